//! Stagewire engine
//! ================
//! An audio plugin host embedded as a plugin: the outer host hands us its
//! audio/CV/MIDI streams, we route them through a user-configured graph of
//! hosted plugins (in-process or bridged out of process) and hand the result
//! back. The UI lives in a separate process behind a framed text pipe.

pub mod abi;
pub mod callback;
pub mod engine;
pub mod error;
pub mod graph;
pub mod idle;
pub mod options;
pub mod plugin;
pub mod state;
pub mod uipipe;

/// Upper bound on concurrently loaded plugins, advertised to the UI.
pub const MAX_PLUGINS: u32 = 255;

pub use callback::{EngineCallback, FlatCallback};
pub use engine::Engine;
pub use error::EngineError;
pub use graph::{Graph, PatchbayGraph, RackGraph};
pub use options::{EngineOptions, ProcessMode, TransportMode};
pub use plugin::{Plugin, PluginType};
pub use state::{PluginState, ProjectDocument};
pub use uipipe::{UiPipe, UiState};
