//! Out-of-process plugin bridge for Stagewire.
//!
//! The engine side ([`BridgeTransport`]) owns four shared-memory regions and
//! drives a worker process through framed opcode streams; the worker side
//! ([`worker::WorkerService`]) attaches to the same regions and hosts the
//! actual plugin. One audio cycle is a semaphore rendezvous: the engine fills
//! the audio pool, posts the server semaphore and waits on the client one.

pub mod proto;
pub mod sem;
pub mod shm;
pub mod transport;
pub mod worker;

pub use proto::{NonRtClientOpcode, NonRtServerOpcode, ProtocolError, RtClientOpcode};
pub use sem::ShmSemaphore;
pub use shm::{AudioPool, ShmRegion};
pub use transport::{BridgeConfig, BridgeTimeInfo, BridgeTransport, ChildStatus, ServerMessage};
pub use worker::{GainPlugin, WorkerParameter, WorkerPlugin, WorkerService};

/// Environment variable naming the four shared regions, `:`-joined in the
/// order audio-pool, rt-control, non-rt-client, non-rt-server.
pub const SHM_PATHS_ENV: &str = "STAGEWIRE_BRIDGE_SHM_PATHS";
