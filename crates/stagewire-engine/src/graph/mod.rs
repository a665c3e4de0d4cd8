//! The two graph implementations the engine selects between at init.

pub mod patchbay;
pub mod rack;

pub use patchbay::{Connection, PatchbayGraph};
pub use rack::RackGraph;

use std::sync::Arc;

use stagewire_rt::{EventQueue, TransportInfo};

use crate::plugin::Plugin;

/// Selected at engine construction; immutable afterwards.
pub enum Graph {
    Rack(RackGraph),
    Patchbay(PatchbayGraph),
}

impl Graph {
    pub fn buffer_size_changed(&mut self, frames: u32) {
        match self {
            Graph::Rack(rack) => rack.set_buffer_size(frames),
            Graph::Patchbay(patchbay) => patchbay.set_buffer_size(frames),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        plugins: &[Arc<Plugin>],
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        cv_in: &[&[f32]],
        cv_out: &mut [&mut [f32]],
        events_in: &EventQueue,
        events_out: &mut EventQueue,
        time: &TransportInfo,
        frames: u32,
    ) {
        match self {
            Graph::Rack(rack) => {
                rack.process(plugins, audio_in, audio_out, events_in, events_out, time, frames)
            }
            Graph::Patchbay(patchbay) => patchbay.process(
                plugins, audio_in, audio_out, cv_in, cv_out, events_in, events_out, time, frames,
            ),
        }
    }
}
