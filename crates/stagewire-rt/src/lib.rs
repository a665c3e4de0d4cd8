//! Realtime primitives shared across the Stagewire plugin host.
//!
//! Everything in this crate is reachable from the audio callback: the framed
//! SPSC ring buffer the bridge transport speaks through, the per-cycle engine
//! event queues, the post-RT notification queue and the transport time state.
//! Nothing here allocates or blocks once constructed.

pub mod events;
pub mod postrt;
pub mod ring;
pub mod time;

pub use events::{
    ControlEvent, EngineEvent, EngineEventKind, EventQueue, MidiData, RawMidi,
    EVENT_QUEUE_CAPACITY, MAX_MIDI_BYTES,
};
pub use postrt::{PostRtEvent, PostRtEventKind, PostRtQueue};
pub use ring::{Ring, RingError, RingMemory, BIG_RING_SIZE, HUGE_RING_SIZE, SMALL_RING_SIZE};
pub use time::{TransportBbt, TransportInfo};
