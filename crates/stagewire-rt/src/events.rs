//! Engine event records and the per-cycle bounded queues.

/// Upper bound on events held per direction in one audio cycle. Overflow
/// drops the tail.
pub const EVENT_QUEUE_CAPACITY: usize = 512;

/// MIDI payloads above this size never cross the engine's output boundary.
pub const MAX_MIDI_BYTES: usize = 4;

/// Control-plane event payloads, addressed to a plugin's ctrl channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlEvent {
    /// Normalized parameter change; `param` follows the MIDI CC numbering
    /// convention for built-in targets.
    Parameter { param: u16, value: f32 },
    MidiBank(u16),
    MidiProgram(u16),
    AllSoundOff,
    AllNotesOff,
}

/// A raw MIDI payload, inline up to [`MAX_MIDI_BYTES`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidiData {
    pub port: u8,
    pub size: u8,
    pub data: [u8; MAX_MIDI_BYTES],
}

impl MidiData {
    pub fn new(port: u8, bytes: &[u8]) -> Self {
        let size = bytes.len().min(MAX_MIDI_BYTES);
        let mut data = [0u8; MAX_MIDI_BYTES];
        data[..size].copy_from_slice(&bytes[..size]);
        Self {
            port,
            size: size as u8,
            data,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EngineEventKind {
    Control(ControlEvent),
    Midi(MidiData),
}

/// One timestamped event inside an audio cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineEvent {
    /// Frame offset into the current cycle.
    pub time: u32,
    /// MIDI channel 0..15.
    pub channel: u8,
    pub kind: EngineEventKind,
}

/// Raw-MIDI rendering of a control event. A bank select expands to the
/// MSB/LSB controller pair, everything else to a single frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawMidi {
    frames: [[u8; 3]; 2],
    count: u8,
}

impl RawMidi {
    pub fn frames(&self) -> &[[u8; 3]] {
        &self.frames[..self.count as usize]
    }

    fn push(&mut self, frame: [u8; 3]) {
        self.frames[self.count as usize] = frame;
        self.count += 1;
    }
}

impl EngineEvent {
    /// Builds an event from a raw MIDI message, normalizing note-on with
    /// velocity zero into note-off.
    pub fn from_midi(time: u32, port: u8, bytes: &[u8]) -> Self {
        let mut data = MidiData::new(port, bytes);
        let channel = bytes.first().map(|status| status & 0x0F).unwrap_or(0);
        if data.size >= 3 && data.data[0] & 0xF0 == 0x90 && data.data[2] == 0 {
            data.data[0] = 0x80 | channel;
        }
        Self {
            time,
            channel,
            kind: EngineEventKind::Midi(data),
        }
    }

    /// Renders a control event to raw MIDI bytes per the engine's opcode
    /// mapping. MIDI events pass through unchanged; `None` means the event
    /// has no wire form (all-sound-off family is emitted as CC frames).
    pub fn to_raw_midi(&self) -> Option<RawMidi> {
        let mut out = RawMidi::default();
        let status_cc = 0xB0 | (self.channel & 0x0F);
        match self.kind {
            EngineEventKind::Control(ControlEvent::Parameter { param, value }) => {
                if param > 0x77 {
                    return None;
                }
                let scaled = (value.clamp(0.0, 1.0) * 127.0).round() as u8;
                out.push([status_cc, param as u8, scaled]);
            }
            EngineEventKind::Control(ControlEvent::MidiBank(bank)) => {
                out.push([status_cc, 0x00, 0]);
                out.push([status_cc, 0x20, (bank & 0x7F) as u8]);
            }
            EngineEventKind::Control(ControlEvent::MidiProgram(program)) => {
                out.push([0xC0 | (self.channel & 0x0F), (program & 0x7F) as u8, 0]);
            }
            EngineEventKind::Control(ControlEvent::AllSoundOff) => {
                out.push([status_cc, 0x78, 0]);
            }
            EngineEventKind::Control(ControlEvent::AllNotesOff) => {
                out.push([status_cc, 0x7B, 0]);
            }
            EngineEventKind::Midi(_) => return None,
        }
        Some(out)
    }
}

/// Fixed-capacity event array filled once per cycle. Never reallocates after
/// construction; pushes beyond capacity are dropped.
pub struct EventQueue {
    events: Vec<EngineEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(EVENT_QUEUE_CAPACITY),
        }
    }

    /// Appends an event, dropping it when the cycle is already full.
    pub fn push(&mut self, event: EngineEvent) -> bool {
        if self.events.len() >= EVENT_QUEUE_CAPACITY {
            return false;
        }
        self.events.push(event);
        true
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[EngineEvent] {
        &self.events
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_velocity_zero_becomes_note_off() {
        let event = EngineEvent::from_midi(0, 0, &[0x93, 60, 0]);
        match event.kind {
            EngineEventKind::Midi(data) => {
                assert_eq!(data.bytes(), &[0x83, 60, 0]);
            }
            _ => panic!("expected midi"),
        }
        assert_eq!(event.channel, 3);
    }

    #[test]
    fn parameter_renders_as_cc() {
        let event = EngineEvent {
            time: 0,
            channel: 2,
            kind: EngineEventKind::Control(ControlEvent::Parameter {
                param: 7,
                value: 1.0,
            }),
        };
        let raw = event.to_raw_midi().unwrap();
        assert_eq!(raw.frames(), &[[0xB2, 7, 127]]);
    }

    #[test]
    fn bank_select_expands_to_msb_lsb_pair() {
        let event = EngineEvent {
            time: 0,
            channel: 0,
            kind: EngineEventKind::Control(ControlEvent::MidiBank(5)),
        };
        let raw = event.to_raw_midi().unwrap();
        assert_eq!(raw.frames(), &[[0xB0, 0x00, 0], [0xB0, 0x20, 5]]);
    }

    #[test]
    fn queue_drops_past_capacity() {
        let mut queue = EventQueue::new();
        let event = EngineEvent::from_midi(0, 0, &[0x90, 60, 100]);
        for _ in 0..EVENT_QUEUE_CAPACITY {
            assert!(queue.push(event));
        }
        assert!(!queue.push(event));
        assert_eq!(queue.len(), EVENT_QUEUE_CAPACITY);
    }
}
