//! The three opcode vocabularies spoken over the bridge rings.
//!
//! Every opcode travels as a `u32`; an unknown value is a protocol violation
//! that poisons the transport it arrived on.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown {family} opcode {value}")]
    UnknownOpcode { family: &'static str, value: u32 },
    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),
}

macro_rules! opcodes {
    ($name:ident, $family:literal, { $($variant:ident = $value:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(ProtocolError::UnknownOpcode {
                        family: $family,
                        value: other,
                    }),
                }
            }

            pub fn as_u32(self) -> u32 {
                self as u32
            }
        }
    };
}

// Engine -> worker, outside the audio cycle. Committed under the non-RT
// write mutex, consumed at the worker's leisure.
opcodes!(NonRtClientOpcode, "non-rt client", {
    Null = 0,
    SetAudioPoolSize = 1,
    SetBufferSize = 2,
    SetSampleRate = 3,
    SetOffline = 4,
    SetOnline = 5,
    SetOption = 6,
    SetCtrlChannel = 7,
    SetParameterValue = 8,
    SetParameterMidiChannel = 9,
    SetParameterMidiCc = 10,
    SetProgram = 11,
    SetMidiProgram = 12,
    SetCustomData = 13,
    SetChunkDataFile = 14,
    PrepareForSave = 15,
    Activate = 16,
    Deactivate = 17,
    ShowUi = 18,
    HideUi = 19,
    Ping = 20,
    UiParameterChange = 21,
    UiProgramChange = 22,
    UiMidiProgramChange = 23,
    UiNoteOn = 24,
    UiNoteOff = 25,
    Quit = 26,
});

// Engine -> worker, posted inside the audio cycle.
opcodes!(RtClientOpcode, "rt client", {
    Null = 0,
    SetAudioPool = 1,
    MidiEvent = 2,
    ControlEventParameter = 3,
    ControlEventMidiBank = 4,
    ControlEventMidiProgram = 5,
    ControlEventAllSoundOff = 6,
    ControlEventAllNotesOff = 7,
    Process = 8,
    Quit = 9,
});

// Worker -> engine, drained by the idle pump.
opcodes!(NonRtServerOpcode, "non-rt server", {
    Null = 0,
    Pong = 1,
    PluginInfo1 = 2,
    PluginInfo2 = 3,
    AudioCount = 4,
    MidiCount = 5,
    ParameterCount = 6,
    ProgramCount = 7,
    MidiProgramCount = 8,
    ParameterData1 = 9,
    ParameterData2 = 10,
    ParameterRanges1 = 11,
    ParameterRanges2 = 12,
    ParameterValue = 13,
    DefaultValue = 14,
    CurrentProgram = 15,
    CurrentMidiProgram = 16,
    ProgramName = 17,
    MidiProgramData = 18,
    SetCustomData = 19,
    SetChunkDataFile = 20,
    SetLatency = 21,
    UiClosed = 22,
    Ready = 23,
    Saved = 24,
    Error = 25,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_u32_roundtrip() {
        for value in 0..=26u32 {
            let op = NonRtClientOpcode::from_u32(value).unwrap();
            assert_eq!(op.as_u32(), value);
        }
        assert!(NonRtClientOpcode::from_u32(27).is_err());
        assert!(RtClientOpcode::from_u32(10).is_err());
        assert!(NonRtServerOpcode::from_u32(26).is_err());
    }
}
