//! Engine-to-host notifications as a typed enum, flattened to the numeric
//! opcode plus six payload slots only at the UI pipe and ABI boundaries.

/// Numeric callback opcodes, shared with the UI protocol.
pub mod callback_ids {
    pub const PLUGIN_ADDED: u32 = 1;
    pub const PLUGIN_REMOVED: u32 = 2;
    pub const PLUGIN_RENAMED: u32 = 3;
    pub const PLUGIN_UNAVAILABLE: u32 = 4;
    pub const PARAMETER_VALUE_CHANGED: u32 = 5;
    pub const PARAMETER_DEFAULT_CHANGED: u32 = 6;
    pub const PARAMETER_MIDI_CHANNEL_CHANGED: u32 = 7;
    pub const PARAMETER_MIDI_CC_CHANGED: u32 = 8;
    pub const PROGRAM_CHANGED: u32 = 9;
    pub const MIDI_PROGRAM_CHANGED: u32 = 10;
    pub const OPTION_CHANGED: u32 = 11;
    pub const UI_STATE_CHANGED: u32 = 12;
    pub const NOTE_ON: u32 = 13;
    pub const NOTE_OFF: u32 = 14;
    pub const UPDATE: u32 = 15;
    pub const RELOAD_INFO: u32 = 16;
    pub const RELOAD_PARAMETERS: u32 = 17;
    pub const RELOAD_PROGRAMS: u32 = 18;
    pub const RELOAD_ALL: u32 = 19;
    pub const PATCHBAY_CLIENT_ADDED: u32 = 20;
    pub const PATCHBAY_CLIENT_REMOVED: u32 = 21;
    pub const PATCHBAY_PORT_ADDED: u32 = 22;
    pub const PATCHBAY_PORT_REMOVED: u32 = 23;
    pub const PATCHBAY_CONNECTION_ADDED: u32 = 24;
    pub const PATCHBAY_CONNECTION_REMOVED: u32 = 25;
    pub const ENGINE_STARTED: u32 = 26;
    pub const ENGINE_STOPPED: u32 = 27;
    pub const PROCESS_MODE_CHANGED: u32 = 28;
    pub const TRANSPORT_MODE_CHANGED: u32 = 29;
    pub const BUFFER_SIZE_CHANGED: u32 = 30;
    pub const SAMPLE_RATE_CHANGED: u32 = 31;
    pub const PROJECT_LOAD_FINISHED: u32 = 32;
    pub const ERROR: u32 = 33;
    pub const QUIT: u32 = 34;
}

/// One notification. Payload meanings follow each variant's fields; the
/// flattened shape is `(opcode, plugin_id, v1, v2, v3, valuef, string)`.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCallback {
    PluginAdded { id: u32, name: String },
    PluginRemoved { id: u32 },
    PluginRenamed { id: u32, name: String },
    PluginUnavailable { id: u32, reason: String },
    ParameterValueChanged { id: u32, index: i32, value: f32 },
    ParameterDefaultChanged { id: u32, index: i32, value: f32 },
    ParameterMidiChannelChanged { id: u32, index: i32, channel: u8 },
    ParameterMidiCcChanged { id: u32, index: i32, cc: i16 },
    ProgramChanged { id: u32, index: i32 },
    MidiProgramChanged { id: u32, index: i32 },
    OptionChanged { id: u32, option: u32, enabled: bool },
    UiStateChanged { id: u32, state: i32 },
    NoteOn { id: u32, channel: u8, note: u8, velocity: u8 },
    NoteOff { id: u32, channel: u8, note: u8 },
    Update { id: u32 },
    ReloadInfo { id: u32 },
    ReloadParameters { id: u32 },
    ReloadPrograms { id: u32 },
    ReloadAll { id: u32 },
    PatchbayClientAdded { group: u32, name: String },
    PatchbayClientRemoved { group: u32 },
    PatchbayPortAdded { group: u32, port: u32, flags: u32, name: String },
    PatchbayPortRemoved { group: u32, port: u32 },
    PatchbayConnectionAdded { connection: u32, src_group: u32, src_port: u32, dst_group: u32, dst_port: u32 },
    PatchbayConnectionRemoved { connection: u32 },
    EngineStarted,
    EngineStopped,
    BufferSizeChanged { frames: u32 },
    SampleRateChanged { rate: f64 },
    ProjectLoadFinished,
    Error { message: String },
    Quit,
}

/// The flat wire shape of one callback.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatCallback {
    pub opcode: u32,
    pub plugin_id: u32,
    pub value1: i32,
    pub value2: i32,
    pub value3: i32,
    pub valuef: f32,
    pub value_str: String,
}

impl EngineCallback {
    pub fn flatten(&self) -> FlatCallback {
        use callback_ids::*;
        let mut flat = FlatCallback {
            opcode: 0,
            plugin_id: 0,
            value1: 0,
            value2: 0,
            value3: 0,
            valuef: 0.0,
            value_str: String::new(),
        };
        match self {
            EngineCallback::PluginAdded { id, name } => {
                flat.opcode = PLUGIN_ADDED;
                flat.plugin_id = *id;
                flat.value_str = name.clone();
            }
            EngineCallback::PluginRemoved { id } => {
                flat.opcode = PLUGIN_REMOVED;
                flat.plugin_id = *id;
            }
            EngineCallback::PluginRenamed { id, name } => {
                flat.opcode = PLUGIN_RENAMED;
                flat.plugin_id = *id;
                flat.value_str = name.clone();
            }
            EngineCallback::PluginUnavailable { id, reason } => {
                flat.opcode = PLUGIN_UNAVAILABLE;
                flat.plugin_id = *id;
                flat.value_str = reason.clone();
            }
            EngineCallback::ParameterValueChanged { id, index, value } => {
                flat.opcode = PARAMETER_VALUE_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
                flat.valuef = *value;
            }
            EngineCallback::ParameterDefaultChanged { id, index, value } => {
                flat.opcode = PARAMETER_DEFAULT_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
                flat.valuef = *value;
            }
            EngineCallback::ParameterMidiChannelChanged { id, index, channel } => {
                flat.opcode = PARAMETER_MIDI_CHANNEL_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
                flat.value2 = *channel as i32;
            }
            EngineCallback::ParameterMidiCcChanged { id, index, cc } => {
                flat.opcode = PARAMETER_MIDI_CC_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
                flat.value2 = *cc as i32;
            }
            EngineCallback::ProgramChanged { id, index } => {
                flat.opcode = PROGRAM_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
            }
            EngineCallback::MidiProgramChanged { id, index } => {
                flat.opcode = MIDI_PROGRAM_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *index;
            }
            EngineCallback::OptionChanged { id, option, enabled } => {
                flat.opcode = OPTION_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *option as i32;
                flat.value2 = *enabled as i32;
            }
            EngineCallback::UiStateChanged { id, state } => {
                flat.opcode = UI_STATE_CHANGED;
                flat.plugin_id = *id;
                flat.value1 = *state;
            }
            EngineCallback::NoteOn { id, channel, note, velocity } => {
                flat.opcode = NOTE_ON;
                flat.plugin_id = *id;
                flat.value1 = *channel as i32;
                flat.value2 = *note as i32;
                flat.value3 = *velocity as i32;
            }
            EngineCallback::NoteOff { id, channel, note } => {
                flat.opcode = NOTE_OFF;
                flat.plugin_id = *id;
                flat.value1 = *channel as i32;
                flat.value2 = *note as i32;
            }
            EngineCallback::Update { id } => {
                flat.opcode = UPDATE;
                flat.plugin_id = *id;
            }
            EngineCallback::ReloadInfo { id } => {
                flat.opcode = RELOAD_INFO;
                flat.plugin_id = *id;
            }
            EngineCallback::ReloadParameters { id } => {
                flat.opcode = RELOAD_PARAMETERS;
                flat.plugin_id = *id;
            }
            EngineCallback::ReloadPrograms { id } => {
                flat.opcode = RELOAD_PROGRAMS;
                flat.plugin_id = *id;
            }
            EngineCallback::ReloadAll { id } => {
                flat.opcode = RELOAD_ALL;
                flat.plugin_id = *id;
            }
            EngineCallback::PatchbayClientAdded { group, name } => {
                flat.opcode = PATCHBAY_CLIENT_ADDED;
                flat.plugin_id = *group;
                flat.value_str = name.clone();
            }
            EngineCallback::PatchbayClientRemoved { group } => {
                flat.opcode = PATCHBAY_CLIENT_REMOVED;
                flat.plugin_id = *group;
            }
            EngineCallback::PatchbayPortAdded { group, port, flags, name } => {
                flat.opcode = PATCHBAY_PORT_ADDED;
                flat.plugin_id = *group;
                flat.value1 = *port as i32;
                flat.value2 = *flags as i32;
                flat.value_str = name.clone();
            }
            EngineCallback::PatchbayPortRemoved { group, port } => {
                flat.opcode = PATCHBAY_PORT_REMOVED;
                flat.plugin_id = *group;
                flat.value1 = *port as i32;
            }
            EngineCallback::PatchbayConnectionAdded {
                connection,
                src_group,
                src_port,
                dst_group,
                dst_port,
            } => {
                flat.opcode = PATCHBAY_CONNECTION_ADDED;
                flat.plugin_id = *connection;
                flat.value_str =
                    format!("{src_group}:{src_port}:{dst_group}:{dst_port}");
            }
            EngineCallback::PatchbayConnectionRemoved { connection } => {
                flat.opcode = PATCHBAY_CONNECTION_REMOVED;
                flat.plugin_id = *connection;
            }
            EngineCallback::EngineStarted => flat.opcode = ENGINE_STARTED,
            EngineCallback::EngineStopped => flat.opcode = ENGINE_STOPPED,
            EngineCallback::BufferSizeChanged { frames } => {
                flat.opcode = BUFFER_SIZE_CHANGED;
                flat.value1 = *frames as i32;
            }
            EngineCallback::SampleRateChanged { rate } => {
                flat.opcode = SAMPLE_RATE_CHANGED;
                flat.valuef = *rate as f32;
            }
            EngineCallback::ProjectLoadFinished => flat.opcode = PROJECT_LOAD_FINISHED,
            EngineCallback::Error { message } => {
                flat.opcode = ERROR;
                flat.value_str = message.clone();
            }
            EngineCallback::Quit => flat.opcode = QUIT,
        }
        flat
    }
}
