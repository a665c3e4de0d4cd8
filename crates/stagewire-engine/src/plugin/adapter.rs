//! The capability seam between the engine and plugin-format wrappers.
//!
//! Format loading (LADSPA/DSSI/LV2/VST/AU/samplers) is an external
//! collaborator; whatever it loads is handed to the engine as a boxed
//! [`FormatAdapter`]. The engine itself ships two small adapters used for
//! internal plugins and tests.

use stagewire_rt::{EngineEvent, EngineEventKind};

use super::{param_hints, ParameterData, ParameterKind, ParameterRanges};

/// Fixed method set every in-process plugin format maps onto.
///
/// All methods are non-reentrant and called either under the plugin's single
/// mutex (process, activate) or its master mutex (everything else); no
/// adapter method may panic across this boundary.
pub trait FormatAdapter: Send {
    fn name(&self) -> &str;
    fn label(&self) -> &str;
    fn maker(&self) -> &str {
        ""
    }
    fn copyright(&self) -> &str {
        ""
    }
    fn unique_id(&self) -> i64 {
        0
    }
    /// Hint bits the adapter contributes (custom UI, synth, chunks).
    fn hints(&self) -> u32 {
        0
    }
    fn audio_io(&self) -> (u32, u32);
    fn cv_io(&self) -> (u32, u32) {
        (0, 0)
    }
    fn midi_io(&self) -> (u32, u32) {
        (0, 0)
    }
    fn parameter_count(&self) -> u32;
    fn parameter_data(&self, index: u32) -> ParameterData;
    fn parameter_ranges(&self, index: u32) -> ParameterRanges;
    fn parameter_value(&self, index: u32) -> f32;
    fn set_parameter_value(&mut self, index: u32, value: f32);
    fn program_count(&self) -> u32 {
        0
    }
    fn program_name(&self, _index: u32) -> String {
        String::new()
    }
    fn set_program(&mut self, _index: i32) {}
    fn set_midi_program(&mut self, _bank: u32, _program: u32) {}
    fn set_custom_data(&mut self, _kind: &str, _key: &str, _value: &str) {}
    fn activate(&mut self) {}
    fn deactivate(&mut self) {}
    /// Processes one block. Inputs and outputs are per-channel slices sized
    /// `frames`; the adapter must fill every output it declares.
    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        events: &[EngineEvent],
        frames: u32,
    );
    fn latency(&self) -> u32 {
        0
    }
    fn ui_show(&mut self, _show: bool) {}
    fn ui_idle(&mut self) {}
}

/// Per-channel gain, the internal utility plugin. Mono or stereo.
pub struct GainAdapter {
    channels: u32,
    gain: f32,
}

impl GainAdapter {
    pub fn mono() -> Self {
        Self {
            channels: 1,
            gain: 1.0,
        }
    }

    pub fn stereo() -> Self {
        Self {
            channels: 2,
            gain: 1.0,
        }
    }
}

impl FormatAdapter for GainAdapter {
    fn name(&self) -> &str {
        "Gain"
    }

    fn label(&self) -> &str {
        "gain"
    }

    fn maker(&self) -> &str {
        "Stagewire"
    }

    fn audio_io(&self) -> (u32, u32) {
        (self.channels, self.channels)
    }

    fn parameter_count(&self) -> u32 {
        1
    }

    fn parameter_data(&self, _index: u32) -> ParameterData {
        ParameterData {
            kind: ParameterKind::Input,
            hints: param_hints::AUTOMABLE | param_hints::ENABLED,
            rindex: 0,
            midi_channel: 0,
            midi_cc: -1,
            name: String::from("Gain"),
            unit: String::new(),
        }
    }

    fn parameter_ranges(&self, _index: u32) -> ParameterRanges {
        ParameterRanges {
            def: 1.0,
            min: 0.0,
            max: 2.0,
            step: 0.01,
            step_small: 0.001,
            step_large: 0.1,
        }
    }

    fn parameter_value(&self, _index: u32) -> f32 {
        self.gain
    }

    fn set_parameter_value(&mut self, _index: u32, value: f32) {
        self.gain = value.clamp(0.0, 2.0);
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        _events: &[EngineEvent],
        frames: u32,
    ) {
        let frames = frames as usize;
        for (output, input) in outputs.iter_mut().zip(inputs.iter()) {
            for i in 0..frames {
                output[i] = input[i] * self.gain;
            }
        }
        for output in outputs.iter_mut().skip(inputs.len()) {
            output[..frames].fill(0.0);
        }
    }
}

/// A one-in two-out mono-to-stereo spreader, exercising the asymmetric rack
/// path. Also counts received notes, which tests use to observe event
/// delivery.
pub struct SpreaderAdapter {
    width: f32,
    pub notes_seen: u32,
}

impl SpreaderAdapter {
    pub fn new() -> Self {
        Self {
            width: 1.0,
            notes_seen: 0,
        }
    }
}

impl Default for SpreaderAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatAdapter for SpreaderAdapter {
    fn name(&self) -> &str {
        "Spreader"
    }

    fn label(&self) -> &str {
        "spreader"
    }

    fn maker(&self) -> &str {
        "Stagewire"
    }

    fn audio_io(&self) -> (u32, u32) {
        (1, 2)
    }

    fn midi_io(&self) -> (u32, u32) {
        (1, 0)
    }

    fn parameter_count(&self) -> u32 {
        1
    }

    fn parameter_data(&self, _index: u32) -> ParameterData {
        ParameterData {
            kind: ParameterKind::Input,
            hints: param_hints::AUTOMABLE | param_hints::ENABLED,
            rindex: 0,
            midi_channel: 0,
            midi_cc: -1,
            name: String::from("Width"),
            unit: String::new(),
        }
    }

    fn parameter_ranges(&self, _index: u32) -> ParameterRanges {
        ParameterRanges {
            def: 1.0,
            min: 0.0,
            max: 1.0,
            step: 0.01,
            step_small: 0.001,
            step_large: 0.1,
        }
    }

    fn parameter_value(&self, _index: u32) -> f32 {
        self.width
    }

    fn set_parameter_value(&mut self, _index: u32, value: f32) {
        self.width = value.clamp(0.0, 1.0);
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        events: &[EngineEvent],
        frames: u32,
    ) {
        for event in events {
            if let EngineEventKind::Midi(data) = event.kind {
                if data.size >= 3 && data.data[0] & 0xF0 == 0x90 {
                    self.notes_seen += 1;
                }
            }
        }
        let frames = frames as usize;
        let input = inputs.first();
        for (channel, output) in outputs.iter_mut().enumerate() {
            match input {
                Some(input) => {
                    let scale = if channel == 0 { 1.0 } else { self.width };
                    for i in 0..frames {
                        output[i] = input[i] * scale;
                    }
                }
                None => output[..frames].fill(0.0),
            }
        }
    }
}

/// Three-in one-out submixer, the widest of the internal utilities.
pub struct SubmixAdapter {
    levels: [f32; 3],
}

impl SubmixAdapter {
    pub fn new() -> Self {
        Self { levels: [1.0; 3] }
    }
}

impl Default for SubmixAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatAdapter for SubmixAdapter {
    fn name(&self) -> &str {
        "Submix 3:1"
    }

    fn label(&self) -> &str {
        "submix3"
    }

    fn maker(&self) -> &str {
        "Stagewire"
    }

    fn audio_io(&self) -> (u32, u32) {
        (3, 1)
    }

    fn parameter_count(&self) -> u32 {
        3
    }

    fn parameter_data(&self, index: u32) -> ParameterData {
        ParameterData {
            kind: ParameterKind::Input,
            hints: param_hints::AUTOMABLE | param_hints::ENABLED,
            rindex: index as i32,
            midi_channel: 0,
            midi_cc: -1,
            name: format!("Level {}", index + 1),
            unit: String::new(),
        }
    }

    fn parameter_ranges(&self, _index: u32) -> ParameterRanges {
        ParameterRanges {
            def: 1.0,
            min: 0.0,
            max: 1.0,
            step: 0.01,
            step_small: 0.001,
            step_large: 0.1,
        }
    }

    fn parameter_value(&self, index: u32) -> f32 {
        self.levels.get(index as usize).copied().unwrap_or(0.0)
    }

    fn set_parameter_value(&mut self, index: u32, value: f32) {
        if let Some(level) = self.levels.get_mut(index as usize) {
            *level = value.clamp(0.0, 1.0);
        }
    }

    fn process(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        _events: &[EngineEvent],
        frames: u32,
    ) {
        let frames = frames as usize;
        let Some(output) = outputs.first_mut() else {
            return;
        };
        output[..frames].fill(0.0);
        for (input, level) in inputs.iter().zip(self.levels.iter()) {
            for i in 0..frames {
                output[i] += input[i] * level;
            }
        }
        for extra in outputs.iter_mut().skip(1) {
            extra[..frames].fill(0.0);
        }
    }
}

/// Resolves an internal-plugin label to its adapter. The plugin-format
/// loaders register richer factories with the embedding application; the
/// engine only knows its built-ins.
pub fn internal_adapter(label: &str) -> Option<Box<dyn FormatAdapter>> {
    match label {
        "gain" => Some(Box::new(GainAdapter::stereo())),
        "gain_mono" => Some(Box::new(GainAdapter::mono())),
        "spreader" => Some(Box::new(SpreaderAdapter::new())),
        "submix3" => Some(Box::new(SubmixAdapter::new())),
        _ => None,
    }
}
