//! Plugin handles: the engine-local representation of every hosted plugin,
//! in-process or bridged.

pub mod adapter;
pub mod bridged;
pub mod process;

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use stagewire_rt::PostRtQueue;

use adapter::FormatAdapter;
use stagewire_bridge::BridgeTransport;

/// Plugin hint bits.
pub mod hints {
    pub const IS_BRIDGE: u32 = 1 << 0;
    pub const HAS_CUSTOM_UI: u32 = 1 << 1;
    pub const NEEDS_UI_MAIN_THREAD: u32 = 1 << 2;
    pub const CAN_DRYWET: u32 = 1 << 3;
    pub const CAN_VOLUME: u32 = 1 << 4;
    pub const CAN_BALANCE: u32 = 1 << 5;
    pub const NEEDS_FIXED_BUFFERS: u32 = 1 << 6;
    pub const USES_CHUNKS: u32 = 1 << 7;
    pub const IS_SYNTH: u32 = 1 << 8;
}

/// Extra hint bits derived from the port layout.
pub mod extra_hints {
    pub const HAS_MIDI_IN: u32 = 1 << 0;
    pub const HAS_MIDI_OUT: u32 = 1 << 1;
    pub const CAN_RUN_RACK: u32 = 1 << 2;
}

/// Per-plugin option bits.
pub mod plugin_options {
    pub const FIXED_BUFFERS: u32 = 1 << 0;
    pub const FORCE_STEREO: u32 = 1 << 1;
    pub const MAP_PROGRAM_CHANGES: u32 = 1 << 2;
    pub const USE_CHUNKS: u32 = 1 << 3;
    pub const SEND_CONTROL_CHANGES: u32 = 1 << 4;
    pub const SEND_ALL_SOUND_OFF: u32 = 1 << 5;
    pub const SEND_PROGRAM_CHANGES: u32 = 1 << 6;
}

/// Parameter hint bits.
pub mod param_hints {
    pub const BOOLEAN: u32 = 1 << 0;
    pub const INTEGER: u32 = 1 << 1;
    pub const LOGARITHMIC: u32 = 1 << 2;
    pub const AUTOMABLE: u32 = 1 << 3;
    pub const USES_SAMPLE_RATE: u32 = 1 << 4;
    pub const USES_SCALE_POINTS: u32 = 1 << 5;
    pub const ENABLED: u32 = 1 << 6;
}

// Internal pseudo-parameter indices addressed from the UI with negative
// numbers. This layout is part of the public protocol.
pub const PARAMETER_NULL: i32 = -1;
pub const PARAMETER_ACTIVE: i32 = -2;
pub const PARAMETER_VOLUME: i32 = -3;
pub const PARAMETER_DRYWET: i32 = -4;
pub const PARAMETER_BALANCE_LEFT: i32 = -5;
pub const PARAMETER_BALANCE_RIGHT: i32 = -6;
pub const PARAMETER_PANNING: i32 = -7;
pub const PARAMETER_CTRL_CHANNEL: i32 = -8;
pub const PARAMETER_MAX: i32 = -9;

/// MIDI CC numbers with built-in meaning on a plugin's ctrl channel.
pub(crate) const CC_BREATH_DRYWET: u16 = 0x02;
pub(crate) const CC_VOLUME: u16 = 0x07;
pub(crate) const CC_BALANCE: u16 = 0x08;
pub(crate) const CC_PAN_BALANCE: u16 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginType {
    Internal,
    Ladspa,
    Dssi,
    Lv2,
    Vst2,
    Vst3,
    Au,
    Sf2,
    Sfz,
    Gig,
}

impl PluginType {
    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "internal" => Self::Internal,
            "ladspa" => Self::Ladspa,
            "dssi" => Self::Dssi,
            "lv2" => Self::Lv2,
            "vst2" => Self::Vst2,
            "vst3" => Self::Vst3,
            "au" => Self::Au,
            "sf2" => Self::Sf2,
            "sfz" => Self::Sfz,
            "gig" => Self::Gig,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Ladspa => "ladspa",
            Self::Dssi => "dssi",
            Self::Lv2 => "lv2",
            Self::Vst2 => "vst2",
            Self::Vst3 => "vst3",
            Self::Au => "au",
            Self::Sf2 => "sf2",
            Self::Sfz => "sfz",
            Self::Gig => "gig",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Input,
    Output,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRanges {
    pub def: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

impl Default for ParameterRanges {
    fn default() -> Self {
        Self {
            def: 0.0,
            min: 0.0,
            max: 1.0,
            step: 0.01,
            step_small: 0.0001,
            step_large: 0.1,
        }
    }
}

impl ParameterRanges {
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone)]
pub struct ParameterData {
    pub kind: ParameterKind,
    pub hints: u32,
    /// Stable index into the backing plugin, which may expose more
    /// parameters than the engine surfaces.
    pub rindex: i32,
    pub midi_channel: u8,
    /// -1 disables MIDI control; otherwise 0..119.
    pub midi_cc: i16,
    pub name: String,
    pub unit: String,
}

impl Default for ParameterData {
    fn default() -> Self {
        Self {
            kind: ParameterKind::Input,
            hints: 0,
            rindex: PARAMETER_NULL,
            midi_channel: 0,
            midi_cc: -1,
            name: String::new(),
            unit: String::new(),
        }
    }
}

/// The parameter table plus the engine-side value cache.
#[derive(Debug, Default)]
pub struct Parameters {
    pub data: Vec<ParameterData>,
    pub ranges: Vec<ParameterRanges>,
    pub values: Vec<f32>,
}

impl Parameters {
    pub fn count(&self) -> u32 {
        self.data.len() as u32
    }

    /// Coerces a candidate value per the parameter's hints: boolean snaps to
    /// either end around the midpoint, integer rounds first, everything
    /// clamps. Idempotent.
    pub fn fixed_value(&self, index: u32, value: f32) -> f32 {
        let Some(data) = self.data.get(index as usize) else {
            return 0.0;
        };
        let ranges = &self.ranges[index as usize];
        if data.hints & param_hints::BOOLEAN != 0 {
            let middle = ranges.min + (ranges.max - ranges.min) / 2.0;
            return if value >= middle { ranges.max } else { ranges.min };
        }
        if data.hints & param_hints::INTEGER != 0 {
            return ranges.clamp(value.round());
        }
        ranges.clamp(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomData {
    pub kind: String,
    pub key: String,
    pub value: String,
}

/// Custom-data entries of this type are surfaced to the UI.
pub const CUSTOM_DATA_PROPERTY: &str = "Property";

#[derive(Debug, Default)]
pub struct Programs {
    pub names: Vec<String>,
    pub current: i32,
}

#[derive(Debug, Clone, Default)]
pub struct MidiProgramData {
    pub bank: u32,
    pub program: u32,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct MidiPrograms {
    pub data: Vec<MidiProgramData>,
    pub current: i32,
}

#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub rindex: u32,
}

/// A snapshot of a plugin's port geometry.
#[derive(Debug, Clone, Copy)]
pub struct PortCounts {
    pub audio_in: usize,
    pub audio_out: usize,
    pub cv_in: usize,
    pub cv_out: usize,
    pub has_event_in: bool,
    pub has_event_out: bool,
}

/// Port layout recomputed by `reload`.
#[derive(Debug, Default, Clone)]
pub struct PortLayout {
    pub audio_in: Vec<Port>,
    pub audio_out: Vec<Port>,
    pub cv_in: Vec<Port>,
    pub cv_out: Vec<Port>,
    pub has_event_in: bool,
    pub has_event_out: bool,
}

impl PortLayout {
    /// Builds the canonical `input|output[_N]` / `events-in|events-out`
    /// names, prefixed by the plugin name under single-client mode.
    pub fn rebuild(
        name: &str,
        prefix: bool,
        audio_in: u32,
        audio_out: u32,
        cv_in: u32,
        cv_out: u32,
        event_in: bool,
        event_out: bool,
    ) -> Self {
        let make = |base: &str, count: u32, offset: u32| -> Vec<Port> {
            (0..count)
                .map(|i| {
                    let suffix = if count > 1 {
                        format!("{base}_{}", i + 1)
                    } else {
                        base.to_string()
                    };
                    let full = if prefix {
                        format!("{name}:{suffix}")
                    } else {
                        suffix
                    };
                    Port {
                        name: full,
                        rindex: offset + i,
                    }
                })
                .collect()
        };
        Self {
            audio_in: make("input", audio_in, 0),
            audio_out: make("output", audio_out, audio_in),
            cv_in: make("cv_input", cv_in, audio_in + audio_out),
            cv_out: make("cv_output", cv_out, audio_in + audio_out + cv_in),
            has_event_in: event_in,
            has_event_out: event_out,
        }
    }
}

/// Non-RT state guarded by the master mutex.
pub struct PluginCore {
    pub plugin_type: PluginType,
    pub name: String,
    pub filename: String,
    pub label: String,
    pub real_name: String,
    pub icon_name: String,
    pub maker: String,
    pub copyright: String,
    pub unique_id: i64,
    pub category: u32,
    pub ports: PortLayout,
    pub params: Parameters,
    pub programs: Programs,
    pub midi_programs: MidiPrograms,
    pub custom_data: Vec<CustomData>,
}

impl PluginCore {
    fn new(plugin_type: PluginType, name: &str, filename: &str, label: &str) -> Self {
        Self {
            plugin_type,
            name: name.to_string(),
            filename: filename.to_string(),
            label: label.to_string(),
            real_name: name.to_string(),
            icon_name: String::from("plugin"),
            maker: String::new(),
            copyright: String::new(),
            unique_id: 0,
            category: 0,
            ports: PortLayout::default(),
            params: Parameters::default(),
            programs: Programs::default(),
            midi_programs: MidiPrograms::default(),
            custom_data: Vec::new(),
        }
    }
}

/// The concrete backing of a plugin handle.
pub enum Backend {
    Local(Box<dyn FormatAdapter>),
    Bridged(BridgeTransport),
}

/// RT state guarded by the single mutex: the backend itself plus the
/// process-scratch the RT path needs.
pub struct ProcessState {
    pub backend: Backend,
    /// Input stash for the dry/wet blend.
    pub dry: Vec<Vec<f32>>,
    /// Balance scratch for the pairwise mix.
    pub bal: Vec<f32>,
    /// Held notes (channel, note) for note-off synthesis.
    pub held_notes: Vec<(u8, u8)>,
    pub buffer_size: u32,
    /// Per-cycle event scratch handed to the backend.
    pub event_scratch: Vec<stagewire_rt::EngineEvent>,
    /// Per-channel delay lines aligning the dry signal with a latent wet
    /// signal; empty while the plugin reports zero latency.
    pub latency_rings: Vec<Vec<f32>>,
    pub latency_pos: usize,
}

pub(crate) fn resize_latency(process: &mut ProcessState, latency: usize) {
    let channels = process.dry.len();
    process.latency_rings = if latency == 0 {
        Vec::new()
    } else {
        (0..channels).map(|_| vec![0.0; latency]).collect()
    };
    process.latency_pos = 0;
}

/// An injected MIDI note from the UI or host, delivered to the RT path
/// through a bounded lock-free mailbox.
#[derive(Debug, Clone, Copy)]
pub struct ExternalNote {
    pub channel: u8,
    pub note: u8,
    /// 0 means note-off.
    pub velocity: u8,
}

fn f32_to_bits(value: f32) -> u32 {
    value.to_bits()
}

fn f32_from_bits(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Mix controls readable from the RT path without locks.
pub struct MixControls {
    dry_wet: AtomicU32,
    volume: AtomicU32,
    balance_left: AtomicU32,
    balance_right: AtomicU32,
    panning: AtomicU32,
}

impl MixControls {
    fn new() -> Self {
        Self {
            dry_wet: AtomicU32::new(f32_to_bits(1.0)),
            volume: AtomicU32::new(f32_to_bits(1.0)),
            balance_left: AtomicU32::new(f32_to_bits(-1.0)),
            balance_right: AtomicU32::new(f32_to_bits(1.0)),
            panning: AtomicU32::new(f32_to_bits(0.0)),
        }
    }

    pub fn dry_wet(&self) -> f32 {
        f32_from_bits(self.dry_wet.load(Ordering::Relaxed))
    }

    pub fn volume(&self) -> f32 {
        f32_from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn balance_left(&self) -> f32 {
        f32_from_bits(self.balance_left.load(Ordering::Relaxed))
    }

    pub fn balance_right(&self) -> f32 {
        f32_from_bits(self.balance_right.load(Ordering::Relaxed))
    }

    pub fn panning(&self) -> f32 {
        f32_from_bits(self.panning.load(Ordering::Relaxed))
    }

    pub fn set_dry_wet(&self, value: f32) -> f32 {
        let fixed = value.clamp(0.0, 1.0);
        self.dry_wet.store(f32_to_bits(fixed), Ordering::Relaxed);
        fixed
    }

    pub fn set_volume(&self, value: f32) -> f32 {
        let fixed = value.clamp(0.0, 1.27);
        self.volume.store(f32_to_bits(fixed), Ordering::Relaxed);
        fixed
    }

    pub fn set_balance_left(&self, value: f32) -> f32 {
        let fixed = value.clamp(-1.0, 1.0);
        self.balance_left.store(f32_to_bits(fixed), Ordering::Relaxed);
        fixed
    }

    pub fn set_balance_right(&self, value: f32) -> f32 {
        let fixed = value.clamp(-1.0, 1.0);
        self.balance_right.store(f32_to_bits(fixed), Ordering::Relaxed);
        fixed
    }

    pub fn set_panning(&self, value: f32) -> f32 {
        let fixed = value.clamp(-1.0, 1.0);
        self.panning.store(f32_to_bits(fixed), Ordering::Relaxed);
        fixed
    }
}

/// Splits a single balance control value into the `(left, right)` pair.
pub fn split_balance(value: f32) -> (f32, f32) {
    if value < 0.0 {
        (-1.0, 2.0 * value + 1.0)
    } else if value > 0.0 {
        (2.0 * value - 1.0, 1.0)
    } else {
        (-1.0, 1.0)
    }
}

const EXT_NOTE_MAILBOX: usize = 128;

/// One hosted plugin.
///
/// Locking discipline: `core` is the master mutex (structural changes, main
/// thread only), `process` is the single mutex (try-locked by the audio
/// thread, silencing on contention). Everything the RT path reads besides
/// `process` lives in atomics.
pub struct Plugin {
    id: AtomicU32,
    enabled: AtomicBool,
    active: AtomicBool,
    hints: AtomicU32,
    extra_hints: AtomicU32,
    options: AtomicU32,
    ctrl_channel: AtomicI32,
    latency_frames: AtomicU32,
    pub mix: MixControls,
    /// Input L/R and output L/R peak levels of the last cycle.
    peaks: [AtomicU32; 4],
    pub(crate) core: Mutex<PluginCore>,
    pub(crate) process: Mutex<ProcessState>,
    pub post_rt: PostRtQueue,
    pub(crate) ext_notes: ArrayQueue<ExternalNote>,
    /// Set when the bridge worker died; cleared never.
    crashed: AtomicBool,
    /// Bridged save handshake flag, set by the worker's `Saved` reply.
    pub(crate) saved: AtomicBool,
}

impl Plugin {
    pub(crate) fn new(
        id: u32,
        plugin_type: PluginType,
        name: &str,
        filename: &str,
        label: &str,
        backend: Backend,
        buffer_size: u32,
    ) -> Self {
        Self {
            id: AtomicU32::new(id),
            enabled: AtomicBool::new(false),
            active: AtomicBool::new(false),
            hints: AtomicU32::new(0),
            extra_hints: AtomicU32::new(0),
            options: AtomicU32::new(
                plugin_options::MAP_PROGRAM_CHANGES | plugin_options::SEND_ALL_SOUND_OFF,
            ),
            ctrl_channel: AtomicI32::new(0),
            latency_frames: AtomicU32::new(0),
            mix: MixControls::new(),
            peaks: Default::default(),
            core: Mutex::new(PluginCore::new(plugin_type, name, filename, label)),
            process: Mutex::new(ProcessState {
                backend,
                dry: Vec::new(),
                bal: Vec::new(),
                held_notes: Vec::new(),
                buffer_size,
                event_scratch: Vec::with_capacity(stagewire_rt::EVENT_QUEUE_CAPACITY),
                latency_rings: Vec::new(),
                latency_pos: 0,
            }),
            post_rt: PostRtQueue::new(),
            ext_notes: ArrayQueue::new(EXT_NOTE_MAILBOX),
            crashed: AtomicBool::new(false),
            saved: AtomicBool::new(false),
        }
    }

    // ---- flags and identity ---------------------------------------------

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn name(&self) -> String {
        self.core.lock().name.clone()
    }

    /// Port counts and event flags, for graph bookkeeping.
    pub fn core_snapshot(&self) -> PortCounts {
        let core = self.core.lock();
        PortCounts {
            audio_in: core.ports.audio_in.len(),
            audio_out: core.ports.audio_out.len(),
            cv_in: core.ports.cv_in.len(),
            cv_out: core.ports.cv_out.len(),
            has_event_in: core.ports.has_event_in,
            has_event_out: core.ports.has_event_out,
        }
    }

    /// `(port id, name)` pairs for the patchbay snapshot. Audio and CV
    /// ports use `rindex + 1`; the event pair sits at its reserved ids.
    pub fn port_names(&self) -> Vec<(u32, String)> {
        let core = self.core.lock();
        let mut names: Vec<(u32, String)> = core
            .ports
            .audio_in
            .iter()
            .chain(core.ports.audio_out.iter())
            .chain(core.ports.cv_in.iter())
            .chain(core.ports.cv_out.iter())
            .map(|port| (port.rindex + 1, port.name.clone()))
            .collect();
        if core.ports.has_event_in {
            names.push((crate::graph::patchbay::PORT_EVENT_IN, String::from("events-in")));
        }
        if core.ports.has_event_out {
            names.push((crate::graph::patchbay::PORT_EVENT_OUT, String::from("events-out")));
        }
        names
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn hints(&self) -> u32 {
        self.hints.load(Ordering::Relaxed)
    }

    pub fn extra_hints(&self) -> u32 {
        self.extra_hints.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> u32 {
        self.options.load(Ordering::Relaxed)
    }

    pub fn ctrl_channel(&self) -> i32 {
        self.ctrl_channel.load(Ordering::Relaxed)
    }

    pub fn latency_frames(&self) -> u32 {
        self.latency_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn set_latency_frames(&self, frames: u32) {
        self.latency_frames.store(frames, Ordering::Relaxed);
        let mut process = self.process.lock();
        resize_latency(&mut process, frames as usize);
    }

    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_crashed(&self) {
        self.crashed.store(true, Ordering::Relaxed);
        self.enabled.store(false, Ordering::Relaxed);
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn is_bridged(&self) -> bool {
        self.hints() & hints::IS_BRIDGE != 0
    }

    /// Peak levels `[in L, in R, out L, out R]` of the last cycle.
    pub fn peaks(&self) -> [f32; 4] {
        [
            f32_from_bits(self.peaks[0].load(Ordering::Relaxed)),
            f32_from_bits(self.peaks[1].load(Ordering::Relaxed)),
            f32_from_bits(self.peaks[2].load(Ordering::Relaxed)),
            f32_from_bits(self.peaks[3].load(Ordering::Relaxed)),
        ]
    }

    pub(crate) fn store_peaks(&self, values: [f32; 4]) {
        for (slot, value) in self.peaks.iter().zip(values) {
            slot.store(f32_to_bits(value), Ordering::Relaxed);
        }
    }

    // ---- non-RT control -------------------------------------------------

    /// Recomputes port layout, hints and extra hints from the backing
    /// plugin. With `force_stereo`, a mono side of the audio layout is
    /// widened to a stereo pair (Rack mode coercion). Master lock held
    /// inside; never called from the RT path.
    pub fn reload(&self, single_client_names: bool, force_stereo: bool) {
        let mut core = self.core.lock();
        let mut process = self.process.lock();

        let (mut audio_in, mut audio_out, cv_in, cv_out, midi_in, midi_out): (u32, u32, u32, u32, u32, u32);
        let mut new_hints: u32;
        match &process.backend {
            Backend::Local(adapter) => {
                (audio_in, audio_out) = adapter.audio_io();
                (cv_in, cv_out) = adapter.cv_io();
                (midi_in, midi_out) = adapter.midi_io();
                new_hints = adapter.hints();

                let count = adapter.parameter_count();
                let mut params = Parameters::default();
                for index in 0..count {
                    params.data.push(adapter.parameter_data(index));
                    params.ranges.push(adapter.parameter_ranges(index));
                    params.values.push(adapter.parameter_value(index));
                }
                core.params = params;
                core.programs.names =
                    (0..adapter.program_count()).map(|i| adapter.program_name(i)).collect();
                if core.programs.names.is_empty() {
                    core.programs.current = -1;
                }
                core.real_name = adapter.name().to_string();
                core.maker = adapter.maker().to_string();
                core.copyright = adapter.copyright().to_string();
                core.unique_id = adapter.unique_id();
            }
            Backend::Bridged(_) => {
                // Bridged topology was filled in from the worker's startup
                // messages; reload only rebuilds the derived state.
                audio_in = core.ports.audio_in.len() as u32;
                audio_out = core.ports.audio_out.len() as u32;
                cv_in = core.ports.cv_in.len() as u32;
                cv_out = core.ports.cv_out.len() as u32;
                midi_in = core.ports.has_event_in as u32;
                midi_out = core.ports.has_event_out as u32;
                new_hints = self.hints() | hints::IS_BRIDGE;
            }
        }

        if force_stereo {
            if audio_in == 1 {
                audio_in = 2;
            }
            if audio_out == 1 {
                audio_out = 2;
            }
        }

        if audio_in > 0 && audio_out > 0 {
            new_hints |= hints::CAN_DRYWET;
        }
        if audio_out > 0 {
            new_hints |= hints::CAN_VOLUME;
        }
        if audio_out >= 2 {
            new_hints |= hints::CAN_BALANCE;
        }

        let mut extra = 0;
        if midi_in > 0 {
            extra |= extra_hints::HAS_MIDI_IN;
        }
        if midi_out > 0 {
            extra |= extra_hints::HAS_MIDI_OUT;
        }
        if audio_in <= 2
            && audio_out <= 2
            && (audio_in == audio_out || audio_in == 0 || audio_out == 0)
        {
            extra |= extra_hints::CAN_RUN_RACK;
        }

        core.ports = PortLayout::rebuild(
            &core.name,
            single_client_names,
            audio_in,
            audio_out,
            cv_in,
            cv_out,
            midi_in > 0,
            midi_out > 0,
        );

        let frames = process.buffer_size as usize;
        let stash_channels = audio_in.max(audio_out).max(2);
        process.dry = (0..stash_channels).map(|_| vec![0.0; frames]).collect();
        process.bal = vec![0.0; frames];
        if let Backend::Local(adapter) = &process.backend {
            self.latency_frames.store(adapter.latency(), Ordering::Relaxed);
        }
        resize_latency(&mut process, self.latency_frames() as usize);

        self.hints.store(new_hints, Ordering::Relaxed);
        self.extra_hints.store(extra, Ordering::Relaxed);
        self.set_enabled(true);
    }

    pub fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::Relaxed) == active {
            return;
        }
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => {
                if active {
                    adapter.activate();
                } else {
                    adapter.deactivate();
                }
            }
            Backend::Bridged(transport) => {
                let result = if active {
                    transport.activate()
                } else {
                    transport.deactivate()
                };
                if let Err(err) = result {
                    tracing::warn!(?err, "bridge (de)activation failed");
                }
            }
        }
    }

    pub fn set_option(&self, option: u32, enabled: bool) {
        let mut bits = self.options.load(Ordering::Relaxed);
        if enabled {
            bits |= option;
        } else {
            bits &= !option;
        }
        self.options.store(bits, Ordering::Relaxed);
        if let Backend::Bridged(transport) = &self.process.lock().backend {
            let _ = transport.set_option(option, enabled);
        }
    }

    pub fn set_ctrl_channel(&self, channel: i32) {
        self.ctrl_channel.store(channel.clamp(-1, 15), Ordering::Relaxed);
        if let Backend::Bridged(transport) = &self.process.lock().backend {
            let _ = transport.set_ctrl_channel(channel as i16);
        }
    }

    pub fn parameter_count(&self) -> u32 {
        self.core.lock().params.count()
    }

    pub fn parameter_value(&self, index: u32) -> f32 {
        self.core
            .lock()
            .params
            .values
            .get(index as usize)
            .copied()
            .unwrap_or(0.0)
    }

    /// Coerces and applies a parameter value; returns what was stored.
    pub fn set_parameter_value(&self, index: u32, value: f32) -> f32 {
        let fixed = {
            let mut core = self.core.lock();
            let fixed = core.params.fixed_value(index, value);
            if let Some(slot) = core.params.values.get_mut(index as usize) {
                *slot = fixed;
            }
            fixed
        };
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => adapter.set_parameter_value(index, fixed),
            Backend::Bridged(transport) => {
                let _ = transport.set_parameter_value(index, fixed);
            }
        }
        fixed
    }

    pub fn set_parameter_midi_channel(&self, index: u32, channel: u8) {
        let mut core = self.core.lock();
        if let Some(data) = core.params.data.get_mut(index as usize) {
            data.midi_channel = channel.min(15);
        }
        drop(core);
        if let Backend::Bridged(transport) = &self.process.lock().backend {
            let _ = transport.set_parameter_midi_channel(index, channel);
        }
    }

    pub fn set_parameter_midi_cc(&self, index: u32, cc: i16) {
        let mut core = self.core.lock();
        if let Some(data) = core.params.data.get_mut(index as usize) {
            data.midi_cc = cc.clamp(-1, 119);
        }
        drop(core);
        if let Backend::Bridged(transport) = &self.process.lock().backend {
            let _ = transport.set_parameter_midi_cc(index, cc);
        }
    }

    pub fn set_program(&self, index: i32) {
        {
            let mut core = self.core.lock();
            let count = core.programs.names.len() as i32;
            core.programs.current = index.clamp(-1, count - 1);
        }
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => adapter.set_program(index),
            Backend::Bridged(transport) => {
                let _ = transport.set_program(index);
            }
        }
        // Program changes may move every parameter; refresh the cache.
        drop(process);
        self.refresh_parameter_cache();
    }

    pub fn set_midi_program(&self, index: i32) {
        let target = {
            let mut core = self.core.lock();
            let count = core.midi_programs.data.len() as i32;
            core.midi_programs.current = index.clamp(-1, count - 1);
            if core.midi_programs.current >= 0 {
                core.midi_programs
                    .data
                    .get(core.midi_programs.current as usize)
                    .map(|data| (data.bank, data.program))
            } else {
                None
            }
        };
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => {
                if let Some((bank, program)) = target {
                    adapter.set_midi_program(bank, program);
                }
            }
            Backend::Bridged(transport) => {
                let _ = transport.set_midi_program(index);
            }
        }
    }

    /// Hands a chunk-data file to the backing plugin. Only bridged plugins
    /// transfer chunks through files; local adapters receive their state
    /// through custom data.
    pub fn set_chunk_data_file(&self, path: &str) {
        let process = self.process.lock();
        if let Backend::Bridged(transport) = &process.backend {
            let _ = transport.set_chunk_data_file(path);
        }
    }

    /// Replaces the whole option bitset, used by project restore.
    pub fn set_options_raw(&self, bits: u32) {
        self.options.store(bits, Ordering::Relaxed);
    }

    pub fn set_custom_data(&self, kind: &str, key: &str, value: &str) {
        let mut core = self.core.lock();
        if let Some(existing) = core
            .custom_data
            .iter_mut()
            .find(|entry| entry.kind == kind && entry.key == key)
        {
            existing.value = value.to_string();
        } else {
            core.custom_data.push(CustomData {
                kind: kind.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        drop(core);
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => adapter.set_custom_data(kind, key, value),
            Backend::Bridged(transport) => {
                let _ = transport.set_custom_data(kind, key, value);
            }
        }
    }

    /// Refreshes the value cache from the backing plugin; used after
    /// program changes and by idle for output parameters. Lock order is
    /// always master before single.
    pub fn refresh_parameter_cache(&self) {
        let mut core = self.core.lock();
        let Some(process) = self.process.try_lock() else {
            return;
        };
        if let Backend::Local(adapter) = &process.backend {
            for index in 0..core.params.values.len() {
                core.params.values[index] = adapter.parameter_value(index as u32);
            }
        }
    }

    pub fn custom_data_snapshot(&self) -> Vec<CustomData> {
        self.core.lock().custom_data.clone()
    }

    /// Queues one externally-injected note for the next cycle.
    pub fn send_midi_note(&self, channel: u8, note: u8, velocity: u8) {
        let _ = self.ext_notes.push(ExternalNote {
            channel,
            note,
            velocity,
        });
    }

    pub fn randomize_parameters(&self, mut rng: impl FnMut() -> f32) {
        let indices: Vec<u32> = {
            let core = self.core.lock();
            (0..core.params.count())
                .filter(|&i| {
                    let data = &core.params.data[i as usize];
                    data.kind == ParameterKind::Input && data.hints & param_hints::ENABLED != 0
                })
                .collect()
        };
        for index in indices {
            let (min, max) = {
                let core = self.core.lock();
                let ranges = &core.params.ranges[index as usize];
                (ranges.min, ranges.max)
            };
            self.set_parameter_value(index, min + (max - min) * rng().clamp(0.0, 1.0));
        }
    }

    pub fn reset_parameters(&self) {
        let defaults: Vec<(u32, f32)> = {
            let core = self.core.lock();
            (0..core.params.count())
                .filter(|&i| core.params.data[i as usize].kind == ParameterKind::Input)
                .map(|i| (i, core.params.ranges[i as usize].def))
                .collect()
        };
        for (index, def) in defaults {
            self.set_parameter_value(index, def);
        }
    }

    pub fn ui_show(&self, show: bool) {
        let mut process = self.process.lock();
        match &mut process.backend {
            Backend::Local(adapter) => adapter.ui_show(show),
            Backend::Bridged(transport) => {
                let _ = transport.show_ui(show);
            }
        }
    }

    pub fn ui_idle(&self) {
        let mut process = self.process.lock();
        if let Backend::Local(adapter) = &mut process.backend {
            adapter.ui_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapter::GainAdapter;

    fn gain_plugin() -> Plugin {
        let plugin = Plugin::new(
            0,
            PluginType::Internal,
            "gain",
            "",
            "gain",
            Backend::Local(Box::new(GainAdapter::stereo())),
            256,
        );
        plugin.reload(false, false);
        plugin
    }

    #[test]
    fn balance_split_law() {
        assert_eq!(split_balance(0.0), (-1.0, 1.0));
        assert_eq!(split_balance(-1.0), (-1.0, -1.0));
        assert_eq!(split_balance(1.0), (1.0, 1.0));
        assert_eq!(split_balance(-0.5), (-1.0, 0.0));
        assert_eq!(split_balance(0.5), (0.0, 1.0));
    }

    #[test]
    fn fixed_value_is_idempotent() {
        let plugin = gain_plugin();
        let core = plugin.core.lock();
        for raw in [-2.0f32, -0.3, 0.0, 0.49, 0.5, 0.77, 1.3, 9.0] {
            let once = core.params.fixed_value(0, raw);
            assert_eq!(core.params.fixed_value(0, once), once);
        }
    }

    #[test]
    fn boolean_parameters_snap_around_midpoint() {
        let mut params = Parameters::default();
        params.data.push(ParameterData {
            hints: param_hints::BOOLEAN,
            ..Default::default()
        });
        params.ranges.push(ParameterRanges {
            def: 0.0,
            min: 0.0,
            max: 1.0,
            ..Default::default()
        });
        params.values.push(0.0);
        assert_eq!(params.fixed_value(0, 0.49), 0.0);
        assert_eq!(params.fixed_value(0, 0.5), 1.0);
        assert_eq!(params.fixed_value(0, 2.0), 1.0);
    }

    #[test]
    fn reload_derives_rack_capability() {
        let plugin = gain_plugin();
        assert!(plugin.extra_hints() & extra_hints::CAN_RUN_RACK != 0);
        assert!(plugin.hints() & hints::CAN_DRYWET != 0);
        assert!(plugin.hints() & hints::CAN_BALANCE != 0);
        assert!(plugin.is_enabled());
    }

    #[test]
    fn mix_controls_clamp() {
        let plugin = gain_plugin();
        assert_eq!(plugin.mix.set_volume(9.0), 1.27);
        assert_eq!(plugin.mix.set_dry_wet(-3.0), 0.0);
        assert_eq!(plugin.mix.set_balance_left(-7.0), -1.0);
    }
}
