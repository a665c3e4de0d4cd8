//! The outer-host C ABI: a descriptor table of function pointers, eight
//! variants differing only in name and I/O counts, and the fixed
//! 100-input/10-output parameter surface.
//!
//! No unwind crosses this boundary: every entry runs under `catch_unwind`
//! and translates failure into a return code or silence.

use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use stagewire_rt::{EngineEvent, EngineEventKind, TransportBbt, TransportInfo};

use crate::engine::Engine;
use crate::options::{EngineOptions, ProcessMode};
use crate::plugin::ParameterRanges;

/// Host-facing parameter surface: the first plugin's parameters, then the
/// engine float cache.
pub const PARAM_INPUT_COUNT: usize = 100;
pub const PARAM_OUTPUT_COUNT: usize = 10;
pub const PARAM_TOTAL: usize = PARAM_INPUT_COUNT + PARAM_OUTPUT_COUNT;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeMidiEvent {
    pub port: u8,
    pub size: u8,
    pub data: [u8; 4],
    pub time: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeParameterRanges {
    pub def: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub step_small: f32,
    pub step_large: f32,
}

#[repr(C)]
pub struct NativeParameter {
    pub hints: u32,
    pub name: *const c_char,
    pub unit: *const c_char,
    pub ranges: NativeParameterRanges,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeTimeInfo {
    pub playing: u8,
    pub frame: u64,
    pub bbt_valid: u8,
    pub bar: i32,
    pub beat: i32,
    pub tick: f64,
    pub bar_start_tick: f64,
    pub beats_per_bar: f32,
    pub beat_type: f32,
    pub ticks_per_beat: f64,
    pub beats_per_minute: f64,
}

#[repr(C)]
pub struct NativeMidiProgram {
    pub bank: u32,
    pub program: u32,
    pub name: *const c_char,
}

/// What the outer host provides us.
#[repr(C)]
pub struct NativeHostDescriptor {
    pub handle: *mut c_void,
    pub resource_dir: *const c_char,
    pub ui_name: *const c_char,
    pub get_buffer_size: Option<extern "C" fn(*mut c_void) -> u32>,
    pub get_sample_rate: Option<extern "C" fn(*mut c_void) -> f64>,
    pub is_offline: Option<extern "C" fn(*mut c_void) -> bool>,
    pub get_time_info: Option<extern "C" fn(*mut c_void) -> *const NativeTimeInfo>,
    pub write_midi_event: Option<extern "C" fn(*mut c_void, *const NativeMidiEvent) -> bool>,
    pub ui_parameter_changed: Option<extern "C" fn(*mut c_void, u32, f32)>,
    pub ui_closed: Option<extern "C" fn(*mut c_void)>,
}

/// Dispatcher opcodes from the outer host.
pub const DISPATCH_NULL: u32 = 0;
pub const DISPATCH_BUFFER_SIZE_CHANGED: u32 = 1;
pub const DISPATCH_SAMPLE_RATE_CHANGED: u32 = 2;
pub const DISPATCH_OFFLINE_CHANGED: u32 = 3;
pub const DISPATCH_UI_NAME_CHANGED: u32 = 4;
pub const DISPATCH_GET_INTERNAL_HANDLE: u32 = 5;
pub const DISPATCH_IDLE: u32 = 6;

/// What we export to the outer host.
#[repr(C)]
pub struct NativePluginDescriptor {
    pub name: *const c_char,
    pub label: *const c_char,
    pub maker: *const c_char,
    pub copyright: *const c_char,
    pub audio_ins: u32,
    pub audio_outs: u32,
    pub cv_ins: u32,
    pub cv_outs: u32,
    pub midi_ins: u32,
    pub midi_outs: u32,
    pub instantiate: extern "C" fn(*const NativeHostDescriptor) -> *mut c_void,
    pub cleanup: extern "C" fn(*mut c_void),
    pub get_parameter_count: extern "C" fn(*mut c_void) -> u32,
    pub get_parameter_info: extern "C" fn(*mut c_void, u32) -> *const NativeParameter,
    pub get_parameter_value: extern "C" fn(*mut c_void, u32) -> f32,
    pub set_parameter_value: extern "C" fn(*mut c_void, u32, f32),
    pub get_midi_program_count: extern "C" fn(*mut c_void) -> u32,
    pub get_midi_program_info: extern "C" fn(*mut c_void, u32) -> *const NativeMidiProgram,
    pub set_midi_program: extern "C" fn(*mut c_void, u8, u32, u32),
    pub ui_show: extern "C" fn(*mut c_void, bool),
    pub ui_idle: extern "C" fn(*mut c_void),
    pub ui_set_parameter_value: extern "C" fn(*mut c_void, u32, f32),
    pub activate: extern "C" fn(*mut c_void),
    pub deactivate: extern "C" fn(*mut c_void),
    #[allow(clippy::type_complexity)]
    pub process: extern "C" fn(
        *mut c_void,
        *const *const f32,
        *mut *mut f32,
        u32,
        *const NativeMidiEvent,
        u32,
    ),
    pub get_state: extern "C" fn(*mut c_void) -> *const c_char,
    pub set_state: extern "C" fn(*mut c_void, *const c_char),
    pub dispatcher: extern "C" fn(*mut c_void, u32, i32, isize, *mut c_void, f32) -> isize,
}

unsafe impl Sync for NativePluginDescriptor {}

/// One instantiated descriptor: the engine plus ABI-side scratch.
struct EngineHandle {
    engine: Arc<Engine>,
    audio_ins: u32,
    audio_outs: u32,
    cv_ins: u32,
    cv_outs: u32,
    host: *const NativeHostDescriptor,
    param_cache: [f32; PARAM_TOTAL],
    param_scratch: NativeParameter,
    param_name: CString,
    state_text: Option<CString>,
    event_scratch: Vec<EngineEvent>,
}

unsafe impl Send for EngineHandle {}

impl EngineHandle {
    fn host(&self) -> Option<&NativeHostDescriptor> {
        unsafe { self.host.as_ref() }
    }
}

fn handle_mut<'a>(ptr: *mut c_void) -> Option<&'a mut EngineHandle> {
    unsafe { (ptr as *mut EngineHandle).as_mut() }
}

struct VariantConfig {
    mode: ProcessMode,
    audio_ins: u32,
    audio_outs: u32,
    cv_ins: u32,
    cv_outs: u32,
}

fn instantiate_common(host: *const NativeHostDescriptor, config: VariantConfig) -> *mut c_void {
    let result = catch_unwind(|| {
        let (buffer_size, sample_rate) = unsafe {
            match host.as_ref() {
                Some(desc) => {
                    let buffer = desc
                        .get_buffer_size
                        .map(|f| f(desc.handle))
                        .filter(|&b| b > 0)
                        .unwrap_or(512);
                    let rate = desc
                        .get_sample_rate
                        .map(|f| f(desc.handle))
                        .filter(|&r| r > 0.0)
                        .unwrap_or(48_000.0);
                    (buffer, rate)
                }
                None => (512, 48_000.0),
            }
        };
        let options = EngineOptions {
            process_mode: config.mode,
            ..EngineOptions::default()
        };
        let engine = Engine::with_io(
            options,
            buffer_size,
            sample_rate,
            (config.audio_ins, config.audio_outs),
            (config.cv_ins, config.cv_outs),
        );
        Box::new(EngineHandle {
            engine,
            audio_ins: config.audio_ins,
            audio_outs: config.audio_outs,
            cv_ins: config.cv_ins,
            cv_outs: config.cv_outs,
            host,
            param_cache: [0.0; PARAM_TOTAL],
            param_scratch: NativeParameter {
                hints: 0,
                name: std::ptr::null(),
                unit: std::ptr::null(),
                ranges: NativeParameterRanges {
                    def: 0.0,
                    min: 0.0,
                    max: 1.0,
                    step: 0.01,
                    step_small: 0.0001,
                    step_large: 0.1,
                },
            },
            param_name: CString::default(),
            state_text: None,
            event_scratch: Vec::with_capacity(512),
        })
    });
    match result {
        Ok(handle) => Box::into_raw(handle) as *mut c_void,
        Err(_) => std::ptr::null_mut(),
    }
}

extern "C" fn plugin_cleanup(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let handle = unsafe { Box::from_raw(ptr as *mut EngineHandle) };
        handle.engine.close();
    }));
}

extern "C" fn plugin_get_parameter_count(_ptr: *mut c_void) -> u32 {
    PARAM_TOTAL as u32
}

extern "C" fn plugin_get_parameter_info(ptr: *mut c_void, index: u32) -> *const NativeParameter {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_mut(ptr)?;
        let (name, hints, ranges) = first_plugin_parameter(handle, index)
            .unwrap_or_else(|| (format!("Param {index}"), 0, ParameterRanges::default()));
        handle.param_name = CString::new(name).unwrap_or_default();
        handle.param_scratch = NativeParameter {
            hints,
            name: handle.param_name.as_ptr(),
            unit: std::ptr::null(),
            ranges: NativeParameterRanges {
                def: ranges.def,
                min: ranges.min,
                max: ranges.max,
                step: ranges.step,
                step_small: ranges.step_small,
                step_large: ranges.step_large,
            },
        };
        Some(&handle.param_scratch as *const NativeParameter)
    }));
    match result {
        Ok(Some(ptr)) => ptr,
        _ => std::ptr::null(),
    }
}

fn first_plugin_parameter(
    handle: &EngineHandle,
    index: u32,
) -> Option<(String, u32, ParameterRanges)> {
    let plugin = handle.engine.plugin(0).ok()?;
    let core = plugin.core.lock();
    let data = core.params.data.get(index as usize)?;
    Some((
        data.name.clone(),
        data.hints,
        core.params.ranges[index as usize],
    ))
}

extern "C" fn plugin_get_parameter_value(ptr: *mut c_void, index: u32) -> f32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_mut(ptr)?;
        if let Ok(plugin) = handle.engine.plugin(0) {
            if index < plugin.parameter_count() {
                return Some(plugin.parameter_value(index));
            }
        }
        handle.param_cache.get(index as usize).copied()
    }));
    result.ok().flatten().unwrap_or(0.0)
}

extern "C" fn plugin_set_parameter_value(ptr: *mut c_void, index: u32, value: f32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = handle_mut(ptr) else {
            return;
        };
        if let Ok(plugin) = handle.engine.plugin(0) {
            if index < plugin.parameter_count() {
                plugin.set_parameter_value(index, value);
                return;
            }
        }
        if let Some(slot) = handle.param_cache.get_mut(index as usize) {
            *slot = value;
        }
    }));
}

extern "C" fn plugin_get_midi_program_count(ptr: *mut c_void) -> u32 {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_mut(ptr)?;
        let plugin = handle.engine.plugin(0).ok()?;
        let core = plugin.core.lock();
        Some(core.midi_programs.data.len() as u32)
    }));
    result.ok().flatten().unwrap_or(0)
}

extern "C" fn plugin_get_midi_program_info(
    _ptr: *mut c_void,
    _index: u32,
) -> *const NativeMidiProgram {
    // Midi program info needs per-call storage; the UI pipe carries the
    // full table instead.
    std::ptr::null()
}

extern "C" fn plugin_set_midi_program(ptr: *mut c_void, _channel: u8, bank: u32, program: u32) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = handle_mut(ptr) else {
            return;
        };
        if let Ok(plugin) = handle.engine.plugin(0) {
            let index = {
                let core = plugin.core.lock();
                core.midi_programs
                    .data
                    .iter()
                    .position(|d| d.bank == bank && d.program == program)
            };
            if let Some(index) = index {
                plugin.set_midi_program(index as i32);
            }
        }
    }));
}

extern "C" fn plugin_ui_show(ptr: *mut c_void, show: bool) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(handle) = handle_mut(ptr) {
            handle.engine.ui_show(show);
        }
    }));
}

extern "C" fn plugin_ui_idle(ptr: *mut c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(handle) = handle_mut(ptr) {
            handle.engine.ui_idle();
        }
    }));
}

extern "C" fn plugin_ui_set_parameter_value(ptr: *mut c_void, index: u32, value: f32) {
    plugin_set_parameter_value(ptr, index, value);
}

extern "C" fn plugin_activate(ptr: *mut c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(handle) = handle_mut(ptr) {
            handle.engine.activate();
        }
    }));
}

extern "C" fn plugin_deactivate(ptr: *mut c_void) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        if let Some(handle) = handle_mut(ptr) {
            handle.engine.deactivate();
        }
    }));
}

extern "C" fn plugin_process(
    ptr: *mut c_void,
    in_buffer: *const *const f32,
    out_buffer: *mut *mut f32,
    frames: u32,
    midi_events: *const NativeMidiEvent,
    midi_count: u32,
) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = handle_mut(ptr) else {
            return;
        };
        let nframes = frames as usize;
        let audio_ins = handle.audio_ins as usize;
        let audio_outs = handle.audio_outs as usize;
        let cv_ins = handle.cv_ins as usize;
        let cv_outs = handle.cv_outs as usize;
        if (in_buffer.is_null() && audio_ins + cv_ins > 0)
            || (out_buffer.is_null() && audio_outs + cv_outs > 0)
        {
            return;
        }

        let ins: Vec<&[f32]> = (0..audio_ins + cv_ins)
            .map(|i| unsafe { std::slice::from_raw_parts(*in_buffer.add(i), nframes) })
            .collect();
        let mut outs: Vec<&mut [f32]> = (0..audio_outs + cv_outs)
            .map(|i| unsafe { std::slice::from_raw_parts_mut(*out_buffer.add(i), nframes) })
            .collect();
        let (audio_in, cv_in) = ins.split_at(audio_ins);
        let (audio_out, cv_out) = outs.split_at_mut(audio_outs);

        if let Some(host) = handle.host() {
            if let Some(get_time_info) = host.get_time_info {
                let info = get_time_info(host.handle);
                if let Some(info) = unsafe { info.as_ref() } {
                    handle.engine.set_transport_rt(native_time_to_transport(info));
                }
            }
        }

        handle.event_scratch.clear();
        for i in 0..midi_count as usize {
            let event = unsafe { &*midi_events.add(i) };
            let size = (event.size as usize).min(4);
            if handle.event_scratch.len() < handle.event_scratch.capacity() {
                handle.event_scratch.push(EngineEvent::from_midi(
                    event.time,
                    event.port,
                    &event.data[..size],
                ));
            }
        }

        let host = handle.host;
        let mut write_out = |event: &EngineEvent| {
            let EngineEventKind::Midi(data) = event.kind else {
                return;
            };
            let native = NativeMidiEvent {
                port: data.port,
                size: data.size,
                data: data.data,
                time: event.time,
            };
            if let Some(desc) = unsafe { host.as_ref() } {
                if let Some(write) = desc.write_midi_event {
                    write(desc.handle, &native);
                }
            }
        };

        handle.engine.process(
            audio_in,
            audio_out,
            cv_in,
            cv_out,
            &handle.event_scratch,
            &mut write_out,
            frames,
        );
    }));
}

fn native_time_to_transport(info: &NativeTimeInfo) -> TransportInfo {
    TransportInfo {
        playing: info.playing != 0,
        frame: info.frame,
        bbt: (info.bbt_valid != 0).then_some(TransportBbt {
            bar: info.bar,
            beat: info.beat,
            tick: info.tick,
            bar_start_tick: info.bar_start_tick,
            beats_per_bar: info.beats_per_bar,
            beat_type: info.beat_type,
            ticks_per_beat: info.ticks_per_beat,
            beats_per_minute: info.beats_per_minute,
        }),
    }
}

extern "C" fn plugin_get_state(ptr: *mut c_void) -> *const c_char {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let handle = handle_mut(ptr)?;
        let text = handle.engine.get_state();
        handle.state_text = CString::new(text).ok();
        handle.state_text.as_ref().map(|s| s.as_ptr())
    }));
    match result {
        Ok(Some(ptr)) => ptr,
        _ => std::ptr::null(),
    }
}

extern "C" fn plugin_set_state(ptr: *mut c_void, data: *const c_char) {
    let _ = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = handle_mut(ptr) else {
            return;
        };
        if data.is_null() {
            return;
        }
        let text = unsafe { CStr::from_ptr(data) }.to_string_lossy();
        if let Err(err) = handle.engine.set_state(&text) {
            handle.engine.set_last_error(err.to_string());
        }
    }));
}

extern "C" fn plugin_dispatcher(
    ptr: *mut c_void,
    opcode: u32,
    _index: i32,
    value: isize,
    _data: *mut c_void,
    opt: f32,
) -> isize {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = handle_mut(ptr) else {
            return 0;
        };
        match opcode {
            DISPATCH_NULL | DISPATCH_UI_NAME_CHANGED | DISPATCH_IDLE => 0,
            DISPATCH_BUFFER_SIZE_CHANGED => {
                if value > 0 {
                    handle.engine.buffer_size_changed(value as u32);
                }
                0
            }
            DISPATCH_SAMPLE_RATE_CHANGED => {
                if opt > 0.0 {
                    handle.engine.sample_rate_changed(opt as f64);
                }
                0
            }
            DISPATCH_OFFLINE_CHANGED => {
                handle.engine.offline_changed(value != 0);
                0
            }
            DISPATCH_GET_INTERNAL_HANDLE => Arc::as_ptr(&handle.engine) as isize,
            _ => 0,
        }
    }));
    result.unwrap_or(0)
}

macro_rules! descriptor {
    ($instantiate:ident, $name:literal, $label:literal, $mode:expr,
     audio: ($ains:literal, $aouts:literal), cv: ($cvins:literal, $cvouts:literal),
     midi_out: $mouts:literal) => {{
        extern "C" fn $instantiate(host: *const NativeHostDescriptor) -> *mut c_void {
            instantiate_common(
                host,
                VariantConfig {
                    mode: $mode,
                    audio_ins: $ains,
                    audio_outs: $aouts,
                    cv_ins: $cvins,
                    cv_outs: $cvouts,
                },
            )
        }
        NativePluginDescriptor {
            name: concat!($name, "\0").as_ptr() as *const c_char,
            label: concat!($label, "\0").as_ptr() as *const c_char,
            maker: "Stagewire\0".as_ptr() as *const c_char,
            copyright: "GPL-2.0-or-later\0".as_ptr() as *const c_char,
            audio_ins: $ains,
            audio_outs: $aouts,
            cv_ins: $cvins,
            cv_outs: $cvouts,
            midi_ins: 1,
            midi_outs: $mouts,
            instantiate: $instantiate,
            cleanup: plugin_cleanup,
            get_parameter_count: plugin_get_parameter_count,
            get_parameter_info: plugin_get_parameter_info,
            get_parameter_value: plugin_get_parameter_value,
            set_parameter_value: plugin_set_parameter_value,
            get_midi_program_count: plugin_get_midi_program_count,
            get_midi_program_info: plugin_get_midi_program_info,
            set_midi_program: plugin_set_midi_program,
            ui_show: plugin_ui_show,
            ui_idle: plugin_ui_idle,
            ui_set_parameter_value: plugin_ui_set_parameter_value,
            activate: plugin_activate,
            deactivate: plugin_deactivate,
            process: plugin_process,
            get_state: plugin_get_state,
            set_state: plugin_set_state,
            dispatcher: plugin_dispatcher,
        }
    }};
}

pub static RACK: NativePluginDescriptor = descriptor!(
    instantiate_rack, "Stagewire Rack", "stagewire-rack", ProcessMode::Rack,
    audio: (2, 2), cv: (0, 0), midi_out: 1
);
pub static RACK_NO_MIDI_OUT: NativePluginDescriptor = descriptor!(
    instantiate_rack_nmo, "Stagewire Rack (no midi out)", "stagewire-rack-nomidiout",
    ProcessMode::Rack, audio: (2, 2), cv: (0, 0), midi_out: 0
);
pub static PATCHBAY: NativePluginDescriptor = descriptor!(
    instantiate_patchbay, "Stagewire Patchbay", "stagewire-patchbay", ProcessMode::Patchbay,
    audio: (2, 2), cv: (0, 0), midi_out: 1
);
pub static PATCHBAY_SIDECHAIN: NativePluginDescriptor = descriptor!(
    instantiate_patchbay3s, "Stagewire Patchbay (sidechain)", "stagewire-patchbay3s",
    ProcessMode::Patchbay, audio: (3, 2), cv: (0, 0), midi_out: 1
);
pub static PATCHBAY_16: NativePluginDescriptor = descriptor!(
    instantiate_patchbay16, "Stagewire Patchbay (16ch)", "stagewire-patchbay16",
    ProcessMode::Patchbay, audio: (16, 16), cv: (0, 0), midi_out: 1
);
pub static PATCHBAY_32: NativePluginDescriptor = descriptor!(
    instantiate_patchbay32, "Stagewire Patchbay (32ch)", "stagewire-patchbay32",
    ProcessMode::Patchbay, audio: (32, 32), cv: (0, 0), midi_out: 1
);
pub static PATCHBAY_64: NativePluginDescriptor = descriptor!(
    instantiate_patchbay64, "Stagewire Patchbay (64ch)", "stagewire-patchbay64",
    ProcessMode::Patchbay, audio: (64, 64), cv: (0, 0), midi_out: 1
);
pub static PATCHBAY_CV: NativePluginDescriptor = descriptor!(
    instantiate_patchbaycv, "Stagewire Patchbay (CV)", "stagewire-patchbay-cv",
    ProcessMode::Patchbay, audio: (2, 2), cv: (5, 5), midi_out: 1
);

/// The full export table, in registration order.
pub static DESCRIPTORS: [&NativePluginDescriptor; 8] = [
    &RACK,
    &RACK_NO_MIDI_OUT,
    &PATCHBAY,
    &PATCHBAY_SIDECHAIN,
    &PATCHBAY_16,
    &PATCHBAY_32,
    &PATCHBAY_64,
    &PATCHBAY_CV,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_table_has_eight_variants() {
        assert_eq!(DESCRIPTORS.len(), 8);
        let rack_name = unsafe { CStr::from_ptr(RACK.name) };
        assert_eq!(rack_name.to_str().unwrap(), "Stagewire Rack");
        assert_eq!(PATCHBAY_CV.cv_ins, 5);
        assert_eq!(RACK_NO_MIDI_OUT.midi_outs, 0);
    }

    #[test]
    fn instantiate_process_cleanup_roundtrip() {
        let handle = (RACK.instantiate)(std::ptr::null());
        assert!(!handle.is_null());
        (RACK.activate)(handle);

        let frames = 64usize;
        let in_l: Vec<f32> = (0..frames).map(|i| i as f32 / frames as f32).collect();
        let in_r = in_l.clone();
        let mut out_l = vec![0.0f32; frames];
        let mut out_r = vec![0.0f32; frames];
        let ins: [*const f32; 2] = [in_l.as_ptr(), in_r.as_ptr()];
        let mut outs: [*mut f32; 2] = [out_l.as_mut_ptr(), out_r.as_mut_ptr()];
        (RACK.process)(
            handle,
            ins.as_ptr(),
            outs.as_mut_ptr(),
            frames as u32,
            std::ptr::null(),
            0,
        );
        // Empty rack: bit-exact passthrough.
        assert_eq!(out_l, in_l);
        assert_eq!(out_r, in_r);

        assert_eq!((RACK.get_parameter_count)(handle), PARAM_TOTAL as u32);
        (RACK.deactivate)(handle);
        (RACK.cleanup)(handle);
    }
}
