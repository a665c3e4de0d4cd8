//! The cooperative idle pump, driven by the outer host's main thread.
//!
//! One `ui_idle` tick: plugin UI idle hooks, the UI pipe (inbound command
//! batch, then the periodic status frames), the post-RT event drain, and
//! bridged-plugin supervision.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use stagewire_rt::{PostRtEvent, PostRtEventKind};

use crate::callback::EngineCallback;
use crate::engine::Engine;
use crate::options::TransportMode;
use crate::plugin::{
    hints, CustomData, ParameterKind, Plugin, PluginType, CUSTOM_DATA_PROPERTY,
    PARAMETER_BALANCE_LEFT, PARAMETER_BALANCE_RIGHT, PARAMETER_CTRL_CHANNEL, PARAMETER_DRYWET,
    PARAMETER_PANNING, PARAMETER_VOLUME,
};
use crate::uipipe::{fmt_float, parse_opt_str, UiPipe, UiState};
use stagewire_bridge::BridgeTransport;

const ARG_TIMEOUT: Duration = Duration::from_millis(200);
/// One idle tick is nominally ~30ms; the bridge ping timeout converts from
/// milliseconds at this rate.
const IDLE_TICK_MS: u32 = 30;

impl Engine {
    pub fn set_ui_pipe(&self, pipe: UiPipe) {
        *self.ui.lock() = Some(Arc::new(pipe));
    }

    pub(crate) fn ui_pipe(&self) -> Option<Arc<UiPipe>> {
        self.ui.lock().clone()
    }

    /// Outer-host `ui_show`. Showing re-sends the full engine and plugin
    /// snapshot so a freshly attached UI is complete. With no pipe attached
    /// yet, showing launches the external UI helper from the binary dir.
    pub fn ui_show(&self, show: bool) {
        if show && self.ui_pipe().is_none() {
            let options = self.options_snapshot();
            if options.prefer_ui_bridges && !options.binary_dir.is_empty() {
                let binary = std::path::Path::new(&options.binary_dir).join("stagewire-ui");
                match UiPipe::spawn_helper(&binary, &[]) {
                    Ok(pipe) => self.set_ui_pipe(pipe),
                    Err(err) => warn!(?err, "failed to launch UI helper"),
                }
            }
        }
        let Some(pipe) = self.ui_pipe() else {
            if show {
                self.callback(EngineCallback::Error {
                    message: String::from("UI is not available"),
                });
            }
            return;
        };
        if show {
            pipe.set_state(UiState::Show);
            self.send_engine_info(&pipe);
            self.send_options(&pipe);
            for plugin in self.plugins_snapshot() {
                self.send_plugin_snapshot(&pipe, &plugin);
            }
        } else {
            pipe.set_state(UiState::Hide);
            self.callback(EngineCallback::UiStateChanged { id: 0, state: 0 });
        }
    }

    /// One main-thread idle tick.
    pub fn ui_idle(self: &Arc<Self>) {
        // 1. Plugin UI hooks, panics swallowed per plugin.
        for plugin in self.plugins_snapshot() {
            let bits = plugin.hints();
            if bits & hints::HAS_CUSTOM_UI != 0 && bits & hints::NEEDS_UI_MAIN_THREAD != 0 {
                let result = catch_unwind(AssertUnwindSafe(|| plugin.ui_idle()));
                if result.is_err() {
                    warn!(id = plugin.id(), "plugin ui_idle panicked");
                }
            }
        }

        // 2. UI pipe: one inbound batch, then the periodic frames.
        if let Some(pipe) = self.ui_pipe() {
            if pipe.helper_crashed() && pipe.state() != UiState::Crashed {
                pipe.set_state(UiState::Crashed);
                self.callback(EngineCallback::UiStateChanged { id: 0, state: -1 });
            }
            let mut remaining = 64;
            while remaining > 0 {
                let Some(command) = pipe.try_recv_line() else {
                    break;
                };
                remaining -= 1;
                self.dispatch_ui_command(&pipe, &command);
            }
            self.send_runtime_info(&pipe);
            self.send_transport(&pipe);
            for plugin in self.plugins_snapshot() {
                self.send_peaks(&pipe, &plugin);
                self.send_output_parameters(&pipe, &plugin);
            }
        }

        // 3. Post-RT events, one batch per tick.
        for plugin in self.plugins_snapshot() {
            plugin.post_rt.try_splice();
            for event in plugin.post_rt.drain() {
                self.dispatch_post_rt(&plugin, event);
            }
        }

        // 4. Bridged-plugin supervision.
        let ping_ticks = {
            let timeout = self.options_snapshot().ui_bridges_timeout;
            (timeout / IDLE_TICK_MS).max(1)
        };
        for plugin in self.plugins_snapshot() {
            if !plugin.is_bridged() || plugin.has_crashed() {
                continue;
            }
            let report = plugin.bridge_idle(ping_ticks);
            if report.crashed {
                let name = plugin.name();
                self.callback(EngineCallback::Error {
                    message: BridgeTransport::crash_message(&name),
                });
                self.callback(EngineCallback::PluginUnavailable {
                    id: plugin.id(),
                    reason: String::from("bridge process died"),
                });
            } else if report.unresponsive {
                warn!(id = plugin.id(), "bridge worker stopped answering pings");
            }
            if report.ui_closed {
                self.callback(EngineCallback::UiStateChanged {
                    id: plugin.id(),
                    state: 0,
                });
            }
        }

        // Finally flush engine callbacks to the UI and the outer host.
        self.flush_callbacks();
    }

    fn flush_callbacks(&self) {
        let drained = self.drain_callbacks();
        if drained.is_empty() {
            return;
        }
        let pipe = self.ui_pipe();
        let host = self.host_callback.lock();
        for callback in drained {
            let flat = callback.flatten();
            if let Some(pipe) = &pipe {
                let mut writer = pipe.writer();
                writer.write_message(&format!("ENGINE_CALLBACK_{}\n", flat.opcode));
                writer.write_uint(flat.plugin_id);
                writer.write_int(flat.value1 as i64);
                writer.write_int(flat.value2 as i64);
                writer.write_int(flat.value3 as i64);
                writer.write_float(flat.valuef);
                writer.write_and_fix_message(&flat.value_str);
                writer.flush_messages();
            }
            if let Some(host) = &*host {
                host(&flat);
            }
        }
    }

    fn dispatch_post_rt(&self, plugin: &Arc<Plugin>, event: PostRtEvent) {
        if !event.send_callback_later {
            return;
        }
        let id = plugin.id();
        match event.kind {
            PostRtEventKind::ParameterValueChanged => {
                self.callback(EngineCallback::ParameterValueChanged {
                    id,
                    index: event.value1,
                    value: event.valuef,
                });
            }
            PostRtEventKind::ProgramChanged => {
                self.callback(EngineCallback::ProgramChanged {
                    id,
                    index: event.value1,
                });
            }
            PostRtEventKind::MidiProgramChanged => {
                self.callback(EngineCallback::MidiProgramChanged {
                    id,
                    index: event.value1,
                });
            }
            PostRtEventKind::NoteOn => {
                self.callback(EngineCallback::NoteOn {
                    id,
                    channel: event.value1 as u8,
                    note: event.value2 as u8,
                    velocity: event.value3 as u8,
                });
            }
            PostRtEventKind::NoteOff => {
                self.callback(EngineCallback::NoteOff {
                    id,
                    channel: event.value1 as u8,
                    note: event.value2 as u8,
                });
            }
            PostRtEventKind::LatencyChanged | PostRtEventKind::ProcessTimedOut => {}
        }
    }

    // ---- server -> client frames ----------------------------------------

    pub(crate) fn send_engine_info(&self, pipe: &UiPipe) {
        let (buffer_size, sample_rate) = {
            let inner = self.inner.lock();
            (inner.buffer_size, inner.sample_rate)
        };
        let mut writer = pipe.writer();
        writer.write_message("osc-urls\n");
        writer.write_and_fix_message("");
        writer.write_and_fix_message("");
        writer.write_message("max-plugin-number\n");
        writer.write_uint(crate::MAX_PLUGINS);
        writer.write_message("buffer-size\n");
        writer.write_uint(buffer_size);
        writer.write_message("sample-rate\n");
        writer.write_double(sample_rate);
        writer.flush_messages();
    }

    pub(crate) fn send_options(&self, pipe: &UiPipe) {
        let options = self.options_snapshot();
        let forced = options.forced;
        let mut writer = pipe.writer();
        for (id, value) in options.dump() {
            writer.write_message(&format!("ENGINE_OPTION_{id}\n"));
            writer.write_bool(forced);
            writer.write_and_fix_message(&value);
        }
        writer.flush_messages();
    }

    fn send_runtime_info(&self, pipe: &UiPipe) {
        let xruns = self.xruns();
        let mut writer = pipe.writer();
        writer.write_message("runtime-info\n");
        writer.write_float(0.0);
        writer.write_uint(xruns);
        writer.flush_messages();
    }

    fn send_transport(&self, pipe: &UiPipe) {
        let info = self.transport();
        let mut writer = pipe.writer();
        writer.write_message("transport\n");
        writer.write_bool(info.playing);
        writer.write_int(info.frame as i64);
        match info.bbt {
            Some(bbt) => {
                writer.write_message(&format!("{}:{}:{}\n", bbt.bar, bbt.beat, bbt.tick as u32));
                writer.write_double(bbt.beats_per_minute);
            }
            None => {
                writer.write_message("0:0:0\n");
                writer.write_double(0.0);
            }
        }
        writer.flush_messages();
    }

    fn send_peaks(&self, pipe: &UiPipe, plugin: &Arc<Plugin>) {
        let peaks = plugin.peaks();
        let mut writer = pipe.writer();
        writer.write_message(&format!("PEAKS_{}\n", plugin.id()));
        writer.write_message(&format!(
            "{}:{}:{}:{}\n",
            fmt_float(peaks[0] as f64),
            fmt_float(peaks[1] as f64),
            fmt_float(peaks[2] as f64),
            fmt_float(peaks[3] as f64)
        ));
        writer.flush_messages();
    }

    fn send_output_parameters(&self, pipe: &UiPipe, plugin: &Arc<Plugin>) {
        plugin.refresh_parameter_cache();
        let outputs: Vec<(u32, f32)> = {
            let core = plugin.core.lock();
            core.params
                .data
                .iter()
                .enumerate()
                .filter(|(_, data)| data.kind == ParameterKind::Output)
                .map(|(index, _)| (index as u32, core.params.values[index]))
                .collect()
        };
        if outputs.is_empty() {
            return;
        }
        let mut writer = pipe.writer();
        for (index, value) in outputs {
            writer.write_message(&format!("PARAMVAL_{}:{}\n", plugin.id(), index));
            writer.write_float(value);
        }
        writer.flush_messages();
    }

    pub(crate) fn send_parameter_value(&self, pipe: &UiPipe, id: u32, index: i32, value: f32) {
        let mut writer = pipe.writer();
        writer.write_message(&format!("PARAMVAL_{id}:{index}\n"));
        writer.write_float(value);
        writer.flush_messages();
    }

    pub(crate) fn send_plugin_snapshot(&self, pipe: &UiPipe, plugin: &Arc<Plugin>) {
        let id = plugin.id();
        let core = plugin.core.lock();
        let mut writer = pipe.writer();

        writer.write_message(&format!("PLUGIN_INFO_{id}\n"));
        writer.write_message(&format!(
            "{}:{}:{}:{}\n",
            core.plugin_type.as_str(),
            core.category,
            plugin.hints(),
            core.unique_id
        ));
        writer.write_and_fix_message(&core.real_name);
        writer.write_and_fix_message(&core.label);
        writer.write_and_fix_message(&core.maker);
        writer.write_and_fix_message(&core.copyright);
        writer.write_and_fix_message(&core.name);
        writer.write_and_fix_message(&core.filename);
        writer.write_and_fix_message(&core.icon_name);

        writer.write_message(&format!("PARAMETER_COUNT_{id}\n"));
        writer.write_uint(core.params.count());
        for (index, data) in core.params.data.iter().enumerate() {
            let kind = match data.kind {
                ParameterKind::Input => 1,
                ParameterKind::Output => 2,
                ParameterKind::Special => 3,
            };
            writer.write_message(&format!("PARAMETER_DATA_{id}:{index}\n"));
            writer.write_message(&format!(
                "{}:{}:{}:{}:{}\n",
                kind, data.hints, data.rindex, data.midi_channel, data.midi_cc
            ));
            writer.write_and_fix_message(&data.name);
            writer.write_and_fix_message(&data.unit);
            let ranges = &core.params.ranges[index];
            writer.write_message(&format!("PARAMETER_RANGES_{id}:{index}\n"));
            writer.write_message(&format!(
                "{}:{}:{}:{}:{}:{}\n",
                fmt_float(ranges.def as f64),
                fmt_float(ranges.min as f64),
                fmt_float(ranges.max as f64),
                fmt_float(ranges.step as f64),
                fmt_float(ranges.step_small as f64),
                fmt_float(ranges.step_large as f64)
            ));
            writer.write_message(&format!("PARAMVAL_{id}:{index}\n"));
            writer.write_float(core.params.values[index]);
        }

        writer.write_message(&format!("PROGRAM_COUNT_{id}\n"));
        writer.write_message(&format!(
            "{}:{}\n",
            core.programs.names.len(),
            core.programs.current
        ));
        for (index, name) in core.programs.names.iter().enumerate() {
            writer.write_message(&format!("PROGRAM_NAME_{id}:{index}\n"));
            writer.write_and_fix_message(name);
        }

        writer.write_message(&format!("MIDI_PROGRAM_COUNT_{id}\n"));
        writer.write_message(&format!(
            "{}:{}\n",
            core.midi_programs.data.len(),
            core.midi_programs.current
        ));
        for (index, data) in core.midi_programs.data.iter().enumerate() {
            writer.write_message(&format!("MIDI_PROGRAM_DATA_{id}:{index}\n"));
            writer.write_message(&format!("{}:{}\n", data.bank, data.program));
            writer.write_and_fix_message(&data.name);
        }

        let properties: Vec<&CustomData> = core
            .custom_data
            .iter()
            .filter(|entry| entry.kind == CUSTOM_DATA_PROPERTY)
            .collect();
        writer.write_message(&format!("CUSTOM_DATA_COUNT_{id}\n"));
        writer.write_uint(properties.len() as u32);
        for (index, entry) in properties.iter().enumerate() {
            writer.write_message(&format!("CUSTOM_DATA_{id}:{index}\n"));
            writer.write_and_fix_message(&entry.kind);
            writer.write_and_fix_message(&entry.key);
            writer.write_and_fix_message(&entry.value);
        }

        writer.flush_messages();
    }

    fn reply_error(&self, pipe: &UiPipe, text: &str) {
        self.set_last_error(text.to_string());
        let mut writer = pipe.writer();
        writer.write_message("error\n");
        writer.write_and_fix_message(text);
        writer.flush_messages();
    }

    // ---- client -> server commands --------------------------------------

    fn dispatch_ui_command(self: &Arc<Self>, pipe: &Arc<UiPipe>, command: &str) {
        let args = Args { pipe };
        let result = self.run_ui_command(pipe, command, &args);
        if let Err(text) = result {
            self.reply_error(pipe, &text);
        }
    }

    fn run_ui_command(
        self: &Arc<Self>,
        pipe: &Arc<UiPipe>,
        command: &str,
        args: &Args<'_>,
    ) -> Result<(), String> {
        match command {
            "set_engine_option" => {
                let id = args.uint()?;
                let value = args.string()?;
                if !self.set_engine_option(id, &value) {
                    return Err(format!("unknown engine option {id}"));
                }
            }
            "clear_engine_xruns" => self.clear_xruns(),
            "cancel_engine_action" => {
                debug!("cancel_engine_action (nothing in flight)");
            }
            "load_file" => {
                let _filename = args.string()?;
                return Err(String::from("load_file needs a sampler, none is built in"));
            }
            "load_project" => {
                let filename = args.string()?;
                self.queue_load_project(PathBuf::from(filename));
            }
            "save_project" => {
                let filename = args.string()?;
                self.inner.lock().project_filename = Some(PathBuf::from(&filename));
                self.queue_save_project(PathBuf::from(filename));
            }
            "clear_project_filename" => self.clear_project_filename(),
            "patchbay_connect" => {
                let src_group = args.uint()?;
                let src_port = args.uint()?;
                let dst_group = args.uint()?;
                let dst_port = args.uint()?;
                self.patchbay_connect(src_group, src_port, dst_group, dst_port)
                    .map_err(|e| e.to_string())?;
            }
            "patchbay_disconnect" => {
                let id = args.uint()?;
                self.patchbay_disconnect(id).map_err(|e| e.to_string())?;
            }
            "patchbay_refresh" => {
                let _external = args.boolean()?;
                self.patchbay_refresh().map_err(|e| e.to_string())?;
            }
            "transport_play" => self.transport_play(),
            "transport_pause" => self.transport_pause(),
            "transport_bpm" => {
                let bpm = args.double()?;
                self.transport_mode_internal()?;
                self.transport_bpm(bpm);
            }
            "transport_relocate" => {
                let frame = args.uint64()?;
                self.transport_relocate(frame);
            }
            "add_plugin" => {
                let ptype = args.string()?;
                let filename = args.opt_string()?;
                let name = args.opt_string()?;
                let label = args.opt_string()?;
                let unique_id = args.int64()?;
                let bridged = args.boolean()?;
                let plugin_type = PluginType::from_str(&ptype)
                    .ok_or_else(|| format!("unknown plugin type {ptype:?}"))?;
                self.add_plugin(
                    plugin_type,
                    filename.as_deref().unwrap_or(""),
                    name.as_deref(),
                    label.as_deref().unwrap_or(""),
                    unique_id,
                    bridged,
                )
                .map_err(|e| e.to_string())?;
            }
            "remove_plugin" => {
                let id = args.uint()?;
                self.remove_plugin(id).map_err(|e| e.to_string())?;
            }
            "remove_all_plugins" => self.remove_all_plugins(),
            "rename_plugin" => {
                let id = args.uint()?;
                let name = args.string()?;
                self.rename_plugin(id, &name).map_err(|e| e.to_string())?;
            }
            "clone_plugin" => {
                let id = args.uint()?;
                self.clone_plugin(id).map_err(|e| e.to_string())?;
            }
            "replace_plugin" => {
                let id = args.uint()?;
                let ptype = args.string()?;
                let filename = args.opt_string()?;
                let name = args.opt_string()?;
                let label = args.opt_string()?;
                let unique_id = args.int64()?;
                let plugin_type = PluginType::from_str(&ptype)
                    .ok_or_else(|| format!("unknown plugin type {ptype:?}"))?;
                self.replace_plugin(
                    id,
                    plugin_type,
                    filename.as_deref().unwrap_or(""),
                    name.as_deref(),
                    label.as_deref().unwrap_or(""),
                    unique_id,
                )
                .map_err(|e| e.to_string())?;
            }
            "switch_plugins" => {
                let id_a = args.uint()?;
                let id_b = args.uint()?;
                self.switch_plugins(id_a, id_b).map_err(|e| e.to_string())?;
            }
            "load_plugin_state" => {
                let id = args.uint()?;
                let filename = args.string()?;
                self.load_plugin_state(id, &PathBuf::from(filename))
                    .map_err(|e| e.to_string())?;
            }
            "save_plugin_state" => {
                let id = args.uint()?;
                let filename = args.string()?;
                self.save_plugin_state(id, &PathBuf::from(filename))
                    .map_err(|e| e.to_string())?;
            }
            "set_option" => {
                let id = args.uint()?;
                let option = args.uint()?;
                let enabled = args.boolean()?;
                self.plugin(id).map_err(|e| e.to_string())?.set_option(option, enabled);
            }
            "set_active" => {
                let id = args.uint()?;
                let active = args.boolean()?;
                self.plugin(id).map_err(|e| e.to_string())?.set_active(active);
            }
            "set_drywet" => {
                let id = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.mix.set_dry_wet(value);
                self.send_parameter_value(pipe, id, PARAMETER_DRYWET, fixed);
            }
            "set_volume" => {
                let id = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.mix.set_volume(value);
                self.send_parameter_value(pipe, id, PARAMETER_VOLUME, fixed);
            }
            "set_balance_left" => {
                let id = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.mix.set_balance_left(value);
                self.send_parameter_value(pipe, id, PARAMETER_BALANCE_LEFT, fixed);
            }
            "set_balance_right" => {
                let id = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.mix.set_balance_right(value);
                self.send_parameter_value(pipe, id, PARAMETER_BALANCE_RIGHT, fixed);
            }
            "set_panning" => {
                let id = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.mix.set_panning(value);
                self.send_parameter_value(pipe, id, PARAMETER_PANNING, fixed);
            }
            "set_ctrl_channel" => {
                let id = args.uint()?;
                let channel = args.int64()? as i32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                plugin.set_ctrl_channel(channel);
                self.send_parameter_value(
                    pipe,
                    id,
                    PARAMETER_CTRL_CHANNEL,
                    plugin.ctrl_channel() as f32,
                );
            }
            "set_parameter_value" => {
                let id = args.uint()?;
                let index = args.uint()?;
                let value = args.double()? as f32;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let fixed = plugin.set_parameter_value(index, value);
                self.send_parameter_value(pipe, id, index as i32, fixed);
            }
            "set_parameter_midi_channel" => {
                let id = args.uint()?;
                let index = args.uint()?;
                let channel = args.uint()? as u8;
                self.plugin(id)
                    .map_err(|e| e.to_string())?
                    .set_parameter_midi_channel(index, channel);
            }
            "set_parameter_midi_cc" => {
                let id = args.uint()?;
                let index = args.uint()?;
                let cc = args.int64()? as i16;
                self.plugin(id)
                    .map_err(|e| e.to_string())?
                    .set_parameter_midi_cc(index, cc);
            }
            "set_parameter_touch" => {
                let id = args.uint()?;
                let index = args.uint()?;
                let touching = args.boolean()?;
                debug!(id, index, touching, "parameter touch");
            }
            "set_program" => {
                let id = args.uint()?;
                let index = args.int64()? as i32;
                self.plugin(id).map_err(|e| e.to_string())?.set_program(index);
            }
            "set_midi_program" => {
                let id = args.uint()?;
                let index = args.int64()? as i32;
                self.plugin(id)
                    .map_err(|e| e.to_string())?
                    .set_midi_program(index);
            }
            "set_custom_data" => {
                let id = args.uint()?;
                let kind = args.string()?;
                let key = args.string()?;
                let value = args.string()?;
                self.plugin(id)
                    .map_err(|e| e.to_string())?
                    .set_custom_data(&kind, &key, &value);
            }
            "set_chunk_data" => {
                let id = args.uint()?;
                let path = args.string()?;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                plugin.set_chunk_data_file(&path);
            }
            "prepare_for_save" => {
                let id = args.uint()?;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let engine = Arc::clone(self);
                plugin.prepare_for_save(move || {
                    if let Some(pipe) = engine.ui_pipe() {
                        engine.send_runtime_info(&pipe);
                    }
                });
            }
            "reset_parameters" => {
                let id = args.uint()?;
                self.plugin(id).map_err(|e| e.to_string())?.reset_parameters();
            }
            "randomize_parameters" => {
                let id = args.uint()?;
                let plugin = self.plugin(id).map_err(|e| e.to_string())?;
                let mut rng = rand::thread_rng();
                plugin.randomize_parameters(move || rng.gen_range(0.0..1.0));
            }
            "send_midi_note" => {
                let id = args.uint()?;
                let channel = args.uint()? as u8;
                let note = args.uint()? as u8;
                let velocity = args.uint()? as u8;
                self.plugin(id)
                    .map_err(|e| e.to_string())?
                    .send_midi_note(channel, note, velocity);
            }
            "show_custom_ui" => {
                let id = args.uint()?;
                let show = args.boolean()?;
                self.plugin(id).map_err(|e| e.to_string())?.ui_show(show);
            }
            other => {
                return Err(format!("unknown command {other:?}"));
            }
        }
        Ok(())
    }

    fn transport_mode_internal(&self) -> Result<(), String> {
        if self.options_snapshot().transport_mode == TransportMode::Internal {
            Ok(())
        } else {
            Err(String::from("transport is host-driven"))
        }
    }
}

/// Typed access to a command's argument lines.
struct Args<'a> {
    pipe: &'a Arc<UiPipe>,
}

impl Args<'_> {
    fn line(&self) -> Result<String, String> {
        self.pipe
            .recv_line(ARG_TIMEOUT)
            .ok_or_else(|| String::from("missing command argument"))
    }

    fn string(&self) -> Result<String, String> {
        self.line()
    }

    fn opt_string(&self) -> Result<Option<String>, String> {
        Ok(parse_opt_str(&self.line()?))
    }

    fn uint(&self) -> Result<u32, String> {
        let line = self.line()?;
        line.parse().map_err(|_| format!("expected uint, got {line:?}"))
    }

    fn uint64(&self) -> Result<u64, String> {
        let line = self.line()?;
        line.parse().map_err(|_| format!("expected u64, got {line:?}"))
    }

    fn int64(&self) -> Result<i64, String> {
        let line = self.line()?;
        line.parse().map_err(|_| format!("expected int, got {line:?}"))
    }

    fn double(&self) -> Result<f64, String> {
        let line = self.line()?;
        line.parse().map_err(|_| format!("expected float, got {line:?}"))
    }

    fn boolean(&self) -> Result<bool, String> {
        match self.line()?.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(format!("expected bool, got {other:?}")),
        }
    }
}
