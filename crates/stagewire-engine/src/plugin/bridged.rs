//! Bridged-plugin construction and idle servicing: everything that keeps an
//! out-of-process worker in sync with its engine-side handle.

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use stagewire_bridge::{BridgeConfig, BridgeTransport, ChildStatus, ServerMessage};

use super::{
    hints, Backend, MidiProgramData, ParameterData, ParameterKind, ParameterRanges, Plugin,
    PluginType, PortLayout,
};

/// Outcome of one idle service pass over a bridged plugin.
#[derive(Debug, Default)]
pub struct BridgeIdleReport {
    /// Worker died without a requested quit; the crash callback fires once.
    pub crashed: bool,
    /// Worker stopped answering pings past the configured timeout.
    pub unresponsive: bool,
    /// The worker closed its custom UI.
    pub ui_closed: bool,
}

impl Plugin {
    /// Spawns a bridge worker and builds its engine-side handle from the
    /// descriptor messages the worker publishes before `Ready`.
    pub fn new_bridged(
        id: u32,
        plugin_type: PluginType,
        name: &str,
        config: BridgeConfig,
        buffer_size: u32,
        sample_rate: f64,
    ) -> Result<Self> {
        let filename = config.filename.clone();
        let label = config.label.clone();
        let mut transport = BridgeTransport::create(config, buffer_size, sample_rate)
            .context("failed to create bridge transport")?;
        transport.spawn().context("failed to spawn bridge worker")?;
        let messages = transport.wait_ready()?;

        let plugin = Plugin::new(
            id,
            plugin_type,
            name,
            &filename,
            &label,
            Backend::Bridged(transport),
            buffer_size,
        );
        plugin
            .hints
            .store(hints::IS_BRIDGE, Ordering::Relaxed);
        for message in messages {
            plugin.apply_server_message(message);
        }
        plugin.finish_bridged_setup(buffer_size)?;
        Ok(plugin)
    }

    /// Applies one worker message to the handle's state.
    pub(crate) fn apply_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Pong => {}
            ServerMessage::PluginInfo1 {
                category,
                hints: plugin_hints,
                options: _,
                midi_ins,
                midi_outs,
                unique_id,
            } => {
                let mut core = self.core.lock();
                core.category = category;
                core.unique_id = unique_id;
                core.ports.has_event_in = midi_ins > 0;
                core.ports.has_event_out = midi_outs > 0;
                drop(core);
                self.hints.store(
                    plugin_hints | hints::IS_BRIDGE,
                    Ordering::Relaxed,
                );
            }
            ServerMessage::PluginInfo2 {
                real_name,
                label,
                maker,
                copyright,
            } => {
                let mut core = self.core.lock();
                core.real_name = real_name;
                core.label = label;
                core.maker = maker;
                core.copyright = copyright;
            }
            ServerMessage::AudioCount { ins, outs } => {
                let mut core = self.core.lock();
                let name = core.name.clone();
                let event_in = core.ports.has_event_in;
                let event_out = core.ports.has_event_out;
                let cv_in = core.ports.cv_in.len() as u32;
                let cv_out = core.ports.cv_out.len() as u32;
                core.ports =
                    PortLayout::rebuild(&name, false, ins, outs, cv_in, cv_out, event_in, event_out);
            }
            ServerMessage::MidiCount { ins, outs } => {
                let mut core = self.core.lock();
                core.ports.has_event_in = ins > 0;
                core.ports.has_event_out = outs > 0;
            }
            ServerMessage::ParameterCount(count) => {
                let mut core = self.core.lock();
                core.params.data = vec![ParameterData::default(); count as usize];
                core.params.ranges = vec![ParameterRanges::default(); count as usize];
                core.params.values = vec![0.0; count as usize];
            }
            ServerMessage::ParameterData1 {
                index,
                rindex,
                kind,
                hints: param_hint_bits,
                midi_channel,
                midi_cc,
            } => {
                let mut core = self.core.lock();
                if let Some(data) = core.params.data.get_mut(index as usize) {
                    data.rindex = rindex;
                    data.kind = match kind {
                        1 => ParameterKind::Input,
                        2 => ParameterKind::Output,
                        _ => ParameterKind::Special,
                    };
                    data.hints = param_hint_bits;
                    data.midi_channel = midi_channel;
                    data.midi_cc = midi_cc;
                }
            }
            ServerMessage::ParameterData2 { index, name, unit } => {
                let mut core = self.core.lock();
                if let Some(data) = core.params.data.get_mut(index as usize) {
                    data.name = name;
                    data.unit = unit;
                }
            }
            ServerMessage::ParameterRanges1 {
                index,
                def,
                min,
                max,
            } => {
                let mut core = self.core.lock();
                if let Some(ranges) = core.params.ranges.get_mut(index as usize) {
                    ranges.def = def;
                    ranges.min = min;
                    ranges.max = max;
                }
            }
            ServerMessage::ParameterRanges2 {
                index,
                step,
                step_small,
                step_large,
            } => {
                let mut core = self.core.lock();
                if let Some(ranges) = core.params.ranges.get_mut(index as usize) {
                    ranges.step = step;
                    ranges.step_small = step_small;
                    ranges.step_large = step_large;
                }
            }
            ServerMessage::ParameterValue { index, value } => {
                let mut core = self.core.lock();
                if let Some(slot) = core.params.values.get_mut(index as usize) {
                    *slot = value;
                }
            }
            ServerMessage::DefaultValue { index, value } => {
                let mut core = self.core.lock();
                if let Some(ranges) = core.params.ranges.get_mut(index as usize) {
                    ranges.def = value;
                }
            }
            ServerMessage::ProgramCount(count) => {
                let mut core = self.core.lock();
                core.programs.names = vec![String::new(); count as usize];
                core.programs.current = -1;
            }
            ServerMessage::MidiProgramCount(count) => {
                let mut core = self.core.lock();
                core.midi_programs.data = vec![MidiProgramData::default(); count as usize];
                core.midi_programs.current = -1;
            }
            ServerMessage::ProgramName { index, name } => {
                let mut core = self.core.lock();
                if let Some(slot) = core.programs.names.get_mut(index as usize) {
                    *slot = name;
                }
            }
            ServerMessage::MidiProgramData {
                index,
                bank,
                program,
                name,
            } => {
                let mut core = self.core.lock();
                if let Some(slot) = core.midi_programs.data.get_mut(index as usize) {
                    *slot = MidiProgramData {
                        bank,
                        program,
                        name,
                    };
                }
            }
            ServerMessage::CurrentProgram(index) => {
                self.core.lock().programs.current = index;
            }
            ServerMessage::CurrentMidiProgram(index) => {
                self.core.lock().midi_programs.current = index;
            }
            ServerMessage::SetCustomData { kind, key, value } => {
                let mut core = self.core.lock();
                if let Some(existing) = core
                    .custom_data
                    .iter_mut()
                    .find(|entry| entry.kind == kind && entry.key == key)
                {
                    existing.value = value;
                } else {
                    core.custom_data.push(super::CustomData { kind, key, value });
                }
            }
            ServerMessage::SetChunkDataFile(path) => {
                debug!(%path, "worker delivered chunk data file");
            }
            ServerMessage::SetLatency(frames) => {
                self.set_latency_frames(frames);
            }
            ServerMessage::UiClosed => {}
            ServerMessage::Ready | ServerMessage::Saved | ServerMessage::Error(_) => {}
        }
    }

    fn finish_bridged_setup(&self, buffer_size: u32) -> Result<()> {
        let (audio_in, audio_out, cv_in, cv_out) = {
            let core = self.core.lock();
            (
                core.ports.audio_in.len() as u32,
                core.ports.audio_out.len() as u32,
                core.ports.cv_in.len() as u32,
                core.ports.cv_out.len() as u32,
            )
        };
        let mut process = self.process.lock();
        if let Backend::Bridged(transport) = &mut process.backend {
            transport.resize_pool(buffer_size, audio_in + cv_in, audio_out + cv_out)?;
        }
        drop(process);
        self.reload(false, false);
        Ok(())
    }

    /// One idle pass: drain the server ring, check the child, age the ping
    /// counter and attempt timeout recovery.
    pub fn bridge_idle(&self, ping_timeout_ticks: u32) -> BridgeIdleReport {
        let mut report = BridgeIdleReport::default();
        let mut pending = Vec::new();
        {
            let mut process = self.process.lock();
            let Backend::Bridged(transport) = &mut process.backend else {
                return report;
            };

            loop {
                match transport.poll_server() {
                    Ok(Some(ServerMessage::UiClosed)) => report.ui_closed = true,
                    Ok(Some(ServerMessage::Saved)) => {
                        self.saved.store(true, Ordering::Relaxed);
                    }
                    Ok(Some(message)) => pending.push(message),
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "bridge protocol violation");
                        report.crashed = true;
                        break;
                    }
                }
            }

            if transport.timed_out() {
                transport.try_recover();
            }

            let age = transport.ping();
            if age > ping_timeout_ticks {
                report.unresponsive = true;
            }

            if matches!(transport.check_child(), ChildStatus::Exited(_))
                && !transport.quit_was_sent()
            {
                report.crashed = true;
            }
        }
        for message in pending {
            self.apply_server_message(message);
        }
        if report.crashed && !self.has_crashed() {
            self.mark_crashed();
        } else {
            report.crashed = false;
        }
        report
    }

    /// Asks the worker to flush its state and waits for the `Saved` reply,
    /// invoking `keep_alive` between polls so the UI pipe stays serviced.
    /// A timeout is soft; saving proceeds with last-known state.
    pub fn prepare_for_save(&self, mut keep_alive: impl FnMut()) -> bool {
        let is_bridged = {
            let process = self.process.lock();
            matches!(process.backend, Backend::Bridged(_))
        };
        if !is_bridged {
            return true;
        }
        self.saved.store(false, Ordering::Relaxed);
        {
            let process = self.process.lock();
            if let Backend::Bridged(transport) = &process.backend {
                if transport.prepare_for_save().is_err() {
                    return false;
                }
            }
        }
        for _ in 0..200 {
            let mut pending = Vec::new();
            {
                let mut process = self.process.lock();
                if let Backend::Bridged(transport) = &mut process.backend {
                    while let Ok(Some(message)) = transport.poll_server() {
                        if matches!(message, ServerMessage::Saved) {
                            self.saved.store(true, Ordering::Relaxed);
                        } else {
                            pending.push(message);
                        }
                    }
                }
            }
            for message in pending {
                self.apply_server_message(message);
            }
            if self.saved.load(Ordering::Relaxed) {
                return true;
            }
            keep_alive();
            std::thread::sleep(Duration::from_millis(30));
        }
        warn!("bridged plugin did not confirm save in time");
        false
    }

    /// Orderly worker shutdown, called before the handle is dropped.
    pub fn shutdown_bridge(&self) {
        let mut process = self.process.lock();
        if let Backend::Bridged(transport) = &mut process.backend {
            transport.shutdown();
        }
    }

    /// Propagates a buffer-size change to the process scratch and, for
    /// bridged plugins, the shared pool.
    pub fn buffer_size_changed(&self, frames: u32) -> Result<()> {
        let (audio_in, audio_out, cv_in, cv_out) = {
            let core = self.core.lock();
            (
                core.ports.audio_in.len() as u32,
                core.ports.audio_out.len() as u32,
                core.ports.cv_in.len() as u32,
                core.ports.cv_out.len() as u32,
            )
        };
        let mut process = self.process.lock();
        process.buffer_size = frames;
        let channels = process.dry.len();
        process.dry = (0..channels).map(|_| vec![0.0; frames as usize]).collect();
        process.bal = vec![0.0; frames as usize];
        if let Backend::Bridged(transport) = &mut process.backend {
            transport.set_buffer_size(frames)?;
            transport.resize_pool(frames, audio_in + cv_in, audio_out + cv_out)?;
        }
        Ok(())
    }

    pub fn sample_rate_changed(&self, rate: f64) -> Result<()> {
        let process = self.process.lock();
        if let Backend::Bridged(transport) = &process.backend {
            transport.set_sample_rate(rate)?;
        }
        Ok(())
    }
}
