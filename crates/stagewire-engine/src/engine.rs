//! The engine: plugin table, graph, transport and the outer-host lifecycle.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use stagewire_bridge::BridgeConfig;
use stagewire_rt::{EngineEvent, EventQueue, TransportBbt, TransportInfo};

use crate::callback::EngineCallback;
use crate::error::EngineError;
use crate::graph::{Graph, PatchbayGraph, RackGraph};
use crate::options::{EngineOptions, ProcessMode, TransportMode};
use crate::plugin::adapter::internal_adapter;
use crate::plugin::{extra_hints, Backend, Plugin, PluginType};
use crate::uipipe::UiPipe;

/// Background jobs served off the main thread.
enum Job {
    SaveProject(PathBuf),
    LoadProject(PathBuf),
    Quit,
}

struct Background {
    tx: Sender<Job>,
    handle: std::thread::JoinHandle<()>,
}

pub(crate) struct EngineInner {
    pub options: EngineOptions,
    pub buffer_size: u32,
    pub sample_rate: f64,
    pub is_active: bool,
    pub offline: bool,
    pub plugins: Vec<Arc<Plugin>>,
    pub graph: Graph,
    pub transport: TransportInfo,
    pub events_in: EventQueue,
    pub events_out: EventQueue,
    pub xruns: u32,
    pub last_error: String,
    pub project_filename: Option<PathBuf>,
}

/// A plugin host that is itself hosted: the outer host drives `process` on
/// its audio thread and `ui_idle` on its main thread; everything else hangs
/// off those two.
pub struct Engine {
    pub(crate) inner: Mutex<EngineInner>,
    callback_tx: Sender<EngineCallback>,
    callback_rx: Receiver<EngineCallback>,
    pub(crate) ui: Mutex<Option<Arc<UiPipe>>>,
    /// Flat-callback hook installed by the outer-host ABI layer.
    pub(crate) host_callback:
        Mutex<Option<Box<dyn Fn(&crate::callback::FlatCallback) + Send>>>,
    background: Mutex<Option<Background>>,
}

impl Engine {
    pub fn new(options: EngineOptions, buffer_size: u32, sample_rate: f64) -> Arc<Self> {
        Self::with_io(options, buffer_size, sample_rate, (2, 2), (0, 0))
    }

    /// Builds an engine for a descriptor variant with explicit external
    /// audio/CV channel counts (patchbay multi-channel and CV variants).
    pub fn with_io(
        options: EngineOptions,
        buffer_size: u32,
        sample_rate: f64,
        audio_io: (u32, u32),
        cv_io: (u32, u32),
    ) -> Arc<Self> {
        let graph = match options.process_mode {
            ProcessMode::Rack => Graph::Rack(RackGraph::new(buffer_size)),
            ProcessMode::Patchbay => {
                Graph::Patchbay(PatchbayGraph::new(buffer_size, audio_io, cv_io))
            }
        };
        let mut transport = TransportInfo::default();
        if options.transport_mode == TransportMode::Internal {
            transport.bbt = Some(TransportBbt::default());
        }
        let (callback_tx, callback_rx) = unbounded();
        let engine = Arc::new(Self {
            inner: Mutex::new(EngineInner {
                options,
                buffer_size,
                sample_rate,
                is_active: false,
                offline: false,
                plugins: Vec::new(),
                graph,
                transport,
                events_in: EventQueue::new(),
                events_out: EventQueue::new(),
                xruns: 0,
                last_error: String::new(),
                project_filename: None,
            }),
            callback_tx,
            callback_rx,
            ui: Mutex::new(None),
            host_callback: Mutex::new(None),
            background: Mutex::new(None),
        });
        engine.start_background();
        info!(buffer_size, sample_rate, "engine initialized");
        engine
    }

    // ---- lifecycle ------------------------------------------------------

    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        if !inner.is_active {
            inner.is_active = true;
            self.callback(EngineCallback::EngineStarted);
        }
    }

    pub fn deactivate(&self) {
        let mut inner = self.inner.lock();
        if inner.is_active {
            inner.is_active = false;
            self.callback(EngineCallback::EngineStopped);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().is_active
    }

    pub fn buffer_size(&self) -> u32 {
        self.inner.lock().buffer_size
    }

    pub fn sample_rate(&self) -> f64 {
        self.inner.lock().sample_rate
    }

    /// Closes the engine: removes plugins, stops the background thread and
    /// drops the UI pipe.
    pub fn close(&self) {
        self.remove_all_plugins();
        self.stop_background();
        *self.ui.lock() = None;
    }

    // ---- host-driven changes --------------------------------------------

    pub fn buffer_size_changed(&self, frames: u32) {
        let mut inner = self.inner.lock();
        if inner.buffer_size == frames || frames == 0 {
            return;
        }
        inner.buffer_size = frames;
        inner.graph.buffer_size_changed(frames);
        for plugin in &inner.plugins {
            if let Err(err) = plugin.buffer_size_changed(frames) {
                warn!(?err, id = plugin.id(), "buffer-size propagation failed");
            }
        }
        drop(inner);
        self.callback(EngineCallback::BufferSizeChanged { frames });
    }

    pub fn sample_rate_changed(&self, rate: f64) {
        let mut inner = self.inner.lock();
        if rate <= 0.0 || (inner.sample_rate - rate).abs() < f64::EPSILON {
            return;
        }
        inner.sample_rate = rate;
        for plugin in &inner.plugins {
            if let Err(err) = plugin.sample_rate_changed(rate) {
                warn!(?err, id = plugin.id(), "sample-rate propagation failed");
            }
        }
        drop(inner);
        self.callback(EngineCallback::SampleRateChanged { rate });
    }

    pub fn offline_changed(&self, offline: bool) {
        let mut inner = self.inner.lock();
        inner.offline = offline;
        for plugin in &inner.plugins {
            let mut process = plugin.process.lock();
            if let Backend::Bridged(transport) = &mut process.backend {
                let _ = transport.set_offline_mode(offline);
            }
        }
    }

    // ---- the audio cycle ------------------------------------------------

    /// One audio cycle. On a contended control plane the cycle degrades to
    /// passthrough and counts an xrun; nothing here blocks.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &self,
        audio_in: &[&[f32]],
        audio_out: &mut [&mut [f32]],
        cv_in: &[&[f32]],
        cv_out: &mut [&mut [f32]],
        midi_in: &[EngineEvent],
        midi_out: &mut dyn FnMut(&EngineEvent),
        frames: u32,
    ) {
        let Some(mut guard) = self.inner.try_lock() else {
            passthrough(audio_in, audio_out, cv_out, frames);
            for event in midi_in {
                midi_out(event);
            }
            return;
        };

        // One-off resize when the host sends a larger cycle than agreed.
        // This path may block; it only runs when the host broke its own
        // buffer-size contract.
        if frames > guard.buffer_size {
            drop(guard);
            warn!(frames, "oversized cycle, resizing");
            self.deactivate();
            self.buffer_size_changed(frames);
            self.activate();
            guard = self.inner.lock();
        }
        let inner = &mut *guard;

        if !inner.is_active {
            let nframes = frames as usize;
            for out in audio_out.iter_mut() {
                out[..nframes].fill(0.0);
            }
            for out in cv_out.iter_mut() {
                out[..nframes].fill(0.0);
            }
            return;
        }

        inner.events_in.clear();
        inner.events_out.clear();
        for event in midi_in {
            if !inner.events_in.push(*event) {
                inner.xruns = inner.xruns.saturating_add(1);
                break;
            }
        }

        if inner.options.transport_mode == TransportMode::Internal {
            let rate = inner.sample_rate;
            inner.transport.advance(frames, rate);
        }

        inner.graph.process(
            &inner.plugins,
            audio_in,
            audio_out,
            cv_in,
            cv_out,
            &inner.events_in,
            &mut inner.events_out,
            &inner.transport,
            frames,
        );

        for event in inner.events_out.as_slice() {
            midi_out(event);
        }
        inner.events_in.clear();
    }

    /// Host-transport snapshot for the next cycles (host transport mode).
    pub fn set_transport(&self, info: TransportInfo) {
        let mut inner = self.inner.lock();
        if inner.options.transport_mode == TransportMode::Host {
            inner.transport = info;
        }
    }

    /// Audio-thread variant: skipped silently when the control plane is
    /// busy, the next cycle catches up.
    pub fn set_transport_rt(&self, info: TransportInfo) {
        if let Some(mut inner) = self.inner.try_lock() {
            if inner.options.transport_mode == TransportMode::Host {
                inner.transport = info;
            }
        }
    }

    pub fn transport(&self) -> TransportInfo {
        self.inner.lock().transport
    }

    // ---- plugin management ----------------------------------------------

    /// Loads a plugin and appends it to the table. Returns the new id.
    pub fn add_plugin(
        &self,
        plugin_type: PluginType,
        filename: &str,
        name: Option<&str>,
        label: &str,
        unique_id: i64,
        use_bridge: bool,
    ) -> Result<u32, EngineError> {
        if label.is_empty() && filename.is_empty() {
            let err = EngineError::UserError(String::from(
                "add_plugin needs at least a filename or a label",
            ));
            self.set_last_error(err.to_string());
            return Err(err);
        }

        let mut inner = self.inner.lock();
        let id = inner.plugins.len() as u32;
        let requested_name = name.filter(|n| !n.is_empty()).unwrap_or(label);
        let unique_name = unique_plugin_name(&inner.plugins, requested_name);
        let single_client = inner.options.process_mode == ProcessMode::Patchbay;
        let force_stereo =
            inner.options.process_mode == ProcessMode::Rack && inner.options.force_stereo;
        let bridged = use_bridge || inner.options.prefer_plugin_bridges;

        let plugin = if bridged {
            let config = BridgeConfig {
                binary: bridge_binary(&inner.options),
                plugin_type: plugin_type.as_str().to_string(),
                filename: filename.to_string(),
                label: label.to_string(),
                unique_id,
                option_env: option_env(&inner.options),
                ..BridgeConfig::default()
            };
            let buffer_size = inner.buffer_size;
            let sample_rate = inner.sample_rate;
            match Plugin::new_bridged(
                id,
                plugin_type,
                &unique_name,
                config,
                buffer_size,
                sample_rate,
            ) {
                Ok(plugin) => Arc::new(plugin),
                Err(err) => {
                    let err = EngineError::UserError(format!("failed to start bridge: {err:#}"));
                    drop(inner);
                    self.set_last_error(err.to_string());
                    return Err(err);
                }
            }
        } else {
            if plugin_type != PluginType::Internal {
                let err = EngineError::UserError(format!(
                    "no in-process loader for {} plugins; use a bridge",
                    plugin_type.as_str()
                ));
                drop(inner);
                self.set_last_error(err.to_string());
                return Err(err);
            }
            let Some(adapter) = internal_adapter(label) else {
                let err =
                    EngineError::UserError(format!("unknown internal plugin label {label:?}"));
                drop(inner);
                self.set_last_error(err.to_string());
                return Err(err);
            };
            let plugin = Plugin::new(
                id,
                plugin_type,
                &unique_name,
                filename,
                label,
                Backend::Local(adapter),
                inner.buffer_size,
            );
            plugin.reload(single_client, force_stereo);
            Arc::new(plugin)
        };

        {
            let mut core = plugin.core.lock();
            core.name = unique_name.clone();
        }

        if inner.options.process_mode == ProcessMode::Rack {
            let counts = plugin.core_snapshot();
            if counts.cv_in > 0 || counts.cv_out > 0 {
                let err = EngineError::CapabilityMismatch(format!(
                    "Plugin '{unique_name}' has CV ports, which Rack mode does not allow"
                ));
                plugin.shutdown_bridge();
                drop(inner);
                self.set_last_error(err.to_string());
                return Err(err);
            }
            if plugin.extra_hints() & extra_hints::CAN_RUN_RACK == 0 {
                let err = EngineError::CapabilityMismatch(format!(
                    "Plugin '{unique_name}' is not compatible with Rack mode processing"
                ));
                plugin.shutdown_bridge();
                drop(inner);
                self.set_last_error(err.to_string());
                return Err(err);
            }
        }

        plugin.set_active(true);
        if let Graph::Patchbay(patchbay) = &mut inner.graph {
            patchbay.ensure_node(&plugin);
            patchbay.auto_connect(&plugin);
        }
        inner.plugins.push(plugin);
        drop(inner);

        debug!(id, name = %unique_name, "plugin added");
        self.callback(EngineCallback::PluginAdded {
            id,
            name: unique_name,
        });
        Ok(id)
    }

    pub fn remove_plugin(&self, id: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if id as usize >= inner.plugins.len() {
            drop(inner);
            self.set_last_error(format!("unknown plugin id {id}"));
            return Err(EngineError::UnknownPlugin(id));
        }
        let plugin = inner.plugins.remove(id as usize);
        plugin.set_active(false);
        plugin.shutdown_bridge();
        if let Graph::Patchbay(patchbay) = &mut inner.graph {
            patchbay.remove_node(plugin.id());
            patchbay.renumber_after_removal(plugin.id());
        }
        for (index, remaining) in inner.plugins.iter().enumerate() {
            remaining.set_id(index as u32);
        }
        drop(inner);
        self.callback(EngineCallback::PluginRemoved { id });
        Ok(())
    }

    pub fn remove_all_plugins(&self) {
        let mut inner = self.inner.lock();
        let plugins = std::mem::take(&mut inner.plugins);
        for plugin in &plugins {
            plugin.set_active(false);
            plugin.shutdown_bridge();
            if let Graph::Patchbay(patchbay) = &mut inner.graph {
                patchbay.remove_node(plugin.id());
            }
        }
        drop(inner);
        for plugin in plugins {
            self.callback(EngineCallback::PluginRemoved { id: plugin.id() });
        }
    }

    pub fn rename_plugin(&self, id: u32, name: &str) -> Result<(), EngineError> {
        let plugin = self.plugin(id)?;
        plugin.core.lock().name = name.to_string();
        self.callback(EngineCallback::PluginRenamed {
            id,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Clones a plugin: same type/label, fresh instance, parameters copied.
    pub fn clone_plugin(&self, id: u32) -> Result<u32, EngineError> {
        let source = self.plugin(id)?;
        let (plugin_type, filename, label, unique_id) = {
            let core = source.core.lock();
            (
                core.plugin_type,
                core.filename.clone(),
                core.label.clone(),
                core.unique_id,
            )
        };
        let bridged = source.is_bridged();
        let new_id = self.add_plugin(
            plugin_type,
            &filename,
            None,
            &label,
            unique_id,
            bridged,
        )?;
        let clone = self.plugin(new_id)?;
        let values: Vec<(u32, f32)> = {
            let core = source.core.lock();
            core.params
                .values
                .iter()
                .enumerate()
                .map(|(i, v)| (i as u32, *v))
                .collect()
        };
        for (index, value) in values {
            clone.set_parameter_value(index, value);
        }
        let custom: Vec<crate::plugin::CustomData> = source.core.lock().custom_data.clone();
        for entry in custom {
            clone.set_custom_data(&entry.kind, &entry.key, &entry.value);
        }
        Ok(new_id)
    }

    /// Replaces the plugin at `id` with a newly loaded one, keeping its slot.
    pub fn replace_plugin(
        &self,
        id: u32,
        plugin_type: PluginType,
        filename: &str,
        name: Option<&str>,
        label: &str,
        unique_id: i64,
    ) -> Result<(), EngineError> {
        self.plugin(id)?;
        let new_id = self.add_plugin(plugin_type, filename, name, label, unique_id, false)?;
        self.switch_plugins(id, new_id)?;
        self.remove_plugin(new_id)?;
        Ok(())
    }

    pub fn switch_plugins(&self, id_a: u32, id_b: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let len = inner.plugins.len() as u32;
        if id_a >= len || id_b >= len {
            drop(inner);
            self.set_last_error(String::from("switch_plugins: id out of range"));
            return Err(EngineError::UnknownPlugin(id_a.max(id_b)));
        }
        inner.plugins.swap(id_a as usize, id_b as usize);
        inner.plugins[id_a as usize].set_id(id_a);
        inner.plugins[id_b as usize].set_id(id_b);
        if let Graph::Patchbay(patchbay) = &mut inner.graph {
            patchbay.swap_groups(id_a, id_b);
        }
        Ok(())
    }

    pub fn plugin(&self, id: u32) -> Result<Arc<Plugin>, EngineError> {
        self.inner
            .lock()
            .plugins
            .get(id as usize)
            .cloned()
            .ok_or(EngineError::UnknownPlugin(id))
    }

    pub fn plugin_count(&self) -> u32 {
        self.inner.lock().plugins.len() as u32
    }

    pub(crate) fn plugins_snapshot(&self) -> Vec<Arc<Plugin>> {
        self.inner.lock().plugins.clone()
    }

    // ---- patchbay surface -----------------------------------------------

    pub fn patchbay_connect(
        &self,
        src_group: u32,
        src_port: u32,
        dst_group: u32,
        dst_port: u32,
    ) -> Result<u32, EngineError> {
        let mut inner = self.inner.lock();
        let Graph::Patchbay(patchbay) = &mut inner.graph else {
            drop(inner);
            self.set_last_error(String::from("patchbay operations need Patchbay mode"));
            return Err(EngineError::CapabilityMismatch(String::from(
                "engine is in Rack mode",
            )));
        };
        match patchbay.connect(src_group, src_port, dst_group, dst_port) {
            Ok(id) => {
                drop(inner);
                self.callback(EngineCallback::PatchbayConnectionAdded {
                    connection: id,
                    src_group,
                    src_port,
                    dst_group,
                    dst_port,
                });
                Ok(id)
            }
            Err(err) => {
                drop(inner);
                self.set_last_error(err.to_string());
                Err(EngineError::CapabilityMismatch(err.to_string()))
            }
        }
    }

    pub fn patchbay_disconnect(&self, connection: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let Graph::Patchbay(patchbay) = &mut inner.graph else {
            drop(inner);
            return Err(EngineError::CapabilityMismatch(String::from(
                "engine is in Rack mode",
            )));
        };
        match patchbay.disconnect(connection) {
            Ok(()) => {
                drop(inner);
                self.callback(EngineCallback::PatchbayConnectionRemoved { connection });
                Ok(())
            }
            Err(err) => {
                drop(inner);
                self.set_last_error(err.to_string());
                Err(EngineError::CapabilityMismatch(err.to_string()))
            }
        }
    }

    pub fn patchbay_refresh(&self) -> Result<(), EngineError> {
        let callbacks = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;
            let Graph::Patchbay(patchbay) = &mut inner.graph else {
                return Err(EngineError::CapabilityMismatch(String::from(
                    "engine is in Rack mode",
                )));
            };
            patchbay.refresh(&inner.plugins)
        };
        for callback in callbacks {
            self.callback(callback);
        }
        Ok(())
    }

    // ---- transport commands ---------------------------------------------

    pub fn transport_play(&self) {
        self.inner.lock().transport.playing = true;
    }

    pub fn transport_pause(&self) {
        self.inner.lock().transport.playing = false;
    }

    pub fn transport_bpm(&self, bpm: f64) {
        let mut inner = self.inner.lock();
        if let Some(bbt) = &mut inner.transport.bbt {
            bbt.beats_per_minute = bpm.max(1.0);
        }
    }

    pub fn transport_relocate(&self, frame: u64) {
        self.inner.lock().transport.relocate(frame);
    }

    // ---- callbacks, errors, misc ----------------------------------------

    pub fn callback(&self, callback: EngineCallback) {
        let _ = self.callback_tx.send(callback);
    }

    pub(crate) fn drain_callbacks(&self) -> Vec<EngineCallback> {
        self.callback_rx.try_iter().collect()
    }

    pub fn set_last_error(&self, message: String) {
        warn!(%message, "engine error");
        self.inner.lock().last_error = message;
    }

    pub fn last_error(&self) -> String {
        self.inner.lock().last_error.clone()
    }

    pub fn xruns(&self) -> u32 {
        self.inner.lock().xruns
    }

    pub fn clear_xruns(&self) {
        self.inner.lock().xruns = 0;
    }

    pub fn options_snapshot(&self) -> EngineOptions {
        self.inner.lock().options.clone()
    }

    pub fn set_engine_option(&self, id: u32, value: &str) -> bool {
        self.inner.lock().options.apply(id, value)
    }

    pub fn project_filename(&self) -> Option<PathBuf> {
        self.inner.lock().project_filename.clone()
    }

    pub fn clear_project_filename(&self) {
        self.inner.lock().project_filename = None;
    }

    // ---- background thread ----------------------------------------------

    fn start_background(self: &Arc<Self>) {
        let (tx, rx) = unbounded::<Job>();
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name(String::from("stagewire-background"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    match job {
                        Job::SaveProject(path) => {
                            if let Err(err) = engine.save_project_file(&path) {
                                engine.set_last_error(format!("project save failed: {err:#}"));
                            }
                        }
                        Job::LoadProject(path) => {
                            if let Err(err) = engine.load_project_file(&path) {
                                engine.set_last_error(format!("project load failed: {err:#}"));
                            }
                            engine.callback(EngineCallback::ProjectLoadFinished);
                        }
                        Job::Quit => break,
                    }
                }
            })
            .expect("failed to spawn background thread");
        *self.background.lock() = Some(Background { tx, handle });
    }

    pub(crate) fn stop_background(&self) {
        if let Some(background) = self.background.lock().take() {
            let _ = background.tx.send(Job::Quit);
            let _ = background.handle.join();
        }
    }

    /// Stops and restarts the background thread; part of `set_state`.
    pub(crate) fn restart_background(self: &Arc<Self>) {
        self.stop_background();
        self.start_background();
    }

    pub fn queue_save_project(&self, path: PathBuf) {
        if let Some(background) = &*self.background.lock() {
            let _ = background.tx.send(Job::SaveProject(path));
        }
    }

    pub fn queue_load_project(&self, path: PathBuf) {
        if let Some(background) = &*self.background.lock() {
            let _ = background.tx.send(Job::LoadProject(path));
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_background();
    }
}

fn passthrough(
    audio_in: &[&[f32]],
    audio_out: &mut [&mut [f32]],
    cv_out: &mut [&mut [f32]],
    frames: u32,
) {
    let nframes = frames as usize;
    for (out, input) in audio_out.iter_mut().zip(audio_in.iter()) {
        out[..nframes].copy_from_slice(&input[..nframes]);
    }
    for out in audio_out.iter_mut().skip(audio_in.len()) {
        out[..nframes].fill(0.0);
    }
    for out in cv_out.iter_mut() {
        out[..nframes].fill(0.0);
    }
}

fn unique_plugin_name(plugins: &[Arc<Plugin>], wanted: &str) -> String {
    let existing: Vec<String> = plugins.iter().map(|p| p.name()).collect();
    if !existing.iter().any(|n| n == wanted) {
        return wanted.to_string();
    }
    for counter in 2.. {
        let candidate = format!("{wanted} ({counter})");
        if !existing.iter().any(|n| *n == candidate) {
            return candidate;
        }
    }
    unreachable!()
}

fn bridge_binary(options: &EngineOptions) -> PathBuf {
    if options.binary_dir.is_empty() {
        PathBuf::from("stagewire-bridge")
    } else {
        PathBuf::from(&options.binary_dir).join("stagewire-bridge")
    }
}

/// `ENGINE_OPTION_*` mirror handed to bridge workers.
fn option_env(options: &EngineOptions) -> Vec<(String, String)> {
    options
        .dump()
        .into_iter()
        .map(|(id, value)| (format!("ENGINE_OPTION_{id}"), value))
        .collect()
}
