//! Project state: a JSON document capturing the engine configuration and
//! every plugin's restorable state.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::options::EngineOptions;
use crate::plugin::{CustomData, Plugin, PluginType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub index: u32,
    pub value: f32,
    pub midi_channel: u8,
    pub midi_cc: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginState {
    pub plugin_type: PluginType,
    pub name: String,
    pub filename: String,
    pub label: String,
    pub unique_id: i64,
    pub bridged: bool,
    pub active: bool,
    pub dry_wet: f32,
    pub volume: f32,
    pub balance_left: f32,
    pub balance_right: f32,
    pub panning: f32,
    pub ctrl_channel: i32,
    pub options: u32,
    pub current_program: i32,
    pub current_midi_program: i32,
    pub parameters: Vec<ParameterState>,
    pub custom_data: Vec<CustomData>,
}

/// The on-disk project shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub options: EngineOptions,
    pub plugins: Vec<PluginState>,
}

impl Engine {
    /// Serializes the full engine configuration plus every plugin's state.
    pub fn get_state(&self) -> String {
        // Give bridged plugins a chance to flush their state first.
        for plugin in self.plugins_snapshot() {
            plugin.prepare_for_save(|| {});
        }
        let document = ProjectDocument {
            options: self.options_snapshot(),
            plugins: self
                .plugins_snapshot()
                .iter()
                .map(|plugin| capture_plugin_state(plugin))
                .collect(),
        };
        serde_json::to_string_pretty(&document).unwrap_or_default()
    }

    /// Replaces the whole engine state with a saved document. Removes all
    /// plugins, restarts the background thread and locks options against
    /// later UI overrides.
    pub fn set_state(self: &Arc<Self>, text: &str) -> Result<(), EngineError> {
        let document: ProjectDocument = serde_json::from_str(text)
            .map_err(|err| EngineError::StateRejection(err.to_string()))?;

        self.remove_all_plugins();
        self.restart_background();

        {
            let mut inner = self.inner.lock();
            let current_mode = inner.options.process_mode;
            let current_transport = inner.options.transport_mode;
            inner.options = document.options.clone();
            // The graph was chosen at construction; a document from another
            // mode keeps its remaining options but not the mode itself.
            if inner.options.process_mode != current_mode {
                warn!("project process mode differs from engine mode, keeping engine mode");
                inner.options.process_mode = current_mode;
            }
            inner.options.transport_mode = current_transport;
            inner.options.forced = true;
        }

        for state in &document.plugins {
            let id = self
                .add_plugin(
                    state.plugin_type,
                    &state.filename,
                    Some(&state.name),
                    &state.label,
                    state.unique_id,
                    state.bridged,
                )
                .map_err(|err| {
                    EngineError::StateRejection(format!(
                        "failed to restore plugin {:?}: {err}",
                        state.name
                    ))
                })?;
            let plugin = self.plugin(id)?;
            apply_plugin_state(&plugin, state);
        }

        info!(plugins = document.plugins.len(), "project state restored");
        Ok(())
    }

    pub(crate) fn save_project_file(&self, path: &Path) -> Result<()> {
        let text = self.get_state();
        std::fs::write(path, text)
            .with_context(|| format!("failed to write project {}", path.display()))?;
        info!(path = %path.display(), "project saved");
        Ok(())
    }

    pub(crate) fn load_project_file(self: &Arc<Self>, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read project {}", path.display()))?;
        self.set_state(&text)?;
        self.inner.lock().project_filename = Some(path.to_path_buf());
        Ok(())
    }

    /// Saves one plugin's state to its own file.
    pub fn save_plugin_state(&self, id: u32, path: &Path) -> Result<(), EngineError> {
        let plugin = self.plugin(id)?;
        plugin.prepare_for_save(|| {});
        let state = capture_plugin_state(&plugin);
        let text = serde_json::to_string_pretty(&state)
            .map_err(|err| EngineError::StateRejection(err.to_string()))?;
        std::fs::write(path, text)
            .map_err(|err| EngineError::ResourceExhaustion(err.to_string()))?;
        Ok(())
    }

    /// Restores one plugin's state from a file saved by `save_plugin_state`.
    pub fn load_plugin_state(&self, id: u32, path: &Path) -> Result<(), EngineError> {
        let plugin = self.plugin(id)?;
        let text = std::fs::read_to_string(path)
            .map_err(|err| EngineError::StateRejection(err.to_string()))?;
        let state: PluginState = serde_json::from_str(&text)
            .map_err(|err| EngineError::StateRejection(err.to_string()))?;
        apply_plugin_state(&plugin, &state);
        Ok(())
    }
}

fn capture_plugin_state(plugin: &Arc<Plugin>) -> PluginState {
    let core = plugin.core.lock();
    PluginState {
        plugin_type: core.plugin_type,
        name: core.name.clone(),
        filename: core.filename.clone(),
        label: core.label.clone(),
        unique_id: core.unique_id,
        bridged: plugin.is_bridged(),
        active: plugin.is_active(),
        dry_wet: plugin.mix.dry_wet(),
        volume: plugin.mix.volume(),
        balance_left: plugin.mix.balance_left(),
        balance_right: plugin.mix.balance_right(),
        panning: plugin.mix.panning(),
        ctrl_channel: plugin.ctrl_channel(),
        options: plugin.options(),
        current_program: core.programs.current,
        current_midi_program: core.midi_programs.current,
        parameters: core
            .params
            .values
            .iter()
            .enumerate()
            .map(|(index, value)| ParameterState {
                index: index as u32,
                value: *value,
                midi_channel: core.params.data[index].midi_channel,
                midi_cc: core.params.data[index].midi_cc,
            })
            .collect(),
        custom_data: core.custom_data.clone(),
    }
}

fn apply_plugin_state(plugin: &Arc<Plugin>, state: &PluginState) {
    for entry in &state.custom_data {
        plugin.set_custom_data(&entry.kind, &entry.key, &entry.value);
    }
    if state.current_program >= 0 {
        plugin.set_program(state.current_program);
    }
    if state.current_midi_program >= 0 {
        plugin.set_midi_program(state.current_midi_program);
    }
    for parameter in &state.parameters {
        plugin.set_parameter_value(parameter.index, parameter.value);
        plugin.set_parameter_midi_channel(parameter.index, parameter.midi_channel);
        plugin.set_parameter_midi_cc(parameter.index, parameter.midi_cc);
    }
    plugin.set_options_raw(state.options);
    plugin.mix.set_dry_wet(state.dry_wet);
    plugin.mix.set_volume(state.volume);
    plugin.mix.set_balance_left(state.balance_left);
    plugin.mix.set_balance_right(state.balance_right);
    plugin.mix.set_panning(state.panning);
    plugin.set_ctrl_channel(state.ctrl_channel);
    plugin.set_active(state.active);
}
