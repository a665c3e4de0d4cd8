//! Engine options, their numeric ids on the UI pipe, and the forced flag.

use serde::{Deserialize, Serialize};

/// Graph implementation, fixed at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessMode {
    Rack,
    Patchbay,
}

/// Who owns the clock. Immutable after init in the embedded build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    Host,
    Internal,
}

/// Numeric option ids used in `ENGINE_OPTION_<n>` dumps and
/// `set_engine_option` commands.
pub mod option_ids {
    pub const PROCESS_MODE: u32 = 1;
    pub const TRANSPORT_MODE: u32 = 2;
    pub const FORCE_STEREO: u32 = 3;
    pub const PREFER_PLUGIN_BRIDGES: u32 = 4;
    pub const PREFER_UI_BRIDGES: u32 = 5;
    pub const UIS_ALWAYS_ON_TOP: u32 = 6;
    pub const MAX_PARAMETERS: u32 = 7;
    pub const UI_BRIDGES_TIMEOUT: u32 = 8;
    pub const PATH_LADSPA: u32 = 9;
    pub const PATH_DSSI: u32 = 10;
    pub const PATH_LV2: u32 = 11;
    pub const PATH_VST2: u32 = 12;
    pub const PATH_VST3: u32 = 13;
    pub const PATH_AU: u32 = 14;
    pub const PATH_GIG: u32 = 15;
    pub const PATH_SF2: u32 = 16;
    pub const PATH_SFZ: u32 = 17;
    pub const BINARY_DIR: u32 = 18;
    pub const RESOURCE_DIR: u32 = 19;
    pub const PREVENT_BAD_BEHAVIOUR: u32 = 20;
    pub const FRONTEND_WIN_ID: u32 = 21;
}

/// Everything the embedding host or a loaded project can configure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    pub process_mode: ProcessMode,
    pub transport_mode: TransportMode,
    /// Rack only: coerce mono plugins into a stereo pair.
    pub force_stereo: bool,
    pub prefer_plugin_bridges: bool,
    pub prefer_ui_bridges: bool,
    pub uis_always_on_top: bool,
    pub max_parameters: u32,
    /// Milliseconds before a UI helper or bridge worker is considered dead.
    pub ui_bridges_timeout: u32,
    pub path_ladspa: String,
    pub path_dssi: String,
    pub path_lv2: String,
    pub path_vst2: String,
    pub path_vst3: String,
    pub path_au: String,
    pub path_gig: String,
    pub path_sf2: String,
    pub path_sfz: String,
    pub binary_dir: String,
    pub resource_dir: String,
    pub prevent_bad_behaviour: bool,
    pub frontend_win_id: u64,
    /// Set by project load; locks options against later UI overrides.
    #[serde(default)]
    pub forced: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            process_mode: ProcessMode::Rack,
            transport_mode: TransportMode::Host,
            force_stereo: false,
            prefer_plugin_bridges: false,
            prefer_ui_bridges: true,
            uis_always_on_top: true,
            max_parameters: 200,
            ui_bridges_timeout: 4000,
            path_ladspa: String::new(),
            path_dssi: String::new(),
            path_lv2: String::new(),
            path_vst2: String::new(),
            path_vst3: String::new(),
            path_au: String::new(),
            path_gig: String::new(),
            path_sf2: String::new(),
            path_sfz: String::new(),
            binary_dir: String::new(),
            resource_dir: String::new(),
            prevent_bad_behaviour: false,
            frontend_win_id: 0,
            forced: false,
        }
    }
}

impl EngineOptions {
    /// Applies one numeric-id option as received from the UI. Ignored when
    /// options are forced. Returns false for unknown ids.
    pub fn apply(&mut self, id: u32, value: &str) -> bool {
        if self.forced {
            return true;
        }
        use option_ids::*;
        match id {
            PROCESS_MODE | TRANSPORT_MODE => {
                // Immutable after init; the dump still includes them.
            }
            FORCE_STEREO => self.force_stereo = value == "true",
            PREFER_PLUGIN_BRIDGES => self.prefer_plugin_bridges = value == "true",
            PREFER_UI_BRIDGES => self.prefer_ui_bridges = value == "true",
            UIS_ALWAYS_ON_TOP => self.uis_always_on_top = value == "true",
            MAX_PARAMETERS => self.max_parameters = value.parse().unwrap_or(self.max_parameters),
            UI_BRIDGES_TIMEOUT => {
                self.ui_bridges_timeout = value.parse().unwrap_or(self.ui_bridges_timeout)
            }
            PATH_LADSPA => self.path_ladspa = value.to_string(),
            PATH_DSSI => self.path_dssi = value.to_string(),
            PATH_LV2 => self.path_lv2 = value.to_string(),
            PATH_VST2 => self.path_vst2 = value.to_string(),
            PATH_VST3 => self.path_vst3 = value.to_string(),
            PATH_AU => self.path_au = value.to_string(),
            PATH_GIG => self.path_gig = value.to_string(),
            PATH_SF2 => self.path_sf2 = value.to_string(),
            PATH_SFZ => self.path_sfz = value.to_string(),
            BINARY_DIR => self.binary_dir = value.to_string(),
            RESOURCE_DIR => self.resource_dir = value.to_string(),
            PREVENT_BAD_BEHAVIOUR => self.prevent_bad_behaviour = value == "true",
            FRONTEND_WIN_ID => {
                self.frontend_win_id = value.parse().unwrap_or(self.frontend_win_id)
            }
            _ => return false,
        }
        true
    }

    /// `(id, value)` pairs for the per-option UI dump, in id order.
    pub fn dump(&self) -> Vec<(u32, String)> {
        use option_ids::*;
        vec![
            (
                PROCESS_MODE,
                match self.process_mode {
                    ProcessMode::Rack => "rack".into(),
                    ProcessMode::Patchbay => "patchbay".into(),
                },
            ),
            (
                TRANSPORT_MODE,
                match self.transport_mode {
                    TransportMode::Host => "host".into(),
                    TransportMode::Internal => "internal".into(),
                },
            ),
            (FORCE_STEREO, self.force_stereo.to_string()),
            (PREFER_PLUGIN_BRIDGES, self.prefer_plugin_bridges.to_string()),
            (PREFER_UI_BRIDGES, self.prefer_ui_bridges.to_string()),
            (UIS_ALWAYS_ON_TOP, self.uis_always_on_top.to_string()),
            (MAX_PARAMETERS, self.max_parameters.to_string()),
            (UI_BRIDGES_TIMEOUT, self.ui_bridges_timeout.to_string()),
            (PATH_LADSPA, self.path_ladspa.clone()),
            (PATH_DSSI, self.path_dssi.clone()),
            (PATH_LV2, self.path_lv2.clone()),
            (PATH_VST2, self.path_vst2.clone()),
            (PATH_VST3, self.path_vst3.clone()),
            (PATH_AU, self.path_au.clone()),
            (PATH_GIG, self.path_gig.clone()),
            (PATH_SF2, self.path_sf2.clone()),
            (PATH_SFZ, self.path_sfz.clone()),
            (BINARY_DIR, self.binary_dir.clone()),
            (RESOURCE_DIR, self.resource_dir.clone()),
            (PREVENT_BAD_BEHAVIOUR, self.prevent_bad_behaviour.to_string()),
            (FRONTEND_WIN_ID, self.frontend_win_id.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_options_ignore_overrides() {
        let mut options = EngineOptions::default();
        options.forced = true;
        assert!(options.apply(option_ids::FORCE_STEREO, "true"));
        assert!(!options.force_stereo);
    }

    #[test]
    fn unknown_option_id_is_rejected() {
        let mut options = EngineOptions::default();
        assert!(!options.apply(9999, "x"));
    }
}
