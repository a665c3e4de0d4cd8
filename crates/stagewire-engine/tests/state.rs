//! Project save/restore round trips.

use stagewire_engine::{Engine, EngineOptions, PluginType, ProcessMode};

fn engine() -> std::sync::Arc<Engine> {
    let options = EngineOptions {
        process_mode: ProcessMode::Rack,
        ..EngineOptions::default()
    };
    Engine::new(options, 128, 44_100.0)
}

#[test]
fn state_roundtrip_restores_plugins_parameters_and_custom_data() {
    let first = engine();
    let gain = first
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    let spreader = first
        .add_plugin(PluginType::Internal, "", None, "spreader", 0, false)
        .unwrap();

    let gain_plugin = first.plugin(gain).unwrap();
    gain_plugin.set_parameter_value(0, 0.75);
    gain_plugin.mix.set_volume(0.9);
    gain_plugin.mix.set_dry_wet(0.5);
    gain_plugin.set_ctrl_channel(3);
    gain_plugin.set_custom_data("Property", "color", "teal");

    let spreader_plugin = first.plugin(spreader).unwrap();
    spreader_plugin.set_parameter_value(0, 0.33);

    let saved = first.get_state();
    assert!(saved.contains("gain"));

    let second = engine();
    second.set_state(&saved).unwrap();
    assert_eq!(second.plugin_count(), 2);

    let restored_gain = second.plugin(0).unwrap();
    assert_eq!(restored_gain.name(), "gain");
    assert_eq!(restored_gain.parameter_value(0), 0.75);
    assert!((restored_gain.mix.volume() - 0.9).abs() < 1e-6);
    assert!((restored_gain.mix.dry_wet() - 0.5).abs() < 1e-6);
    assert_eq!(restored_gain.ctrl_channel(), 3);
    let custom = restored_gain.custom_data_snapshot();
    assert!(custom
        .iter()
        .any(|entry| entry.kind == "Property" && entry.key == "color" && entry.value == "teal"));

    let restored_spreader = second.plugin(1).unwrap();
    assert!((restored_spreader.parameter_value(0) - 0.33).abs() < 1e-6);
}

#[test]
fn set_state_locks_options_against_ui_overrides() {
    let first = engine();
    let saved = first.get_state();

    let second = engine();
    second.set_state(&saved).unwrap();
    let options = second.options_snapshot();
    assert!(options.forced);
    // A later UI override is silently ignored.
    assert!(second.set_engine_option(stagewire_engine::options::option_ids::FORCE_STEREO, "true"));
    assert!(!second.options_snapshot().force_stereo);
}

#[test]
fn malformed_state_is_rejected() {
    let engine = engine();
    let err = engine.set_state("not a project").unwrap_err();
    assert!(err.to_string().contains("state"));
}

#[test]
fn per_plugin_state_files_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugin-state.json");

    let first = engine();
    let id = first
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    first.plugin(id).unwrap().set_parameter_value(0, 1.5);
    first.save_plugin_state(id, &path).unwrap();

    let second = engine();
    let id2 = second
        .add_plugin(PluginType::Internal, "", None, "gain", 0, false)
        .unwrap();
    second.load_plugin_state(id2, &path).unwrap();
    assert_eq!(second.plugin(id2).unwrap().parameter_value(0), 1.5);
}
