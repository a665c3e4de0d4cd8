//! Bridge worker entry point.
//!
//! Invoked by the engine as
//! `stagewire-bridge <plugin-type> <filename> <label> <unique-id>` with the
//! shared-region paths in the environment. Format wrappers register their
//! plugins here; the built-in gain is the `internal` fallback.

use anyhow::{bail, Result};

use stagewire_bridge::{GainPlugin, WorkerPlugin, WorkerService};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 4 {
        bail!("usage: stagewire-bridge <plugin-type> <filename> <label> <unique-id>");
    }
    let plugin_type = args[0].as_str();
    let label = args[2].as_str();

    let plugin: Box<dyn WorkerPlugin> = match (plugin_type, label) {
        ("internal", _) | (_, "gain") => Box::new(GainPlugin::new()),
        _ => bail!("no worker backend for plugin type {plugin_type:?} label {label:?}"),
    };

    let mut service = WorkerService::attach_from_env(plugin)?;
    service.publish_descriptor()?;
    service.run()
}
