use std::path::Path;

use anyhow::Context;
use ap_core::config::Config;

/// Run the `discard` subcommand: drop the saved run so the next `run`
/// starts clean.
pub fn run(config: &Config, workspace: &Path) -> anyhow::Result<()> {
    let store = super::state_store(config, workspace);
    let removed = store
        .discard()
        .with_context(|| format!("failed to remove {}", store.snapshot_path().display()))?;
    if removed {
        println!("discarded {}", store.snapshot_path().display());
    } else {
        println!("nothing to discard");
    }
    Ok(())
}
