pub mod discard;
pub mod run;
pub mod status;

use std::path::Path;

use anyhow::Context;
use ap_core::config::{Config, LogFormat};
use ap_core::state_store::StateStore;
use ap_telemetry::logging::{self, LogOutput};

/// Load the config file named on the command line, else the default one.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load ~/.autoplan/config.toml"),
    }
}

pub fn init_logging(config: &Config, json: bool) {
    let output = if json || config.general.log_format == LogFormat::Json {
        LogOutput::Json
    } else {
        LogOutput::Human
    };
    logging::init("ap", &config.general.log_level, output);
}

pub fn state_store(config: &Config, workspace: &Path) -> StateStore {
    StateStore::new(config.state.resolve_dir(workspace))
}
