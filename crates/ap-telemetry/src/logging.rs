use tracing_subscriber::{fmt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Human,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Install the global `tracing` subscriber.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "debug", "ap_agents=debug,warn").
/// Logs go to stderr so command output on stdout stays machine-readable.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init(service_name: &str, default_level: &str, output: LogOutput) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = match output {
        LogOutput::Human => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogOutput::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(service = service_name, ?output, "logging initialised");
    }
}

/// Human-readable output.
pub fn init_logging(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogOutput::Human);
}

/// JSON output (suitable for Vector / Loki / ELK).
pub fn init_logging_json(service_name: &str, default_level: &str) {
    init(service_name, default_level, LogOutput::Json);
}
