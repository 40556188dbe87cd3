use ap_telemetry::logging::{self, LogOutput};

#[test]
fn test_init_logging_human() {
    // Should not panic; second call is a safe no-op.
    logging::init_logging("test-service", "debug");
    logging::init_logging("test-service", "info");

    tracing::info!(key = "value", "human-readable log line");
}

#[test]
fn test_init_logging_json() {
    // Whichever test runs first installs the subscriber; this one no-ops.
    logging::init_logging_json("test-service-json", "info");
    logging::init("test-service-json", "info", LogOutput::Json);

    tracing::info!(key = "value", "json log line");
}

#[test]
fn test_default_output_is_human() {
    assert_eq!(LogOutput::default(), LogOutput::Human);
}
