//! Observability for the autoplan workspace.
//!
//! - **Logging**: human-readable or JSON `tracing-subscriber` output with an
//!   `EnvFilter` honouring `RUST_LOG`.
//! - **Event log**: a bus subscriber that turns workflow events into log lines.

pub mod event_log;
pub mod logging;
