//! Plan-level validation gate run after every item completed.
//!
//! Checks run in order (build, test, lint, custom) through `sh -c` in the
//! workspace root and stop at the first failure.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ap_core::config::ValidationConfig;

/// Captured output kept per check.
const MAX_OUTPUT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    /// Set when the run was cancelled before all checks finished.
    #[serde(default)]
    pub cancelled: bool,
}

impl ValidationReport {
    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed)
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, cancel: CancellationToken) -> ValidationReport;
}

// ---------------------------------------------------------------------------
// CommandValidator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandValidator {
    workdir: PathBuf,
    checks: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandValidator {
    pub fn new(workdir: impl Into<PathBuf>, checks: Vec<(String, String)>) -> Self {
        Self {
            workdir: workdir.into(),
            checks,
            timeout: None,
        }
    }

    pub fn from_config(config: &ValidationConfig, workdir: impl Into<PathBuf>) -> Self {
        let mut validator = Self::new(workdir, config.checks());
        validator.timeout = config.timeout_secs.map(Duration::from_secs);
        validator
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    async fn run_check(
        &self,
        name: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Option<CheckResult> {
        let started = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Some(CheckResult {
                    name: name.to_string(),
                    command: command.to_string(),
                    passed: false,
                    exit_code: None,
                    output: format!("failed to spawn: {e}"),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
        };

        let limit = self.timeout.unwrap_or(Duration::MAX);
        let waited = tokio::select! {
            out = tokio::time::timeout(limit, child.wait_with_output()) => out,
            // Dropping the child future kills the process.
            _ = cancel.cancelled() => return None,
        };

        let (passed, exit_code, output) = match waited {
            Ok(Ok(out)) => {
                let mut text = String::from_utf8_lossy(&out.stdout).to_string();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.success(), out.status.code(), truncate(text))
            }
            Ok(Err(e)) => (false, None, format!("failed to wait: {e}")),
            Err(_) => (false, None, format!("timed out after {limit:?}")),
        };

        Some(CheckResult {
            name: name.to_string(),
            command: command.to_string(),
            passed,
            exit_code,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = text.len() - MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        text = format!("...{}", &text[cut..]);
    }
    text
}

#[async_trait]
impl Validator for CommandValidator {
    async fn validate(&self, cancel: CancellationToken) -> ValidationReport {
        let mut report = ValidationReport {
            passed: true,
            ..Default::default()
        };
        for (name, command) in &self.checks {
            let Some(result) = self.run_check(name, command, &cancel).await else {
                report.passed = false;
                report.cancelled = true;
                break;
            };
            let passed = result.passed;
            if passed {
                info!(check = %name, duration_ms = result.duration_ms, "validation check passed");
            } else {
                warn!(check = %name, exit_code = ?result.exit_code, "validation check failed");
            }
            report.checks.push(result);
            if !passed {
                report.passed = false;
                break;
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checks(cmds: &[(&str, &str)]) -> Vec<(String, String)> {
        cmds.iter()
            .map(|(n, c)| (n.to_string(), c.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn all_passing_checks_pass() {
        let dir = tempfile::tempdir().unwrap();
        let v = CommandValidator::new(
            dir.path(),
            checks(&[("build", "true"), ("test", "echo ok")]),
        );
        let report = v.validate(CancellationToken::new()).await;
        assert!(report.passed);
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks[1].output.contains("ok"));
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let v = CommandValidator::new(
            dir.path(),
            checks(&[("build", "true"), ("test", "echo broken >&2; exit 3"), ("lint", "true")]),
        );
        let report = v.validate(CancellationToken::new()).await;
        assert!(!report.passed);
        assert_eq!(report.checks.len(), 2);
        let failed = report.first_failure().unwrap();
        assert_eq!(failed.name, "test");
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.output.contains("broken"));
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let v = CommandValidator::new(dir.path(), checks(&[("custom_check_1", "test -f marker")]));
        assert!(v.validate(CancellationToken::new()).await.passed);
    }

    #[tokio::test]
    async fn timeout_fails_check() {
        let dir = tempfile::tempdir().unwrap();
        let v = CommandValidator::new(dir.path(), checks(&[("slow", "sleep 5")]))
            .with_timeout(Duration::from_millis(100));
        let report = v.validate(CancellationToken::new()).await;
        assert!(!report.passed);
        assert!(report.checks[0].output.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_marks_report() {
        let dir = tempfile::tempdir().unwrap();
        let v = CommandValidator::new(dir.path(), checks(&[("slow", "sleep 5")]));
        let token = CancellationToken::new();
        token.cancel();
        let report = v.validate(token).await;
        assert!(report.cancelled);
        assert!(!report.passed);
    }

    #[test]
    fn from_config_orders_checks() {
        let config = ValidationConfig {
            build_command: Some("cargo build".into()),
            lint_command: Some("cargo clippy".into()),
            custom_checks: vec!["./check.sh".into()],
            ..Default::default()
        };
        let v = CommandValidator::from_config(&config, ".");
        let names: Vec<&str> = v.checks.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["build", "lint", "custom_check_1"]);
    }
}
