use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.autoplan/config.toml`.
///
/// **Security**: This struct NEVER stores API keys. Only the name of the
/// environment variable holding the key is configured (see [`LlmSettings`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub llm: LlmSettings,
}

impl Config {
    /// Load config from `~/.autoplan/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.orchestration.validate()?;
        self.validation.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autoplan")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "general.log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_project_name() -> String {
    "autoplan".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Knobs consumed by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default = "default_true")]
    pub parallel_execution: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Plan-level default; a todo's `timeout_secs` wins when set.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Plan-level default; a todo's `max_retries` wins when set.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub stop_on_failure: bool,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            parallel_execution: true,
            max_concurrent: default_max_concurrent(),
            step_timeout_secs: default_step_timeout(),
            max_retries: default_max_retries(),
            stop_on_failure: true,
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl OrchestrationConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "orchestration.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestration.step_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "orchestration.backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    4
}
fn default_step_timeout() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    30_000
}

/// Plan-level validation gate, run after every item completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub lint_command: Option<String>,
    #[serde(default)]
    pub custom_checks: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ValidationConfig {
    /// Named checks in execution order: build, test, lint, then custom.
    pub fn checks(&self) -> Vec<(String, String)> {
        let mut checks = Vec::new();
        for (name, cmd) in [
            ("build", &self.build_command),
            ("test", &self.test_command),
            ("lint", &self.lint_command),
        ] {
            if let Some(cmd) = cmd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                checks.push((name.to_string(), cmd.to_string()));
            }
        }
        for (i, cmd) in self.custom_checks.iter().enumerate() {
            let cmd = cmd.trim();
            if !cmd.is_empty() {
                checks.push((format!("custom_check_{}", i + 1), cmd.to_string()));
            }
        }
        checks
    }

    pub fn is_empty(&self) -> bool {
        self.checks().is_empty()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "validation.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory (relative to the workspace root unless absolute) holding the
    /// run snapshot.
    #[serde(default = "default_state_dir")]
    pub dir: String,
    /// Move the snapshot into `<dir>/archive/` on success instead of deleting it.
    #[serde(default = "default_true")]
    pub archive: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            archive: true,
        }
    }
}

impl StateConfig {
    pub fn resolve_dir(&self, workspace_root: &std::path::Path) -> PathBuf {
        let dir = PathBuf::from(&self.dir);
        if dir.is_absolute() {
            dir
        } else {
            workspace_root.join(dir)
        }
    }
}

fn default_state_dir() -> String {
    ".autoplan".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_temperature(),
            base_url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

impl LlmSettings {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_llm_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.3
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
