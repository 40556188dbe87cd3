//! LLM collaborator abstraction.
//!
//! The decomposer and the LLM executor only ever see [`LlmProvider`]; the
//! concrete provider is injected by the caller. [`MockProvider`] serves
//! scripted responses for tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ap_core::config::LlmSettings;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures talking to the LLM collaborator.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Connection failure, DNS, TLS, etc.
    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    /// No API key was configured for a provider that needs one.
    #[error("missing API key: set {0}")]
    MissingApiKey(String),
}

impl LlmError {
    /// Transient failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::HttpError(_) | LlmError::RateLimited { .. } | LlmError::Timeout
        ) || matches!(self, LlmError::ApiError { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::HttpError(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for LlmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LlmRole::System => "system",
            LlmRole::User => "user",
            LlmRole::Assistant => "assistant",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

impl LlmMessage {
    pub fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }
}

/// Per-request options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::from(&LlmSettings::default())
    }
}

impl From<&LlmSettings> for LlmConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

impl LlmResponse {
    /// A plain text response, mostly for scripting mocks.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: "mock".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: "end_turn".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmProvider trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// One request/response turn.
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Single-prompt convenience returning only the text.
    async fn generate(&self, prompt: &str, config: &LlmConfig) -> Result<String, LlmError> {
        let response = self.complete(&[LlmMessage::user(prompt)], config).await?;
        Ok(response.content)
    }
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Talks to the Anthropic Messages API over `reqwest`.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    /// Build a provider from config, reading the key from `settings.api_key_env`.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let key = settings
            .api_key()
            .ok_or_else(|| LlmError::MissingApiKey(settings.api_key_env.clone()))?;
        let mut provider = Self::new(key);
        if let Some(url) = &settings.base_url {
            provider = provider.with_base_url(url.clone());
        }
        Ok(provider)
    }

    /// Point at a proxy or a local stand-in instead of the public endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Request body for `POST /v1/messages`. System messages and the
    /// configured system prompt go into the top-level `system` field.
    pub fn build_request_body(messages: &[LlmMessage], config: &LlmConfig) -> serde_json::Value {
        let request = MessagesRequest::new(messages, config);
        serde_json::to_value(&request).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: LlmRole,
    content: &'a str,
}

impl<'a> MessagesRequest<'a> {
    fn new(messages: &'a [LlmMessage], config: &'a LlmConfig) -> Self {
        let (system, turns): (Vec<&LlmMessage>, Vec<&LlmMessage>) =
            messages.iter().partition(|m| m.role == LlmRole::System);
        let system: Vec<&str> = config
            .system_prompt
            .as_deref()
            .into_iter()
            .chain(system.into_iter().map(|m| m.content.as_str()))
            .collect();
        Self {
            model: &config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system: (!system.is_empty()).then(|| system.join("\n")),
            messages: turns
                .into_iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

impl From<MessagesResponse> for LlmResponse {
    fn from(resp: MessagesResponse) -> Self {
        Self {
            content: resp.content.into_iter().filter_map(|b| b.text).collect(),
            model: resp.model,
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            finish_reason: resp.stop_reason.unwrap_or_else(|| "unknown".into()),
        }
    }
}

/// Map non-2xx replies to [`LlmError`]; 429 carries `retry-after` if sent.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.trim().parse().ok());
        return Err(LlmError::RateLimited { retry_after_secs });
    }
    Err(LlmError::ApiError {
        status: status.as_u16(),
        message: resp.text().await.unwrap_or_default(),
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        tracing::debug!(model = %config.model, messages = messages.len(), "anthropic request");
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&MessagesRequest::new(messages, config))
            .send()
            .await?;

        let body: MessagesResponse = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::ParseError(e.to_string()))?;
        Ok(body.into())
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

type Captured = Vec<(Vec<LlmMessage>, LlmConfig)>;

/// Scripted provider for tests.
///
/// Each call to `complete` pops the next queued result. Once the queue is
/// empty every call returns the fallback response. Clones share the queue and
/// the captured requests.
#[derive(Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<LlmResponse, LlmError>>>>,
    captured_requests: Arc<Mutex<Captured>>,
    fallback: String,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            captured_requests: Arc::new(Mutex::new(Vec::new())),
            fallback: "Mock response".to_string(),
        }
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        lock(&self.responses).push_back(Ok(response));
        self
    }

    pub fn with_text(self, content: impl Into<String>) -> Self {
        self.with_response(LlmResponse::text(content))
    }

    pub fn with_error(self, error: LlmError) -> Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    /// Text returned once the queue is drained.
    pub fn with_fallback(mut self, content: impl Into<String>) -> Self {
        self.fallback = content.into();
        self
    }

    pub fn captured_requests(&self) -> Vec<(Vec<LlmMessage>, LlmConfig)> {
        lock(&self.captured_requests).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.captured_requests).len()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmError> {
        lock(&self.captured_requests).push((messages.to_vec(), config.clone()));
        let next = lock(&self.responses).pop_front();
        next.unwrap_or_else(|| {
            let mut resp = LlmResponse::text(self.fallback.clone());
            resp.model = config.model.clone();
            Ok(resp)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
