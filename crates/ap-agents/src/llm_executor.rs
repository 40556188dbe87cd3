//! Default [`Executor`] that hands a todo to the LLM collaborator and reports
//! the answer as the item's output.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use ap_core::types::{ExecutionResult, Todo, TodoKind};
use ap_intelligence::{LlmConfig, LlmMessage, LlmProvider};

use crate::executor::{Executor, ExecutorError, Result};

const BASE_PROMPT: &str = "You are a senior software engineer carrying out one step of a \
larger plan in the user's workspace. Do only this step. Report what you did and list every \
file you changed on lines starting with `CHANGED: `.";

fn kind_guidance(kind: TodoKind) -> &'static str {
    match kind {
        TodoKind::CodeChange => "Make the smallest code change that completes the step.",
        TodoKind::Test => "Write or update tests that cover the behavior described.",
        TodoKind::Documentation => "Update documentation only; do not change code.",
        TodoKind::Analysis => "Inspect and explain; do not change any files.",
        TodoKind::Validation => "Check that the described condition holds and report evidence.",
        TodoKind::Configuration => "Change configuration only, keeping existing values intact.",
    }
}

pub struct LlmExecutor {
    llm: Arc<dyn LlmProvider>,
    config: LlmConfig,
    /// `None` accepts every kind.
    kinds: Option<Vec<TodoKind>>,
}

impl LlmExecutor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: LlmConfig) -> Self {
        Self {
            llm,
            config,
            kinds: None,
        }
    }

    pub fn for_kinds(mut self, kinds: &[TodoKind]) -> Self {
        self.kinds = Some(kinds.to_vec());
        self
    }

    pub fn build_messages(todo: &Todo) -> Vec<LlmMessage> {
        let mut prompt = format!("Step ({}): {}\n", todo.kind, todo.description.trim());
        if !todo.target_files.is_empty() {
            prompt.push_str(&format!("Files involved: {}\n", todo.target_files.join(", ")));
        }
        if let Some(error) = &todo.last_error {
            prompt.push_str(&format!(
                "The previous attempt (#{}) failed with: {error}\n",
                todo.attempt.saturating_sub(1)
            ));
        }
        vec![
            LlmMessage::system(format!("{BASE_PROMPT}\n{}", kind_guidance(todo.kind))),
            LlmMessage::user(prompt),
        ]
    }
}

/// Files the model reported on `CHANGED:` lines.
fn changed_files(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("CHANGED:"))
        .map(|path| path.trim().trim_matches('`').to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

#[async_trait]
impl Executor for LlmExecutor {
    fn name(&self) -> &str {
        "llm"
    }

    fn can_execute(&self, kind: TodoKind) -> bool {
        self.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind))
    }

    async fn execute(&self, todo: &Todo, cancel: CancellationToken) -> Result<ExecutionResult> {
        let started = Instant::now();
        let messages = Self::build_messages(todo);
        debug!(todo_id = %todo.id, model = %self.config.model, "sending todo to llm");

        let response = tokio::select! {
            response = self.llm.complete(&messages, &self.config) => response,
            _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
        };

        match response {
            Ok(response) => {
                let files = changed_files(&response.content);
                let mut result =
                    ExecutionResult::success(response.content).with_changed_files(files);
                result.duration_ms = started.elapsed().as_millis() as u64;
                Ok(result)
            }
            Err(e) if e.is_transient() => Err(ExecutorError::Failed(e.to_string())),
            Err(e) => Err(ExecutorError::Fatal(e.to_string())),
        }
    }
}
