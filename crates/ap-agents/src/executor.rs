use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use ap_core::types::{ExecutionResult, Todo, TodoKind};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    /// The attempt failed; another attempt may succeed.
    #[error("execution failed: {0}")]
    Failed(String),
    /// The attempt failed in a way retrying cannot fix.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("no executor registered for kind {0}")]
    Unsupported(TodoKind),
    /// The executor observed its cancellation token and stopped.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Failed(_))
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// Performs the real work of a todo.
///
/// Implementations carry no timeout or retry logic; the scheduler wraps
/// every call uniformly. `cancel` fires when the attempt times out or the
/// plan halts, and long-running work should stop promptly when it does.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    fn can_execute(&self, kind: TodoKind) -> bool;

    async fn execute(&self, todo: &Todo, cancel: CancellationToken) -> Result<ExecutionResult>;
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Executors injected by the caller, consulted in registration order.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        tracing::debug!(executor = executor.name(), "executor registered");
        self.executors.push(executor);
    }

    /// First registered executor that handles `kind`.
    pub fn resolve(&self, kind: TodoKind) -> Option<Arc<dyn Executor>> {
        self.executors
            .iter()
            .find(|e| e.can_execute(kind))
            .map(Arc::clone)
    }

    /// Kinds no registered executor can run.
    pub fn uncovered_kinds(&self) -> Vec<TodoKind> {
        TodoKind::ALL
            .into_iter()
            .filter(|k| self.resolve(*k).is_none())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.executors.iter().map(|e| e.name()).collect();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}
