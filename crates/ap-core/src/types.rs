use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lowest priority a todo can carry.
pub const PRIORITY_MIN: i32 = 10;
/// Highest priority a todo can carry.
pub const PRIORITY_MAX: i32 = 100;
/// Priority assigned when the decomposition does not provide one.
pub const PRIORITY_NORMAL: i32 = 50;

pub const COMPLEXITY_MIN: u8 = 1;
pub const COMPLEXITY_MAX: u8 = 4;
pub const COMPLEXITY_MODERATE: u8 = 2;

// ---------------------------------------------------------------------------
// TodoKind
// ---------------------------------------------------------------------------

/// The kind of work a todo involves. Used to route to an executor and to bias
/// the initial priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoKind {
    Analysis,
    CodeChange,
    Validation,
    Documentation,
    Test,
    Configuration,
}

impl TodoKind {
    pub const ALL: [TodoKind; 6] = [
        TodoKind::Analysis,
        TodoKind::CodeChange,
        TodoKind::Validation,
        TodoKind::Documentation,
        TodoKind::Test,
        TodoKind::Configuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TodoKind::Analysis => "analysis",
            TodoKind::CodeChange => "code_change",
            TodoKind::Validation => "validation",
            TodoKind::Documentation => "documentation",
            TodoKind::Test => "test",
            TodoKind::Configuration => "configuration",
        }
    }

    /// Lenient parse used on LLM output. Accepts the canonical names plus a
    /// handful of common synonyms.
    pub fn parse_lenient(raw: &str) -> Option<TodoKind> {
        let normalized = raw.trim().to_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "analysis" | "analyze" | "research" | "investigation" => TodoKind::Analysis,
            "code_change" | "code" | "implementation" | "implement" | "refactor"
            | "refactoring" | "edit" => TodoKind::CodeChange,
            "validation" | "validate" | "verify" | "verification" | "review" => {
                TodoKind::Validation
            }
            "documentation" | "docs" | "doc" => TodoKind::Documentation,
            "test" | "tests" | "testing" => TodoKind::Test,
            "configuration" | "config" | "setup" => TodoKind::Configuration,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for TodoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TodoStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TodoStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `InProgress -> Pending` covers both a retryable failure and the reset
    /// of an item that was in flight when the process died.
    pub fn can_transition_to(&self, target: &TodoStatus) -> bool {
        matches!(
            (self, target),
            (TodoStatus::Pending, TodoStatus::InProgress)
                | (TodoStatus::InProgress, TodoStatus::Completed)
                | (TodoStatus::InProgress, TodoStatus::Failed)
                | (TodoStatus::InProgress, TodoStatus::Pending)
                | (TodoStatus::Pending, TodoStatus::Cancelled)
                | (TodoStatus::InProgress, TodoStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TodoStatus::Completed | TodoStatus::Failed | TodoStatus::Cancelled
        )
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Failed => "failed",
            TodoStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("todo {id}: invalid transition {from} -> {to}")]
    Invalid {
        id: String,
        from: TodoStatus,
        to: TodoStatus,
    },
    #[error("todo {0} not found")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// What an executor reports back for a single attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_changed_files(mut self, files: Vec<String>) -> Self {
        self.changed_files = files;
        self
    }
}

// ---------------------------------------------------------------------------
// Todo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub description: String,
    pub active_form: String,
    #[serde(rename = "type")]
    pub kind: TodoKind,
    pub priority: i32,
    pub complexity: u8,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub status: TodoStatus,
    #[serde(default)]
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Per-item override of the plan-level step timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Per-item override of the plan-level retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl Todo {
    pub fn new(description: impl Into<String>, kind: TodoKind) -> Self {
        let description = description.into();
        Self {
            id: Uuid::new_v4().to_string(),
            active_form: description.clone(),
            description,
            kind,
            priority: PRIORITY_NORMAL,
            complexity: COMPLEXITY_MODERATE,
            dependencies: Vec::new(),
            target_files: Vec::new(),
            status: TodoStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            timeout_secs: None,
            max_retries: None,
            output: None,
            changed_files: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_active_form(mut self, active_form: impl Into<String>) -> Self {
        self.active_form = active_form.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(COMPLEXITY_MIN, COMPLEXITY_MAX);
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_files(mut self, files: Vec<String>) -> Self {
        self.target_files = files;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    fn ensure(&self, to: TodoStatus) -> Result<(), TransitionError> {
        if self.status.can_transition_to(&to) {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                id: self.id.clone(),
                from: self.status,
                to,
            })
        }
    }

    /// Begin a new attempt.
    pub fn mark_started(&mut self) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::InProgress)?;
        self.status = TodoStatus::InProgress;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, result: &ExecutionResult) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::Completed)?;
        self.status = TodoStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.output = Some(result.output.clone());
        self.changed_files = result.changed_files.clone();
        self.last_error = None;
        Ok(())
    }

    /// Failed attempt with retry budget left: back to `Pending`.
    pub fn mark_retry(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::Pending)?;
        self.status = TodoStatus::Pending;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Terminal failure.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::Failed)?;
        self.status = TodoStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error.into());
        Ok(())
    }

    pub fn mark_cancelled(&mut self, reason: Option<String>) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::Cancelled)?;
        self.status = TodoStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        if reason.is_some() {
            self.last_error = reason;
        }
        Ok(())
    }

    /// Put an in-flight item back to `Pending` without touching its attempt
    /// counter or last error. Used when the outcome of an attempt is unknown.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.ensure(TodoStatus::Pending)?;
        self.status = TodoStatus::Pending;
        Ok(())
    }

    /// Wall-clock time of the latest attempt, if it has started.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end - started)
    }
}

pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

// ---------------------------------------------------------------------------
// TodoList
// ---------------------------------------------------------------------------

/// Per-status counts of a [`TodoList`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.cancelled
    }
}

/// An ordered collection of todos sharing one originating intent.
///
/// Counters are derived and recomputed after every transition; mutate items
/// only through the transition methods so they never drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub id: String,
    pub user_intent: String,
    pub todos: Vec<Todo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_todos: usize,
    #[serde(default)]
    pub counts: StatusCounts,
}

impl TodoList {
    pub fn new(user_intent: impl Into<String>, todos: Vec<Todo>) -> Self {
        let now = Utc::now();
        let mut list = Self {
            id: Uuid::new_v4().to_string(),
            user_intent: user_intent.into(),
            todos,
            created_at: now,
            updated_at: now,
            total_todos: 0,
            counts: StatusCounts::default(),
        };
        list.recount();
        list
    }

    pub fn add_todo(&mut self, todo: Todo) {
        self.todos.push(todo);
        self.recount();
    }

    pub fn get(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.todos.iter().map(|t| t.id.as_str())
    }

    pub fn status_of(&self, id: &str) -> Option<TodoStatus> {
        self.get(id).map(|t| t.status)
    }

    /// Recompute the derived counters from item statuses.
    pub fn recount(&mut self) {
        let mut counts = StatusCounts::default();
        for todo in &self.todos {
            match todo.status {
                TodoStatus::Pending => counts.pending += 1,
                TodoStatus::InProgress => counts.in_progress += 1,
                TodoStatus::Completed => counts.completed += 1,
                TodoStatus::Failed => counts.failed += 1,
                TodoStatus::Cancelled => counts.cancelled += 1,
            }
        }
        self.counts = counts;
        self.total_todos = self.todos.len();
        self.updated_at = Utc::now();
    }

    fn apply<F>(&mut self, id: &str, f: F) -> Result<&Todo, TransitionError>
    where
        F: FnOnce(&mut Todo) -> Result<(), TransitionError>,
    {
        let idx = self
            .todos
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;
        f(&mut self.todos[idx])?;
        self.recount();
        Ok(&self.todos[idx])
    }

    pub fn start(&mut self, id: &str) -> Result<&Todo, TransitionError> {
        self.apply(id, Todo::mark_started)
    }

    pub fn complete(&mut self, id: &str, result: &ExecutionResult) -> Result<&Todo, TransitionError> {
        self.apply(id, |t| t.mark_completed(result))
    }

    pub fn retry(&mut self, id: &str, error: impl Into<String>) -> Result<&Todo, TransitionError> {
        let error = error.into();
        self.apply(id, |t| t.mark_retry(error))
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> Result<&Todo, TransitionError> {
        let error = error.into();
        self.apply(id, |t| t.mark_failed(error))
    }

    pub fn cancel(&mut self, id: &str, reason: Option<String>) -> Result<&Todo, TransitionError> {
        self.apply(id, |t| t.mark_cancelled(reason))
    }

    pub fn requeue(&mut self, id: &str) -> Result<&Todo, TransitionError> {
        self.apply(id, Todo::requeue)
    }

    /// Cancel every item still `Pending`. Returns the cancelled IDs.
    pub fn cancel_pending(&mut self, reason: &str) -> Vec<String> {
        let mut cancelled = Vec::new();
        for todo in self.todos.iter_mut() {
            if todo.status == TodoStatus::Pending
                && todo.mark_cancelled(Some(reason.to_string())).is_ok()
            {
                cancelled.push(todo.id.clone());
            }
        }
        self.recount();
        cancelled
    }

    /// Completed / total. An empty list counts as fully done.
    pub fn progress(&self) -> f64 {
        if self.total_todos == 0 {
            return 1.0;
        }
        self.counts.completed as f64 / self.total_todos as f64
    }

    /// `true` once no item is `Pending` or `InProgress`.
    pub fn is_finished(&self) -> bool {
        self.todos.iter().all(|t| t.status.is_terminal())
    }

    pub fn all_completed(&self) -> bool {
        self.todos.iter().all(|t| t.status == TodoStatus::Completed)
    }

    pub fn failed_todos(&self) -> Vec<&Todo> {
        self.todos
            .iter()
            .filter(|t| t.status == TodoStatus::Failed)
            .collect()
    }

    /// Human-readable one-block summary used by the CLI.
    pub fn summary(&self) -> String {
        let c = &self.counts;
        let mut out = format!(
            "{} todos: {} completed, {} failed, {} cancelled, {} in progress, {} pending ({:.0}%)",
            self.total_todos,
            c.completed,
            c.failed,
            c.cancelled,
            c.in_progress,
            c.pending,
            self.progress() * 100.0
        );
        for todo in self.failed_todos() {
            out.push_str(&format!(
                "\n  x {} [{}]: {}",
                todo.description,
                todo.id,
                todo.last_error.as_deref().unwrap_or("unknown error")
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Intent analysis & plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    CodeGeneration,
    Analysis,
    Refactoring,
    Documentation,
    Question,
    MultiStep,
    Orchestration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// A single small item.
    QuickEdit,
    /// Full multi-item execution.
    FullEdit,
    /// Read-only analysis.
    Analyze,
    Orchestrate,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionStrategy::QuickEdit => "quick_edit",
            ExecutionStrategy::FullEdit => "full_edit",
            ExecutionStrategy::Analyze => "analyze",
            ExecutionStrategy::Orchestrate => "orchestrate",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub complexity: u8,
    pub confidence: f64,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    pub description: String,
}

/// A todo list bound to the strategy and analysis that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: String,
    pub strategy: ExecutionStrategy,
    pub analysis: IntentAnalysis,
    pub todo_list: TodoList,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    pub fn new(strategy: ExecutionStrategy, analysis: IntentAnalysis, todo_list: TodoList) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            strategy,
            analysis,
            todo_list,
            created_at: Utc::now(),
        }
    }

    pub fn progress(&self) -> f64 {
        self.todo_list.progress()
    }

    pub fn remaining(&self) -> usize {
        self.todo_list.total_todos - self.todo_list.counts.completed
    }
}

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Analyzing,
    Planning,
    Executing,
    Validating,
    Completed,
    Failed,
    Paused,
}

impl AgentStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    /// Staying in the same state is always allowed.
    ///
    /// Valid transitions:
    /// - Idle       -> Analyzing | Executing (resume)
    /// - Analyzing  -> Planning
    /// - Planning   -> Executing
    /// - Executing  -> Validating | Completed | Paused
    /// - Validating -> Completed | Paused
    /// - Paused     -> Executing
    /// - any active -> Failed
    /// - Completed | Failed | Paused -> Idle
    pub fn can_transition_to(&self, target: &AgentStatus) -> bool {
        use AgentStatus::*;
        if self == target {
            return true;
        }
        matches!(
            (self, target),
            (Idle, Analyzing)
                | (Idle, Executing)
                | (Analyzing, Planning)
                | (Planning, Executing)
                | (Executing, Validating)
                | (Executing, Completed)
                | (Executing, Paused)
                | (Validating, Completed)
                | (Validating, Paused)
                | (Paused, Executing)
                | (Analyzing, Failed)
                | (Planning, Failed)
                | (Executing, Failed)
                | (Validating, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
                | (Paused, Idle)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            AgentStatus::Analyzing
                | AgentStatus::Planning
                | AgentStatus::Executing
                | AgentStatus::Validating
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Analyzing => "analyzing",
            AgentStatus::Planning => "planning",
            AgentStatus::Executing => "executing",
            AgentStatus::Validating => "validating",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Paused => "paused",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent transition: {from} -> {to}")]
pub struct AgentTransitionError {
    pub from: AgentStatus,
    pub to: AgentStatus,
}

/// Overall status of one run. Persisted next to the todo list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub current_todo_id: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub strategy: Option<ExecutionStrategy>,
    #[serde(default)]
    pub analysis: Option<IntentAnalysis>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: AgentStatus::Idle,
            plan_id: None,
            current_todo_id: None,
            progress: 0.0,
            strategy: None,
            analysis: None,
            started_at: now,
            last_activity_at: now,
        }
    }

    pub fn transition(&mut self, next: AgentStatus) -> Result<(), AgentTransitionError> {
        if !self.status.can_transition_to(&next) {
            return Err(AgentTransitionError {
                from: self.status,
                to: next,
            });
        }
        if self.status != next {
            tracing::debug!(from = %self.status, to = %next, "agent status transition");
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn set_plan(&mut self, plan: &ExecutionPlan) {
        self.plan_id = Some(plan.id.clone());
        self.strategy = Some(plan.strategy);
        self.analysis = Some(plan.analysis.clone());
        self.touch();
    }

    pub fn set_current_todo(&mut self, todo_id: Option<String>) {
        self.current_todo_id = todo_id;
        self.touch();
    }

    pub fn update_progress(&mut self, progress: f64) {
        self.progress = progress;
        self.touch();
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
