//! The dispatch loop: runs a validated [`TodoList`] to a terminal outcome.
//!
//! All mutation of the list and the agent state happens on the task that
//! calls [`Scheduler::run`]. Attempts run as spawned tasks that only return an
//! [`AttemptOutcome`]; the loop applies outcomes one at a time, so no locking
//! is needed on the core data structures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EventType;
use ap_core::config::OrchestrationConfig;
use ap_core::dependency::{self, BlockedTodo, DependencyError};
use ap_core::state_store::StateStore;
use ap_core::types::{
    AgentState, AgentStatus, AgentTransitionError, ExecutionResult, StatusCounts, Todo, TodoList,
    TransitionError,
};

use crate::executor::{Executor, ExecutorError, ExecutorRegistry};
use crate::validation::{ValidationReport, Validator};

/// Time an attempt gets to observe its cancellation before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error("deadlock: {}", format_blocked(.0))]
    Deadlock(Vec<BlockedTodo>),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Agent(#[from] AgentTransitionError),
    #[error("attempt task failed: {0}")]
    Join(String),
}

fn format_blocked(blocked: &[BlockedTodo]) -> String {
    blocked
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

// ---------------------------------------------------------------------------
// Outcomes & report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Succeeded,
    Failed,
    Halted,
}

impl std::fmt::Display for PlanOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PlanOutcome::Succeeded => "succeeded",
            PlanOutcome::Failed => "failed",
            PlanOutcome::Halted => "halted",
        };
        f.write_str(label)
    }
}

/// What one execution attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(ExecutionResult),
    Failed { error: String, retryable: bool },
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoFailure {
    pub todo_id: String,
    pub description: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub outcome: PlanOutcome,
    pub counts: StatusCounts,
    pub total: usize,
    /// Items that ended terminally `Failed`.
    pub failures: Vec<TodoFailure>,
    /// Items cancelled by a halt or a failed dependency.
    pub cancelled: Vec<String>,
    pub validation: Option<ValidationReport>,
    pub halt_reason: Option<String>,
    pub duration_ms: u64,
}

impl PlanReport {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "plan {}: {}/{} completed, {} failed, {} cancelled in {:.1}s",
            self.outcome,
            self.counts.completed,
            self.total,
            self.counts.failed,
            self.counts.cancelled,
            self.duration_ms as f64 / 1000.0
        );
        if let Some(reason) = &self.halt_reason {
            out.push_str(&format!("\n  halted: {reason}"));
        }
        for failure in &self.failures {
            out.push_str(&format!(
                "\n  x {} [{}]: {}",
                failure.description, failure.todo_id, failure.error
            ));
        }
        if let Some(check) = self.validation.as_ref().and_then(|v| v.first_failure()) {
            out.push_str(&format!(
                "\n  validation `{}` failed (exit {:?})",
                check.name, check.exit_code
            ));
        }
        out
    }
}

/// Why dispatching stopped early.
#[derive(Debug, Clone)]
enum Halt {
    StopOnFailure { todo_id: String, error: String },
    Cancelled,
}

impl Halt {
    fn reason(&self) -> String {
        match self {
            Halt::StopOnFailure { todo_id, error } => {
                format!("stop on failure: {todo_id} failed: {error}")
            }
            Halt::Cancelled => "cancelled by caller".to_string(),
        }
    }
}

/// What to do when nothing is in flight and nothing is ready.
#[derive(Debug, PartialEq)]
enum Stall {
    /// Pending items behind a failed or cancelled dependency, in list order.
    Doomed(Vec<String>),
    Deadlock(Vec<BlockedTodo>),
}

fn classify_stall(list: &TodoList) -> Stall {
    let doomed = dependency::doomed_items(list);
    if doomed.is_empty() {
        return Stall::Deadlock(dependency::blocked_items(list));
    }
    Stall::Doomed(
        list.ids()
            .filter(|id| doomed.contains(*id))
            .map(str::to_string)
            .collect(),
    )
}

/// `base * 2^(attempt - 1)`, capped at `max`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exp).min(max)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    executors: Arc<ExecutorRegistry>,
    config: OrchestrationConfig,
    bus: EventBus,
    store: Option<StateStore>,
    validator: Option<Arc<dyn Validator>>,
    cancel: CancellationToken,
}

/// Mutable bookkeeping for one `run` call.
struct RunState {
    token: CancellationToken,
    not_before: HashMap<String, Instant>,
    halt: Option<Halt>,
    failures: Vec<TodoFailure>,
    cancelled: Vec<String>,
}

impl Scheduler {
    pub fn new(
        executors: Arc<ExecutorRegistry>,
        config: OrchestrationConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            executors,
            config,
            bus,
            store: None,
            validator: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Cancelling `token` halts the run: nothing new is dispatched, in-flight
    /// attempts and every still-pending item end `Cancelled`, and the outcome
    /// is [`PlanOutcome::Halted`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn concurrency_limit(&self) -> usize {
        if self.config.parallel_execution {
            self.config.max_concurrent.max(1)
        } else {
            1
        }
    }

    /// Run `list` until every item is terminal or the plan halts.
    ///
    /// Returns `Err` only for an invalid graph, a deadlock, or a broken
    /// invariant; failed items and failed validation are reported through
    /// [`PlanReport::outcome`].
    pub async fn run(&self, list: &mut TodoList, agent: &mut AgentState) -> Result<PlanReport> {
        let started = Instant::now();
        dependency::validate(list)?;
        agent.transition(AgentStatus::Executing)?;

        let limit = self.concurrency_limit();
        let mut state = RunState {
            token: self.cancel.child_token(),
            not_before: HashMap::new(),
            halt: None,
            failures: Vec::new(),
            cancelled: Vec::new(),
        };
        let mut in_flight: JoinSet<(String, AttemptOutcome)> = JoinSet::new();

        info!(
            list_id = %list.id,
            todos = list.total_todos,
            limit,
            "scheduler started"
        );
        agent.update_progress(list.progress());
        self.persist(agent, list);

        loop {
            if state.halt.is_none() && state.token.is_cancelled() {
                state.halt = Some(Halt::Cancelled);
            }

            if state.halt.is_none() {
                let now = Instant::now();
                for id in dependency::ready_set(list) {
                    if in_flight.len() >= limit {
                        break;
                    }
                    if state.not_before.get(&id).is_some_and(|t| *t > now) {
                        continue;
                    }
                    state.not_before.remove(&id);
                    self.dispatch(&id, list, agent, &state.token, &mut in_flight)?;
                }
            }

            if in_flight.is_empty() {
                if state.halt.is_some() || list.counts.pending == 0 {
                    break;
                }

                let ready = dependency::ready_set(list);
                if !ready.is_empty() {
                    // Everything ready is still backing off.
                    let wake = ready
                        .iter()
                        .filter_map(|id| state.not_before.get(id))
                        .min()
                        .copied()
                        .unwrap_or_else(Instant::now);
                    tokio::select! {
                        _ = tokio::time::sleep_until(wake) => {}
                        _ = state.token.cancelled() => {}
                    }
                    continue;
                }

                match classify_stall(list) {
                    Stall::Doomed(ids) => {
                        for id in ids {
                            list.cancel(&id, Some("dependency failed".to_string()))?;
                            warn!(todo_id = %id, "cancelled: dependency failed");
                            self.bus.emit(
                                EventType::TodoCancelled,
                                format!("{id} cancelled: dependency failed"),
                                json!({ "todo_id": id, "reason": "dependency failed" }),
                            );
                            state.cancelled.push(id);
                        }
                        agent.update_progress(list.progress());
                        self.persist(agent, list);
                        continue;
                    }
                    Stall::Deadlock(blocked) => {
                        warn!(blocked = blocked.len(), "deadlock detected");
                        agent.set_current_todo(None);
                        agent.transition(AgentStatus::Failed)?;
                        self.persist(agent, list);
                        self.bus.emit(
                            EventType::WorkflowFailed,
                            format!("deadlock: {}", format_blocked(&blocked)),
                            json!({ "reason": "deadlock", "blocked": blocked }),
                        );
                        return Err(SchedulerError::Deadlock(blocked));
                    }
                }
            }

            tokio::select! {
                biased;
                _ = state.token.cancelled(), if state.halt.is_none() => {
                    info!("cancellation requested, halting");
                    state.halt = Some(Halt::Cancelled);
                }
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (id, outcome) = joined.map_err(|e| SchedulerError::Join(e.to_string()))?;
                    self.apply_outcome(&id, outcome, list, agent, &mut state)?;
                }
            }
        }

        self.finish(list, agent, state, started).await
    }

    fn dispatch(
        &self,
        id: &str,
        list: &mut TodoList,
        agent: &mut AgentState,
        token: &CancellationToken,
        in_flight: &mut JoinSet<(String, AttemptOutcome)>,
    ) -> Result<()> {
        let todo = list.start(id)?.clone();
        agent.set_current_todo(Some(todo.id.clone()));
        info!(todo_id = %todo.id, attempt = todo.attempt, kind = %todo.kind, "todo started");
        self.bus.emit(
            EventType::TodoStarted,
            todo.active_form.clone(),
            json!({
                "todo_id": todo.id,
                "attempt": todo.attempt,
                "active_form": todo.active_form,
            }),
        );
        self.persist(agent, list);

        let limit = todo
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.step_timeout());
        let todo_id = todo.id.clone();
        match self.executors.resolve(todo.kind) {
            Some(executor) => {
                let attempt_token = token.child_token();
                in_flight.spawn(async move {
                    let outcome = run_attempt(executor, todo, limit, attempt_token).await;
                    (todo_id, outcome)
                });
            }
            None => {
                let error = ExecutorError::Unsupported(todo.kind).to_string();
                in_flight.spawn(async move {
                    (
                        todo_id,
                        AttemptOutcome::Failed {
                            error,
                            retryable: false,
                        },
                    )
                });
            }
        }
        Ok(())
    }

    fn apply_outcome(
        &self,
        id: &str,
        outcome: AttemptOutcome,
        list: &mut TodoList,
        agent: &mut AgentState,
        state: &mut RunState,
    ) -> Result<()> {
        match outcome {
            AttemptOutcome::Succeeded(result) => {
                let todo = list.complete(id, &result)?;
                info!(
                    todo_id = %id,
                    attempt = todo.attempt,
                    duration_ms = result.duration_ms,
                    "todo completed"
                );
                self.bus.emit(
                    EventType::TodoCompleted,
                    format!("{} completed", todo.description),
                    json!({
                        "todo_id": id,
                        "attempt": todo.attempt,
                        "duration_ms": result.duration_ms,
                        "changed_files": result.changed_files,
                    }),
                );
            }
            AttemptOutcome::Cancelled => {
                let reason = state
                    .halt
                    .as_ref()
                    .map_or_else(|| "cancelled".to_string(), Halt::reason);
                list.cancel(id, Some(reason.clone()))?;
                info!(todo_id = %id, reason = %reason, "todo cancelled");
                self.bus.emit(
                    EventType::TodoCancelled,
                    format!("{id} cancelled: {reason}"),
                    json!({ "todo_id": id, "reason": reason }),
                );
                state.cancelled.push(id.to_string());
            }
            AttemptOutcome::Failed { error, retryable } => {
                self.handle_failure(id, error, retryable, list, state)?;
            }
            AttemptOutcome::TimedOut(limit) => {
                let error = format!("timed out after {}s", limit.as_secs());
                self.handle_failure(id, error, true, list, state)?;
            }
        }

        if agent.current_todo_id.as_deref() == Some(id) {
            agent.set_current_todo(None);
        }
        agent.update_progress(list.progress());
        self.persist(agent, list);
        self.bus.emit(
            EventType::Progress,
            format!("{:.0}% complete", list.progress() * 100.0),
            json!({
                "progress": list.progress(),
                "total": list.total_todos,
                "counts": list.counts,
            }),
        );
        Ok(())
    }

    fn handle_failure(
        &self,
        id: &str,
        error: String,
        retryable: bool,
        list: &mut TodoList,
        state: &mut RunState,
    ) -> Result<()> {
        let todo: &Todo = list
            .get(id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;
        let attempt = todo.attempt;
        let max_retries = todo.max_retries.unwrap_or(self.config.max_retries);

        if retryable && state.halt.is_none() && attempt <= max_retries {
            let delay = backoff_delay(
                attempt,
                self.config.backoff_base(),
                self.config.backoff_max(),
            );
            list.retry(id, error.clone())?;
            state.not_before.insert(id.to_string(), Instant::now() + delay);
            warn!(
                todo_id = %id,
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "attempt failed, retrying"
            );
            self.bus.emit(
                EventType::TodoRetrying,
                format!("{id} retrying after attempt {attempt}: {error}"),
                json!({
                    "todo_id": id,
                    "attempt": attempt,
                    "error": error,
                    "delay_ms": delay.as_millis() as u64,
                }),
            );
            return Ok(());
        }

        let todo = list.fail(id, error.clone())?;
        warn!(todo_id = %id, attempt, error = %error, "todo failed");
        state.failures.push(TodoFailure {
            todo_id: id.to_string(),
            description: todo.description.clone(),
            error: error.clone(),
        });
        self.bus.emit(
            EventType::TodoFailed,
            format!("{} failed: {error}", todo.description),
            json!({ "todo_id": id, "attempt": attempt, "error": error }),
        );

        if self.config.stop_on_failure && state.halt.is_none() {
            info!(todo_id = %id, "stop_on_failure set, halting dispatch");
            state.halt = Some(Halt::StopOnFailure {
                todo_id: id.to_string(),
                error,
            });
            state.token.cancel();
        }
        Ok(())
    }

    async fn finish(
        &self,
        list: &mut TodoList,
        agent: &mut AgentState,
        mut state: RunState,
        started: Instant,
    ) -> Result<PlanReport> {
        let mut validation = None;
        let halt_reason = state.halt.as_ref().map(Halt::reason);

        let outcome = match &state.halt {
            Some(halt) => {
                let reason = halt.reason();
                for id in list.cancel_pending(&reason) {
                    self.bus.emit(
                        EventType::TodoCancelled,
                        format!("{id} cancelled: {reason}"),
                        json!({ "todo_id": id, "reason": reason }),
                    );
                    state.cancelled.push(id);
                }
                match halt {
                    Halt::Cancelled => PlanOutcome::Halted,
                    Halt::StopOnFailure { .. } => PlanOutcome::Failed,
                }
            }
            None if list.all_completed() => match &self.validator {
                Some(validator) => {
                    agent.transition(AgentStatus::Validating)?;
                    self.persist(agent, list);
                    self.bus.emit(
                        EventType::ValidationStarted,
                        "running validation checks",
                        json!({}),
                    );
                    let report = validator.validate(state.token.clone()).await;
                    let outcome = if report.cancelled {
                        PlanOutcome::Halted
                    } else if report.passed {
                        self.bus.emit(
                            EventType::ValidationPassed,
                            "validation passed",
                            json!({ "checks": report.checks.len() }),
                        );
                        PlanOutcome::Succeeded
                    } else {
                        let failed = report.first_failure();
                        self.bus.emit(
                            EventType::ValidationFailed,
                            format!(
                                "validation check `{}` failed",
                                failed.map_or("unknown", |c| c.name.as_str())
                            ),
                            json!({
                                "check": failed.map(|c| c.name.clone()),
                                "exit_code": failed.and_then(|c| c.exit_code),
                                "output": failed.map(|c| c.output.clone()),
                            }),
                        );
                        PlanOutcome::Failed
                    };
                    validation = Some(report);
                    outcome
                }
                None => PlanOutcome::Succeeded,
            },
            None => PlanOutcome::Failed,
        };

        let target = match outcome {
            PlanOutcome::Succeeded => AgentStatus::Completed,
            PlanOutcome::Failed => AgentStatus::Failed,
            PlanOutcome::Halted => AgentStatus::Paused,
        };
        if let Err(e) = agent.transition(target) {
            debug!(error = %e, "falling back to failed");
            agent.transition(AgentStatus::Failed)?;
        }
        agent.set_current_todo(None);
        agent.update_progress(list.progress());
        self.persist(agent, list);

        let report = PlanReport {
            outcome,
            counts: list.counts,
            total: list.total_todos,
            failures: state.failures,
            cancelled: state.cancelled,
            validation,
            halt_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let event_type = match outcome {
            PlanOutcome::Succeeded => EventType::WorkflowComplete,
            PlanOutcome::Failed => EventType::WorkflowFailed,
            PlanOutcome::Halted => EventType::WorkflowHalted,
        };
        info!(
            outcome = ?outcome,
            completed = list.counts.completed,
            total = list.total_todos,
            "plan finished"
        );
        self.bus.emit(
            event_type,
            report.summary(),
            json!({
                "outcome": outcome,
                "counts": list.counts,
                "progress": list.progress(),
                "halt_reason": report.halt_reason,
            }),
        );
        Ok(report)
    }

    /// Best-effort snapshot; failures never abort the run.
    fn persist(&self, agent: &AgentState, list: &TodoList) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.snapshot(agent, list) {
            warn!(error = %e, path = %store.snapshot_path().display(), "snapshot write failed");
            self.bus.emit(
                EventType::PersistenceFailed,
                format!("snapshot write failed: {e}"),
                json!({ "error": e.to_string() }),
            );
        }
    }
}

/// Run one attempt bounded by `limit`. Never panics the caller: an executor
/// panic is reported as a retryable failure.
async fn run_attempt(
    executor: Arc<dyn Executor>,
    todo: Todo,
    limit: Duration,
    token: CancellationToken,
) -> AttemptOutcome {
    let started = Instant::now();
    let exec_token = token.clone();
    let mut handle = tokio::spawn(async move { executor.execute(&todo, exec_token).await });

    tokio::select! {
        joined = &mut handle => match joined {
            Ok(Ok(mut result)) if result.success => {
                if result.duration_ms == 0 {
                    result.duration_ms = started.elapsed().as_millis() as u64;
                }
                AttemptOutcome::Succeeded(result)
            }
            Ok(Ok(result)) => AttemptOutcome::Failed {
                error: result
                    .error
                    .unwrap_or_else(|| "executor reported failure".to_string()),
                retryable: true,
            },
            Ok(Err(ExecutorError::Cancelled)) => AttemptOutcome::Cancelled,
            Ok(Err(e)) => AttemptOutcome::Failed {
                retryable: e.is_retryable(),
                error: e.to_string(),
            },
            Err(e) => AttemptOutcome::Failed {
                error: format!("executor task failed: {e}"),
                retryable: true,
            },
        },
        _ = tokio::time::sleep(limit) => {
            token.cancel();
            wind_down(handle).await;
            AttemptOutcome::TimedOut(limit)
        }
        _ = token.cancelled() => {
            wind_down(handle).await;
            AttemptOutcome::Cancelled
        }
    }
}

/// Give a cancelled executor a moment to stop on its own, then abort it.
async fn wind_down<T>(mut handle: tokio::task::JoinHandle<T>) {
    if tokio::time::timeout(CANCEL_GRACE, &mut handle).await.is_err() {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::types::TodoKind;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(backoff_delay(1, base, max), Duration::from_millis(100));
        assert_eq!(backoff_delay(2, base, max), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, max), Duration::from_millis(400));
        assert_eq!(backoff_delay(5, base, max), max);
        assert_eq!(backoff_delay(64, base, max), max);
    }

    #[test]
    fn cyclic_pending_items_are_a_deadlock() {
        let list = TodoList::new(
            "cycle",
            vec![
                Todo::new("a", TodoKind::CodeChange)
                    .with_id("a")
                    .with_dependencies(["b"]),
                Todo::new("b", TodoKind::CodeChange)
                    .with_id("b")
                    .with_dependencies(["a"]),
            ],
        );
        match classify_stall(&list) {
            Stall::Deadlock(blocked) => {
                let ids: Vec<&str> = blocked.iter().map(|b| b.todo_id.as_str()).collect();
                assert_eq!(ids, vec!["a", "b"]);
                assert_eq!(blocked[0].unmet[0].todo_id, "b");
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[test]
    fn failed_dependency_dooms_transitively() {
        let mut list = TodoList::new(
            "doomed",
            vec![
                Todo::new("a", TodoKind::CodeChange).with_id("a"),
                Todo::new("b", TodoKind::CodeChange)
                    .with_id("b")
                    .with_dependencies(["a"]),
                Todo::new("c", TodoKind::Test)
                    .with_id("c")
                    .with_dependencies(["b"]),
            ],
        );
        list.start("a").unwrap();
        list.fail("a", "boom").unwrap();
        assert_eq!(
            classify_stall(&list),
            Stall::Doomed(vec!["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn halt_reason_names_failed_item() {
        let halt = Halt::StopOnFailure {
            todo_id: "t1".into(),
            error: "exit 1".into(),
        };
        assert_eq!(halt.reason(), "stop on failure: t1 failed: exit 1");
        assert_eq!(Halt::Cancelled.reason(), "cancelled by caller");
    }
}
