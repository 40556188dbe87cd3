//! Integration tests for the scheduler dispatch loop, driven by scripted
//! executors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ap_agents::executor::{Executor, ExecutorError, ExecutorRegistry, Result as ExecResult};
use ap_agents::scheduler::{PlanOutcome, Scheduler, SchedulerError};
use ap_agents::validation::{CheckResult, ValidationReport, Validator};
use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::{EventType, WorkflowEvent};
use ap_core::config::OrchestrationConfig;
use ap_core::dependency::DependencyError;
use ap_core::state_store::StateStore;
use ap_core::types::{AgentState, AgentStatus, ExecutionResult, Todo, TodoKind, TodoList, TodoStatus};

// ---------------------------------------------------------------------------
// Scripted executor
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Script {
    Succeed,
    /// Retryable failure for the first `n` attempts, then success.
    Flaky(u32),
    AlwaysFail,
    Fatal,
    /// Wait for cancellation.
    Hang,
    /// Cancel the whole run, then wait for cancellation.
    CancelRun,
}

struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    kinds: Vec<TodoKind>,
    delay: Duration,
    run_token: CancellationToken,
    calls: Mutex<Vec<String>>,
    seen_tokens: Mutex<Vec<CancellationToken>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(scripts: &[(&str, Script)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(id, s)| (id.to_string(), *s))
                .collect(),
            kinds: TodoKind::ALL.to_vec(),
            delay: Duration::ZERO,
            run_token: CancellationToken::new(),
            calls: Mutex::new(Vec::new()),
            seen_tokens: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_kinds(mut self, kinds: &[TodoKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    fn with_run_token(mut self, token: CancellationToken) -> Self {
        self.run_token = token;
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn perform(&self, todo: &Todo, cancel: CancellationToken) -> ExecResult<ExecutionResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let script = self
            .scripts
            .get(&todo.id)
            .copied()
            .unwrap_or(Script::Succeed);
        match script {
            Script::Succeed => Ok(ExecutionResult::success(format!("done {}", todo.id))),
            Script::Flaky(n) if todo.attempt <= n => Err(ExecutorError::Failed("flaky".into())),
            Script::Flaky(_) => Ok(ExecutionResult::success("recovered")),
            Script::AlwaysFail => Err(ExecutorError::Failed("boom".into())),
            Script::Fatal => Err(ExecutorError::Fatal("unrecoverable".into())),
            Script::Hang | Script::CancelRun => {
                self.seen_tokens.lock().unwrap().push(cancel.clone());
                if matches!(script, Script::CancelRun) {
                    self.run_token.cancel();
                }
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        Ok(ExecutionResult::success("woke up"))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn can_execute(&self, kind: TodoKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn execute(&self, todo: &Todo, cancel: CancellationToken) -> ExecResult<ExecutionResult> {
        self.calls.lock().unwrap().push(todo.id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.perform(todo, cancel).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct FixedValidator {
    passed: bool,
    calls: AtomicUsize,
}

impl FixedValidator {
    fn new(passed: bool) -> Arc<Self> {
        Arc::new(Self {
            passed,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Validator for FixedValidator {
    async fn validate(&self, _cancel: CancellationToken) -> ValidationReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ValidationReport {
            passed: self.passed,
            checks: vec![CheckResult {
                name: "test".into(),
                command: "cargo test".into(),
                passed: self.passed,
                exit_code: Some(if self.passed { 0 } else { 101 }),
                output: String::new(),
                duration_ms: 1,
            }],
            cancelled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> OrchestrationConfig {
    OrchestrationConfig {
        max_concurrent: 4,
        step_timeout_secs: 5,
        max_retries: 0,
        stop_on_failure: false,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Default::default()
    }
}

fn sequential() -> OrchestrationConfig {
    OrchestrationConfig {
        parallel_execution: false,
        ..config()
    }
}

fn todo(id: &str, priority: i32, deps: &[&str]) -> Todo {
    Todo::new(format!("task {id}"), TodoKind::CodeChange)
        .with_id(id)
        .with_priority(priority)
        .with_dependencies(deps.iter().copied())
}

fn scheduler(
    exec: &Arc<ScriptedExecutor>,
    config: OrchestrationConfig,
    bus: &EventBus,
) -> Scheduler {
    let registry = ExecutorRegistry::new().with(Arc::clone(exec) as Arc<dyn Executor>);
    Scheduler::new(Arc::new(registry), config, bus.clone())
}

fn drain(rx: &flume::Receiver<Arc<WorkflowEvent>>) -> Vec<Arc<WorkflowEvent>> {
    rx.try_iter().collect()
}

fn position(events: &[Arc<WorkflowEvent>], kind: EventType, id: &str) -> Option<usize> {
    events
        .iter()
        .position(|e| e.event_type == kind && e.todo_id() == Some(id))
}

fn statuses(list: &TodoList) -> Vec<(String, TodoStatus)> {
    list.todos.iter().map(|t| (t.id.clone(), t.status)).collect()
}

// ---------------------------------------------------------------------------
// Ordering & determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependencies_complete_before_dependents_start() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let exec = Arc::new(ScriptedExecutor::new(&[]).with_delay(Duration::from_millis(5)));
    let mut list = TodoList::new(
        "build feature",
        vec![
            todo("a", 50, &[]),
            todo("b", 50, &["a"]),
            todo("c", 50, &["a", "b"]),
            todo("d", 50, &[]),
        ],
    );
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert_eq!(report.counts.completed, 4);
    assert_eq!(agent.status, AgentStatus::Completed);
    assert!((agent.progress - 1.0).abs() < f64::EPSILON);

    let events = drain(&rx);
    for t in &list.todos {
        let started = position(&events, EventType::TodoStarted, &t.id).unwrap();
        for dep in &t.dependencies {
            let done = position(&events, EventType::TodoCompleted, dep).unwrap();
            assert!(done < started, "{} started before {dep} completed", t.id);
        }
    }
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowComplete);
}

#[tokio::test]
async fn replaying_a_plan_gives_identical_results() {
    let template = TodoList::new(
        "replay",
        vec![
            todo("a", 50, &[]),
            todo("b", 60, &["a"]),
            todo("c", 70, &[]),
            todo("d", 40, &["c"]),
            todo("e", 40, &["b", "d"]),
        ],
    );

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let bus = EventBus::new();
        let exec = Arc::new(ScriptedExecutor::new(&[("c", Script::AlwaysFail)]));
        let mut list = template.clone();
        let mut agent = AgentState::new();
        let report = scheduler(&exec, config(), &bus)
            .run(&mut list, &mut agent)
            .await
            .unwrap();
        outcomes.push((report.outcome, statuses(&list)));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].0, PlanOutcome::Failed);
}

#[tokio::test]
async fn ready_item_runs_before_higher_priority_dependent() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new("priority", vec![todo("a", 80, &[]), todo("b", 90, &["a"])]);
    let mut agent = AgentState::new();

    scheduler(&exec, sequential(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(exec.calls(), vec!["a", "b"]);
}

#[tokio::test]
async fn sequential_mode_follows_dispatch_order() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new(
        "ordering",
        vec![
            todo("low", 20, &[]),
            todo("high", 90, &[]),
            todo("after-low", 100, &["low"]),
        ],
    );
    let mut agent = AgentState::new();

    scheduler(&exec, sequential(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(exec.calls(), vec!["high", "low", "after-low"]);
    assert_eq!(exec.peak(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrency_never_exceeds_the_bound() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]).with_delay(Duration::from_millis(40)));
    let todos = (0..6).map(|i| todo(&format!("t{i}"), 50, &[])).collect();
    let mut list = TodoList::new("fan out", todos);
    let mut agent = AgentState::new();
    let config = OrchestrationConfig {
        max_concurrent: 2,
        ..config()
    };

    let report = scheduler(&exec, config, &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert_eq!(exec.peak(), 2);
}

// ---------------------------------------------------------------------------
// Retry, timeout, failure policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn retries_are_exhausted_then_item_fails() {
    let bus = EventBus::new();
    let retrying = bus.subscribe_to(&[EventType::TodoRetrying]);
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::AlwaysFail)]));
    let mut list = TodoList::new("retry", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();
    let config = OrchestrationConfig {
        max_retries: 2,
        ..config()
    };

    let report = scheduler(&exec, config, &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    let a = list.get("a").unwrap();
    assert_eq!(exec.calls().len(), 3);
    assert_eq!(a.status, TodoStatus::Failed);
    assert_eq!(a.attempt, 3);
    assert_eq!(a.last_error.as_deref(), Some("execution failed: boom"));
    assert_eq!(drain(&retrying).len(), 2);
    assert_eq!(report.outcome, PlanOutcome::Failed);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(agent.status, AgentStatus::Failed);
}

#[tokio::test]
async fn flaky_item_recovers_within_budget() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::Flaky(1))]));
    let mut list = TodoList::new("flaky", vec![todo("a", 50, &[]).with_max_retries(1)]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    let a = list.get("a").unwrap();
    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert_eq!(a.attempt, 2);
    assert_eq!(a.output.as_deref(), Some("recovered"));
    assert!(a.last_error.is_none());
}

#[tokio::test]
async fn fatal_errors_are_not_retried() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::Fatal)]));
    let mut list = TodoList::new("fatal", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();
    let config = OrchestrationConfig {
        max_retries: 3,
        ..config()
    };

    scheduler(&exec, config, &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(exec.calls().len(), 1);
    assert_eq!(list.status_of("a"), Some(TodoStatus::Failed));
}

#[tokio::test]
async fn timed_out_attempt_fails_and_is_cancelled() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("slow", Script::Hang)]));
    let mut list = TodoList::new(
        "timeout",
        vec![todo("slow", 50, &[]).with_timeout_secs(1)],
    );
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    let slow = list.get("slow").unwrap();
    assert_eq!(slow.status, TodoStatus::Failed);
    assert_eq!(slow.last_error.as_deref(), Some("timed out after 1s"));
    assert_eq!(report.outcome, PlanOutcome::Failed);
    let tokens = exec.seen_tokens.lock().unwrap();
    assert!(tokens[0].is_cancelled());
}

#[tokio::test]
async fn stop_on_failure_cancels_remaining_items() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::Fatal)]));
    let mut list = TodoList::new(
        "halt",
        vec![todo("a", 90, &[]), todo("b", 50, &[]), todo("c", 50, &["b"])],
    );
    let mut agent = AgentState::new();
    let config = OrchestrationConfig {
        stop_on_failure: true,
        ..sequential()
    };

    let report = scheduler(&exec, config, &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(exec.calls(), vec!["a"]);
    assert_eq!(list.status_of("a"), Some(TodoStatus::Failed));
    assert_eq!(list.status_of("b"), Some(TodoStatus::Cancelled));
    assert_eq!(list.status_of("c"), Some(TodoStatus::Cancelled));
    assert_eq!(report.outcome, PlanOutcome::Failed);
    assert_eq!(report.cancelled, vec!["b", "c"]);
    assert!(report.halt_reason.unwrap().contains("a failed"));
}

#[tokio::test]
async fn failed_dependency_cancels_dependents_without_deadlock() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::Fatal)]));
    let mut list = TodoList::new(
        "doomed",
        vec![
            todo("a", 50, &[]),
            todo("b", 50, &["a"]),
            todo("c", 50, &["b"]),
            todo("d", 50, &[]),
        ],
    );
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(list.status_of("a"), Some(TodoStatus::Failed));
    assert_eq!(list.status_of("b"), Some(TodoStatus::Cancelled));
    assert_eq!(list.status_of("c"), Some(TodoStatus::Cancelled));
    assert_eq!(list.status_of("d"), Some(TodoStatus::Completed));
    assert_eq!(report.cancelled, vec!["b", "c"]);
    assert_eq!(report.outcome, PlanOutcome::Failed);
    assert!(list.is_finished());
}

#[tokio::test]
async fn kind_without_executor_fails_item() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]).with_kinds(&[TodoKind::CodeChange]));
    let mut list = TodoList::new(
        "unsupported",
        vec![Todo::new("write docs", TodoKind::Documentation).with_id("docs")],
    );
    let mut agent = AgentState::new();
    let config = OrchestrationConfig {
        max_retries: 3,
        ..config()
    };

    scheduler(&exec, config, &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    let docs = list.get("docs").unwrap();
    assert_eq!(docs.status, TodoStatus::Failed);
    assert!(docs
        .last_error
        .as_deref()
        .unwrap()
        .contains("no executor registered"));
    assert!(exec.calls().is_empty());
}

#[tokio::test]
async fn cyclic_plan_is_rejected_before_dispatch() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new("cycle", vec![todo("a", 50, &["b"]), todo("b", 50, &["a"])]);
    let mut agent = AgentState::new();

    let err = scheduler(&exec, config(), &bus)
        .run(&mut list, &mut agent)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::Dependency(DependencyError::Cycle(_))
    ));
    assert!(exec.calls().is_empty());
    assert_eq!(agent.status, AgentStatus::Idle);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn external_cancel_cancels_in_flight_and_pending_items() {
    let bus = EventBus::new();
    let rx = bus.subscribe();
    let token = CancellationToken::new();
    let exec = Arc::new(
        ScriptedExecutor::new(&[("a", Script::CancelRun)]).with_run_token(token.clone()),
    );
    let mut list = TodoList::new(
        "halt",
        vec![todo("a", 90, &[]), todo("b", 50, &["a"]), todo("c", 40, &[])],
    );
    let mut agent = AgentState::new();

    let report = scheduler(&exec, sequential(), &bus)
        .with_cancellation(token)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Halted);
    assert_eq!(report.halt_reason.as_deref(), Some("cancelled by caller"));
    assert_eq!(agent.status, AgentStatus::Paused);
    assert_eq!(exec.calls(), vec!["a"]);
    for id in ["a", "b", "c"] {
        assert_eq!(list.status_of(id), Some(TodoStatus::Cancelled), "{id}");
    }
    assert_eq!(list.get("a").unwrap().attempt, 1);
    assert_eq!(list.counts.cancelled, 3);
    assert_eq!(report.cancelled.len(), 3);

    let events = drain(&rx);
    for id in ["a", "b", "c"] {
        assert!(position(&events, EventType::TodoCancelled, id).is_some(), "{id}");
    }
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowHalted);
}

// ---------------------------------------------------------------------------
// Validation gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_validation_fails_the_plan() {
    let bus = EventBus::new();
    let rx = bus.subscribe_to(&[EventType::ValidationStarted, EventType::ValidationFailed]);
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let validator = FixedValidator::new(false);
    let mut list = TodoList::new("validate", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .with_validator(validator.clone())
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert!(list.all_completed());
    assert_eq!(report.outcome, PlanOutcome::Failed);
    assert!(!report.validation.unwrap().passed);
    let kinds: Vec<EventType> = drain(&rx).iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![EventType::ValidationStarted, EventType::ValidationFailed]
    );
    assert_eq!(agent.status, AgentStatus::Failed);
}

#[tokio::test]
async fn validation_is_skipped_when_items_failed() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[("a", Script::Fatal)]));
    let validator = FixedValidator::new(true);
    let mut list = TodoList::new("skip", vec![todo("a", 50, &[]), todo("b", 50, &[])]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .with_validator(validator.clone())
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Failed);
    assert!(report.validation.is_none());
    assert_eq!(validator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn passing_validation_succeeds() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let validator = FixedValidator::new(true);
    let mut list = TodoList::new("ok", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .with_validator(validator.clone())
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert_eq!(validator.calls.load(Ordering::SeqCst), 1);
}

struct InterruptedValidator;

#[async_trait]
impl Validator for InterruptedValidator {
    async fn validate(&self, _cancel: CancellationToken) -> ValidationReport {
        ValidationReport {
            passed: false,
            checks: Vec::new(),
            cancelled: true,
        }
    }
}

#[tokio::test]
async fn interrupted_validation_halts_and_pauses() {
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new("validate", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .with_validator(Arc::new(InterruptedValidator))
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Halted);
    assert_eq!(agent.status, AgentStatus::Paused);
    assert_eq!(list.status_of("a"), Some(TodoStatus::Completed));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn snapshot_tracks_final_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().join("state"));
    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new("persist", vec![todo("a", 50, &[]), todo("b", 50, &["a"])]);
    let mut agent = AgentState::new();

    scheduler(&exec, config(), &bus)
        .with_state_store(store.clone())
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.todo_list.counts.completed, 2);
    assert_eq!(snapshot.agent_state.status, AgentStatus::Completed);
}

#[tokio::test]
async fn snapshot_failures_do_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let store = StateStore::new(blocker.join("state"));

    let bus = EventBus::new();
    let failures = bus.subscribe_to(&[EventType::PersistenceFailed]);
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let mut list = TodoList::new("unwritable", vec![todo("a", 50, &[])]);
    let mut agent = AgentState::new();

    let report = scheduler(&exec, config(), &bus)
        .with_state_store(store)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert!(!drain(&failures).is_empty());
}

#[tokio::test]
async fn resumed_list_reruns_interrupted_item() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path());
    let mut list = TodoList::new("crash", vec![todo("a", 50, &[]), todo("b", 50, &["a"])]);
    let mut agent = AgentState::new();
    agent.transition(AgentStatus::Executing).unwrap();
    list.start("a").unwrap();
    store.snapshot(&agent, &list).unwrap();

    let snapshot = store.resume("crash", None).unwrap();
    let mut list = snapshot.todo_list;
    let mut agent = snapshot.agent_state;
    assert_eq!(list.status_of("a"), Some(TodoStatus::Pending));

    let bus = EventBus::new();
    let exec = Arc::new(ScriptedExecutor::new(&[]));
    let report = scheduler(&exec, config(), &bus)
        .with_state_store(store)
        .run(&mut list, &mut agent)
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Succeeded);
    assert_eq!(list.get("a").unwrap().attempt, 2);
    assert_eq!(exec.calls(), vec!["a", "b"]);
}
