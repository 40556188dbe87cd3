//! TaskOrchestrator -- wires intent analysis, decomposition, and the
//! scheduler into one run, and resumes an interrupted run from its snapshot.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ap_bridge::event_bus::EventBus;
use ap_bridge::protocol::EventType;
use ap_core::config::OrchestrationConfig;
use ap_core::dependency::{self, DependencyError};
use ap_core::state_store::{StateStore, StateStoreError};
use ap_core::types::{AgentState, AgentStatus, AgentTransitionError, ExecutionPlan};
use ap_core::workspace::{WorkspaceContext, WorkspaceError, WorkspaceProvider};
use ap_intelligence::{determine_strategy, DecomposeError, Decomposer, IntentAnalyzer};

use crate::executor::ExecutorRegistry;
use crate::scheduler::{PlanOutcome, PlanReport, Scheduler, SchedulerError};
use crate::validation::Validator;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("decomposition failed: {0}")]
    Decompose(#[from] DecomposeError),
    #[error("invalid plan: {0}")]
    Dependency(#[from] DependencyError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),
    #[error(transparent)]
    Agent(#[from] AgentTransitionError),
    #[error("no state store configured")]
    NoStateStore,
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Everything a finished (or halted) run produced.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub plan: ExecutionPlan,
    pub report: PlanReport,
    pub agent_state: AgentState,
    pub total_duration_ms: u64,
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

pub struct TaskOrchestrator {
    decomposer: Decomposer,
    analyzer: IntentAnalyzer,
    workspace: Arc<dyn WorkspaceProvider>,
    executors: Arc<ExecutorRegistry>,
    event_bus: EventBus,
    config: OrchestrationConfig,
    store: Option<StateStore>,
    archive: bool,
    validator: Option<Arc<dyn Validator>>,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(
        decomposer: Decomposer,
        workspace: Arc<dyn WorkspaceProvider>,
        executors: ExecutorRegistry,
        event_bus: EventBus,
        config: OrchestrationConfig,
    ) -> Self {
        Self {
            decomposer: decomposer.with_event_bus(event_bus.clone()),
            analyzer: IntentAnalyzer::new(),
            workspace,
            executors: Arc::new(executors),
            event_bus,
            config,
            store: None,
            archive: true,
            validator: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist snapshots in `store`. On success the snapshot is archived when
    /// `archive` is set, deleted otherwise.
    pub fn with_state_store(mut self, store: StateStore, archive: bool) -> Self {
        self.store = Some(store);
        self.archive = archive;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Use `token` as the run's cancellation handle.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that halts the current run when cancelled.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Analyze, decompose, and execute `intent` from scratch.
    pub async fn run(&self, intent: &str) -> Result<PipelineResult> {
        let started = Instant::now();
        let mut agent = AgentState::new();
        info!(agent_id = %agent.id, "intent received");
        self.event_bus.emit(
            EventType::IntentReceived,
            intent.trim(),
            json!({ "intent": intent.trim() }),
        );

        let plan = match self.plan(intent, &mut agent).await {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_before_execution(&mut agent, &e);
                return Err(e);
            }
        };

        agent.set_plan(&plan);
        info!(
            plan_id = %plan.id,
            strategy = %plan.strategy,
            todos = plan.todo_list.total_todos,
            "plan created"
        );
        self.event_bus.emit(
            EventType::PlanCreated,
            format!("{} todos planned", plan.todo_list.total_todos),
            json!({
                "plan_id": plan.id,
                "list_id": plan.todo_list.id,
                "strategy": plan.strategy,
                "todos": plan.todo_list.todos.iter().map(|t| json!({
                    "id": t.id,
                    "description": t.description,
                    "type": t.kind,
                    "priority": t.priority,
                    "dependencies": t.dependencies,
                })).collect::<Vec<_>>(),
            }),
        );

        self.execute(plan, agent, started).await
    }

    /// Continue the run stored in the state store. Fails with
    /// [`StateStoreError::Incompatible`] if the snapshot was made for a
    /// different intent.
    pub async fn resume(&self, intent: &str) -> Result<PipelineResult> {
        let started = Instant::now();
        let store = self.store.as_ref().ok_or(PipelineError::NoStateStore)?;
        let snapshot = store.resume(intent, None)?;
        let mut agent = snapshot.agent_state;
        let list = snapshot.todo_list;

        match agent.status {
            AgentStatus::Idle | AgentStatus::Executing | AgentStatus::Paused => {}
            AgentStatus::Completed | AgentStatus::Failed => agent.transition(AgentStatus::Idle)?,
            // Interrupted before or after the dispatch loop.
            AgentStatus::Analyzing | AgentStatus::Planning | AgentStatus::Validating => {
                agent.transition(AgentStatus::Failed)?;
                agent.transition(AgentStatus::Idle)?;
            }
        }

        let analysis = match agent.analysis.clone() {
            Some(analysis) => analysis,
            None => self.analyzer.analyze(intent, &WorkspaceContext::default()),
        };
        let strategy = agent
            .strategy
            .unwrap_or_else(|| determine_strategy(&analysis));
        let mut plan = ExecutionPlan::new(strategy, analysis, list);
        if let Some(plan_id) = agent.plan_id.clone() {
            plan.id = plan_id;
        }

        info!(
            plan_id = %plan.id,
            remaining = plan.remaining(),
            "resuming plan"
        );
        self.event_bus.emit(
            EventType::WorkflowResumed,
            format!(
                "resuming with {} of {} todos remaining",
                plan.remaining(),
                plan.todo_list.total_todos
            ),
            json!({
                "plan_id": plan.id,
                "list_id": plan.todo_list.id,
                "counts": plan.todo_list.counts,
            }),
        );

        self.execute(plan, agent, started).await
    }

    async fn plan(&self, intent: &str, agent: &mut AgentState) -> Result<ExecutionPlan> {
        agent.transition(AgentStatus::Analyzing)?;
        self.event_bus
            .emit(EventType::AnalysisStarted, "analyzing intent", json!({}));

        let ctx = self.workspace.context(intent).await?;
        let analysis = self.analyzer.analyze(intent, &ctx);
        self.event_bus.emit(
            EventType::AnalysisComplete,
            format!("intent classified as {:?}", analysis.intent_type),
            json!({
                "type": analysis.intent_type,
                "complexity": analysis.complexity,
                "confidence": analysis.confidence,
                "project_type": ctx.project_type,
            }),
        );

        agent.transition(AgentStatus::Planning)?;
        let list = self.decomposer.decompose(intent, &ctx).await?;
        dependency::validate(&list)?;
        let strategy = determine_strategy(&analysis);
        Ok(ExecutionPlan::new(strategy, analysis, list))
    }

    fn fail_before_execution(&self, agent: &mut AgentState, error: &PipelineError) {
        warn!(error = %error, "run failed before execution");
        if let Err(e) = agent.transition(AgentStatus::Failed) {
            warn!(error = %e, "could not mark agent failed");
        }
        self.event_bus.emit(
            EventType::WorkflowFailed,
            error.to_string(),
            json!({ "error": error.to_string(), "stage": "planning" }),
        );
    }

    async fn execute(
        &self,
        mut plan: ExecutionPlan,
        mut agent: AgentState,
        started: Instant,
    ) -> Result<PipelineResult> {
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.executors),
            self.config.clone(),
            self.event_bus.clone(),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(store) = &self.store {
            scheduler = scheduler.with_state_store(store.clone());
        }
        if let Some(validator) = &self.validator {
            scheduler = scheduler.with_validator(Arc::clone(validator));
        }

        let report = scheduler.run(&mut plan.todo_list, &mut agent).await?;

        if report.outcome == PlanOutcome::Succeeded {
            if let Some(store) = &self.store {
                let cleanup = if self.archive {
                    store.archive().map(|_| ())
                } else {
                    store.discard().map(|_| ())
                };
                if let Err(e) = cleanup {
                    warn!(error = %e, "could not clean up snapshot after success");
                }
            }
        }

        Ok(PipelineResult {
            plan,
            report,
            agent_state: agent,
            total_duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
