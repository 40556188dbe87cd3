use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::{info, warn};

use ap_agents::executor::ExecutorRegistry;
use ap_agents::llm_executor::LlmExecutor;
use ap_agents::scheduler::PlanOutcome;
use ap_agents::task_orchestrator::{PipelineResult, TaskOrchestrator};
use ap_agents::validation::CommandValidator;
use ap_bridge::event_bus::EventBus;
use ap_core::config::{Config, OrchestrationConfig};
use ap_core::workspace::FsWorkspaceProvider;
use ap_intelligence::{AnthropicProvider, Decomposer, LlmConfig, LlmProvider};
use ap_telemetry::event_log::spawn_event_logger;

/// Command-line overrides for the `[orchestration]` config section.
#[derive(Args, Debug, Clone, Default)]
pub struct RunOverrides {
    /// Run one todo at a time.
    #[arg(long)]
    pub sequential: bool,

    /// Maximum todos in flight at once.
    #[arg(long, value_name = "N")]
    pub max_concurrent: Option<usize>,

    /// Per-todo timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Retries per todo after the first attempt.
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Keep going after a todo fails for good.
    #[arg(long)]
    pub no_stop_on_failure: bool,

    /// Skip the build/test/lint checks after the plan completes.
    #[arg(long)]
    pub no_validate: bool,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut OrchestrationConfig) {
        if self.sequential {
            config.parallel_execution = false;
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent = n;
        }
        if let Some(secs) = self.timeout {
            config.step_timeout_secs = secs;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if self.no_stop_on_failure {
            config.stop_on_failure = false;
        }
    }
}

pub struct RunOptions {
    pub intent: String,
    pub overrides: RunOverrides,
    pub json: bool,
    pub resume: bool,
}

/// Run the `run` and `resume` subcommands.
pub async fn run(
    mut config: Config,
    workspace: &Path,
    opts: RunOptions,
) -> anyhow::Result<ExitCode> {
    opts.overrides.apply(&mut config.orchestration);
    config
        .orchestration
        .validate()
        .context("invalid orchestration settings")?;

    let root = workspace
        .canonicalize()
        .with_context(|| format!("workspace {} not found", workspace.display()))?;

    let bus = EventBus::new();
    let event_log = spawn_event_logger(&bus);
    let orchestrator = build_orchestrator(&config, &root, &bus, opts.overrides.no_validate)?;

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, halting and cancelling remaining todos");
            cancel.cancel();
        }
    });

    info!(workspace = %root.display(), resume = opts.resume, "starting");
    let result = if opts.resume {
        orchestrator.resume(&opts.intent).await
    } else {
        orchestrator.run(&opts.intent).await
    };
    event_log.shutdown();
    let result = result.context(if opts.resume { "resume failed" } else { "run failed" })?;

    print_result(&result, opts.json)?;
    Ok(ExitCode::from(exit_status(result.report.outcome)))
}

fn build_orchestrator(
    config: &Config,
    root: &Path,
    bus: &EventBus,
    no_validate: bool,
) -> anyhow::Result<TaskOrchestrator> {
    let llm: Arc<dyn LlmProvider> = Arc::new(
        AnthropicProvider::from_settings(&config.llm).context("failed to set up the LLM client")?,
    );
    let llm_config = LlmConfig::from(&config.llm);

    let decomposer = Decomposer::new(Arc::clone(&llm), llm_config.clone());
    let executors = ExecutorRegistry::new().with(Arc::new(LlmExecutor::new(llm, llm_config)));
    let workspace = Arc::new(FsWorkspaceProvider::new(root));

    let mut orchestrator = TaskOrchestrator::new(
        decomposer,
        workspace,
        executors,
        bus.clone(),
        config.orchestration.clone(),
    )
    .with_state_store(super::state_store(config, root), config.state.archive);

    let validator = CommandValidator::from_config(&config.validation, root);
    if !no_validate && !validator.is_empty() {
        orchestrator = orchestrator.with_validator(Arc::new(validator));
    }
    Ok(orchestrator)
}

fn print_result(result: &PipelineResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!(
        "{} ({} strategy, plan {})",
        result.plan.todo_list.user_intent, result.plan.strategy, result.plan.id
    );
    println!("{}", result.report.summary());
    Ok(())
}

fn exit_status(outcome: PlanOutcome) -> u8 {
    match outcome {
        PlanOutcome::Succeeded => 0,
        PlanOutcome::Failed => 1,
        PlanOutcome::Halted => 130,
    }
}
