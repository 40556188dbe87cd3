pub mod executor;
pub mod llm_executor;
pub mod scheduler;
pub mod task_orchestrator;
pub mod validation;
