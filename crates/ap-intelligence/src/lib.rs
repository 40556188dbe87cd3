pub mod decomposer;
pub mod intent;
pub mod llm;

// Re-export canonical LLM types for convenience.
pub use decomposer::{DecomposeError, Decomposer};
pub use intent::{determine_strategy, IntentAnalyzer};
pub use llm::{
    AnthropicProvider, LlmConfig, LlmError, LlmMessage, LlmProvider, LlmResponse, LlmRole,
    MockProvider as LlmMockProvider,
};
