// src/lib.rs

// Import the top-level `swarmsdk` module.
pub mod swarmsdk;

// Re-export the component modules at the crate root so callers write
// `swarmsdk::llm_client::...` instead of `swarmsdk::swarmsdk::llm_client::...`.
pub use swarmsdk::{
    agent_chat, concurrency, config, context_manager, definition, delegation, hooks, llm_client,
    log_stream, serialization, skill, swarm, tool,
};

// Re-exporting key items for easier external access.
pub use swarmsdk::agent_chat::{AgentChat, ChatError, Finish};
pub use swarmsdk::config::SwarmDefaults;
pub use swarmsdk::definition::{AgentDefinition, ConfigError, RetryPolicy};
pub use swarmsdk::llm_client::{LlmClient, LlmError, Message, Role, TokenUsage, ToolCall};
pub use swarmsdk::log_stream::{AgentContext, EventKind, EventSink, LogStream, SwarmEvent};
pub use swarmsdk::swarm::{ExecutionResult, Swarm, SwarmBuilder};
pub use swarmsdk::tool::{Tool, ToolOutcome, ToolRegistry, ToolResult};
