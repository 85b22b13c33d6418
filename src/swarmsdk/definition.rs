//! Validated agent configuration.
//!
//! An [`AgentDefinition`] is the immutable input from which the runtime
//! creates an agent chat: identity, system prompt, LLM client, declared
//! tools, delegation targets, and per-agent policies (streaming, turn
//! timeout, retry).  Definitions are assembled with a consuming builder
//! chain and validated when the swarm is built.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmsdk::definition::AgentDefinition;
//! # use swarmsdk::llm_client::{LlmClient, Message, ToolDefinition, ChunkSender, LlmError};
//! # use async_trait::async_trait;
//! # struct MyClient;
//! # #[async_trait]
//! # impl LlmClient for MyClient {
//! #     async fn complete(&self, _m: &[Message], _t: &[ToolDefinition], _c: Option<ChunkSender>)
//! #         -> Result<Message, LlmError> { Ok(Message::assistant("")) }
//! #     fn model_name(&self) -> &str { "mock" }
//! # }
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let lead = AgentDefinition::new("lead", Arc::new(MyClient))
//!     .with_system_prompt("You coordinate the team.")
//!     .with_delegates_to(vec!["researcher"])
//!     .with_turn_timeout(Duration::from_secs(300))
//!     .with_streaming(true);
//! ```

use crate::swarmsdk::llm_client::LlmClient;
use crate::swarmsdk::tool::Tool;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Retry behaviour for retryable LLM failures (429/5xx/network).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum retry attempts before giving up.
    pub max_attempts: usize,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(15),
        }
    }
}

/// Configuration errors raised while building definitions or swarms.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Agent name is empty or contains characters outside
    /// `[A-Za-z0-9_-]` (must start with a letter).
    InvalidAgentName(String),
    /// Two agents share a name.
    DuplicateAgent(String),
    /// Two tools on one agent share a name.
    DuplicateTool { agent: String, tool: String },
    /// A tool declares an empty or malformed name.
    InvalidTool { agent: String, tool: String },
    /// A `delegates_to` target is neither an agent nor a registered
    /// sub-swarm.
    UnknownDelegationTarget { agent: String, target: String },
    /// The configured lead agent does not exist.
    UnknownLead(String),
    /// The swarm has no agents.
    EmptySwarm,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidAgentName(name) => write!(f, "invalid agent name: {:?}", name),
            ConfigError::DuplicateAgent(name) => write!(f, "duplicate agent name: {}", name),
            ConfigError::DuplicateTool { agent, tool } => {
                write!(f, "agent '{}' declares tool '{}' twice", agent, tool)
            }
            ConfigError::InvalidTool { agent, tool } => {
                write!(f, "agent '{}' declares invalid tool name {:?}", agent, tool)
            }
            ConfigError::UnknownDelegationTarget { agent, target } => write!(
                f,
                "agent '{}' delegates to unknown target '{}' (not an agent or sub-swarm)",
                agent, target
            ),
            ConfigError::UnknownLead(name) => write!(f, "lead agent '{}' is not defined", name),
            ConfigError::EmptySwarm => write!(f, "swarm has no agents"),
        }
    }
}

impl Error for ConfigError {}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Immutable configuration for one agent.
pub struct AgentDefinition {
    /// Agent name, unique within the swarm.
    pub name: String,
    /// Free-form description used in delegation tool descriptions.
    pub description: Option<String>,
    /// System prompt prepended to every LLM request.
    pub system_prompt: Option<String>,
    /// Working directory the agent's tools operate in.
    pub directory: Option<PathBuf>,
    /// Delegation targets (agents or sub-swarms) this agent may call.
    pub delegates_to: Vec<String>,
    /// Whether LLM responses stream chunk events.
    pub streaming: bool,
    /// Wall-clock limit for one `ask` turn.
    pub turn_timeout: Option<Duration>,
    /// Retry policy for retryable LLM failures.
    pub retry: RetryPolicy,
    /// When this agent is a delegation target: whether its conversation is
    /// kept between delegated calls.
    pub keep_context: bool,
    /// Context window override; falls back to the client's value.
    pub context_window: Option<usize>,
    /// Overrides for generated delegation tool names, keyed by target.
    pub delegation_tool_overrides: HashMap<String, String>,
    client: Arc<dyn LlmClient>,
    tools: Vec<Arc<dyn Tool>>,
}

impl AgentDefinition {
    /// Create a definition with the mandatory identity and client.
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        AgentDefinition {
            name: name.into(),
            description: None,
            system_prompt: None,
            directory: None,
            delegates_to: Vec::new(),
            streaming: false,
            turn_timeout: None,
            retry: RetryPolicy::default(),
            keep_context: true,
            context_window: None,
            delegation_tool_overrides: HashMap::new(),
            client,
            tools: Vec::new(),
        }
    }

    /// Attach a description surfaced in delegation tool descriptions.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the working directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    /// Declare a tool.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    /// Declare the delegation targets this agent may call.
    pub fn with_delegates_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.delegates_to = targets.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable streaming.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the per-turn wall-clock limit.
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Control whether this agent's conversation survives between delegated
    /// calls when it is used as a delegation target.
    pub fn with_keep_context(mut self, keep_context: bool) -> Self {
        self.keep_context = keep_context;
        self
    }

    /// Override the context window used for compression decisions.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Override the generated delegation tool name for one target.
    pub fn with_delegation_tool_name(
        mut self,
        target: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        self.delegation_tool_overrides
            .insert(target.into(), tool_name.into());
        self
    }

    /// Borrow the LLM client.
    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    /// Borrow the declared tools.
    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Effective context window: the override or the client's value.
    pub fn effective_context_window(&self) -> usize {
        self.context_window.unwrap_or_else(|| self.client.context_window())
    }

    /// Validate the definition in isolation: name shape and duplicate tool
    /// declarations.  Cross-agent checks (duplicate names, unknown
    /// delegation targets) run at swarm build time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_name(&self.name) {
            return Err(ConfigError::InvalidAgentName(self.name.clone()));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_string()) {
                return Err(ConfigError::DuplicateTool {
                    agent: self.name.clone(),
                    tool: tool.name().to_string(),
                });
            }
        }
        Ok(())
    }
}
