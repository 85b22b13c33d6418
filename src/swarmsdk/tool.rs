//! Tool abstraction and per-agent tool registry.
//!
//! A [`Tool`] is anything an agent can invoke through native function
//! calling: it declares a name, a description, and a JSON Schema for its
//! parameters, and executes against parsed JSON arguments.  Tools are
//! registered once per agent in a [`ToolRegistry`]; before every LLM turn
//! the registry computes the *active subset* from the agent's current skill
//! state.
//!
//! # Active subset rules
//!
//! - No skill loaded: every registered tool is active.
//! - Skill with a tool list: the intersection of the skill's tools with the
//!   registry, plus every *non-removable* tool (delegation tools and other
//!   permanently available primitives), each wrapped with the skill's
//!   permission policy when one is declared for it.
//!
//! The registry is keyed by canonical tool name — plain `String`, case
//! sensitive — and the active view is a fresh map computed per turn rather
//! than a mutation of shared state.

use crate::swarmsdk::llm_client::ToolDefinition;
use crate::swarmsdk::skill::{PermissionedTool, SkillState, ToolPermission};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Represents the result of a tool execution, as produced by the tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Whether the tool execution was successful.
    pub success: bool,
    /// The output data from the tool.
    pub output: serde_json::Value,
    /// Optional error message if execution failed.
    pub error: Option<String>,
}

impl ToolOutcome {
    /// Convenience constructor for successful tool execution.
    pub fn success(output: serde_json::Value) -> Self {
        ToolOutcome {
            success: true,
            output,
            error: None,
        }
    }

    /// Convenience constructor for a successful plain-text result.
    pub fn text(output: impl Into<String>) -> Self {
        ToolOutcome::success(serde_json::Value::String(output.into()))
    }

    /// Convenience constructor for failed tool execution.
    pub fn failure(error: impl Into<String>) -> Self {
        ToolOutcome {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    /// Render the outcome as the string content of a tool-result message.
    pub fn render(&self) -> String {
        if self.success {
            match &self.output {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            }
        } else {
            self.error
                .clone()
                .unwrap_or_else(|| "tool execution failed".to_string())
        }
    }
}

/// One executed tool call, correlated back to the assistant message that
/// requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Id of the [`ToolCall`](crate::swarmsdk::llm_client::ToolCall) this
    /// result answers.
    pub tool_call_id: String,
    /// Rendered result content.
    pub content: String,
    /// Whether the execution succeeded.
    pub success: bool,
}

/// Error types for tool registration and lookup.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered.
    NotFound(String),
    /// A tool with an empty or malformed name was registered.
    InvalidName(String),
    /// The provided JSON parameters failed validation or deserialization.
    InvalidParameters(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "tool not found: {}", name),
            ToolError::InvalidName(name) => write!(f, "invalid tool name: {:?}", name),
            ToolError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// A tool that can be used by agents.
///
/// Implementations execute against parsed JSON arguments and return a
/// [`ToolOutcome`].  Execution failures should be reported through
/// `ToolOutcome::failure` (or an `Err`, which the runtime converts to a
/// failed outcome) — the runtime never retries tools and always hands the
/// failure back to the LLM as a tool result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Canonical tool name as exposed to the LLM.  Case sensitive.
    fn name(&self) -> &str;

    /// Human-readable description surfaced to the LLM.
    fn description(&self) -> &str;

    /// JSON Schema object describing the accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>>;

    /// Whether a skill may hide this tool.  Non-removable tools (delegation
    /// tools, memory/scratchpad primitives) stay active under every skill.
    fn removable(&self) -> bool {
        true
    }
}

/// Registry for the tools declared for one agent.
///
/// The registry itself is stable for the agent's lifetime; what changes per
/// turn is the *active view* computed by
/// [`active_tools`](ToolRegistry::active_tools).
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ToolRegistry {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  A tool with the same name replaces the previous
    /// entry, mirroring last-wins semantics for re-registration.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if name.is_empty() || name.chars().any(|c| c.is_whitespace()) {
            return Err(ToolError::InvalidName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Borrow a tool by canonical name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Names of every registered tool.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Compute the active tool subset for the given skill state.
    ///
    /// See the module docs for the selection rules.  The returned map is an
    /// independent view; the registry itself is never mutated.
    pub fn active_tools(&self, skill: Option<&SkillState>) -> HashMap<String, Arc<dyn Tool>> {
        let skill = match skill {
            Some(skill) => skill,
            None => return self.tools.clone(),
        };
        let mut active: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for (name, tool) in &self.tools {
            if !tool.removable() || skill.tools.contains(name) {
                let instance = match skill.permissions.get(name) {
                    Some(permission) => wrap_with_permission(tool.clone(), permission.clone()),
                    None => tool.clone(),
                };
                active.insert(name.clone(), instance);
            }
        }
        active
    }

    /// Provider-facing definitions for an active view, sorted by name so the
    /// toolset presented to the LLM is deterministic.
    pub fn definitions(active: &HashMap<String, Arc<dyn Tool>>) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = active
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters_schema: tool.parameters_schema(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_with_permission(tool: Arc<dyn Tool>, permission: ToolPermission) -> Arc<dyn Tool> {
    match permission {
        ToolPermission::Allow => tool,
        other => Arc::new(PermissionedTool::new(tool, other)),
    }
}
