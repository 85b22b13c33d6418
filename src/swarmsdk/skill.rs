//! Skill state: runtime restriction and permission-wrapping of an agent's
//! tools.
//!
//! A *skill* is a named policy loaded onto an agent at runtime.  While
//! loaded it restricts the active tool subset to the skill's `tools` list
//! (non-removable tools always stay) and can wrap individual tools with a
//! [`ToolPermission`] that is enforced on every call.  Clearing the skill
//! restores the full registry on the next turn.

use crate::swarmsdk::tool::{Tool, ToolOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-tool policy a skill applies on top of tool selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ToolPermission {
    /// The tool runs unrestricted.
    Allow,
    /// Every call fails without executing the tool.
    Deny {
        /// Optional explanation returned to the LLM.
        reason: Option<String>,
    },
}

/// Active skill for an agent: the tool subset it allows plus per-tool
/// permissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillState {
    /// Path of the skill definition file the state was loaded from, when
    /// the loader keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Tools the skill exposes.  Intersected with the agent's registry.
    pub tools: HashSet<String>,
    /// Per-tool permission overrides.
    #[serde(default)]
    pub permissions: HashMap<String, ToolPermission>,
}

impl SkillState {
    /// Build a skill exposing exactly the named tools, with no permission
    /// overrides.
    pub fn with_tools<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SkillState {
            file_path: None,
            tools: tools.into_iter().map(Into::into).collect(),
            permissions: HashMap::new(),
        }
    }

    /// Attach a permission override for one tool.
    pub fn with_permission(mut self, tool: impl Into<String>, permission: ToolPermission) -> Self {
        self.permissions.insert(tool.into(), permission);
        self
    }
}

/// A tool wrapped with a skill permission, enforced before delegation to the
/// inner tool.
pub struct PermissionedTool {
    inner: Arc<dyn Tool>,
    permission: ToolPermission,
}

impl PermissionedTool {
    /// Wrap `inner` with `permission`.
    pub fn new(inner: Arc<dyn Tool>, permission: ToolPermission) -> Self {
        PermissionedTool { inner, permission }
    }
}

#[async_trait]
impl Tool for PermissionedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>> {
        match &self.permission {
            ToolPermission::Allow => self.inner.execute(arguments).await,
            ToolPermission::Deny { reason } => {
                let reason = reason
                    .clone()
                    .unwrap_or_else(|| format!("tool '{}' is not permitted by the active skill", self.inner.name()));
                Ok(ToolOutcome::failure(reason))
            }
        }
    }

    fn removable(&self) -> bool {
        self.inner.removable()
    }
}
