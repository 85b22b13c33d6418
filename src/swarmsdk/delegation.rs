//! Agent-to-agent delegation.
//!
//! Every `delegates_to` target on an agent definition materializes as one
//! delegation tool named `WorkWith<PascalCase(target)>` (overridable).  The
//! tool routes a message to the target agent — or to a registered
//! sub-swarm's lead agent — through the same `ask` path a user prompt
//! takes, and returns the target's final message content as the tool
//! result.
//!
//! # Circularity detection
//!
//! The chain of targets currently being delegated to is tracked in
//! *task-local* storage ([`current_path`]).  Each delegation snapshots the
//! path, refuses with an error string when the target is already on it, and
//! otherwise scopes `path + [target]` around the inner `ask`.  Futures
//! nested inside that scope (the target's own delegations) observe the
//! extension; sibling futures in a parallel fan-out do not — which is what
//! distinguishes a true cycle `A→B→A` from two concurrent `A→B` calls.
//!
//! # Fan-out isolation
//!
//! An atomic counter tracks concurrent invocations of each delegation tool
//! instance.  While more than one is active, the inner `ask` is forced to
//! `clear_context` regardless of the caller's preference, so two parallel
//! delegations to the same target can never interleave inside a single
//! conversation.  The clear itself runs inside the target's ask-semaphore.

use crate::swarmsdk::agent_chat::{ChatError, Finish};
use crate::swarmsdk::hooks::{HookContext, HookDecision, HookEvent, HookRegistry};
use crate::swarmsdk::llm_client::Message;
use crate::swarmsdk::log_stream::{AgentContext, EventKind, LogStream, SwarmEvent};
use crate::swarmsdk::tool::{Tool, ToolOutcome};
use async_trait::async_trait;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

tokio::task_local! {
    static DELEGATION_PATH: Vec<String>;
}

/// Snapshot of the delegation path for the current task, outermost first.
/// Empty outside any delegation scope.
pub fn current_path() -> Vec<String> {
    DELEGATION_PATH
        .try_with(|path| path.clone())
        .unwrap_or_default()
}

/// Run `future` with the delegation path set to `path` for its whole
/// duration.  Nested scopes shadow outer ones; sibling futures are
/// unaffected.
pub async fn with_path<F>(path: Vec<String>, future: F) -> F::Output
where
    F: std::future::Future,
{
    DELEGATION_PATH.scope(path, future).await
}

/// Default delegation tool name for a target: `WorkWith` plus the target in
/// PascalCase (`data_analyst` → `WorkWithDataAnalyst`).
pub fn delegation_tool_name(target: &str) -> String {
    let mut name = String::from("WorkWith");
    for segment in target.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.') {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name
}

/// Routes a delegated message to its target.  Implemented by the swarm
/// core, which owns the agent and sub-swarm registries.
#[async_trait]
pub(crate) trait TargetResolver: Send + Sync {
    async fn delegate(
        &self,
        target: &str,
        delegator: &str,
        message: String,
        clear_context: bool,
    ) -> Result<Message, ChatError>;
}

/// Result of one delegation dispatch, including any finish marker raised by
/// hooks or propagated from the target.
pub(crate) struct DelegationOutcome {
    pub content: String,
    pub success: bool,
    pub finish: Option<Finish>,
}

impl DelegationOutcome {
    fn ok(content: String) -> Self {
        DelegationOutcome {
            content,
            success: true,
            finish: None,
        }
    }

    fn error(content: String) -> Self {
        DelegationOutcome {
            content,
            success: false,
            finish: None,
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> Drop for ActiveGuard<'a> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tool that delegates work to one fixed target agent or sub-swarm.
pub struct DelegateTool {
    target: String,
    tool_name: String,
    description: String,
    context: AgentContext,
    hooks: Arc<HookRegistry>,
    events: LogStream,
    resolver: Weak<dyn TargetResolver>,
    active: AtomicUsize,
}

impl DelegateTool {
    pub(crate) fn new(
        target: impl Into<String>,
        tool_name: impl Into<String>,
        target_description: Option<String>,
        context: AgentContext,
        hooks: Arc<HookRegistry>,
        events: LogStream,
        resolver: Weak<dyn TargetResolver>,
    ) -> Self {
        let target = target.into();
        let description = match target_description {
            Some(desc) => format!("Delegate work to the '{}' agent. {}", target, desc),
            None => format!(
                "Delegate work to the '{}' agent and return its final response.",
                target
            ),
        };
        DelegateTool {
            target,
            tool_name: tool_name.into(),
            description,
            context,
            hooks,
            events,
            resolver,
            active: AtomicUsize::new(0),
        }
    }

    /// The delegation target.
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.events
            .emit(SwarmEvent::new(kind, &self.context, payload))
            .await;
    }

    /// Execute one delegation, returning content plus any finish marker.
    ///
    /// This is the dispatch path the chat loop uses; it bypasses the
    /// tool-use hook pipeline (delegation has its own hooks and events).
    pub(crate) async fn dispatch(&self, arguments: &serde_json::Value) -> DelegationOutcome {
        let message = match arguments.get("message").and_then(|v| v.as_str()) {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => {
                return DelegationOutcome::error(
                    "missing required 'message' argument for delegation".to_string(),
                )
            }
        };
        let reset_context = arguments
            .get("reset_context")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        // Circularity check precedes everything, including the hooks.
        let path = current_path();
        if path.iter().any(|entry| entry == &self.target) {
            self.emit(
                EventKind::DelegationCircularDependency,
                serde_json::json!({
                    "target": self.target,
                    "delegation_path": path,
                }),
            )
            .await;
            return DelegationOutcome::error(format!(
                "Circular delegation detected: '{}' is already on the delegation path {:?}. \
                 Answer with the information you already have instead.",
                self.target, path
            ));
        }

        let pre_context = HookContext::new(
            HookEvent::PreDelegation,
            self.context.agent_name.clone(),
            self.context.swarm_id.clone(),
            serde_json::json!({"target": self.target, "message": message}),
        )
        .with_tool(&self.tool_name);
        match self.hooks.execute_safe(&pre_context).await {
            HookDecision::Proceed => {}
            HookDecision::Replace(result) | HookDecision::Halt(result) => {
                return DelegationOutcome::ok(result);
            }
            HookDecision::FinishAgent(msg) => {
                return DelegationOutcome {
                    content: msg.clone(),
                    success: true,
                    finish: Some(Finish::Agent(msg)),
                }
            }
            HookDecision::FinishSwarm(msg) => {
                return DelegationOutcome {
                    content: msg.clone(),
                    success: true,
                    finish: Some(Finish::Swarm(msg)),
                }
            }
        }

        let resolver = match self.resolver.upgrade() {
            Some(resolver) => resolver,
            None => {
                return DelegationOutcome::error(
                    "delegation failed: the owning swarm is no longer alive".to_string(),
                )
            }
        };

        // While more than one invocation of this tool is active, force a
        // fresh conversation on the target so parallel fan-outs cannot
        // interleave.
        let concurrent = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        let clear_context = reset_context || concurrent > 1;

        self.emit(
            EventKind::AgentDelegation,
            serde_json::json!({
                "target": self.target,
                "message": message,
                "clear_context": clear_context,
            }),
        )
        .await;

        let mut extended = path;
        extended.push(self.target.clone());
        let delegated = with_path(
            extended,
            resolver.delegate(
                &self.target,
                &self.context.agent_name,
                message,
                clear_context,
            ),
        )
        .await;

        match delegated {
            Ok(response) => {
                let mut content = response.content;
                let post_context = HookContext::new(
                    HookEvent::PostDelegation,
                    self.context.agent_name.clone(),
                    self.context.swarm_id.clone(),
                    serde_json::json!({"target": self.target, "result": content}),
                )
                .with_tool(&self.tool_name);
                let mut finish = None;
                match self.hooks.execute_safe(&post_context).await {
                    HookDecision::Proceed => {}
                    HookDecision::Replace(rewritten) | HookDecision::Halt(rewritten) => {
                        content = rewritten;
                    }
                    HookDecision::FinishAgent(msg) => finish = Some(Finish::Agent(msg)),
                    HookDecision::FinishSwarm(msg) => finish = Some(Finish::Swarm(msg)),
                }
                self.emit(
                    EventKind::DelegationResult,
                    serde_json::json!({
                        "target": self.target,
                        "result_length": content.len(),
                    }),
                )
                .await;
                DelegationOutcome {
                    content,
                    success: true,
                    finish,
                }
            }
            Err(ChatError::FinishSwarm(msg)) => DelegationOutcome {
                content: msg.clone(),
                success: true,
                finish: Some(Finish::Swarm(msg)),
            },
            Err(error) => {
                self.emit(
                    EventKind::DelegationError,
                    serde_json::json!({
                        "target": self.target,
                        "error": error.to_string(),
                    }),
                )
                .await;
                DelegationOutcome::error(format!(
                    "Delegation to '{}' failed: {}",
                    self.target, error
                ))
            }
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The request to send to the target agent."
                },
                "reset_context": {
                    "type": "boolean",
                    "description": "Start the target from a fresh conversation."
                }
            },
            "required": ["message"]
        })
    }

    // The chat loop routes delegation tools through `dispatch` so finish
    // markers survive; this path serves direct registry callers only.
    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>> {
        let outcome = self.dispatch(&arguments).await;
        if outcome.success {
            Ok(ToolOutcome::text(outcome.content))
        } else {
            Ok(ToolOutcome::failure(outcome.content))
        }
    }

    fn removable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_pascal_cased() {
        assert_eq!(delegation_tool_name("helper"), "WorkWithHelper");
        assert_eq!(delegation_tool_name("data_analyst"), "WorkWithDataAnalyst");
        assert_eq!(delegation_tool_name("code-reviewer"), "WorkWithCodeReviewer");
        assert_eq!(delegation_tool_name("QA"), "WorkWithQA");
    }

    #[tokio::test]
    async fn path_defaults_to_empty() {
        assert!(current_path().is_empty());
    }

    #[tokio::test]
    async fn scoped_path_is_visible_inside_and_gone_after() {
        let inner = with_path(vec!["a".into()], async {
            let mut path = current_path();
            path.push("b".into());
            with_path(path, async { current_path() }).await
        })
        .await;
        assert_eq!(inner, vec!["a".to_string(), "b".to_string()]);
        assert!(current_path().is_empty());
    }

    #[tokio::test]
    async fn sibling_futures_do_not_share_extensions() {
        // Two "fan-out" siblings each extend the same base path; neither
        // observes the other's extension.
        let base = vec!["lead".to_string()];
        let (left, right) = with_path(base, async {
            let left = async {
                let mut path = current_path();
                path.push("left".into());
                with_path(path, async {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    current_path()
                })
                .await
            };
            let right = async {
                let mut path = current_path();
                path.push("right".into());
                with_path(path, async {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    current_path()
                })
                .await
            };
            futures_util::future::join(left, right).await
        })
        .await;
        assert_eq!(left, vec!["lead".to_string(), "left".to_string()]);
        assert_eq!(right, vec!["lead".to_string(), "right".to_string()]);
    }
}
