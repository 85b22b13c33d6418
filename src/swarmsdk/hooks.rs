//! Hook registration and execution.
//!
//! Hooks intercept the runtime at fixed lifecycle points — user prompts,
//! tool use, delegation, context pressure — and return a typed
//! [`HookDecision`] that can let execution proceed, replace a value, halt
//! with a message, or finish the agent/swarm outright.
//!
//! # Anatomy of a hook
//!
//! Each [`Hook`] has an event kind, an optional tool-name regex matcher
//! (consulted for `pre_tool_use`/`post_tool_use`), an integer priority
//! (lower runs first), and a handler: either an in-process callback or an
//! external command speaking a stdin-JSON protocol.
//!
//! # External-command protocol
//!
//! The command receives one JSON object on stdin
//! (`{"event": …, "agent": …, "swarm_id": …, …event fields}`) and signals
//! its decision through the exit code:
//!
//! | Exit code | Meaning |
//! |---|---|
//! | 0 | continue; non-empty stdout becomes the replacement value |
//! | 2 | halt, with stderr as the message |
//! | other | non-blocking warning, execution proceeds |
//!
//! A command that exceeds the configured timeout is killed and treated as a
//! non-blocking warning.
//!
//! # Failure isolation
//!
//! [`HookRegistry::execute_safe`] runs matching hooks in priority order.
//! Handler errors are logged and skipped; the first halt/replace/finish
//! decision wins and short-circuits the remaining hooks.

use async_trait::async_trait;
use regex::Regex;
use std::error::Error;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SwarmStart,
    SwarmStop,
    UserPrompt,
    PreToolUse,
    PostToolUse,
    PreDelegation,
    PostDelegation,
    ContextWarning,
    AgentStop,
    FirstMessage,
}

impl HookEvent {
    /// The `snake_case` name used in the external-command protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::SwarmStart => "swarm_start",
            HookEvent::SwarmStop => "swarm_stop",
            HookEvent::UserPrompt => "user_prompt",
            HookEvent::PreToolUse => "pre_tool_use",
            HookEvent::PostToolUse => "post_tool_use",
            HookEvent::PreDelegation => "pre_delegation",
            HookEvent::PostDelegation => "post_delegation",
            HookEvent::ContextWarning => "context_warning",
            HookEvent::AgentStop => "agent_stop",
            HookEvent::FirstMessage => "first_message",
        }
    }
}

/// Typed result of running a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    /// Continue unchanged.
    Proceed,
    /// Continue, substituting the carried value for the hooked one: the
    /// rewritten prompt for `user_prompt`, the replacement result for
    /// `pre_tool_use` (which then skips the tool) and `post_tool_use`, the
    /// rewritten result for delegation hooks.
    Replace(String),
    /// Stop the hooked operation and surface the message in its place.
    Halt(String),
    /// End the current agent's turn now with the supplied message.
    FinishAgent(String),
    /// Unwind the delegation chain up to the root swarm with the supplied
    /// message.
    FinishSwarm(String),
}

impl HookDecision {
    /// True for `Proceed`.
    pub fn is_proceed(&self) -> bool {
        matches!(self, HookDecision::Proceed)
    }
}

/// Context handed to each hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// The lifecycle point being intercepted.
    pub event: HookEvent,
    /// Name of the agent the event concerns.
    pub agent: String,
    /// Owning swarm id.
    pub swarm_id: String,
    /// Tool name, for tool-use and delegation events.
    pub tool_name: Option<String>,
    /// Event-specific fields (prompt, arguments, result, …).
    pub payload: serde_json::Value,
}

impl HookContext {
    /// Build a context for `event` in `agent`/`swarm_id` with the given
    /// payload.
    pub fn new(
        event: HookEvent,
        agent: impl Into<String>,
        swarm_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        HookContext {
            event,
            agent: agent.into(),
            swarm_id: swarm_id.into(),
            tool_name: None,
            payload,
        }
    }

    /// Attach the tool name the event concerns.
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// The JSON object sent to external-command hooks.
    pub fn to_protocol_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("event".into(), serde_json::json!(self.event.as_str()));
        object.insert("agent".into(), serde_json::json!(self.agent));
        object.insert("swarm_id".into(), serde_json::json!(self.swarm_id));
        if let Some(tool) = &self.tool_name {
            object.insert("tool_name".into(), serde_json::json!(tool));
        }
        if let serde_json::Value::Object(extra) = &self.payload {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }
        serde_json::Value::Object(object)
    }
}

/// In-process hook handler.
#[async_trait]
pub trait HookCallback: Send + Sync {
    /// Inspect the context and decide.  Errors are logged by the executor
    /// and treated as non-blocking.
    async fn run(&self, context: &HookContext)
        -> Result<HookDecision, Box<dyn Error + Send + Sync>>;
}

/// Adapter turning a plain closure into a [`HookCallback`].
struct FnCallback<F>(F);

#[async_trait]
impl<F> HookCallback for FnCallback<F>
where
    F: Fn(&HookContext) -> HookDecision + Send + Sync,
{
    async fn run(
        &self,
        context: &HookContext,
    ) -> Result<HookDecision, Box<dyn Error + Send + Sync>> {
        Ok((self.0)(context))
    }
}

/// An external command run for each matching event.
#[derive(Debug, Clone)]
pub struct CommandHook {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Wall-clock limit; expiry kills the process and counts as a warning.
    pub timeout: Duration,
}

impl CommandHook {
    /// Build a command hook with the default 30 s timeout.
    pub fn new(program: impl Into<String>) -> Self {
        CommandHook {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Override the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, context: &HookContext) -> Result<HookDecision, Box<dyn Error + Send + Sync>> {
        let input = serde_json::to_vec(&context.to_protocol_json())?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await?;
            drop(stdin);
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                log::warn!(
                    "hook command '{}' timed out after {:?} on {}",
                    self.program,
                    self.timeout,
                    context.event.as_str()
                );
                return Ok(HookDecision::Proceed);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(0) => {
                if stdout.is_empty() {
                    Ok(HookDecision::Proceed)
                } else {
                    Ok(HookDecision::Replace(stdout))
                }
            }
            Some(2) => Ok(HookDecision::Halt(stderr)),
            code => {
                log::warn!(
                    "hook command '{}' exited with {:?} on {}: {}",
                    self.program,
                    code,
                    context.event.as_str(),
                    stderr
                );
                Ok(HookDecision::Proceed)
            }
        }
    }
}

enum HookHandler {
    Callback(Arc<dyn HookCallback>),
    Command(CommandHook),
}

/// One registered hook.
pub struct Hook {
    event: HookEvent,
    matcher: Option<Regex>,
    priority: i32,
    handler: HookHandler,
}

impl Hook {
    /// Build a hook backed by a synchronous closure.
    pub fn on<F>(event: HookEvent, handler: F) -> Self
    where
        F: Fn(&HookContext) -> HookDecision + Send + Sync + 'static,
    {
        Hook {
            event,
            matcher: None,
            priority: 0,
            handler: HookHandler::Callback(Arc::new(FnCallback(handler))),
        }
    }

    /// Build a hook backed by a [`HookCallback`] implementation.
    pub fn callback(event: HookEvent, callback: Arc<dyn HookCallback>) -> Self {
        Hook {
            event,
            matcher: None,
            priority: 0,
            handler: HookHandler::Callback(callback),
        }
    }

    /// Build a hook backed by an external command.
    pub fn command(event: HookEvent, command: CommandHook) -> Self {
        Hook {
            event,
            matcher: None,
            priority: 0,
            handler: HookHandler::Command(command),
        }
    }

    /// Restrict the hook to tool names matching `pattern`.
    pub fn with_matcher(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.matcher = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Set the priority (lower runs first, default 0).
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, context: &HookContext) -> bool {
        if self.event != context.event {
            return false;
        }
        match (&self.matcher, &context.tool_name) {
            (Some(matcher), Some(tool)) => matcher.is_match(tool),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Hooks grouped for one swarm, executed in priority order.
pub struct HookRegistry {
    hooks: Vec<Hook>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        HookRegistry { hooks: Vec::new() }
    }

    /// Register a hook.
    pub fn add(&mut self, hook: Hook) {
        self.hooks.push(hook);
        self.hooks.sort_by_key(|h| h.priority);
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hooks are registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook matching `context` in priority order.
    ///
    /// Handler errors are logged and skipped.  The first decision other
    /// than `Proceed` wins and short-circuits the rest.
    pub async fn execute_safe(&self, context: &HookContext) -> HookDecision {
        for hook in self.hooks.iter().filter(|h| h.matches(context)) {
            let result = match &hook.handler {
                HookHandler::Callback(callback) => callback.run(context).await,
                HookHandler::Command(command) => command.run(context).await,
            };
            match result {
                Ok(HookDecision::Proceed) => continue,
                Ok(decision) => return decision,
                Err(error) => {
                    log::warn!(
                        "hook for {} failed on agent '{}': {}",
                        context.event.as_str(),
                        context.agent,
                        error
                    );
                }
            }
        }
        HookDecision::Proceed
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
