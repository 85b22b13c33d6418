//! Per-agent conversation loop.
//!
//! [`AgentChat`] owns one agent's conversation and drives its LLM through
//! the automatic tool-use loop: prepare messages, call the model (with
//! retry and error classification), execute returned tool calls through the
//! hook pipeline — delegations included — append the results, and repeat
//! until the model answers without tool calls or a hook finishes the turn.
//!
//! # Serialization points
//!
//! A capacity-1 *ask-semaphore* serializes concurrent `ask` calls on the
//! same agent, so conversation messages appear in strict append order.  A
//! *global capacity limiter*, shared across the swarm, bounds concurrent
//! in-flight LLM requests; a per-agent *local limiter* bounds parallel tool
//! executions within one turn.
//!
//! # Error classification
//!
//! | Failure | Action |
//! |---|---|
//! | 400 with tool-use wording | one-shot orphan recovery, then a free same-turn retry |
//! | 401/402/403/422, other 4xx, request bugs | fail fast: a synthesized assistant message, never raised |
//! | 429/5xx/network/timeout | up to N retries with a fixed delay, then raised |
//!
//! Fail-fast results come back as normal assistant messages so a
//! delegating agent sees them as content and can react.
//!
//! # Finish markers
//!
//! Hooks can end the turn early.  [`Finish::Agent`] returns the supplied
//! message from the current `ask`; [`Finish::Swarm`] unwinds the whole
//! delegation chain as [`ChatError::FinishSwarm`], checked at every
//! delegation-return site and at the swarm root.

use crate::swarmsdk::concurrency::{deadline, CapacityLimiter, DeadlineExceeded};
use crate::swarmsdk::config::SwarmDefaults;
use crate::swarmsdk::context_manager::{estimate_tokens, extract_reminders, ContextManager};
use crate::swarmsdk::definition::{AgentDefinition, ConfigError};
use crate::swarmsdk::delegation::DelegateTool;
use crate::swarmsdk::hooks::{HookContext, HookDecision, HookEvent, HookRegistry};
use crate::swarmsdk::llm_client::{
    ChunkChannel, LlmClient, LlmError, Message, MessageChunk, Role, TokenUsage, ToolDefinition,
};
use crate::swarmsdk::log_stream::{AgentContext, EventKind, LogStream, SwarmEvent};
use crate::swarmsdk::serialization::{ChatSnapshot, SnapshotError};
use crate::swarmsdk::skill::SkillState;
use crate::swarmsdk::tool::{Tool, ToolOutcome, ToolRegistry, ToolResult};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Marker raised by hooks to end a turn or the whole swarm early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    /// End this agent's turn now, answering with the supplied message.
    Agent(String),
    /// Unwind through all delegating ancestors to the root swarm.
    Swarm(String),
}

/// Errors surfaced by [`AgentChat::ask`] and friends.
///
/// `FinishSwarm` is not a failure: it transports the swarm-finish marker up
/// the delegation chain, where the root converts it into a successful
/// result.
#[derive(Debug)]
pub enum ChatError {
    /// A `finish_swarm` marker travelling to the root.
    FinishSwarm(String),
    /// Retryable LLM failures exhausted the retry budget.
    RetriesExhausted {
        /// Retries performed before giving up.
        attempts: usize,
        /// The last error observed.
        source: LlmError,
    },
    /// Internal runtime failure (unknown target, dropped swarm, …).
    Internal(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::FinishSwarm(msg) => write!(f, "swarm finished early: {}", msg),
            ChatError::RetriesExhausted { attempts, source } => write!(
                f,
                "LLM retries exhausted after {} attempts: {}",
                attempts, source
            ),
            ChatError::Internal(msg) => write!(f, "agent runtime error: {}", msg),
        }
    }
}

impl Error for ChatError {}

/// Mutable conversation state, guarded by the chat's `RwLock` and mutated
/// only while the ask-semaphore is held.
struct ChatState {
    messages: Vec<Message>,
    context: ContextManager,
    skill: Option<SkillState>,
    usage: TokenUsage,
    started: bool,
}

impl ChatState {
    fn reseed(&mut self, definition: &AgentDefinition) {
        self.messages.clear();
        self.context.reset();
        if let Some(prompt) = &definition.system_prompt {
            self.messages.push(Message::system(prompt.clone()));
        }
    }
}

struct TurnOutput {
    message: Message,
    finish_reason: String,
}

enum Round {
    Assistant(Message),
    FailFast(Message),
}

struct ToolDispatch {
    result: ToolResult,
    finish: Option<Finish>,
    todo_warning: Option<String>,
    is_todo: bool,
}

/// One agent's conversation runtime.
///
/// Created lazily by the swarm on first use; shared as `Arc<AgentChat>`.
pub struct AgentChat {
    definition: Arc<AgentDefinition>,
    context: AgentContext,
    registry: ToolRegistry,
    delegations: HashMap<String, Arc<DelegateTool>>,
    hooks: Arc<HookRegistry>,
    events: LogStream,
    ask_semaphore: CapacityLimiter,
    global_limiter: CapacityLimiter,
    local_limiter: CapacityLimiter,
    defaults: SwarmDefaults,
    state: RwLock<ChatState>,
}

impl AgentChat {
    pub(crate) fn new(
        definition: Arc<AgentDefinition>,
        context: AgentContext,
        hooks: Arc<HookRegistry>,
        events: LogStream,
        global_limiter: CapacityLimiter,
        defaults: SwarmDefaults,
        delegations: HashMap<String, Arc<DelegateTool>>,
    ) -> Result<Self, ConfigError> {
        let mut registry = ToolRegistry::new();
        for tool in definition.tools() {
            registry
                .register(tool.clone())
                .map_err(|_| ConfigError::InvalidTool {
                    agent: definition.name.clone(),
                    tool: tool.name().to_string(),
                })?;
        }
        for delegation in delegations.values() {
            let tool: Arc<dyn Tool> = delegation.clone();
            registry
                .register(tool)
                .map_err(|_| ConfigError::InvalidTool {
                    agent: definition.name.clone(),
                    tool: delegation.name().to_string(),
                })?;
        }

        let mut state = ChatState {
            messages: Vec::new(),
            context: ContextManager::new(),
            skill: None,
            usage: TokenUsage::default(),
            started: false,
        };
        state.reseed(&definition);

        let local_limiter = CapacityLimiter::new(defaults.local_capacity);
        Ok(AgentChat {
            definition,
            context,
            registry,
            delegations,
            hooks,
            events,
            ask_semaphore: CapacityLimiter::new(1),
            global_limiter,
            local_limiter,
            defaults,
            state: RwLock::new(state),
        })
    }

    /// The agent's name (composite `target@delegator` for isolated
    /// delegation instances).
    pub fn name(&self) -> &str {
        &self.context.agent_name
    }

    pub(crate) fn definition(&self) -> &Arc<AgentDefinition> {
        &self.definition
    }

    /// Cumulative token usage for this agent.
    pub async fn usage(&self) -> TokenUsage {
        self.state.read().await.usage.clone()
    }

    /// Clone of the persistent conversation.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    /// Load (or replace) the active skill; takes effect on the next turn.
    pub async fn load_skill_state(&self, skill: Option<SkillState>) {
        self.state.write().await.skill = skill;
    }

    /// Drop the active skill, restoring the full toolset on the next turn.
    pub async fn clear_skill(&self) {
        self.state.write().await.skill = None;
    }

    /// Append a message without calling the LLM.
    ///
    /// System-reminder blocks embedded in the content are stripped and
    /// re-attached as ephemerals, so they reach the model exactly once and
    /// never persist.
    pub async fn add_message(&self, message: Message) {
        let mut state = self.state.write().await;
        Self::push_into(&mut state, message);
    }

    /// Enqueue one user turn and drive the tool loop to the final assistant
    /// message.
    pub async fn ask(&self, prompt: &str) -> Result<Message, ChatError> {
        self.ask_inner(prompt, false, "user", false).await
    }

    /// [`ask`](AgentChat::ask) with explicit context clearing and source
    /// labelling (`"user"`, `"delegation"`, …).
    pub async fn ask_with_options(
        &self,
        prompt: &str,
        clear_context: bool,
        source: &str,
    ) -> Result<Message, ChatError> {
        self.ask_inner(prompt, clear_context, source, false).await
    }

    /// Resume the existing conversation without a new user turn.
    pub async fn complete(&self) -> Result<Message, ChatError> {
        let _turn = self.ask_semaphore.acquire().await;
        self.mark_started(None).await;
        let result = if crate::swarmsdk::delegation::current_path().is_empty() {
            crate::swarmsdk::delegation::with_path(
                vec![self.definition.name.clone()],
                self.bounded_tool_loop(),
            )
            .await
        } else {
            self.bounded_tool_loop().await
        };
        self.finish_turn(result).await
    }

    async fn bounded_tool_loop(&self) -> Result<TurnOutput, ChatError> {
        match deadline(self.definition.turn_timeout, self.tool_loop()).await {
            Ok(result) => result,
            Err(DeadlineExceeded) => Ok(self.timed_out_turn().await),
        }
    }

    async fn bounded_turn(&self, prompt: &str, source: &str) -> Result<TurnOutput, ChatError> {
        match deadline(self.definition.turn_timeout, self.run_turn(prompt, source)).await {
            Ok(result) => result,
            Err(DeadlineExceeded) => Ok(self.timed_out_turn().await),
        }
    }

    /// Serialize the full conversation + context-manager state.
    pub async fn snapshot(&self) -> Result<serde_json::Value, SnapshotError> {
        let state = self.state.read().await;
        let snapshot = ChatSnapshot {
            messages: state.messages.clone(),
            ephemerals: state.context.ephemeral_entries().clone(),
            compression_applied: state.context.compression_applied(),
            last_todo_index: state.context.last_todo_index(),
            skill: state.skill.clone(),
            usage: state.usage.clone(),
        };
        serde_json::to_value(&snapshot).map_err(|e| SnapshotError::Serialize(e.to_string()))
    }

    /// Restore a state previously produced by
    /// [`snapshot`](AgentChat::snapshot).
    pub async fn restore(&self, blob: serde_json::Value) -> Result<(), SnapshotError> {
        let snapshot: ChatSnapshot =
            serde_json::from_value(blob).map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        let mut state = self.state.write().await;
        state.messages = snapshot.messages;
        state.context.clear_ephemeral();
        state.context.set_ephemeral_entries(snapshot.ephemerals);
        state.context.set_compression_applied(snapshot.compression_applied);
        state.context.set_last_todo_index(snapshot.last_todo_index);
        state.skill = snapshot.skill;
        state.usage = snapshot.usage;
        Ok(())
    }

    /// Full ask sequence.  `reset_after` clears the conversation before the
    /// ask-semaphore is released (used for `keep_context: false` delegation
    /// targets, so a peer can never observe a half-dropped context).
    pub(crate) async fn ask_inner(
        &self,
        prompt: &str,
        clear_context: bool,
        source: &str,
        reset_after: bool,
    ) -> Result<Message, ChatError> {
        let _turn = self.ask_semaphore.acquire().await;

        if clear_context {
            self.state.write().await.reseed(&self.definition);
        }
        self.mark_started(Some(prompt)).await;

        // A top-level ask seeds the delegation path with this agent, so a
        // descendant delegating back to it is recognized as a cycle instead
        // of deadlocking on the ask-semaphore.
        let result = if crate::swarmsdk::delegation::current_path().is_empty() {
            crate::swarmsdk::delegation::with_path(
                vec![self.definition.name.clone()],
                self.bounded_turn(prompt, source),
            )
            .await
        } else {
            self.bounded_turn(prompt, source).await
        };

        if reset_after {
            self.state.write().await.reseed(&self.definition);
        }
        self.finish_turn(result).await
    }

    async fn mark_started(&self, prompt: Option<&str>) {
        let first = {
            let mut state = self.state.write().await;
            if state.started {
                false
            } else {
                state.started = true;
                true
            }
        };
        if first {
            self.emit(
                EventKind::AgentStart,
                serde_json::json!({"model": self.definition.client().model_name()}),
            )
            .await;
            let payload = serde_json::json!({"prompt": prompt.unwrap_or_default()});
            let context = self.hook_context(HookEvent::FirstMessage, payload);
            // first_message is informational; any non-proceed decision is
            // logged and ignored.
            let decision = self.hooks.execute_safe(&context).await;
            if !decision.is_proceed() {
                log::debug!(
                    "first_message hook returned a non-proceed decision for '{}'; ignored",
                    self.context.agent_name
                );
            }
        }
    }

    /// Turn epilogue: emit `agent_stop`, fire the `agent_stop` hook, and
    /// pass the result through.
    async fn finish_turn(
        &self,
        result: Result<TurnOutput, ChatError>,
    ) -> Result<Message, ChatError> {
        match result {
            Ok(output) => {
                let usage = self.state.read().await.usage.clone();
                self.emit(
                    EventKind::AgentStop,
                    serde_json::json!({
                        "finish_reason": output.finish_reason,
                        "content_length": output.message.content.len(),
                        "usage": usage,
                    }),
                )
                .await;
                let context = self.hook_context(
                    HookEvent::AgentStop,
                    serde_json::json!({
                        "finish_reason": output.finish_reason,
                        "content": output.message.content,
                    }),
                );
                self.hooks.execute_safe(&context).await;
                Ok(output.message)
            }
            Err(error) => Err(error),
        }
    }

    async fn timed_out_turn(&self) -> TurnOutput {
        // The turn future was dropped mid-flight; pending ephemerals from
        // the cancelled round-trip must not leak into the next turn.
        self.state.write().await.context.clear_ephemeral();
        let timeout = self.definition.turn_timeout.unwrap_or_default();
        self.emit(
            EventKind::TurnTimeout,
            serde_json::json!({"timeout_ms": timeout.as_millis() as u64}),
        )
        .await;
        // Synthesized, deliberately not persisted: the next ask starts from
        // the conversation as it stood before the deadline fired.
        TurnOutput {
            message: Message::assistant(format!(
                "The turn was cancelled after exceeding its {}s time limit. \
                 The conversation is unchanged; you can retry with a narrower request.",
                timeout.as_secs()
            )),
            finish_reason: "timeout".to_string(),
        }
    }

    async fn run_turn(&self, prompt: &str, source: &str) -> Result<TurnOutput, ChatError> {
        self.emit(
            EventKind::UserPrompt,
            serde_json::json!({"prompt": prompt, "source": source}),
        )
        .await;
        let context = self.hook_context(
            HookEvent::UserPrompt,
            serde_json::json!({"prompt": prompt, "source": source}),
        );
        let prompt = match self.hooks.execute_safe(&context).await {
            HookDecision::Proceed => prompt.to_string(),
            HookDecision::Replace(rewritten) => rewritten,
            HookDecision::Halt(message) | HookDecision::FinishAgent(message) => {
                return Ok(TurnOutput {
                    message: Message::assistant(message),
                    finish_reason: "halted".to_string(),
                })
            }
            HookDecision::FinishSwarm(message) => return Err(ChatError::FinishSwarm(message)),
        };

        {
            let mut state = self.state.write().await;
            let index = Self::push_into(&mut state, Message::user(prompt));
            for reminder in Self::collect_reminders(&state) {
                state.context.add_reminder(index, reminder);
            }
        }

        self.tool_loop().await
    }

    /// Reminders gathered at the top of a turn (skill notices and anything
    /// queued by earlier tool handling).
    fn collect_reminders(state: &ChatState) -> Vec<String> {
        let mut reminders = Vec::new();
        if let Some(skill) = &state.skill {
            let mut names: Vec<&str> = skill.tools.iter().map(String::as_str).collect();
            names.sort();
            reminders.push(format!(
                "A skill is active; the available tools are restricted to: {}.",
                names.join(", ")
            ));
        }
        reminders
    }

    /// Append a message, stripping embedded system reminders into
    /// ephemerals at the new index, and folding usage into the agent
    /// counters.  Returns the index of the appended message.
    fn push_into(state: &mut ChatState, mut message: Message) -> usize {
        if message.content.contains("<system-reminder>") {
            let (clean, reminders) = extract_reminders(&message.content);
            message.content = clean;
            let index = state.messages.len();
            for reminder in reminders {
                state.context.add_reminder(index, reminder);
            }
        }
        if let Some(usage) = &message.usage {
            state.usage.add(usage);
        }
        state.messages.push(message);
        state.messages.len() - 1
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.events
            .emit(SwarmEvent::new(kind, &self.context, payload))
            .await;
    }

    fn hook_context(&self, event: HookEvent, payload: serde_json::Value) -> HookContext {
        HookContext::new(
            event,
            self.context.agent_name.clone(),
            self.context.swarm_id.clone(),
            payload,
        )
    }

    /// The inner loop: LLM round-trips interleaved with parallel tool
    /// execution, until the model stops calling tools or a finish marker
    /// unwinds the turn.
    async fn tool_loop(&self) -> Result<TurnOutput, ChatError> {
        loop {
            let (active, definitions) = {
                let state = self.state.read().await;
                let active = self.registry.active_tools(state.skill.as_ref());
                let definitions = ToolRegistry::definitions(&active);
                (active, definitions)
            };

            let round = self.call_with_retry(&definitions).await?;
            let message = match round {
                Round::Assistant(message) => message,
                Round::FailFast(message) => {
                    let returned = message.clone();
                    let mut state = self.state.write().await;
                    Self::push_into(&mut state, message);
                    return Ok(TurnOutput {
                        message: returned,
                        finish_reason: "error".to_string(),
                    });
                }
            };

            let tool_calls = message.tool_calls.clone();
            {
                let mut state = self.state.write().await;
                Self::push_into(&mut state, message.clone());
            }
            self.emit(
                EventKind::AgentStep,
                serde_json::json!({
                    "tool_calls": tool_calls.len(),
                    "content_length": message.content.len(),
                }),
            )
            .await;

            if tool_calls.is_empty() {
                return Ok(TurnOutput {
                    message,
                    finish_reason: "stop".to_string(),
                });
            }

            // Run the calls concurrently under the local limiter.  The
            // futures share this task, so the delegation path scoped around
            // each dispatch stays isolated between siblings.
            let dispatches = futures_util::future::join_all(tool_calls.iter().map(|call| {
                let active = &active;
                async move {
                    let _permit = self.local_limiter.acquire().await;
                    self.dispatch_tool_call(active, call).await
                }
            }))
            .await;

            let mut finish: Option<Finish> = None;
            {
                let mut state = self.state.write().await;
                for dispatch in dispatches {
                    let index = Self::push_into(
                        &mut state,
                        Message::tool(
                            dispatch.result.tool_call_id.clone(),
                            dispatch.result.content.clone(),
                        ),
                    );
                    if dispatch.is_todo {
                        state.context.note_todo_index(index);
                    }
                    if let Some(warning) = dispatch.todo_warning {
                        state.context.add_reminder(index, warning);
                    }
                    if finish.is_none() {
                        finish = dispatch.finish;
                    }
                }
            }

            match finish {
                Some(Finish::Agent(message)) => {
                    let answer = Message::assistant(message);
                    {
                        let mut state = self.state.write().await;
                        Self::push_into(&mut state, answer.clone());
                    }
                    return Ok(TurnOutput {
                        message: answer,
                        finish_reason: "finish_agent".to_string(),
                    });
                }
                Some(Finish::Swarm(message)) => return Err(ChatError::FinishSwarm(message)),
                None => {}
            }

            self.maybe_compress().await;
        }
    }

    /// One hook-wrapped tool execution.  Delegation tools bypass the
    /// tool-use hooks entirely; delegation emits its own lifecycle events.
    async fn dispatch_tool_call(
        &self,
        active: &HashMap<String, Arc<dyn Tool>>,
        call: &crate::swarmsdk::llm_client::ToolCall,
    ) -> ToolDispatch {
        if let Some(delegation) = self.delegations.get(&call.name) {
            let outcome = delegation.dispatch(&call.arguments).await;
            return ToolDispatch {
                result: ToolResult {
                    tool_call_id: call.id.clone(),
                    content: outcome.content,
                    success: outcome.success,
                },
                finish: outcome.finish,
                todo_warning: None,
                is_todo: false,
            };
        }

        self.emit(
            EventKind::ToolCall,
            serde_json::json!({
                "tool_name": call.name,
                "tool_call_id": call.id,
                "arguments": call.arguments,
            }),
        )
        .await;

        let pre_context = self
            .hook_context(
                HookEvent::PreToolUse,
                serde_json::json!({"tool_name": call.name, "arguments": call.arguments}),
            )
            .with_tool(&call.name);
        let mut finish: Option<Finish> = None;
        let mut outcome = match self.hooks.execute_safe(&pre_context).await {
            HookDecision::Proceed => match active.get(&call.name) {
                Some(tool) => match tool.execute(call.arguments.clone()).await {
                    Ok(outcome) => outcome,
                    // Tool failures are never raised: the LLM sees them as
                    // a failed tool result and decides what to do next.
                    Err(error) => ToolOutcome::failure(error.to_string()),
                },
                None => ToolOutcome::failure(format!("tool not found: {}", call.name)),
            },
            // block(custom_result): the hook's value replaces the tool
            // output without executing the tool.
            HookDecision::Replace(result) | HookDecision::Halt(result) => ToolOutcome::text(result),
            HookDecision::FinishAgent(message) => {
                finish = Some(Finish::Agent(message.clone()));
                ToolOutcome::text(message)
            }
            HookDecision::FinishSwarm(message) => {
                finish = Some(Finish::Swarm(message.clone()));
                ToolOutcome::text(message)
            }
        };

        if finish.is_none() {
            let post_context = self
                .hook_context(
                    HookEvent::PostToolUse,
                    serde_json::json!({
                        "tool_name": call.name,
                        "result": outcome.render(),
                        "success": outcome.success,
                    }),
                )
                .with_tool(&call.name);
            match self.hooks.execute_safe(&post_context).await {
                HookDecision::Proceed => {}
                HookDecision::Replace(result) | HookDecision::Halt(result) => {
                    outcome = ToolOutcome::text(result);
                }
                HookDecision::FinishAgent(message) => finish = Some(Finish::Agent(message)),
                HookDecision::FinishSwarm(message) => finish = Some(Finish::Swarm(message)),
            }
        }

        let content = outcome.render();
        self.emit(
            EventKind::ToolResult,
            serde_json::json!({
                "tool_name": call.name,
                "tool_call_id": call.id,
                "success": outcome.success,
                "content_length": content.len(),
            }),
        )
        .await;

        let (todo_warning, is_todo) = if call.name == "TodoWrite" {
            (check_todo_arguments(&call.arguments), true)
        } else {
            (None, false)
        };

        ToolDispatch {
            result: ToolResult {
                tool_call_id: call.id.clone(),
                content,
                success: outcome.success,
            },
            finish,
            todo_warning,
            is_todo,
        }
    }

    /// LLM call with retry, classification, and orphan recovery.  Pairs
    /// ephemeral embedding and clearing around every round-trip.
    async fn call_with_retry(&self, definitions: &[ToolDefinition]) -> Result<Round, ChatError> {
        let retry = &self.definition.retry;
        let mut attempts = 0usize;
        let mut recovered = false;
        loop {
            let prepared = {
                let state = self.state.read().await;
                state.context.prepare_for_llm(&state.messages)
            };
            self.emit(
                EventKind::LlmApiRequest,
                serde_json::json!({
                    "model": self.definition.client().model_name(),
                    "message_count": prepared.len(),
                    "tool_count": definitions.len(),
                }),
            )
            .await;

            let result = {
                let _permit = self.global_limiter.acquire().await;
                if self.definition.streaming {
                    self.complete_streaming(&prepared, definitions).await
                } else {
                    self.definition
                        .client()
                        .complete(&prepared, definitions, None)
                        .await
                }
            };
            // Pairing: the embedded reminders were sent (or the attempt
            // failed); either way they are spent.
            self.state.write().await.context.clear_ephemeral();

            match result {
                Ok(mut message) => {
                    if message.model_id.is_none() {
                        message.model_id =
                            Some(self.definition.client().model_name().to_string());
                    }
                    let finish_reason = if message.tool_calls.is_empty() {
                        "stop"
                    } else {
                        "tool_calls"
                    };
                    self.emit(
                        EventKind::LlmApiResponse,
                        serde_json::json!({
                            "model": message.model_id,
                            "tool_calls": message.tool_calls.len(),
                            "usage": message.usage,
                            "finish_reason": finish_reason,
                        }),
                    )
                    .await;
                    return Ok(Round::Assistant(message));
                }
                Err(error) => {
                    if error.is_tool_use_rejection() && !recovered {
                        recovered = true;
                        if self.recover_orphans().await > 0 {
                            // The same turn is retried without touching the
                            // retry budget.
                            continue;
                        }
                    }
                    if error.is_retryable() {
                        attempts += 1;
                        if attempts > retry.max_attempts {
                            self.emit(
                                EventKind::LlmRetryExhausted,
                                serde_json::json!({
                                    "attempts": attempts - 1,
                                    "error": error.to_string(),
                                }),
                            )
                            .await;
                            return Err(ChatError::RetriesExhausted {
                                attempts: attempts - 1,
                                source: error,
                            });
                        }
                        self.emit(
                            EventKind::LlmRetryAttempt,
                            serde_json::json!({
                                "attempt": attempts,
                                "max_attempts": retry.max_attempts,
                                "delay_ms": retry.delay.as_millis() as u64,
                                "error": error.to_string(),
                            }),
                        )
                        .await;
                        tokio::time::sleep(retry.delay).await;
                        continue;
                    }
                    self.emit(
                        EventKind::LlmRequestFailed,
                        serde_json::json!({
                            "retryable": false,
                            "status": error.status(),
                            "error": error.to_string(),
                        }),
                    )
                    .await;
                    return Ok(Round::FailFast(synthesize_failure(&error)));
                }
            }
        }
    }

    /// Streamed round-trip: forwards chunks as `content_chunk` events with
    /// a one-time separator at the text→tool-call transition.
    async fn complete_streaming(
        &self,
        prepared: &[Message],
        definitions: &[ToolDefinition],
    ) -> Result<Message, LlmError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<MessageChunk>();
        let forward = async {
            let mut saw_text = false;
            let mut separator_sent = false;
            while let Some(chunk) = receiver.recv().await {
                if chunk.content.is_empty() {
                    continue;
                }
                match chunk.channel {
                    ChunkChannel::Text => {
                        saw_text = true;
                        self.emit(
                            EventKind::ContentChunk,
                            serde_json::json!({"content": chunk.content, "channel": "text"}),
                        )
                        .await;
                    }
                    ChunkChannel::ToolCall => {
                        if saw_text && !separator_sent {
                            separator_sent = true;
                            self.emit(
                                EventKind::ContentChunk,
                                serde_json::json!({"content": "", "channel": "separator", "separator": true}),
                            )
                            .await;
                        }
                        // Verbatim fragments; never parsed here.
                        self.emit(
                            EventKind::ContentChunk,
                            serde_json::json!({"content": chunk.content, "channel": "tool_call"}),
                        )
                        .await;
                    }
                }
            }
        };
        let (result, _) = tokio::join!(
            self.definition
                .client()
                .complete(prepared, definitions, Some(sender)),
            forward
        );
        result
    }

    /// Prune assistant tool calls that never received results, then remind
    /// the model about them.  Returns the number of pruned calls.
    async fn recover_orphans(&self) -> usize {
        let mut state = self.state.write().await;
        let orphan_map = find_orphans(&state.messages);
        if orphan_map.is_empty() {
            return 0;
        }

        let mut pruned: Vec<(String, String)> = Vec::new();
        let mut rebuilt: Vec<Message> = Vec::with_capacity(state.messages.len());
        for (index, message) in state.messages.iter().enumerate() {
            match orphan_map.get(&index) {
                Some(orphan_ids) => {
                    let mut replacement = message.clone();
                    replacement.tool_calls.retain(|call| {
                        if orphan_ids.contains(&call.id) {
                            pruned.push((call.id.clone(), call.name.clone()));
                            false
                        } else {
                            true
                        }
                    });
                    if !replacement.is_empty() {
                        rebuilt.push(replacement);
                    }
                }
                None => rebuilt.push(message.clone()),
            }
        }
        state.messages = rebuilt;
        // Indices shifted; prior ephemerals are invalid.
        state.context.clear_ephemeral();

        let listing = pruned
            .iter()
            .map(|(id, name)| format!("{} ({})", id, name))
            .collect::<Vec<_>>()
            .join(", ");
        if let Some(last) = state.messages.len().checked_sub(1) {
            state.context.add_reminder(
                last,
                format!(
                    "Removed {} incomplete tool call(s) that never received results: {}. \
                     Re-issue them if the work is still needed.",
                    pruned.len(),
                    listing
                ),
            );
        }
        let count = pruned.len();
        let ids: Vec<String> = pruned.iter().map(|(id, _)| id.clone()).collect();
        drop(state);

        self.emit(
            EventKind::OrphanToolCallsPruned,
            serde_json::json!({"pruned": ids, "count": count}),
        )
        .await;
        count
    }

    /// Warn once and compress when the conversation crosses the configured
    /// share of the context window.
    async fn maybe_compress(&self) {
        let window = self.definition.effective_context_window().max(1);
        let (estimated, ratio) = {
            let state = self.state.read().await;
            if state.context.compression_applied() {
                return;
            }
            let estimated = estimate_tokens(&state.messages);
            (estimated, estimated as f64 / window as f64)
        };
        if ratio < self.defaults.compression_threshold {
            return;
        }

        self.emit(
            EventKind::ContextLimitWarning,
            serde_json::json!({
                "estimated_tokens": estimated,
                "context_window": window,
                "ratio": ratio,
            }),
        )
        .await;
        let context = self.hook_context(
            HookEvent::ContextWarning,
            serde_json::json!({"estimated_tokens": estimated, "context_window": window}),
        );
        self.hooks.execute_safe(&context).await;

        let stats = {
            let mut state = self.state.write().await;
            let ChatState {
                ref mut messages,
                ref mut context,
                ..
            } = *state;
            context.compress(messages, self.defaults.recent_tail)
        };
        self.emit(
            EventKind::ContextCompression,
            serde_json::json!({
                "chars_before": stats.chars_before,
                "chars_after": stats.chars_after,
                "messages_truncated": stats.messages_truncated,
            }),
        )
        .await;
    }
}

/// Scan for assistant tool calls with no matching tool result before the
/// next user/assistant message.  Returns `message index → orphan call ids`.
fn find_orphans(messages: &[Message]) -> HashMap<usize, Vec<String>> {
    let mut orphans: HashMap<usize, Vec<String>> = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        if message.role != Role::Assistant || message.tool_calls.is_empty() {
            continue;
        }
        let mut answered: Vec<&str> = Vec::new();
        for later in &messages[index + 1..] {
            match later.role {
                Role::Tool => {
                    if let Some(id) = &later.tool_call_id {
                        answered.push(id.as_str());
                    }
                }
                Role::User | Role::Assistant => break,
                Role::System => {}
            }
        }
        let missing: Vec<String> = message
            .tool_calls
            .iter()
            .filter(|call| !answered.contains(&call.id.as_str()))
            .map(|call| call.id.clone())
            .collect();
        if !missing.is_empty() {
            orphans.insert(index, missing);
        }
    }
    orphans
}

/// TodoWrite boundary check: exactly one `in_progress` entry is expected.
fn check_todo_arguments(arguments: &serde_json::Value) -> Option<String> {
    let todos = arguments.get("todos")?.as_array()?;
    let in_progress = todos
        .iter()
        .filter(|todo| {
            todo.get("status").and_then(|s| s.as_str()) == Some("in_progress")
        })
        .count();
    if in_progress == 1 {
        None
    } else {
        Some(format!(
            "TodoWrite recorded {} items with status \"in_progress\"; \
             keep exactly one task in progress at a time.",
            in_progress
        ))
    }
}

/// Build the assistant message returned for non-retryable LLM failures.
fn synthesize_failure(error: &LlmError) -> Message {
    let text = match error.status() {
        Some(401) => "Unauthorized: the LLM provider rejected the configured credentials \
                      (HTTP 401). Verify the API key and account access before retrying."
            .to_string(),
        Some(402) => "Payment required (HTTP 402): the provider reports a billing problem \
                      with this account. Resolve the billing state before retrying."
            .to_string(),
        Some(403) => "Forbidden (HTTP 403): the credentials are valid but lack access to \
                      this model or endpoint."
            .to_string(),
        Some(422) => format!(
            "The provider could not process the request (HTTP 422): {}. \
             The request will not be retried.",
            error
        ),
        Some(status) => format!(
            "The LLM request failed with HTTP {} and will not be retried: {}",
            status, error
        ),
        None => format!(
            "The LLM request could not be completed and will not be retried: {}",
            error
        ),
    };
    Message::assistant(text)
}
