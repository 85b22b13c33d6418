//! Swarm construction and execution.
//!
//! A [`Swarm`] is a named, statically configured set of agents with one
//! *lead*.  [`Swarm::execute`] hands a prompt to the lead agent, drives the
//! whole delegation tree to completion, and returns an
//! [`ExecutionResult`] with the lead's final content, cumulative token
//! usage, and the list of agents that were actually reached.
//!
//! # Construction
//!
//! Swarms are assembled with [`SwarmBuilder`] and validated at build time:
//! duplicate agent names and `delegates_to` targets that are neither an
//! agent nor a registered sub-swarm fail fast with a
//! [`ConfigError`].  Agents themselves are created lazily, on their first
//! `ask` or first delegation.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmsdk::{AgentDefinition, SwarmBuilder};
//! # use swarmsdk::llm_client::{LlmClient, Message, ToolDefinition, ChunkSender, LlmError};
//! # use async_trait::async_trait;
//! # struct MyClient;
//! # #[async_trait]
//! # impl LlmClient for MyClient {
//! #     async fn complete(&self, _m: &[Message], _t: &[ToolDefinition], _c: Option<ChunkSender>)
//! #         -> Result<Message, LlmError> { Ok(Message::assistant("done")) }
//! #     fn model_name(&self) -> &str { "mock" }
//! # }
//! use std::sync::Arc;
//!
//! # async {
//! let swarm = SwarmBuilder::new("support")
//!     .add_agent(
//!         AgentDefinition::new("lead", Arc::new(MyClient))
//!             .with_system_prompt("Coordinate the team.")
//!             .with_delegates_to(vec!["helper"]),
//!     )
//!     .add_agent(AgentDefinition::new("helper", Arc::new(MyClient)))
//!     .with_lead("lead")
//!     .build()
//!     .unwrap();
//!
//! let result = swarm.execute("ask helper for 2+2").await;
//! assert!(result.success);
//! # };
//! ```

use crate::swarmsdk::agent_chat::{AgentChat, ChatError};
use crate::swarmsdk::concurrency::{deadline, CapacityLimiter, DeadlineExceeded};
use crate::swarmsdk::config::SwarmDefaults;
use crate::swarmsdk::definition::{AgentDefinition, ConfigError};
use crate::swarmsdk::delegation::{delegation_tool_name, DelegateTool, TargetResolver};
use crate::swarmsdk::hooks::{Hook, HookContext, HookEvent, HookRegistry};
use crate::swarmsdk::llm_client::{Message, TokenUsage};
use crate::swarmsdk::log_stream::{AgentContext, EventKind, EventSink, LogStream, SwarmEvent};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Outcome of one [`Swarm::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The lead agent's final message content, or an error description when
    /// `success` is false.
    pub content: String,
    /// Whether execution completed normally.
    pub success: bool,
    /// Wall-clock duration of the execution.
    pub duration: Duration,
    /// Cumulative token usage across every agent reached, sub-swarms
    /// included.
    pub usage: TokenUsage,
    /// Names of the agents of this swarm that were instantiated, in
    /// first-use order.
    pub agents_involved: Vec<String>,
}

/// Errors surfaced by swarm operations after construction.
#[derive(Debug)]
pub enum SwarmError {
    /// Invalid configuration discovered while creating an agent.
    Config(ConfigError),
    /// The named agent is not defined in this swarm.
    UnknownAgent(String),
}

impl fmt::Display for SwarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwarmError::Config(error) => write!(f, "configuration error: {}", error),
            SwarmError::UnknownAgent(name) => write!(f, "unknown agent: {}", name),
        }
    }
}

impl Error for SwarmError {}

impl From<ConfigError> for SwarmError {
    fn from(error: ConfigError) -> Self {
        SwarmError::Config(error)
    }
}

/// A swarm registered as a delegation target of a parent swarm.
///
/// The inner swarm is built lazily on first delegation and cached.  With
/// `keep_context: false` the sub-swarm lead's conversation is reset after
/// each delegated call; the reset runs inside the lead's ask-semaphore, so
/// concurrent delegations serialize rather than dropping a peer's context
/// mid-flight.
pub struct SubSwarmSpec {
    builder: SwarmBuilder,
    keep_context: bool,
}

impl SubSwarmSpec {
    /// Wrap a builder as a lazily loaded sub-swarm.
    pub fn new(builder: SwarmBuilder) -> Self {
        SubSwarmSpec {
            builder,
            keep_context: true,
        }
    }

    /// Control whether the sub-swarm lead keeps its conversation between
    /// delegated calls.
    pub fn with_keep_context(mut self, keep_context: bool) -> Self {
        self.keep_context = keep_context;
        self
    }
}

struct SubSwarmSlot {
    spec: Option<SubSwarmSpec>,
    loaded: Option<Arc<SwarmCore>>,
    keep_context: bool,
}

/// Builder for [`Swarm`].
pub struct SwarmBuilder {
    name: String,
    lead: Option<String>,
    agents: Vec<AgentDefinition>,
    sub_swarms: Vec<(String, SubSwarmSpec)>,
    defaults: SwarmDefaults,
    hooks: HookRegistry,
    sinks: Vec<Arc<dyn EventSink>>,
    isolate_delegates: bool,
}

impl SwarmBuilder {
    /// Start building a swarm with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        SwarmBuilder {
            name: name.into(),
            lead: None,
            agents: Vec::new(),
            sub_swarms: Vec::new(),
            defaults: SwarmDefaults::default(),
            hooks: HookRegistry::new(),
            sinks: Vec::new(),
            isolate_delegates: false,
        }
    }

    /// Add an agent definition.
    pub fn add_agent(mut self, definition: AgentDefinition) -> Self {
        self.agents.push(definition);
        self
    }

    /// Register a sub-swarm as a delegation target.
    pub fn add_sub_swarm(mut self, name: impl Into<String>, spec: SubSwarmSpec) -> Self {
        self.sub_swarms.push((name.into(), spec));
        self
    }

    /// Name the lead agent.  Defaults to the first agent added.
    pub fn with_lead(mut self, lead: impl Into<String>) -> Self {
        self.lead = Some(lead.into());
        self
    }

    /// Override the runtime defaults (capacities, retry, compression).
    pub fn with_defaults(mut self, defaults: SwarmDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Cap concurrent in-flight LLM requests across the swarm tree.
    pub fn with_global_limit(mut self, limit: usize) -> Self {
        self.defaults.global_capacity = limit;
        self
    }

    /// Cap concurrent tool executions within one agent turn.
    pub fn with_local_limit(mut self, limit: usize) -> Self {
        self.defaults.local_capacity = limit;
        self
    }

    /// Register a hook.
    pub fn add_hook(mut self, hook: Hook) -> Self {
        self.hooks.add(hook);
        self
    }

    /// Subscribe an event sink.
    pub fn subscribe(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Give each delegating agent its own instance of shared delegation
    /// targets, keyed `target@delegator`, instead of one shared instance
    /// per target.
    pub fn with_isolated_delegations(mut self, isolate: bool) -> Self {
        self.isolate_delegates = isolate;
        self
    }

    /// Validate the configuration and produce the swarm.
    pub fn build(self) -> Result<Swarm, ConfigError> {
        let events = LogStream::new();
        let core = self.build_core(None, events)?;
        Ok(Swarm { core })
    }

    fn build_core(
        self,
        parent_swarm_id: Option<String>,
        events: LogStream,
    ) -> Result<Arc<SwarmCore>, ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::EmptySwarm);
        }

        let mut names: HashSet<String> = HashSet::new();
        for definition in &self.agents {
            definition.validate()?;
            if !names.insert(definition.name.clone()) {
                return Err(ConfigError::DuplicateAgent(definition.name.clone()));
            }
        }
        let mut sub_swarm_names: HashSet<String> = HashSet::new();
        for (name, _) in &self.sub_swarms {
            if names.contains(name) || !sub_swarm_names.insert(name.clone()) {
                return Err(ConfigError::DuplicateAgent(name.clone()));
            }
        }

        let lead = self
            .lead
            .clone()
            .unwrap_or_else(|| self.agents[0].name.clone());
        if !names.contains(&lead) {
            return Err(ConfigError::UnknownLead(lead));
        }

        for definition in &self.agents {
            for target in &definition.delegates_to {
                if !names.contains(target) && !sub_swarm_names.contains(target) {
                    return Err(ConfigError::UnknownDelegationTarget {
                        agent: definition.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        for sink in &self.sinks {
            events.subscribe(sink.clone());
        }

        let definitions: HashMap<String, Arc<AgentDefinition>> = self
            .agents
            .into_iter()
            .map(|definition| (definition.name.clone(), Arc::new(definition)))
            .collect();
        let sub_swarms: HashMap<String, SubSwarmSlot> = self
            .sub_swarms
            .into_iter()
            .map(|(name, spec)| {
                let keep_context = spec.keep_context;
                (
                    name,
                    SubSwarmSlot {
                        spec: Some(spec),
                        loaded: None,
                        keep_context,
                    },
                )
            })
            .collect();

        let global_limiter = CapacityLimiter::new(self.defaults.global_capacity);
        let id = format!("swarm_{}", uuid::Uuid::new_v4().simple());
        Ok(Arc::new_cyclic(|self_ref| SwarmCore {
            id,
            name: self.name,
            lead,
            parent_swarm_id,
            definitions,
            agents: RwLock::new(HashMap::new()),
            involved: StdMutex::new(Vec::new()),
            sub_swarms: RwLock::new(sub_swarms),
            sub_swarm_names,
            defaults: self.defaults,
            global_limiter,
            hooks: Arc::new(self.hooks),
            events,
            isolate_delegates: self.isolate_delegates,
            self_ref: self_ref.clone(),
        }))
    }
}

pub(crate) struct SwarmCore {
    id: String,
    name: String,
    lead: String,
    parent_swarm_id: Option<String>,
    definitions: HashMap<String, Arc<AgentDefinition>>,
    agents: RwLock<HashMap<String, Arc<AgentChat>>>,
    involved: StdMutex<Vec<String>>,
    sub_swarms: RwLock<HashMap<String, SubSwarmSlot>>,
    sub_swarm_names: HashSet<String>,
    defaults: SwarmDefaults,
    global_limiter: CapacityLimiter,
    hooks: Arc<HookRegistry>,
    events: LogStream,
    isolate_delegates: bool,
    self_ref: Weak<SwarmCore>,
}

impl SwarmCore {
    /// Fetch or lazily create an agent instance.  With delegation isolation
    /// on, instances created for a delegator are keyed `target@delegator`.
    async fn agent_instance(
        &self,
        name: &str,
        delegator: Option<&str>,
    ) -> Result<Arc<AgentChat>, SwarmError> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| SwarmError::UnknownAgent(name.to_string()))?;
        // Composite instance names use the delegator's base name, so a
        // chain of isolated instances stays two levels deep.
        let key = match delegator {
            Some(delegator) if self.isolate_delegates => {
                let base = delegator.split('@').next().unwrap_or(delegator);
                format!("{}@{}", name, base)
            }
            _ => name.to_string(),
        };

        let mut agents = self.agents.write().await;
        if let Some(agent) = agents.get(&key) {
            return Ok(agent.clone());
        }

        let mut context = AgentContext::new(key.clone(), self.id.clone());
        context.parent_swarm_id = self.parent_swarm_id.clone();

        let mut delegations: HashMap<String, Arc<DelegateTool>> = HashMap::new();
        let resolver: Weak<dyn TargetResolver> = self.self_ref.clone();
        for target in &definition.delegates_to {
            let tool_name = definition
                .delegation_tool_overrides
                .get(target)
                .cloned()
                .unwrap_or_else(|| delegation_tool_name(target));
            context.delegation_tool_names.insert(tool_name.clone());
        }
        for target in &definition.delegates_to {
            let tool_name = definition
                .delegation_tool_overrides
                .get(target)
                .cloned()
                .unwrap_or_else(|| delegation_tool_name(target));
            let target_description = self
                .definitions
                .get(target)
                .and_then(|d| d.description.clone());
            let tool = Arc::new(DelegateTool::new(
                target.clone(),
                tool_name.clone(),
                target_description,
                context.clone(),
                self.hooks.clone(),
                self.events.clone(),
                resolver.clone(),
            ));
            delegations.insert(tool_name, tool);
        }

        let chat = Arc::new(AgentChat::new(
            definition.clone(),
            context,
            self.hooks.clone(),
            self.events.clone(),
            self.global_limiter.clone(),
            self.defaults.clone(),
            delegations,
        )?);
        agents.insert(key.clone(), chat.clone());
        if let Ok(mut involved) = self.involved.lock() {
            involved.push(key);
        }
        Ok(chat)
    }

    async fn load_sub_swarm(&self, name: &str) -> Result<(Arc<SwarmCore>, bool), ChatError> {
        let mut slots = self.sub_swarms.write().await;
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| ChatError::Internal(format!("unknown sub-swarm: {}", name)))?;
        if slot.loaded.is_none() {
            let spec = slot
                .spec
                .take()
                .ok_or_else(|| ChatError::Internal(format!("sub-swarm '{}' lost its spec", name)))?;
            let core = spec
                .builder
                .build_core(Some(self.id.clone()), self.events.clone())
                .map_err(|e| ChatError::Internal(format!("sub-swarm '{}': {}", name, e)))?;
            slot.loaded = Some(core);
        }
        let core = slot
            .loaded
            .clone()
            .ok_or_else(|| ChatError::Internal(format!("sub-swarm '{}' failed to load", name)))?;
        Ok((core, slot.keep_context))
    }

    /// Cumulative usage across this swarm's agents and every loaded
    /// sub-swarm.
    fn total_usage<'a>(&'a self) -> Pin<Box<dyn Future<Output = TokenUsage> + Send + 'a>> {
        Box::pin(async move {
            let mut usage = TokenUsage::default();
            let agents = self.agents.read().await;
            for agent in agents.values() {
                usage.add(&agent.usage().await);
            }
            drop(agents);
            let subs = self.sub_swarms.read().await;
            let loaded: Vec<Arc<SwarmCore>> =
                subs.values().filter_map(|slot| slot.loaded.clone()).collect();
            drop(subs);
            for sub in loaded {
                usage.add(&sub.total_usage().await);
            }
            usage
        })
    }

    fn swarm_context(&self) -> AgentContext {
        let mut context = AgentContext::new(self.lead.clone(), self.id.clone());
        context.parent_swarm_id = self.parent_swarm_id.clone();
        context
    }

    async fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.events
            .emit(SwarmEvent::new(kind, &self.swarm_context(), payload))
            .await;
    }
}

#[async_trait]
impl TargetResolver for SwarmCore {
    async fn delegate(
        &self,
        target: &str,
        delegator: &str,
        message: String,
        clear_context: bool,
    ) -> Result<Message, ChatError> {
        if self.sub_swarm_names.contains(target) {
            let (child, keep_context) = self.load_sub_swarm(target).await?;
            let lead_name = child.lead.clone();
            let lead = child
                .agent_instance(&lead_name, None)
                .await
                .map_err(|e| ChatError::Internal(e.to_string()))?;
            return lead
                .ask_inner(&message, clear_context, "delegation", !keep_context)
                .await;
        }

        let agent = self
            .agent_instance(target, Some(delegator))
            .await
            .map_err(|e| ChatError::Internal(e.to_string()))?;
        let reset_after = !agent.definition().keep_context;
        agent
            .ask_inner(&message, clear_context, "delegation", reset_after)
            .await
    }
}

/// A configured, immutable swarm of agents.
pub struct Swarm {
    core: Arc<SwarmCore>,
}

impl Swarm {
    /// Start a builder.
    pub fn builder(name: impl Into<String>) -> SwarmBuilder {
        SwarmBuilder::new(name)
    }

    /// The swarm's unique id.
    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// The swarm's configured name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Subscribe an event sink after construction.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        self.core.events.subscribe(sink);
    }

    /// Fetch (or lazily create) an agent for interactive use,
    /// snapshot/restore, or skill loading.
    pub async fn agent(&self, name: &str) -> Result<Arc<AgentChat>, SwarmError> {
        self.core.agent_instance(name, None).await
    }

    /// Run one prompt through the lead agent with no overall deadline.
    pub async fn execute(&self, prompt: &str) -> ExecutionResult {
        self.execute_with_timeout(prompt, None).await
    }

    /// Run one prompt through the lead agent, bounded by an optional
    /// wall-clock timeout.  Timeouts and lead-agent failures surface as a
    /// failed result, never a panic or error.
    pub async fn execute_with_timeout(
        &self,
        prompt: &str,
        limit: Option<Duration>,
    ) -> ExecutionResult {
        let core = &self.core;
        let started = Instant::now();
        core.emit(
            EventKind::SwarmStart,
            serde_json::json!({
                "swarm_name": core.name,
                "lead": core.lead,
                "agent_count": core.definitions.len(),
            }),
        )
        .await;
        core.hooks
            .execute_safe(&HookContext::new(
                HookEvent::SwarmStart,
                core.lead.clone(),
                core.id.clone(),
                serde_json::json!({"prompt": prompt}),
            ))
            .await;

        let outcome = deadline(limit, async {
            let lead = core
                .agent_instance(&core.lead.clone(), None)
                .await
                .map_err(|e| ChatError::Internal(e.to_string()))?;
            lead.ask(prompt).await
        })
        .await;

        let (content, success) = match outcome {
            Ok(Ok(message)) => (message.content, true),
            Ok(Err(ChatError::FinishSwarm(message))) => (message, true),
            Ok(Err(error)) => {
                log::error!("swarm '{}' execution failed: {}", core.name, error);
                (format!("Swarm execution failed: {}", error), false)
            }
            Err(DeadlineExceeded) => {
                let limit = limit.unwrap_or_default();
                (
                    format!(
                        "Swarm execution timed out after {}s",
                        limit.as_secs()
                    ),
                    false,
                )
            }
        };

        let usage = core.total_usage().await;
        let agents_involved = core
            .involved
            .lock()
            .map(|involved| involved.clone())
            .unwrap_or_default();
        let duration = started.elapsed();

        core.hooks
            .execute_safe(&HookContext::new(
                HookEvent::SwarmStop,
                core.lead.clone(),
                core.id.clone(),
                serde_json::json!({"success": success}),
            ))
            .await;
        core.emit(
            EventKind::SwarmStop,
            serde_json::json!({
                "success": success,
                "duration_ms": duration.as_millis() as u64,
                "usage": usage,
                "agents_involved": agents_involved,
            }),
        )
        .await;

        ExecutionResult {
            content,
            success,
            duration,
            usage,
            agents_involved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarmsdk::llm_client::{ChunkSender, LlmClient, LlmError, ToolDefinition};

    struct StaticClient(&'static str);

    #[async_trait]
    impl LlmClient for StaticClient {
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _chunks: Option<ChunkSender>,
        ) -> Result<Message, LlmError> {
            Ok(Message::assistant(self.0))
        }
        fn model_name(&self) -> &str {
            "static"
        }
    }

    fn definition(name: &str) -> AgentDefinition {
        AgentDefinition::new(name, Arc::new(StaticClient("ok")))
    }

    #[test]
    fn build_rejects_unknown_delegation_target() {
        let result = SwarmBuilder::new("team")
            .add_agent(definition("lead").with_delegates_to(vec!["ghost"]))
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::UnknownDelegationTarget { .. })
        ));
    }

    #[test]
    fn build_rejects_duplicate_agent_names() {
        let result = SwarmBuilder::new("team")
            .add_agent(definition("lead"))
            .add_agent(definition("lead"))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateAgent(_))));
    }

    #[test]
    fn build_rejects_unknown_lead() {
        let result = SwarmBuilder::new("team")
            .add_agent(definition("lead"))
            .with_lead("nobody")
            .build();
        assert!(matches!(result, Err(ConfigError::UnknownLead(_))));
    }

    #[test]
    fn build_rejects_empty_swarm() {
        assert!(matches!(
            SwarmBuilder::new("team").build(),
            Err(ConfigError::EmptySwarm)
        ));
    }

    #[test]
    fn sub_swarm_name_satisfies_delegation_target() {
        let sub = SwarmBuilder::new("research-team").add_agent(definition("researcher"));
        let result = SwarmBuilder::new("team")
            .add_agent(definition("lead").with_delegates_to(vec!["research"]))
            .add_sub_swarm("research", SubSwarmSpec::new(sub))
            .build();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn agents_are_created_lazily() {
        let swarm = SwarmBuilder::new("team")
            .add_agent(definition("lead"))
            .add_agent(definition("idle"))
            .build()
            .unwrap();

        let result = swarm.execute("hello").await;
        assert!(result.success);
        assert_eq!(result.content, "ok");
        // Only the lead was instantiated.
        assert_eq!(result.agents_involved, vec!["lead".to_string()]);
    }

    #[tokio::test]
    async fn swarm_timeout_yields_failed_result() {
        struct SlowClient;

        #[async_trait]
        impl LlmClient for SlowClient {
            async fn complete(
                &self,
                _messages: &[Message],
                _tools: &[ToolDefinition],
                _chunks: Option<ChunkSender>,
            ) -> Result<Message, LlmError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Message::assistant("late"))
            }
            fn model_name(&self) -> &str {
                "slow"
            }
        }

        let swarm = SwarmBuilder::new("team")
            .add_agent(AgentDefinition::new("lead", Arc::new(SlowClient)))
            .build()
            .unwrap();
        let result = swarm
            .execute_with_timeout("hello", Some(Duration::from_millis(50)))
            .await;
        assert!(!result.success);
        assert!(result.content.contains("timed out"));
    }
}
