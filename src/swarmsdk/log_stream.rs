//! Structured event stream for swarm observability.
//!
//! Every interesting moment in a swarm execution — LLM round-trips, tool
//! calls, delegations, retries, compressions, timeouts — is emitted as a
//! [`SwarmEvent`] on a [`LogStream`].  Subscribers implement [`EventSink`]
//! and receive every event in emission order.
//!
//! # Architecture
//!
//! ```text
//! AgentChat ──┐
//! DelegateTool├── emit(SwarmEvent) ──► LogStream ──► sink 1
//! Swarm ──────┘                            │    └──► sink 2
//!                                          └───────► sink N
//! ```
//!
//! The stream is append-only broadcast: subscribers cannot influence the
//! runtime, and a subscriber that panics is isolated — the panic is caught,
//! logged, and the remaining subscribers still receive the event.
//!
//! # Example
//!
//! ```rust,no_run
//! use swarmsdk::log_stream::{EventSink, LogStream, SwarmEvent};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventSink for Printer {
//!     async fn on_event(&self, event: &SwarmEvent) {
//!         println!("{}", event.to_json());
//!     }
//! }
//!
//! let stream = LogStream::new();
//! stream.subscribe(Arc::new(Printer));
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

/// Every event type the runtime can emit.
///
/// Serialized in `snake_case` as the `type` field of the JSON event object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SwarmStart,
    SwarmStop,
    AgentStart,
    AgentStop,
    AgentStep,
    UserPrompt,
    ToolCall,
    ToolResult,
    AgentDelegation,
    DelegationResult,
    DelegationCircularDependency,
    DelegationError,
    ContextLimitWarning,
    ContextCompression,
    LlmApiRequest,
    LlmApiResponse,
    LlmRetryAttempt,
    LlmRetryExhausted,
    LlmRequestFailed,
    OrphanToolCallsPruned,
    ContentChunk,
    TurnTimeout,
}

impl EventKind {
    /// The `snake_case` wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SwarmStart => "swarm_start",
            EventKind::SwarmStop => "swarm_stop",
            EventKind::AgentStart => "agent_start",
            EventKind::AgentStop => "agent_stop",
            EventKind::AgentStep => "agent_step",
            EventKind::UserPrompt => "user_prompt",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::AgentDelegation => "agent_delegation",
            EventKind::DelegationResult => "delegation_result",
            EventKind::DelegationCircularDependency => "delegation_circular_dependency",
            EventKind::DelegationError => "delegation_error",
            EventKind::ContextLimitWarning => "context_limit_warning",
            EventKind::ContextCompression => "context_compression",
            EventKind::LlmApiRequest => "llm_api_request",
            EventKind::LlmApiResponse => "llm_api_response",
            EventKind::LlmRetryAttempt => "llm_retry_attempt",
            EventKind::LlmRetryExhausted => "llm_retry_exhausted",
            EventKind::LlmRequestFailed => "llm_request_failed",
            EventKind::OrphanToolCallsPruned => "orphan_tool_calls_pruned",
            EventKind::ContentChunk => "content_chunk",
            EventKind::TurnTimeout => "turn_timeout",
        }
    }
}

/// Enrichment metadata stamped onto every event an agent emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentContext {
    /// Agent name.  Isolated delegation instances use the composite form
    /// `target@delegator`.
    pub agent_name: String,
    /// Identifier of the owning swarm.
    pub swarm_id: String,
    /// Identifier of the parent swarm when this swarm runs as a sub-swarm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_swarm_id: Option<String>,
    /// Names of this agent's delegation tools (`WorkWith…`).  Tool calls to
    /// these names bypass the tool-use hook pipeline.
    #[serde(default)]
    pub delegation_tool_names: HashSet<String>,
}

impl AgentContext {
    /// Build a context for `agent_name` inside `swarm_id`.
    pub fn new(agent_name: impl Into<String>, swarm_id: impl Into<String>) -> Self {
        AgentContext {
            agent_name: agent_name.into(),
            swarm_id: swarm_id.into(),
            parent_swarm_id: None,
            delegation_tool_names: HashSet::new(),
        }
    }

    /// True when `tool_name` is one of this agent's delegation tools.
    pub fn is_delegation_tool(&self, tool_name: &str) -> bool {
        self.delegation_tool_names.contains(tool_name)
    }
}

/// A single structured event on the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    /// Event type.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Emission time (serialized as ISO-8601 / RFC 3339).
    pub timestamp: DateTime<Utc>,
    /// Name of the agent the event concerns.
    pub agent: String,
    /// Identifier of the swarm the agent belongs to.
    pub swarm_id: String,
    /// Parent swarm identifier, for events from sub-swarms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_swarm_id: Option<String>,
    /// Kind-specific fields.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SwarmEvent {
    /// Build an event stamped with the given agent context and the current
    /// time.
    pub fn new(kind: EventKind, context: &AgentContext, payload: serde_json::Value) -> Self {
        SwarmEvent {
            kind,
            timestamp: Utc::now(),
            agent: context.agent_name.clone(),
            swarm_id: context.swarm_id.clone(),
            parent_swarm_id: context.parent_swarm_id.clone(),
            payload,
        }
    }

    /// Render the event as a flat JSON object: the standard envelope fields
    /// plus the payload fields merged at the top level.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("type".into(), serde_json::json!(self.kind.as_str()));
        object.insert(
            "timestamp".into(),
            serde_json::json!(self.timestamp.to_rfc3339()),
        );
        object.insert("agent".into(), serde_json::json!(self.agent));
        object.insert("swarm_id".into(), serde_json::json!(self.swarm_id));
        if let Some(parent) = &self.parent_swarm_id {
            object.insert("parent_swarm_id".into(), serde_json::json!(parent));
        }
        if let serde_json::Value::Object(extra) = &self.payload {
            for (key, value) in extra {
                object.insert(key.clone(), value.clone());
            }
        }
        serde_json::Value::Object(object)
    }
}

/// Trait for receiving swarm events.
///
/// The `Send + Sync` bound allows the sink to be shared across agents and
/// tokio tasks via `Arc<dyn EventSink>`.  Sinks must tolerate concurrent
/// invocation; any internal state needs its own synchronization.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Called once per emitted event, in emission order.
    async fn on_event(&self, event: &SwarmEvent);
}

/// Append-only broadcast bus carrying [`SwarmEvent`]s to all subscribers.
///
/// Cloning a `LogStream` produces a handle onto the same subscriber list, so
/// a swarm and its sub-swarms can share one stream.
#[derive(Clone)]
pub struct LogStream {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl LogStream {
    /// Create a stream with no subscribers.
    pub fn new() -> Self {
        LogStream {
            sinks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a subscriber.  Subscribers added mid-execution receive only
    /// subsequently emitted events.
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) {
        let mut sinks = match self.sinks.write() {
            Ok(sinks) => sinks,
            Err(poisoned) => poisoned.into_inner(),
        };
        sinks.push(sink);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        match self.sinks.read() {
            Ok(sinks) => sinks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Fan an event out to every subscriber.
    ///
    /// A panicking subscriber is caught and logged; remaining subscribers
    /// still receive the event, and the emitting component never observes
    /// the failure.
    pub async fn emit(&self, event: SwarmEvent) {
        let sinks = match self.sinks.read() {
            Ok(sinks) => sinks.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for sink in sinks {
            let delivery = AssertUnwindSafe(sink.on_event(&event)).catch_unwind();
            if delivery.await.is_err() {
                log::warn!(
                    "event subscriber panicked while handling {} for agent '{}'",
                    event.kind.as_str(),
                    event.agent
                );
            }
        }
    }
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Test/debug subscriber that records every event in order.
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<SwarmEvent>>,
}

impl CollectingSink {
    /// Create an empty collector.
    pub fn new() -> Self {
        CollectingSink {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Clone out everything recorded so far.
    pub fn events(&self) -> Vec<SwarmEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// The recorded event kinds, in order.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    /// Count of recorded events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn on_event(&self, event: &SwarmEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
