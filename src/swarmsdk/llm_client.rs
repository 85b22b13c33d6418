//! Shared primitives for provider-agnostic LLM clients.
//!
//! The swarm core never talks HTTP itself.  It drives any concrete provider
//! through the [`LlmClient`] trait and the lightweight data types defined in
//! this module: chat [`Message`]s, native [`ToolCall`]s, streaming
//! [`MessageChunk`]s, and [`TokenUsage`] accounting.
//!
//! Concrete clients (OpenAI-compatible, Anthropic, local inference, …) live
//! outside this crate; the runtime only requires that a client can take a
//! prepared message array plus a set of [`ToolDefinition`]s and produce one
//! assistant [`Message`], optionally streaming chunks along the way.
//!
//! # Error classification
//!
//! Clients report failures as [`LlmError`].  The conversation loop inspects
//! [`LlmError::status`] and [`LlmError::is_retryable`] to decide between
//! fail-fast (auth/billing/validation), bounded retry (rate limits, 5xx,
//! transient network failures), and one-shot orphan-tool-call recovery
//! (certain 400s — see the agent chat module).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

/// Represents the possible roles for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (a human prompt or a delegating agent's request).
    User,
    /// An assistant authored message (model responses, possibly carrying tool calls).
    Assistant,
    /// A tool-result message correlating with a prior assistant [`ToolCall`]
    /// through [`Message::tool_call_id`].
    Tool,
}

/// A single tool call returned by the LLM in a native function-calling response.
///
/// Providers assign an opaque [`id`](ToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage report into this accumulator.  Counters only ever
    /// grow, which keeps per-agent and per-swarm totals monotonic.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// True when no tokens have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Represents a generic message exchanged with an LLM.
///
/// Messages are immutable once appended to an agent's conversation; the
/// conversation itself is owned exclusively by the agent's chat loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
    /// For `Role::Tool` messages: the id of the assistant tool call this
    /// message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Native tool calls requested by the assistant.  Non-empty only on
    /// assistant messages returned by [`LlmClient::complete`] when the
    /// provider responds with function-calling results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Identifier of the model that produced this message, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Token accounting for the round-trip that produced this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl Message {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// Build an assistant message with no tool calls.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// Build a tool-result message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
            model_id: None,
            usage: None,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Message {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            model_id: None,
            usage: None,
        }
    }

    /// True when this message neither carries text content nor tool calls.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Which stream a chunk belongs to during a streamed response.
///
/// Providers interleave plain text with tool-call argument fragments; the
/// runtime forwards both verbatim and inserts a one-time separator at the
/// text-to-tool-call transition.  Tool-call fragments are *partial strings*,
/// never parsed JSON — consumers that need complete arguments wait for the
/// post-stream `tool_call` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkChannel {
    /// Assistant text content.
    Text,
    /// A fragment of serialized tool-call arguments.
    ToolCall,
}

/// Represents a chunk of content in a streaming response.
#[derive(Debug, Clone)]
pub struct MessageChunk {
    /// The incremental content delta in this chunk.  May be empty for chunks
    /// that only carry a finish reason.
    pub content: String,
    /// Stream the delta belongs to.
    pub channel: ChunkChannel,
    /// Optional finish reason mirroring the provider-specific completion
    /// status (e.g. `"stop"`, `"tool_calls"`).
    pub finish_reason: Option<String>,
}

impl MessageChunk {
    /// Build a plain text chunk.
    pub fn text(content: impl Into<String>) -> Self {
        MessageChunk {
            content: content.into(),
            channel: ChunkChannel::Text,
            finish_reason: None,
        }
    }

    /// Build a tool-call fragment chunk.
    pub fn tool_fragment(content: impl Into<String>) -> Self {
        MessageChunk {
            content: content.into(),
            channel: ChunkChannel::ToolCall,
            finish_reason: None,
        }
    }
}

/// Sink for streamed [`MessageChunk`]s, handed to [`LlmClient::complete`]
/// when streaming is enabled for the agent.
pub type ChunkSender = mpsc::UnboundedSender<MessageChunk>;

/// Error produced by an [`LlmClient`] implementation.
///
/// The variants deliberately mirror the failure classes the conversation
/// loop distinguishes: HTTP status failures, transport-level failures, and
/// request-construction bugs.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// The provider answered with a non-success HTTP status.
    Http {
        /// HTTP status code (e.g. 400, 401, 429, 500).
        status: u16,
        /// Provider-supplied error body or summary.
        message: String,
    },
    /// The request never completed: connection refused, reset, DNS failure.
    Network(String),
    /// The request timed out at the transport level.
    Timeout(String),
    /// The request could not be constructed or the response could not be
    /// decoded — a programming error, never retried.
    InvalidRequest(String),
}

impl LlmError {
    /// HTTP status code, when the error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a retry with delay is worthwhile: rate limits, server-side
    /// failures, and transient network conditions.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            LlmError::Network(_) | LlmError::Timeout(_) => true,
            LlmError::InvalidRequest(_) => false,
        }
    }

    /// Whether this looks like the provider rejecting unanswered tool calls
    /// in the request history — the trigger for orphan tool-call recovery.
    pub fn is_tool_use_rejection(&self) -> bool {
        match self {
            LlmError::Http { status: 400, message } => {
                let lower = message.to_lowercase();
                lower.contains("tool_call")
                    || lower.contains("tool call")
                    || lower.contains("tool_use")
                    || lower.contains("tool use")
            }
            _ => false,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Http { status, message } => {
                write!(f, "LLM request failed with HTTP {}: {}", status, message)
            }
            LlmError::Network(msg) => write!(f, "LLM network error: {}", msg),
            LlmError::Timeout(msg) => write!(f, "LLM request timed out: {}", msg),
            LlmError::InvalidRequest(msg) => write!(f, "invalid LLM request: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// Trait-driven abstraction for a concrete LLM provider.
///
/// An [`LlmClient`] instance translates a prepared message array into the
/// provider-specific wire format and returns the response in a uniform
/// shape.  The abstraction deliberately excludes any conversation
/// bookkeeping: history, ephemeral injection, and retry policy are owned by
/// the agent chat loop.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Drive one chat round-trip.
    ///
    /// `messages` is the fully prepared conversation (system prompt first,
    /// ephemerals already embedded).  `tools` carries the active toolset for
    /// this turn; implementations forward it to the provider's native
    /// function-calling API.  When `chunks` is `Some`, the implementation
    /// should stream deltas into the sender as they arrive and still return
    /// the complete final message; clients without streaming support may
    /// ignore the sender entirely.
    ///
    /// On success the returned [`Message`] has `Role::Assistant` and may
    /// carry non-empty [`Message::tool_calls`] as well as [`Message::usage`].
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        chunks: Option<ChunkSender>,
    ) -> Result<Message, LlmError>;

    /// Return the identifier used to select the upstream model
    /// (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Approximate context window of the backing model, in tokens.  Used by
    /// the context manager to decide when to warn and compress.
    fn context_window(&self) -> usize {
        128_000
    }
}
