//! Shared fixtures for the integration suite: a scripted LLM client and a
//! couple of trivial tools.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Once;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use swarmsdk::llm_client::{
    ChunkSender, LlmClient, LlmError, Message, TokenUsage, ToolCall, ToolDefinition,
};
use swarmsdk::tool::{Tool, ToolOutcome};

static LOGGER: Once = Once::new();

/// Route `log` output through env_logger for test diagnostics
/// (`RUST_LOG=debug cargo test`).
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// An `LlmClient` that replays a fixed script of responses and records every
/// prepared message array it was sent.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<Message, LlmError>>>,
    requests: Mutex<Vec<Vec<Message>>>,
    toolsets: Mutex<Vec<Vec<String>>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    latency: std::time::Duration,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<Message, LlmError>>) -> Self {
        ScriptedClient {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            toolsets: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            latency: std::time::Duration::from_millis(0),
        }
    }

    /// Add an artificial per-call delay, for concurrency tests.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every message array the client was called with, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The tool names offered on each call, in order.
    pub fn toolsets(&self) -> Vec<Vec<String>> {
        self.toolsets.lock().unwrap().clone()
    }

    /// Highest number of concurrently in-flight calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        _chunks: Option<ChunkSender>,
    ) -> Result<Message, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.toolsets
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(step) => step,
            None => Ok(Message::assistant("script exhausted")),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Assistant message carrying a single tool call.
pub fn assistant_calling(id: &str, tool: &str, arguments: serde_json::Value) -> Message {
    let mut message = Message::assistant("");
    message.tool_calls = vec![ToolCall {
        id: id.to_string(),
        name: tool.to_string(),
        arguments,
    }];
    message
}

/// Assistant message carrying several tool calls.
pub fn assistant_calling_many(calls: Vec<(&str, &str, serde_json::Value)>) -> Message {
    let mut message = Message::assistant("");
    message.tool_calls = calls
        .into_iter()
        .map(|(id, tool, arguments)| ToolCall {
            id: id.to_string(),
            name: tool.to_string(),
            arguments,
        })
        .collect();
    message
}

/// Assistant message with content and usage attached.
pub fn assistant_with_usage(content: &str, input: usize, output: usize) -> Message {
    let mut message = Message::assistant(content);
    message.usage = Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
    });
    message
}

/// Tool that echoes its `text` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>> {
        let text = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(ToolOutcome::text(text))
    }
}

/// Tool that counts its executions.
pub struct CountingTool {
    pub calls: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            CountingTool {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "counter"
    }

    fn description(&self) -> &str {
        "Counts invocations."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ToolOutcome::text(format!("count={}", n)))
    }
}
