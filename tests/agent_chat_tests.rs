mod common;

use async_trait::async_trait;
use common::{assistant_calling, CountingTool, EchoTool, ScriptedClient};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use swarmsdk::hooks::{Hook, HookDecision, HookEvent};
use swarmsdk::llm_client::{
    ChunkSender, LlmClient, LlmError, Message, MessageChunk, ToolDefinition,
};
use swarmsdk::log_stream::{CollectingSink, EventKind};
use swarmsdk::tool::{Tool, ToolOutcome};
use swarmsdk::{AgentDefinition, ChatError, RetryPolicy, SwarmBuilder};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(5),
    }
}

// ---------------------------------------------------------------------------
// Orphan tool-call recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn orphan_recovery_prunes_and_retries_without_counting() {
    let client = Arc::new(ScriptedClient::new(vec![
        Err(LlmError::Http {
            status: 400,
            message: "`tool_use` ids were found without `tool_result` blocks".into(),
        }),
        Ok(Message::assistant("recovered")),
    ]));
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()).with_retry_policy(fast_retry()))
        .subscribe(sink.clone())
        .build()
        .unwrap();

    // Seed a conversation with an unanswered tool call.
    let agent = swarm.agent("lead").await.unwrap();
    agent
        .add_message(assistant_calling(
            "id1",
            "echo",
            serde_json::json!({"text": "lost"}),
        ))
        .await;

    let answer = agent.ask("continue").await.unwrap();
    assert_eq!(answer.content, "recovered");

    // Exactly one recovery, no retry events.
    assert_eq!(sink.count(EventKind::OrphanToolCallsPruned), 1);
    assert_eq!(sink.count(EventKind::LlmRetryAttempt), 0);

    // The orphaned assistant message is gone from the conversation.
    let messages = agent.messages().await;
    assert!(messages.iter().all(|m| m.tool_calls.is_empty()));

    // The retried request carried a reminder about the pruned call; the
    // persistent conversation does not.
    let retried = &client.requests()[1];
    assert!(retried.iter().any(|m| m.content.contains("id1")));
    assert!(messages.iter().all(|m| !m.content.contains("id1")));
}

#[tokio::test]
async fn unrelated_400_fails_fast_without_recovery() {
    let client = Arc::new(ScriptedClient::new(vec![Err(LlmError::Http {
        status: 400,
        message: "max_tokens is too large".into(),
    })]));
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()))
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let result = swarm.execute("go").await;
    assert!(result.success);
    assert!(result.content.contains("400"));
    assert_eq!(client.call_count(), 1);
    assert_eq!(sink.count(EventKind::OrphanToolCallsPruned), 0);
    assert_eq!(sink.count(EventKind::LlmRequestFailed), 1);
}

// ---------------------------------------------------------------------------
// Retry classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_retries_then_succeeds() {
    let client = Arc::new(ScriptedClient::new(vec![
        Err(LlmError::Http {
            status: 429,
            message: "rate limited".into(),
        }),
        Ok(Message::assistant("after retry")),
    ]));
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()).with_retry_policy(fast_retry()))
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let result = swarm.execute("go").await;
    assert!(result.success);
    assert_eq!(result.content, "after retry");
    assert_eq!(sink.count(EventKind::LlmRetryAttempt), 1);
    assert_eq!(sink.count(EventKind::LlmRetryExhausted), 0);
}

#[tokio::test]
async fn exhausted_retries_raise_and_fail_the_swarm() {
    let server_error = || {
        Err(LlmError::Http {
            status: 503,
            message: "overloaded".into(),
        })
    };
    let client = Arc::new(ScriptedClient::new(vec![
        server_error(),
        server_error(),
        server_error(),
    ]));
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", client.clone()).with_retry_policy(RetryPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(5),
            }),
        )
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let result = swarm.execute("go").await;
    assert!(!result.success);
    assert!(result.content.contains("failed"));
    assert_eq!(client.call_count(), 3); // initial + 2 retries
    assert_eq!(sink.count(EventKind::LlmRetryAttempt), 2);
    assert_eq!(sink.count(EventKind::LlmRetryExhausted), 1);
}

#[tokio::test]
async fn direct_ask_surfaces_retries_exhausted() {
    let client = Arc::new(ScriptedClient::new(vec![Err(LlmError::Network(
        "connection refused".into(),
    ))]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", client).with_retry_policy(RetryPolicy {
                max_attempts: 0,
                delay: Duration::from_millis(1),
            }),
        )
        .build()
        .unwrap();

    let agent = swarm.agent("lead").await.unwrap();
    let error = agent.ask("go").await.unwrap_err();
    assert!(matches!(error, ChatError::RetriesExhausted { .. }));
}

// ---------------------------------------------------------------------------
// Hook pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn user_prompt_hook_can_rewrite() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(Message::assistant("ok"))]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()))
        .add_hook(Hook::on(HookEvent::UserPrompt, |_| {
            HookDecision::Replace("rewritten prompt".into())
        }))
        .build()
        .unwrap();

    swarm.execute("original prompt").await;

    let request = &client.requests()[0];
    let user = request
        .iter()
        .find(|m| m.role == swarmsdk::Role::User)
        .unwrap();
    assert_eq!(user.content, "rewritten prompt");
}

#[tokio::test]
async fn user_prompt_hook_can_halt_before_any_llm_call() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(Message::assistant(
        "never sent",
    ))]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()))
        .add_hook(Hook::on(HookEvent::UserPrompt, |_| {
            HookDecision::Halt("halted by policy".into())
        }))
        .build()
        .unwrap();

    let result = swarm.execute("anything").await;
    assert!(result.success);
    assert_eq!(result.content, "halted by policy");
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn pre_tool_use_block_replaces_result_without_executing() {
    let (counting, calls) = CountingTool::new();
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling("call_1", "counter", serde_json::json!({}))),
        Ok(Message::assistant("done")),
    ]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", client.clone()).with_tool(Arc::new(counting)),
        )
        .add_hook(
            Hook::on(HookEvent::PreToolUse, |_| {
                HookDecision::Replace("blocked by hook".into())
            })
            .with_matcher("^counter$")
            .unwrap(),
        )
        .build()
        .unwrap();

    let result = swarm.execute("count something").await;
    assert!(result.success);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let followup = &client.requests()[1];
    let tool_message = followup
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_1"))
        .unwrap();
    assert_eq!(tool_message.content, "blocked by hook");
}

#[tokio::test]
async fn post_tool_use_hook_transforms_the_result() {
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling(
            "call_1",
            "echo",
            serde_json::json!({"text": "raw"}),
        )),
        Ok(Message::assistant("done")),
    ]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()).with_tool(Arc::new(EchoTool)))
        .add_hook(Hook::on(HookEvent::PostToolUse, |context| {
            let original = context.payload["result"].as_str().unwrap_or_default();
            HookDecision::Replace(format!("[redacted] {}", original))
        }))
        .build()
        .unwrap();

    swarm.execute("echo raw").await;

    let followup = &client.requests()[1];
    let tool_message = followup
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("call_1"))
        .unwrap();
    assert_eq!(tool_message.content, "[redacted] raw");
}

#[tokio::test]
async fn finish_agent_ends_the_turn_with_the_hook_message() {
    let (counting, calls) = CountingTool::new();
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling("call_1", "counter", serde_json::json!({}))),
        Ok(Message::assistant("unreachable")),
    ]));
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", client.clone()).with_tool(Arc::new(counting)),
        )
        .add_hook(
            Hook::on(HookEvent::PreToolUse, |_| {
                HookDecision::FinishAgent("stopped early".into())
            })
            .with_matcher("^counter$")
            .unwrap(),
        )
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let result = swarm.execute("count").await;
    assert!(result.success);
    assert_eq!(result.content, "stopped early");
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(client.call_count(), 1);

    let stop = sink
        .events()
        .into_iter()
        .find(|e| e.kind == EventKind::AgentStop)
        .unwrap();
    assert_eq!(stop.payload["finish_reason"], "finish_agent");
}

#[tokio::test]
async fn finish_swarm_unwinds_through_the_delegation_chain() {
    // The hook fires inside the helper; the marker unwinds through the
    // lead's delegation and becomes the swarm's final content.
    let lead_client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling(
            "call_1",
            "WorkWithHelper",
            serde_json::json!({"message": "go"}),
        )),
        Ok(Message::assistant("unreachable")),
    ]));
    let helper_client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling(
            "call_2",
            "echo",
            serde_json::json!({"text": "x"}),
        )),
        Ok(Message::assistant("unreachable")),
    ]));
    let swarm = SwarmBuilder::new("pair")
        .add_agent(
            AgentDefinition::new("lead", lead_client.clone()).with_delegates_to(vec!["helper"]),
        )
        .add_agent(
            AgentDefinition::new("helper", helper_client.clone()).with_tool(Arc::new(EchoTool)),
        )
        .add_hook(
            Hook::on(HookEvent::PreToolUse, |_| {
                HookDecision::FinishSwarm("the whole swarm is done".into())
            })
            .with_matcher("^echo$")
            .unwrap(),
        )
        .build()
        .unwrap();

    let result = swarm.execute("go").await;
    assert!(result.success);
    assert_eq!(result.content, "the whole swarm is done");
    // The lead never got a follow-up call.
    assert_eq!(lead_client.call_count(), 1);
}

// ---------------------------------------------------------------------------
// Reminders, todos, snapshots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reminders_are_sent_once_and_never_persist() {
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(Message::assistant("first")),
        Ok(Message::assistant("second")),
    ]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()))
        .build()
        .unwrap();

    let agent = swarm.agent("lead").await.unwrap();
    agent
        .add_message(Message::user(
            "context<system-reminder>hidden instruction</system-reminder>",
        ))
        .await;

    agent.ask("go").await.unwrap();
    agent.ask("again").await.unwrap();

    // The first request embedded the reminder.
    assert!(client.requests()[0]
        .iter()
        .any(|m| m.content.contains("hidden instruction")));
    // The second request no longer carries it.
    assert!(client.requests()[1]
        .iter()
        .all(|m| !m.content.contains("hidden instruction")));
    // And the persistent conversation never contained it.
    let messages = agent.messages().await;
    assert!(messages
        .iter()
        .all(|m| !m.content.contains("hidden instruction")));
    assert!(messages
        .iter()
        .all(|m| !m.content.contains("<system-reminder>")));
}

struct TodoTool;

#[async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "TodoWrite"
    }
    fn description(&self) -> &str {
        "Track the task list."
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"todos": {"type": "array"}},
            "required": ["todos"]
        })
    }
    async fn execute(
        &self,
        _arguments: serde_json::Value,
    ) -> Result<ToolOutcome, Box<dyn Error + Send + Sync>> {
        Ok(ToolOutcome::text("todos updated"))
    }
}

#[tokio::test]
async fn todo_write_with_two_active_items_warns_the_model() {
    let client = Arc::new(ScriptedClient::new(vec![
        Ok(assistant_calling(
            "call_1",
            "TodoWrite",
            serde_json::json!({"todos": [
                {"content": "a", "status": "in_progress"},
                {"content": "b", "status": "in_progress"},
            ]}),
        )),
        Ok(Message::assistant("noted")),
    ]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", client.clone()).with_tool(Arc::new(TodoTool)))
        .build()
        .unwrap();

    let result = swarm.execute("update todos").await;
    assert!(result.success);

    // The follow-up request embeds the warning on the tool result; the
    // persistent conversation stays clean.
    let followup = &client.requests()[1];
    assert!(followup
        .iter()
        .any(|m| m.content.contains("exactly one task in progress")));
    let agent = swarm.agent("lead").await.unwrap();
    assert!(agent
        .messages()
        .await
        .iter()
        .all(|m| !m.content.contains("exactly one task")));
}

#[tokio::test]
async fn snapshot_restore_roundtrips_exactly() {
    let client = Arc::new(ScriptedClient::new(vec![Ok(common::assistant_with_usage(
        "answer", 30, 7,
    ))]));
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", client.clone()).with_system_prompt("Be helpful."),
        )
        .build()
        .unwrap();
    let agent = swarm.agent("lead").await.unwrap();
    agent.ask("remember this").await.unwrap();
    agent
        .load_skill_state(Some(swarmsdk::skill::SkillState::with_tools(vec!["echo"])))
        .await;

    let blob = agent.snapshot().await.unwrap();

    // Restore into a fresh swarm built from the same definitions.
    let clone_swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", Arc::new(ScriptedClient::new(vec![])))
                .with_system_prompt("Be helpful."),
        )
        .build()
        .unwrap();
    let restored = clone_swarm.agent("lead").await.unwrap();
    restored.restore(blob.clone()).await.unwrap();

    assert_eq!(restored.usage().await, agent.usage().await);
    let original_messages = agent.messages().await;
    let restored_messages = restored.messages().await;
    assert_eq!(original_messages.len(), restored_messages.len());
    for (a, b) in original_messages.iter().zip(restored_messages.iter()) {
        assert_eq!(a.role, b.role);
        assert_eq!(a.content, b.content);
    }
    // Snapshotting the restored state yields the same blob.
    assert_eq!(blob, restored.snapshot().await.unwrap());
}

#[tokio::test]
async fn restore_rejects_garbage() {
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new(
            "lead",
            Arc::new(ScriptedClient::new(vec![])),
        ))
        .build()
        .unwrap();
    let agent = swarm.agent("lead").await.unwrap();
    let error = agent
        .restore(serde_json::json!({"messages": "not an array"}))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("corrupt"));
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct StreamingClient;

#[async_trait]
impl LlmClient for StreamingClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        chunks: Option<ChunkSender>,
    ) -> Result<Message, LlmError> {
        if let Some(sender) = chunks {
            let _ = sender.send(MessageChunk::text("hel"));
            let _ = sender.send(MessageChunk::text("lo"));
            let _ = sender.send(MessageChunk::tool_fragment("{\"te"));
            let _ = sender.send(MessageChunk::tool_fragment("xt\":"));
        }
        Ok(Message::assistant("hello"))
    }

    fn model_name(&self) -> &str {
        "streaming"
    }
}

#[tokio::test]
async fn streaming_emits_chunks_with_one_separator() {
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(AgentDefinition::new("lead", Arc::new(StreamingClient)).with_streaming(true))
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let result = swarm.execute("stream it").await;
    assert!(result.success);
    assert_eq!(result.content, "hello");

    let chunks: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::ContentChunk)
        .collect();
    let channels: Vec<String> = chunks
        .iter()
        .map(|e| e.payload["channel"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        channels,
        vec!["text", "text", "separator", "tool_call", "tool_call"]
    );
    // Fragments are forwarded verbatim, not parsed.
    assert_eq!(chunks[3].payload["content"], "{\"te");
}

// ---------------------------------------------------------------------------
// Turn timeout
// ---------------------------------------------------------------------------

struct StallClient;

#[async_trait]
impl LlmClient for StallClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _chunks: Option<ChunkSender>,
    ) -> Result<Message, LlmError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(Message::assistant("too late"))
    }

    fn model_name(&self) -> &str {
        "stall"
    }
}

#[tokio::test]
async fn turn_timeout_returns_synthetic_message_without_persisting_it() {
    let sink = Arc::new(CollectingSink::new());
    let swarm = SwarmBuilder::new("solo")
        .add_agent(
            AgentDefinition::new("lead", Arc::new(StallClient))
                .with_turn_timeout(Duration::from_millis(50)),
        )
        .subscribe(sink.clone())
        .build()
        .unwrap();

    let agent = swarm.agent("lead").await.unwrap();
    let answer = agent.ask("slow question").await.unwrap();
    assert!(answer.content.contains("cancelled"));
    assert_eq!(sink.count(EventKind::TurnTimeout), 1);

    // The synthetic message is not in the conversation; the user turn is.
    let messages = agent.messages().await;
    assert!(messages.iter().any(|m| m.content == "slow question"));
    assert!(messages.iter().all(|m| !m.content.contains("cancelled")));
}
