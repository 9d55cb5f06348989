// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end orchestrator tests against the scripted mock provider and an
//! in-memory database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chatforge_db::{event_kind, status, ConversationSettings, Db};
use chatforge_model::{
    ChatMessage, CompletionRequest, FinishReason, MockProvider, ProviderCaps, ProviderEvent,
    ToolChoice, ToolSpec,
};
use chatforge_tools::{Tool, ToolCall, ToolContext, ToolOutput, ToolRegistry};

use crate::context::RequestContext;
use crate::events::ChatEvent;
use crate::orchestrator::{Orchestrator, OrchestratorLimits, TurnSetup};

/// A clock tool that answers instantly.
struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "get_time"
    }
    fn description(&self) -> &str {
        "current time"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::ok(&call.id, json!({ "now": "2026-08-01T12:00:00Z" }).to_string())
    }
}

/// A tool requiring a `query` argument, for validation tests.
struct PickyTool;

#[async_trait]
impl Tool for PickyTool {
    fn name(&self) -> &str {
        "picky"
    }
    fn description(&self) -> &str {
        "requires query"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "required": ["query"] })
    }
    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolOutput {
        ToolOutput::ok(&call.id, "should never run without query")
    }
}

/// A tool that blocks until cancelled.
struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "sleeps"
    }
    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        tokio::select! {
            _ = ctx.cancel.cancelled() => ToolOutput::err(&call.id, "cancelled"),
            _ = tokio::time::sleep(Duration::from_secs(300)) => {
                ToolOutput::ok(&call.id, "slept")
            }
        }
    }
}

struct Fixture {
    db: Db,
    user_id: String,
    conversation_id: String,
    message_id: String,
    orchestrator: Orchestrator,
}

async fn fixture(limits: OrchestratorLimits) -> Fixture {
    let db = Db::open_in_memory(None).await.unwrap();
    let (user, _) = db.create_user("t@example.com").await.unwrap();
    let conv = db
        .create_conversation(&user.id, None, ConversationSettings::default())
        .await
        .unwrap();
    db.append_user_message(&conv.id, &user.id, 0, "hi".into(), None, "cm1".into())
        .await
        .unwrap();
    let msg = db
        .begin_assistant_message(&conv.id, &user.id, None, Some("mock-model".into()))
        .await
        .unwrap();

    let mut registry = ToolRegistry::new();
    registry.register(ClockTool).unwrap();
    registry.register(PickyTool).unwrap();
    registry.register(SlowTool).unwrap();

    let orchestrator = Orchestrator::new(db.clone(), Arc::new(registry), limits);
    Fixture {
        db,
        user_id: user.id,
        conversation_id: conv.id,
        message_id: msg.id,
        orchestrator,
    }
}

fn setup_with(f: &Fixture, provider: Arc<MockProvider>, tools: Vec<&str>) -> TurnSetup {
    TurnSetup {
        provider,
        caps: ProviderCaps { reasoning_effort: false, verbosity: false, images: true },
        request: CompletionRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::user("hi")],
            tools: tools
                .into_iter()
                .map(|name| ToolSpec {
                    name: name.into(),
                    description: "d".into(),
                    parameters: json!({ "type": "object" }),
                })
                .collect(),
            stream: true,
            ..Default::default()
        },
        message_id: f.message_id.clone(),
    }
}

fn ctx(f: &Fixture) -> RequestContext {
    RequestContext::new(
        f.user_id.clone(),
        f.conversation_id.clone(),
        "req-1",
        CancellationToken::new(),
    )
}

fn tool_call_turn(name: &str, args: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ToolCallDelta {
            index: 0,
            id: format!("call_{name}"),
            name: name.into(),
            arguments: args.into(),
        },
        ProviderEvent::Finished(FinishReason::ToolCalls),
        ProviderEvent::Done,
    ]
}

fn text_turn(text: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ContentDelta(text.into()),
        ProviderEvent::Finished(FinishReason::Stop),
        ProviderEvent::Done,
    ]
}

async fn drain(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

// ─── Streaming passthrough ────────────────────────────────────────────────────

#[tokio::test]
async fn plain_streaming_turn_persists_and_frames() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![vec![
        ProviderEvent::ContentDelta("Hello".into()),
        ProviderEvent::ContentDelta(" world".into()),
        ProviderEvent::Usage(chatforge_model::Usage {
            input_tokens: 3,
            output_tokens: 2,
            cache_read_tokens: 0,
        }),
        ProviderEvent::Finished(FinishReason::Stop),
        ProviderEvent::Done,
    ]]);
    let setup = setup_with(&f, Arc::new(provider), vec![]);
    let (tx, rx) = mpsc::channel(64);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.status, status::FINAL);
    assert_eq!(outcome.content, "Hello world");
    assert_eq!(outcome.usage.input_tokens, 3);

    let events = drain(rx).await;
    let deltas: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ContentDelta { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Hello", " world"]);

    // The persisted event log replays to the streamed body.
    let log = f.db.list_events(&f.user_id, &f.message_id).await.unwrap();
    let replayed: String = log
        .iter()
        .filter(|e| e.kind == event_kind::CONTENT_CHUNK)
        .filter_map(|e| e.payload["text"].as_str())
        .collect();
    assert_eq!(replayed, "Hello world");

    let msgs = f.db.list_messages(&f.user_id, &f.conversation_id).await.unwrap();
    let assistant = msgs.last().unwrap();
    assert_eq!(assistant.status, status::FINAL);
    assert_eq!(assistant.content_text, "Hello world");
}

// ─── Tool loop ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_tool_call_loops_back_to_model() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        tool_call_turn("get_time", "{}"),
        text_turn("It is noon."),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["get_time"]);
    let (tx, rx) = mpsc::channel(64);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.status, status::FINAL);
    assert_eq!(outcome.content, "It is noon.");
    assert_eq!(outcome.tool_calls.len(), 1);
    assert_eq!(outcome.tool_calls[0].call_index, 0);
    assert_eq!(outcome.tool_calls[0].status, "success");

    // SSE order: tool_call before tool_output before content.
    let events = drain(rx).await;
    let kinds: Vec<&str> = events
        .iter()
        .map(|e| match e {
            ChatEvent::ToolCall { .. } => "tool_call",
            ChatEvent::ToolOutput { .. } => "tool_output",
            ChatEvent::ContentDelta { .. } => "content_delta",
            _ => "other",
        })
        .collect();
    let tc = kinds.iter().position(|k| *k == "tool_call").unwrap();
    let to = kinds.iter().position(|k| *k == "tool_output").unwrap();
    let cd = kinds.iter().position(|k| *k == "content_delta").unwrap();
    assert!(tc < to && to < cd, "order was {kinds:?}");

    // tool_output payload carries the ISO timestamp.
    let payload = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ToolOutput { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(payload["now"], "2026-08-01T12:00:00Z");

    // Persisted events in order tool_call, tool_result, content_chunk.
    let log = f.db.list_events(&f.user_id, &f.message_id).await.unwrap();
    let kinds: Vec<&str> = log.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec![
        event_kind::TOOL_CALL,
        event_kind::TOOL_RESULT,
        event_kind::CONTENT_CHUNK,
    ]);

    // Tool call row persisted with index 0 and success status.
    let calls = f.db.list_tool_calls(&f.user_id, &f.message_id).await.unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call_index, 0);
    assert_eq!(calls[0].status, "success");
}

#[tokio::test]
async fn parallel_tool_outputs_are_index_ordered() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        vec![
            ProviderEvent::ToolCallDelta {
                index: 1,
                id: "call_b".into(),
                name: "get_time".into(),
                arguments: "{}".into(),
            },
            ProviderEvent::ToolCallDelta {
                index: 0,
                id: "call_a".into(),
                name: "get_time".into(),
                arguments: "{}".into(),
            },
            ProviderEvent::Finished(FinishReason::ToolCalls),
            ProviderEvent::Done,
        ],
        text_turn("done"),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["get_time"]);
    let (tx, rx) = mpsc::channel(64);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.tool_calls.len(), 2);
    let indices: Vec<i64> = outcome.tool_calls.iter().map(|c| c.call_index).collect();
    assert_eq!(indices, vec![0, 1], "rows must be contiguous from 0");

    let events = drain(rx).await;
    let output_order: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ToolOutput { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(output_order, vec![0, 1], "outputs follow call index, not completion order");
}

#[tokio::test]
async fn iteration_cap_forces_tool_free_wrap_up() {
    let f = fixture(OrchestratorLimits { max_iterations: 2, ..Default::default() }).await;
    // Scripted to want three tool batches; the cap allows two.
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_turn("get_time", "{}"),
        tool_call_turn("get_time", "{}"),
        tool_call_turn("get_time", "{}"),
        text_turn("summary"),
    ]));
    let setup = setup_with(&f, Arc::clone(&provider), vec!["get_time"]);
    let (tx, _rx) = mpsc::channel(256);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.tool_calls.len(), 2, "exactly two batches execute");

    // The third model call must carry tool_choice = none.
    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].tool_choice, ToolChoice::None);
    assert_eq!(seen[1].tool_choice, ToolChoice::Auto);
}

#[tokio::test]
async fn invalid_arguments_become_tool_output_not_failure() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        tool_call_turn("picky", "{}"), // missing required "query"
        text_turn("recovered"),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["picky"]);
    let (tx, rx) = mpsc::channel(64);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.status, status::FINAL, "validation failure must not abort the loop");
    assert_eq!(outcome.tool_calls[0].status, "error");

    let events = drain(rx).await;
    let payload = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ToolOutput { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(payload["error"], "invalid_arguments");
    assert!(payload["detail"].as_str().unwrap().contains("query"));
}

#[tokio::test]
async fn malformed_json_arguments_are_rejected_as_invalid() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        tool_call_turn("get_time", "{\"unterminated"),
        text_turn("ok"),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["get_time"]);
    let (tx, rx) = mpsc::channel(64);

    f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    let events = drain(rx).await;
    let payload = events
        .iter()
        .find_map(|e| match e {
            ChatEvent::ToolOutput { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(payload["error"], "invalid_arguments");
}

#[tokio::test]
async fn fragmented_arguments_reassemble_across_chunks() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        vec![
            ProviderEvent::ToolCallDelta {
                index: 0,
                id: "call_1".into(),
                name: "picky".into(),
                arguments: String::new(),
            },
            ProviderEvent::ToolCallDelta {
                index: 0,
                id: String::new(),
                name: String::new(),
                arguments: "{\"query\":".into(),
            },
            ProviderEvent::ToolCallDelta {
                index: 0,
                id: String::new(),
                name: String::new(),
                arguments: "\"x\"}".into(),
            },
            ProviderEvent::Finished(FinishReason::ToolCalls),
            ProviderEvent::Done,
        ],
        text_turn("done"),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["picky"]);
    let (tx, _rx) = mpsc::channel(256);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.tool_calls[0].status, "success");
    assert_eq!(outcome.tool_calls[0].arguments_json, "{\"query\":\"x\"}");
}

// ─── Text-offset tracking ─────────────────────────────────────────────────────

#[tokio::test]
async fn text_offset_records_position_in_prose() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        vec![
            ProviderEvent::ContentDelta("Checking the clock".into()), // 18 chars
            ProviderEvent::ToolCallDelta {
                index: 0,
                id: "call_1".into(),
                name: "get_time".into(),
                arguments: "{}".into(),
            },
            ProviderEvent::Finished(FinishReason::ToolCalls),
            ProviderEvent::Done,
        ],
        text_turn(" — it is noon."),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["get_time"]);
    let (tx, _rx) = mpsc::channel(256);

    let outcome = f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();
    assert_eq!(outcome.tool_calls[0].text_offset, 18);
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_mid_stream_checkpoints_and_aborts() {
    let f = fixture(OrchestratorLimits::default()).await;
    let cancel = CancellationToken::new();
    // First delta arrives, then cancellation fires before the stream ends.
    let provider = MockProvider::new(vec![vec![
        ProviderEvent::ContentDelta("partial".into()),
        ProviderEvent::ContentDelta(" answer".into()),
        ProviderEvent::Finished(FinishReason::Stop),
        ProviderEvent::Done,
    ]]);
    let setup = setup_with(&f, Arc::new(provider), vec![]);
    let request_ctx = RequestContext::new(
        f.user_id.clone(),
        f.conversation_id.clone(),
        "req-1",
        cancel.clone(),
    );
    cancel.cancel();
    let (tx, rx) = mpsc::channel(64);

    let outcome = f
        .orchestrator
        .run_streaming(setup, &request_ctx, tx)
        .await
        .unwrap();
    assert_eq!(outcome.status, status::ABORTED);

    let events = drain(rx).await;
    assert!(events.iter().any(|e| matches!(
        e,
        ChatEvent::Error { kind, .. } if kind == "aborted"
    )));

    let msgs = f.db.list_messages(&f.user_id, &f.conversation_id).await.unwrap();
    assert_eq!(msgs.last().unwrap().status, status::ABORTED);
}

#[tokio::test]
async fn cancel_during_tool_execution_stops_the_loop() {
    let f = fixture(OrchestratorLimits::default()).await;
    let cancel = CancellationToken::new();
    let provider = MockProvider::new(vec![
        tool_call_turn("slow", "{}"),
        text_turn("never reached"),
    ]);
    let setup = setup_with(&f, Arc::new(provider), vec!["slow"]);
    let request_ctx = RequestContext::new(
        f.user_id.clone(),
        f.conversation_id.clone(),
        "req-1",
        cancel.clone(),
    );
    let (tx, rx) = mpsc::channel(64);

    let cancel_after = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_after.cancel();
    });

    let outcome = f
        .orchestrator
        .run_streaming(setup, &request_ctx, tx)
        .await
        .unwrap();
    assert_eq!(outcome.status, status::ABORTED);
    // The slow tool observed the cancellation and reported an error result.
    assert_eq!(outcome.tool_calls[0].status, "error");
    drop(rx);
}

// ─── Buffered (JSON) path ─────────────────────────────────────────────────────

#[tokio::test]
async fn buffered_turn_with_tools_produces_final_message() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = MockProvider::new(vec![
        tool_call_turn("get_time", "{}"),
        text_turn("It is noon."),
    ]);
    let mut setup = setup_with(&f, Arc::new(provider), vec!["get_time"]);
    setup.request.stream = false;

    let outcome = f.orchestrator.run_buffered(setup, &ctx(&f)).await.unwrap();
    assert_eq!(outcome.status, status::FINAL);
    assert_eq!(outcome.content, "It is noon.");
    assert_eq!(outcome.tool_calls.len(), 1);

    // Events are journaled on the buffered path too.
    let log = f.db.list_events(&f.user_id, &f.message_id).await.unwrap();
    assert!(log.iter().any(|e| e.kind == event_kind::TOOL_CALL));
    assert!(log.iter().any(|e| e.kind == event_kind::TOOL_RESULT));
    assert!(log.iter().any(|e| e.kind == event_kind::CONTENT_CHUNK));
}

#[tokio::test]
async fn tool_results_are_fed_back_into_history() {
    let f = fixture(OrchestratorLimits::default()).await;
    let provider = Arc::new(MockProvider::new(vec![
        tool_call_turn("get_time", "{}"),
        text_turn("done"),
    ]));
    let setup = setup_with(&f, Arc::clone(&provider), vec!["get_time"]);
    let (tx, _rx) = mpsc::channel(256);

    f.orchestrator.run_streaming(setup, &ctx(&f), tx).await.unwrap();

    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    // Second call carries the assistant tool call and its result.
    let second = &seen[1].messages;
    assert!(second.iter().any(|m| matches!(
        &m.content,
        chatforge_model::MessageContent::ToolCall { .. }
    )));
    assert!(second.iter().any(|m| matches!(
        &m.content,
        chatforge_model::MessageContent::ToolResult { content, .. } if content.contains("12:00")
    )));
}
