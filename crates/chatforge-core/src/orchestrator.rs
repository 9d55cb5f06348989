// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The iterative tool orchestrator: drives the model↔tool loop.
//!
//! One instance serves all requests; per-request state lives on the stack of
//! [`Orchestrator::run_streaming`] / [`Orchestrator::run_buffered`].  Every
//! model event is simultaneously framed (sent to the SSE channel) and
//! journaled (appended to the message event log); tool calls issued in one
//! assistant turn execute in parallel under a per-user concurrency bound and
//! their outputs are emitted in call-index order regardless of completion
//! order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use chatforge_db::{event_kind, status, Db, ToolCallRow};
use chatforge_model::{
    sanitize, ChatMessage, CompletionRequest, FinishReason, ModelProvider, ProviderCaps,
    ProviderError, ProviderEvent, ToolChoice, Usage,
};
use chatforge_tools::{ToolCall, ToolContext, ToolOutput, ToolRegistry};

use crate::context::RequestContext;
use crate::error::{ApiError, ErrorKind};
use crate::events::ChatEvent;

/// Flush buffered message events to durable storage every this many events.
const CHECKPOINT_EVERY: usize = 32;

/// Limits governing one orchestrated turn.
#[derive(Debug, Clone)]
pub struct OrchestratorLimits {
    /// Model↔tool iteration cap (clamped to 1–50 at use sites).  Also the
    /// per-user tool concurrency bound.
    pub max_iterations: u32,
    pub stream_idle_timeout: Duration,
    pub tool_timeout: Duration,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            stream_idle_timeout: Duration::from_secs(60),
            tool_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything the orchestrator needs for one turn.
pub struct TurnSetup {
    pub provider: Arc<dyn ModelProvider>,
    pub caps: ProviderCaps,
    /// Canonical request with the full history (system + prior turns + the
    /// new user message) and the usable tool specs already attached.
    pub request: CompletionRequest,
    /// The assistant placeholder created by the persistence coordinator.
    pub message_id: String,
}

/// Result of a completed (or aborted) turn, after the assistant message was
/// finalized.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Terminal message status (`final`, `aborted`).
    pub status: &'static str,
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallRow>,
    /// Responses-API continuity token minted this turn, if any.
    pub response_id: Option<String>,
}

/// A tool call under assembly from streamed fragments.
#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    /// Character position in the cumulative assistant text at the moment the
    /// last fragment arrived — used on replay to re-interleave the call with
    /// prose.
    text_offset: usize,
}

/// A fully assembled call ready for execution.
#[derive(Debug, Clone)]
struct PlannedCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
    text_offset: usize,
}

pub struct Orchestrator {
    db: Db,
    tools: Arc<ToolRegistry>,
    limits: OrchestratorLimits,
}

/// Running accumulation for the assistant message being produced.
struct TurnState {
    message_id: String,
    content: String,
    reasoning: String,
    usage: Usage,
    response_id: Option<String>,
    tool_rows: Vec<ToolCallRow>,
    events_since_checkpoint: usize,
}

impl TurnState {
    fn new(message_id: String) -> Self {
        Self {
            message_id,
            content: String::new(),
            reasoning: String::new(),
            usage: Usage::default(),
            response_id: None,
            tool_rows: Vec::new(),
            events_since_checkpoint: 0,
        }
    }

    fn reasoning_value(&self) -> Option<Value> {
        (!self.reasoning.is_empty()).then(|| json!([{ "text": self.reasoning }]))
    }

    fn usage_value(&self) -> Option<Value> {
        serde_json::to_value(self.usage).ok()
    }
}

impl Orchestrator {
    pub fn new(db: Db, tools: Arc<ToolRegistry>, limits: OrchestratorLimits) -> Self {
        Self { db, tools, limits }
    }

    fn iteration_cap(&self) -> u32 {
        self.limits.max_iterations.clamp(1, 50)
    }

    /// Journal one event, flushing to durable storage periodically.
    async fn journal(&self, state: &mut TurnState, kind: &str, payload: Value) {
        if let Err(e) = self.db.append_event(&state.message_id, kind, payload).await {
            warn!(message_id = %state.message_id, error = %e, "event journaling failed");
            return;
        }
        state.events_since_checkpoint += 1;
        if state.events_since_checkpoint >= CHECKPOINT_EVERY {
            state.events_since_checkpoint = 0;
            if let Err(e) = self.db.checkpoint(&state.message_id).await {
                warn!(message_id = %state.message_id, error = %e, "checkpoint failed");
            }
        }
    }

    /// Open the upstream stream, retrying once per iteration on network and
    /// 5xx-class failures.
    async fn open_stream_with_retry(
        &self,
        provider: &dyn ModelProvider,
        req: CompletionRequest,
    ) -> Result<chatforge_model::EventStream, ProviderError> {
        match provider.stream(req.clone()).await {
            Ok(s) => Ok(s),
            Err(e) if is_retriable(&e) => {
                warn!(error = %e, "provider stream failed; retrying once");
                tokio::time::sleep(Duration::from_millis(500)).await;
                provider.stream(req).await
            }
            Err(e) => Err(e),
        }
    }

    async fn request_with_retry(
        &self,
        provider: &dyn ModelProvider,
        req: CompletionRequest,
    ) -> Result<chatforge_model::CompletionResponse, ProviderError> {
        match provider.request(req.clone()).await {
            Ok(r) => Ok(r),
            Err(e) if is_retriable(&e) => {
                warn!(error = %e, "provider request failed; retrying once");
                tokio::time::sleep(Duration::from_millis(500)).await;
                provider.request(req).await
            }
            Err(e) => Err(e),
        }
    }

    /// Streaming turn: used for both plain streaming passthrough (no tools)
    /// and the iterative tool loop.
    pub async fn run_streaming(
        &self,
        setup: TurnSetup,
        ctx: &RequestContext,
        tx: mpsc::Sender<ChatEvent>,
    ) -> Result<TurnOutcome, ApiError> {
        let cap = self.iteration_cap();
        let semaphore = Arc::new(Semaphore::new(cap as usize));
        let mut state = TurnState::new(setup.message_id.clone());
        let mut history = setup.request.messages.clone();
        let mut iterations: u32 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return self.abort_turn(state, &tx).await;
            }

            let forced_wrap_up = iterations >= cap;
            let req = self.build_iteration_request(&setup, &history, &state, forced_wrap_up, true);

            let mut stream = match self.open_stream_with_retry(&*setup.provider, req).await {
                Ok(s) => s,
                Err(e) => return Err(self.fail_turn(state, e.into()).await),
            };

            let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
            let mut finish: Option<FinishReason> = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => {
                        return self.abort_turn(state, &tx).await;
                    }
                    item = tokio::time::timeout(
                        self.limits.stream_idle_timeout,
                        stream.next(),
                    ) => item,
                };
                let event = match next {
                    Err(_) => {
                        let e = ApiError::new(
                            ErrorKind::ProviderError,
                            "upstream stream stalled",
                        );
                        return Err(self.fail_turn(state, e).await);
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => return Err(self.fail_turn(state, e.into()).await),
                    Ok(Some(Ok(ev))) => ev,
                };

                match event {
                    ProviderEvent::ContentDelta(text) => {
                        state.content.push_str(&text);
                        self.journal(
                            &mut state,
                            event_kind::CONTENT_CHUNK,
                            json!({ "text": &text }),
                        )
                        .await;
                        self.emit(ctx, &tx, ChatEvent::ContentDelta { text }).await;
                    }
                    ProviderEvent::ReasoningDelta(text) => {
                        state.reasoning.push_str(&text);
                        self.journal(
                            &mut state,
                            event_kind::REASONING_CHUNK,
                            json!({ "text": &text }),
                        )
                        .await;
                        self.emit(ctx, &tx, ChatEvent::ReasoningDelta { text }).await;
                    }
                    ProviderEvent::ToolCallDelta { index, id, name, arguments } => {
                        let p = pending.entry(index).or_default();
                        if !id.is_empty() {
                            p.id = id;
                        }
                        if !name.is_empty() {
                            p.name = name;
                        }
                        p.arguments.push_str(&arguments);
                        p.text_offset = state.content.len();
                        self.emit(
                            ctx,
                            &tx,
                            ChatEvent::ToolCall {
                                id: p.id.clone(),
                                index,
                                name: p.name.clone(),
                                arguments_fragment: arguments,
                            },
                        )
                        .await;
                    }
                    ProviderEvent::Usage(u) => {
                        state.usage.accumulate(&u);
                        self.emit(
                            ctx,
                            &tx,
                            ChatEvent::Usage {
                                input_tokens: u.input_tokens,
                                output_tokens: u.output_tokens,
                                cache_read_tokens: u.cache_read_tokens,
                            },
                        )
                        .await;
                    }
                    ProviderEvent::ResponseId(id) => state.response_id = Some(id),
                    ProviderEvent::Finished(reason) => finish = Some(reason),
                    ProviderEvent::Done => break,
                    ProviderEvent::Error(msg) => {
                        warn!(message_id = %state.message_id, "upstream stream warning: {msg}");
                    }
                }
            }

            let calls = assemble_calls(pending);
            let wants_tools =
                finish == Some(FinishReason::ToolCalls) && !calls.is_empty() && !forced_wrap_up;
            if !wants_tools {
                break;
            }

            self.run_tool_batch(&calls, &mut state, &mut history, ctx, &semaphore, Some(&tx))
                .await;
            iterations += 1;
        }

        self.finish_turn(state).await
    }

    /// Buffered (non-streaming) turn: used for direct passthrough and the
    /// unified tools+JSON strategy.  Events are journaled exactly as in the
    /// streaming path so replay semantics are identical.
    pub async fn run_buffered(
        &self,
        setup: TurnSetup,
        ctx: &RequestContext,
    ) -> Result<TurnOutcome, ApiError> {
        let cap = self.iteration_cap();
        let semaphore = Arc::new(Semaphore::new(cap as usize));
        let mut state = TurnState::new(setup.message_id.clone());
        let mut history = setup.request.messages.clone();
        let mut iterations: u32 = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return self.abort_turn_silent(state).await;
            }

            let forced_wrap_up = iterations >= cap;
            let req = self.build_iteration_request(&setup, &history, &state, forced_wrap_up, false);

            let resp = match self.request_with_retry(&*setup.provider, req).await {
                Ok(r) => r,
                Err(e) => return Err(self.fail_turn(state, e.into()).await),
            };

            if !resp.content.is_empty() {
                state.content.push_str(&resp.content);
                self.journal(
                    &mut state,
                    event_kind::CONTENT_CHUNK,
                    json!({ "text": &resp.content }),
                )
                .await;
            }
            if let Some(reasoning) = &resp.reasoning {
                state.reasoning.push_str(reasoning);
                self.journal(
                    &mut state,
                    event_kind::REASONING_CHUNK,
                    json!({ "text": reasoning }),
                )
                .await;
            }
            state.usage.accumulate(&resp.usage);
            if resp.response_id.is_some() {
                state.response_id = resp.response_id.clone();
            }

            let calls: Vec<PlannedCall> = resp
                .tool_calls
                .iter()
                .map(|tc| PlannedCall {
                    index: tc.index,
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: tc.arguments.clone(),
                    text_offset: state.content.len(),
                })
                .collect();
            let wants_tools = resp.finish_reason == Some(FinishReason::ToolCalls)
                && !calls.is_empty()
                && !forced_wrap_up;
            if !wants_tools {
                break;
            }

            self.run_tool_batch(&calls, &mut state, &mut history, ctx, &semaphore, None)
                .await;
            iterations += 1;
        }

        self.finish_turn(state).await
    }

    fn build_iteration_request(
        &self,
        setup: &TurnSetup,
        history: &[ChatMessage],
        state: &TurnState,
        forced_wrap_up: bool,
        stream: bool,
    ) -> CompletionRequest {
        let mut req = setup.request.clone();
        req.messages = history.to_vec();
        req.stream = stream;
        // At the cap the model gets one final turn with tools disabled so it
        // can summarize instead of stopping mid-plan.
        req.tool_choice = if forced_wrap_up { ToolChoice::None } else { ToolChoice::Auto };
        // Later iterations continue from the freshest continuity token.
        if state.response_id.is_some() {
            req.previous_response_id = state.response_id.clone();
        }
        sanitize::strip_unsupported(req, &setup.caps)
    }

    /// Execute one batch of tool calls: journal the calls, run them in
    /// parallel under the concurrency bound, then journal/emit results and
    /// extend the history — all in call-index order.
    async fn run_tool_batch(
        &self,
        calls: &[PlannedCall],
        state: &mut TurnState,
        history: &mut Vec<ChatMessage>,
        ctx: &RequestContext,
        semaphore: &Arc<Semaphore>,
        tx: Option<&mpsc::Sender<ChatEvent>>,
    ) {
        for call in calls {
            self.journal(
                state,
                event_kind::TOOL_CALL,
                json!({
                    "id": &call.id,
                    "index": call.index,
                    "name": &call.name,
                    "arguments": &call.arguments,
                    "text_offset": call.text_offset,
                }),
            )
            .await;
            history.push(ChatMessage::tool_call(&call.id, &call.name, &call.arguments));
        }

        let results = self.execute_calls(calls, ctx, semaphore).await;

        for (call, output, started_at, completed_at) in results {
            let payload = payload_of(&output);
            self.journal(
                state,
                event_kind::TOOL_RESULT,
                json!({
                    "id": &call.id,
                    "index": call.index,
                    "payload": &payload,
                    "is_error": output.is_error,
                }),
            )
            .await;
            if let Some(tx) = tx {
                self.emit(
                    ctx,
                    tx,
                    ChatEvent::ToolOutput { id: call.id.clone(), index: call.index, payload },
                )
                .await;
            }
            history.push(ChatMessage::tool_result(&call.id, &output.content));
            state.tool_rows.push(ToolCallRow {
                call_index: call.index as i64,
                tool_name: call.name.clone(),
                arguments_json: call.arguments.clone(),
                text_offset: call.text_offset as i64,
                status: if output.is_error { "error".into() } else { "success".into() },
                output_ref: Some(output.content),
                started_at: Some(started_at),
                completed_at: Some(completed_at),
            });
        }
    }

    /// Run the calls concurrently, each behind a semaphore permit, a
    /// wall-clock cap, and the request's cancellation token.  Results come
    /// back in call-index order.  Tool failures are never retried; the error
    /// becomes the tool's result so the model can react.
    async fn execute_calls(
        &self,
        calls: &[PlannedCall],
        ctx: &RequestContext,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<(PlannedCall, ToolOutput, String, String)> {
        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls {
            let call = call.clone();
            let tools = Arc::clone(&self.tools);
            let semaphore = Arc::clone(semaphore);
            let tool_timeout = self.limits.tool_timeout;
            let tool_ctx = ToolContext {
                user_id: ctx.user_id.clone(),
                conversation_id: ctx.conversation_id.clone(),
                request_id: ctx.request_id.clone(),
                cancel: ctx.cancel.clone(),
            };
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started_at = chrono::Utc::now().to_rfc3339();

                let args: Value = if call.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&call.arguments) {
                        Ok(v) => v,
                        Err(e) => {
                            let output = ToolOutput::invalid_arguments(
                                &call.id,
                                format!("arguments are not valid JSON: {e}"),
                            );
                            let completed_at = chrono::Utc::now().to_rfc3339();
                            return (call, output, started_at, completed_at);
                        }
                    }
                };
                let tool_call = ToolCall { id: call.id.clone(), name: call.name.clone(), args };

                let output = if let Err(detail) = tools.validate(&tool_call) {
                    ToolOutput::invalid_arguments(&tool_call.id, detail)
                } else {
                    tokio::select! {
                        biased;
                        _ = tool_ctx.cancel.cancelled() => {
                            ToolOutput::err(&tool_call.id, "tool cancelled")
                        }
                        result = tokio::time::timeout(
                            tool_timeout,
                            tools.execute(&tool_call, &tool_ctx),
                        ) => match result {
                            Ok(out) => out,
                            Err(_) => ToolOutput::err(&tool_call.id, "tool timed out"),
                        },
                    }
                };
                let completed_at = chrono::Utc::now().to_rfc3339();
                (call, output, started_at, completed_at)
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let result = match task.await {
                Ok(r) => r,
                Err(e) => {
                    let call = calls[i].clone();
                    let output = ToolOutput::err(&call.id, format!("tool panicked: {e}"));
                    let now = chrono::Utc::now().to_rfc3339();
                    (call, output, now.clone(), now)
                }
            };
            results.push(result);
        }
        results.sort_by_key(|(call, ..)| call.index);
        results
    }

    async fn emit(&self, ctx: &RequestContext, tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
        // A closed channel means the client side is gone; fold that into the
        // cancellation path checked at the next suspension point.
        if tx.send(event).await.is_err() {
            ctx.cancel.cancel();
        }
    }

    /// Successful completion: final checkpoint plus the terminal transition,
    /// with canonical content and tool-call rows derived from the turn.
    async fn finish_turn(&self, state: TurnState) -> Result<TurnOutcome, ApiError> {
        let reasoning = state.reasoning_value();
        let usage = state.usage_value();
        self.db
            .finalize_message(
                &state.message_id,
                status::FINAL,
                state.content.clone(),
                None,
                reasoning,
                usage,
                state.tool_rows.clone(),
            )
            .await?;
        debug!(message_id = %state.message_id, "assistant message finalized");
        Ok(TurnOutcome {
            status: status::FINAL,
            content: state.content,
            reasoning: (!state.reasoning.is_empty()).then_some(state.reasoning),
            usage: state.usage,
            tool_calls: state.tool_rows,
            response_id: state.response_id,
        })
    }

    /// Cancellation: persist everything accumulated so far (checkpoint
    /// flush), finalize as `aborted`, and tell the client.
    async fn abort_turn(
        &self,
        state: TurnState,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<TurnOutcome, ApiError> {
        let _ = self
            .db
            .append_event(&state.message_id, event_kind::ERROR, json!({ "kind": "aborted" }))
            .await;
        let _ = tx
            .send(ChatEvent::Error { kind: "aborted".into(), message: "request aborted".into() })
            .await;
        self.abort_turn_silent(state).await
    }

    async fn abort_turn_silent(&self, state: TurnState) -> Result<TurnOutcome, ApiError> {
        let reasoning = state.reasoning_value();
        let usage = state.usage_value();
        if let Err(e) = self
            .db
            .finalize_message(
                &state.message_id,
                status::ABORTED,
                state.content.clone(),
                None,
                reasoning,
                usage,
                state.tool_rows.clone(),
            )
            .await
        {
            warn!(message_id = %state.message_id, error = %e, "abort finalize failed");
        }
        Ok(TurnOutcome {
            status: status::ABORTED,
            content: state.content,
            reasoning: (!state.reasoning.is_empty()).then_some(state.reasoning),
            usage: state.usage,
            tool_calls: state.tool_rows,
            response_id: state.response_id,
        })
    }

    /// Unrecoverable failure: journal the error event, finalize as `error`,
    /// and hand the classified error back to the pipeline.
    async fn fail_turn(&self, state: TurnState, error: ApiError) -> ApiError {
        let _ = self
            .db
            .append_event(
                &state.message_id,
                event_kind::ERROR,
                json!({ "kind": error.kind.as_str(), "message": &error.message }),
            )
            .await;
        let reasoning = state.reasoning_value();
        let usage = state.usage_value();
        if let Err(e) = self
            .db
            .finalize_message(
                &state.message_id,
                status::ERROR,
                state.content.clone(),
                None,
                reasoning,
                usage,
                state.tool_rows.clone(),
            )
            .await
        {
            warn!(message_id = %state.message_id, error = %e, "error finalize failed");
        }
        error
    }
}

fn is_retriable(e: &ProviderError) -> bool {
    match e {
        ProviderError::Network(_) | ProviderError::Timeout => true,
        ProviderError::Upstream { status, .. } => *status >= 500,
        _ => false,
    }
}

fn payload_of(output: &ToolOutput) -> Value {
    serde_json::from_str(&output.content).unwrap_or(Value::String(output.content.clone()))
}

/// Flush accumulated parallel tool calls, ordered by provider index and
/// re-numbered densely from 0.  Calls with an empty name cannot be
/// dispatched and are dropped; an empty id gets a synthetic fallback.
fn assemble_calls(pending: BTreeMap<u32, PendingCall>) -> Vec<PlannedCall> {
    let mut calls = Vec::with_capacity(pending.len());
    for (i, (_, p)) in pending.into_iter().enumerate() {
        if p.name.is_empty() {
            warn!(tool_call_id = %p.id, "dropping tool call with empty name from model");
            continue;
        }
        let id = if p.id.is_empty() { format!("tc_synthetic_{i}") } else { p.id };
        calls.push(PlannedCall {
            index: calls.len() as u32,
            id,
            name: p.name,
            arguments: p.arguments,
            text_offset: p.text_offset,
        });
    }
    calls
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
