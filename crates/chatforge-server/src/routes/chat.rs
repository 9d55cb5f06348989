// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! `POST /v1/chat/completions` — the request pipeline.
//!
//! Validates the intent envelope, resolves the provider, appends the user
//! message under the optimistic lock, classifies the request into one of the
//! four strategies, and either returns a buffered JSON completion or hands a
//! channel to the SSE framer while the orchestrator runs.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use chatforge_core::{
    select, ApiError, ChatEvent, ErrorKind, Orchestrator, OrchestratorLimits, RequestContext,
    Strategy, TurnOutcome, TurnSetup,
};
use chatforge_db::{Conversation, ConversationSettings, MessageRow};
use chatforge_model::{
    ChatMessage, CompletionRequest, HttpProvider, ProviderConfig, ProviderKind, Role, ToolSpec,
};

use crate::auth::Principal;
use crate::error::HttpError;
use crate::intent::{self, AppendIntent, ChatBody, CompletionParams};
use crate::sse::sse_response;
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(user): Principal,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Response, HttpError> {
    let body: ChatBody = serde_json::from_value(raw)
        .map_err(|e| ApiError::validation(format!("malformed request body: {e}")))?;
    let (intent, conversation_id) = intent::validate_append(body).map_err(remap_conflict)?;

    // Conversation: explicit id, or created on the first user message.
    let conversation = match conversation_id {
        Some(id) => state.db.get_conversation(&user.id, &id).await?,
        None => {
            let settings = settings_from(&intent.completion);
            state.db.create_conversation(&user.id, None, settings).await?
        }
    };

    // Provider resolution: explicit id (body, then header) wins over the
    // conversation snapshot, which wins over the user default.
    let provider_id = intent
        .completion
        .provider_id
        .clone()
        .or_else(|| header_str(&headers, "x-provider-id"))
        .or_else(|| conversation.settings.provider_id.clone());
    let record = match provider_id {
        Some(id) => state.db.get_provider(&user.id, &id).await?,
        None => state
            .db
            .default_provider(&user.id)
            .await?
            .ok_or_else(|| ApiError::validation("no provider configured for this user"))?,
    };
    if !record.enabled {
        return Err(ApiError::validation("provider is disabled").into());
    }
    let kind = ProviderKind::parse(&record.provider_type)
        .ok_or_else(|| ApiError::validation(format!("unknown provider type {}", record.provider_type)))?;
    let api_key = state.db.provider_api_key(&user.id, &record.id).await?;
    let provider_config = ProviderConfig {
        id: record.id.clone(),
        kind,
        base_url: record.base_url.clone(),
        api_key,
        extra_headers: record.extra_headers.clone(),
        metadata: record.metadata.clone(),
    };
    let connect_timeout = Duration::from_secs(state.config.orchestrator.connect_timeout_secs);
    let provider = HttpProvider::new(provider_config, connect_timeout).map_err(ApiError::from)?;
    let caps = provider.caps();

    // Abort registration, keyed by the client-supplied request id.
    let request_id = header_str(&headers, "x-client-request-id")
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let guard = state.abort.register(&user.id, &request_id)?;
    let ctx = RequestContext::new(
        user.id.clone(),
        conversation.id.clone(),
        request_id.clone(),
        guard.token(),
    );

    // Append the new user message(s) under the optimistic lock.  A stale
    // token surfaces as validation_error/conflict on this endpoint.
    let mut expected = intent.expected_last_seq;
    for msg in &intent.messages {
        let (text, json_form) = intent::split_content(&msg.content);
        let client_message_id = msg
            .client_message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        state
            .db
            .append_user_message(
                &conversation.id,
                &user.id,
                expected,
                text,
                json_form,
                client_message_id,
            )
            .await
            .map_err(|e| remap_conflict(e.into()))?;
        expected += 1;
    }

    // Strategy classification (unusable tools are dropped, not fatal).
    let (strategy, usable_tools) = select(intent.completion.stream, &intent.completion.tools, &state.tools);

    let model = intent
        .completion
        .model
        .clone()
        .unwrap_or_default();
    let history = build_history(&state, &user.id, &conversation).await?;
    let request = build_completion_request(&intent, &conversation, history, &usable_tools, &state);

    let assistant = state
        .db
        .begin_assistant_message(
            &conversation.id,
            &user.id,
            Some(record.id.clone()),
            Some(model.clone()),
        )
        .await?;

    let limits = limits_for(&state, &user.id).await;
    let orchestrator = Orchestrator::new(state.db.clone(), Arc::clone(&state.tools), limits);
    let setup = TurnSetup {
        provider: Arc::new(provider),
        caps,
        request,
        message_id: assistant.id.clone(),
    };

    let span = info_span!(
        "chat_request",
        request_id = %request_id,
        conversation_id = %conversation.id,
        provider = %record.id,
        model = %model,
        strategy = ?strategy,
    );

    match strategy {
        Strategy::Direct | Strategy::ToolsUnified => {
            // Guard lives to the end of this scope: the registry entry is
            // removed on every exit path.
            let _guard = guard;
            let outcome = orchestrator
                .run_buffered(setup, &ctx)
                .instrument(span)
                .await
                .map_err(remap_conflict)?;
            persist_provider_state(&state, &user.id, &conversation.id, &outcome).await;
            Ok(Json(completion_json(&conversation, &assistant, &model, &outcome)).into_response())
        }
        Strategy::Streaming | Strategy::ToolsIterative => {
            let (tx, rx) = mpsc::channel::<ChatEvent>(256);
            let error_tx = tx.clone();
            let stream_state = state.clone();
            let user_id = user.id.clone();
            let conversation_id = conversation.id.clone();
            let cancel = ctx.cancel.clone();
            tokio::spawn(
                async move {
                    // The guard moves into the task so the abort entry stays
                    // registered for the lifetime of the stream.
                    let _guard = guard;
                    match orchestrator.run_streaming(setup, &ctx, tx).await {
                        Ok(outcome) => {
                            persist_provider_state(
                                &stream_state,
                                &user_id,
                                &conversation_id,
                                &outcome,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(error = %e, "streaming turn failed");
                            let _ = error_tx
                                .send(ChatEvent::Error {
                                    kind: e.kind.as_str().into(),
                                    message: e.message,
                                })
                                .await;
                        }
                    }
                }
                .instrument(span),
            );
            Ok(sse_response(rx, cancel).into_response())
        }
    }
}

/// `POST /v1/chat/completions/stop` — signal a running request.
#[derive(serde::Deserialize)]
pub struct StopBody {
    pub request_id: String,
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(user): Principal,
    Json(body): Json<StopBody>,
) -> Json<Value> {
    let stopped = state.abort.signal(&user.id, &body.request_id);
    Json(json!({ "stopped": stopped }))
}

/// Optimistic-lock failures on this endpoint serialize as
/// `validation_error` + `error_code="conflict"` per the endpoint contract;
/// the taxonomy's 409 `conflict` kind is reserved for the edit route.
fn remap_conflict(e: ApiError) -> ApiError {
    if e.kind == ErrorKind::Conflict {
        ApiError::validation(e.message).with_code("conflict")
    } else {
        e
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn settings_from(completion: &CompletionParams) -> ConversationSettings {
    ConversationSettings {
        model: completion.model.clone(),
        provider_id: completion.provider_id.clone(),
        system_prompt: None,
        tools_enabled: !completion.tools.is_empty(),
        streaming_enabled: completion.stream,
        reasoning_effort: completion.reasoning_effort.clone(),
        verbosity: completion.verbosity.clone(),
        quality_level: None,
        custom_params_id: completion.custom_request_params_id.clone(),
    }
}

/// Reconstruct the canonical history for the model from persisted rows:
/// the conversation's system prompt followed by every live user/assistant
/// message in sequence order.
async fn build_history(
    state: &AppState,
    user_id: &str,
    conversation: &Conversation,
) -> Result<Vec<ChatMessage>, ApiError> {
    let mut history = Vec::new();
    if let Some(system) = &conversation.settings.system_prompt {
        if !system.is_empty() {
            history.push(ChatMessage::system(system.clone()));
        }
    }
    let rows = state.db.list_messages(user_id, &conversation.id).await?;
    for row in rows {
        if row.content_text.is_empty() {
            continue;
        }
        match row.role.as_str() {
            "user" => history.push(ChatMessage::user(row.content_text)),
            "assistant" => history.push(ChatMessage::assistant(row.content_text)),
            _ => {}
        }
    }
    Ok(history)
}

fn build_completion_request(
    intent: &AppendIntent,
    conversation: &Conversation,
    history: Vec<ChatMessage>,
    usable_tools: &[String],
    state: &AppState,
) -> CompletionRequest {
    let tools: Vec<ToolSpec> = state
        .tools
        .schemas_for(usable_tools)
        .into_iter()
        .map(|s| ToolSpec { name: s.name, description: s.description, parameters: s.parameters })
        .collect();
    let previous_response_id = conversation
        .provider_state
        .as_ref()
        .and_then(|s| s["previous_response_id"].as_str())
        .map(str::to_string);

    CompletionRequest {
        model: intent.completion.model.clone().unwrap_or_default(),
        messages: history,
        tools,
        stream: intent.completion.stream,
        reasoning_effort: intent
            .completion
            .reasoning_effort
            .clone()
            .or_else(|| conversation.settings.reasoning_effort.clone()),
        verbosity: intent
            .completion
            .verbosity
            .clone()
            .or_else(|| conversation.settings.verbosity.clone()),
        previous_response_id,
        extra_params: intent.completion.custom_params.clone(),
        ..Default::default()
    }
}

async fn limits_for(state: &AppState, user_id: &str) -> OrchestratorLimits {
    let settings = state.db.get_user_settings(user_id).await.unwrap_or_default();
    OrchestratorLimits {
        max_iterations: settings
            .max_tool_iterations
            .unwrap_or(state.config.orchestrator.max_tool_iterations)
            .clamp(1, 50),
        stream_idle_timeout: Duration::from_secs(
            state.config.orchestrator.stream_idle_timeout_secs,
        ),
        tool_timeout: Duration::from_secs(state.config.orchestrator.tool_timeout_secs),
    }
}

/// Record the Responses-API continuity token minted this turn.
async fn persist_provider_state(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
    outcome: &TurnOutcome,
) {
    if let Some(response_id) = &outcome.response_id {
        if let Err(e) = state
            .db
            .set_provider_state(user_id, conversation_id, Some(response_id.clone()))
            .await
        {
            warn!(error = %e, "failed to persist provider state");
        }
    }
}

/// OpenAI-shaped completion response with the conversation id attached so
/// clients can follow up.
fn completion_json(
    conversation: &Conversation,
    assistant: &MessageRow,
    model: &str,
    outcome: &TurnOutcome,
) -> Value {
    let tool_calls: Vec<Value> = outcome
        .tool_calls
        .iter()
        .map(|tc| {
            json!({
                "index": tc.call_index,
                "type": "function",
                "function": { "name": tc.tool_name, "arguments": tc.arguments_json },
            })
        })
        .collect();
    let mut message = json!({
        "role": Role::Assistant.as_str(),
        "content": outcome.content,
    });
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    json!({
        "id": format!("chatcmpl-{}", assistant.client_message_id),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": if tool_calls.is_empty() { "stop" } else { "tool_calls" },
        }],
        "usage": {
            "prompt_tokens": outcome.usage.input_tokens,
            "completion_tokens": outcome.usage.output_tokens,
            "total_tokens": outcome.usage.input_tokens + outcome.usage.output_tokens,
        },
        "conversation_id": conversation.id,
        "message_id": assistant.client_message_id,
    })
}
