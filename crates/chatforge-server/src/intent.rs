// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The intent envelope: every mutation names its operation, carries the
//! optimistic-lock token, and is validated against a type-specific shape
//! before anything touches the database.  Legacy (envelope-less) request
//! formats are rejected with `error_code = intent_required`.

use serde::Deserialize;
use serde_json::Value;

use chatforge_core::ApiError;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub intent: Option<IntentEnvelope>,
    /// Conversation to append to; absent on the first message, which
    /// creates one.
    pub conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IntentEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_operation: Option<String>,
    pub expected_last_seq: Option<i64>,
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
    pub completion: Option<CompletionParams>,
    pub message_id: Option<String>,
    pub content: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: Value,
    pub client_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionParams {
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// Tool *names*; resolution against the registry happens in the
    /// strategy selector.
    #[serde(default)]
    pub tools: Vec<String>,
    pub provider_id: Option<String>,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
    pub custom_request_params_id: Option<String>,
    /// Free-form parameters merged verbatim into the upstream body.
    #[serde(default)]
    pub custom_params: Value,
}

/// A validated `append_message` intent.
#[derive(Debug)]
pub struct AppendIntent {
    pub expected_last_seq: i64,
    pub messages: Vec<IncomingMessage>,
    pub completion: CompletionParams,
}

/// A validated `edit_message` intent.
#[derive(Debug)]
pub struct EditIntent {
    pub expected_last_seq: i64,
    pub message_id: String,
    pub content: Value,
}

fn intent_required() -> ApiError {
    ApiError::validation("request must carry an intent envelope").with_code("intent_required")
}

/// Validate the chat-completions body into an append intent.
pub fn validate_append(body: ChatBody) -> Result<(AppendIntent, Option<String>), ApiError> {
    let intent = body.intent.ok_or_else(intent_required)?;
    if intent.kind != "append_message" {
        return Err(ApiError::validation(format!(
            "unsupported intent type '{}' for this route",
            intent.kind
        )));
    }
    let expected_last_seq = intent
        .expected_last_seq
        .ok_or_else(|| ApiError::validation("intent.expected_last_seq is required"))?;
    if expected_last_seq < 0 {
        return Err(ApiError::validation("intent.expected_last_seq must be non-negative"));
    }
    if intent.messages.is_empty() {
        return Err(ApiError::validation("intent.messages must not be empty"));
    }
    for m in &intent.messages {
        if m.role != "user" && m.role != "system" {
            return Err(ApiError::validation(format!(
                "cannot append a message with role '{}'",
                m.role
            )));
        }
    }
    let completion = intent
        .completion
        .ok_or_else(|| ApiError::validation("intent.completion is required"))?;
    if completion.model.as_deref().map_or(true, str::is_empty) {
        return Err(ApiError::validation("intent.completion.model is required"));
    }
    Ok((
        AppendIntent { expected_last_seq, messages: intent.messages, completion },
        body.conversation_id,
    ))
}

/// Validate an edit-message envelope.
pub fn validate_edit(intent: Option<IntentEnvelope>) -> Result<EditIntent, ApiError> {
    let intent = intent.ok_or_else(intent_required)?;
    if intent.kind != "edit_message" {
        return Err(ApiError::validation(format!(
            "unsupported intent type '{}' for this route",
            intent.kind
        )));
    }
    let expected_last_seq = intent
        .expected_last_seq
        .ok_or_else(|| ApiError::validation("intent.expected_last_seq is required"))?;
    let message_id = intent
        .message_id
        .ok_or_else(|| ApiError::validation("intent.message_id is required"))?;
    let content = intent
        .content
        .ok_or_else(|| ApiError::validation("intent.content is required"))?;
    Ok(EditIntent { expected_last_seq, message_id, content })
}

/// Split a wire content value (string or mixed-part array) into canonical
/// plain text plus the structured form when parts are present.
pub fn split_content(content: &Value) -> (String, Option<Value>) {
    match content {
        Value::String(s) => (s.clone(), None),
        Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| {
                    if p["type"] == "text" {
                        p["text"].as_str()
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            (text, Some(content.clone()))
        }
        other => (other.to_string(), None),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
