// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini wire dialect — Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent?alt=sse` endpoints.
//! Auth travels in the `x-goog-api-key` header.  Model listing at
//! `/v1beta/models` returns names prefixed `models/`, which the provider
//! strips before surfacing them.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::{
    CompletionRequest, ContentPart, FinishReason, MessageContent, ProviderEvent, Role, Usage,
};

/// Per-stream translation state.
///
/// Gemini sends each function call as a single complete part (no fragment
/// accumulation), but parallel calls still need dense canonical indices, and
/// the final `finishReason: STOP` must be reported as `tool_calls` when the
/// turn requested any.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    next_call_index: u32,
}

/// Build the request body for `:generateContent` / `:streamGenerateContent`.
pub(crate) fn build_request(req: &CompletionRequest) -> Value {
    // functionResponse parts are matched to calls by function *name*, not by
    // the opaque call id, so build the id → name map up front.
    let mut tc_name_map: HashMap<String, String> = HashMap::new();
    for m in &req.messages {
        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            tc_name_map.insert(tool_call_id.clone(), function.name.clone());
        }
    }

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for m in &req.messages {
        match m.role {
            Role::System => {
                if let Some(t) = m.as_text() {
                    system_parts.push(json!({ "text": t }));
                }
            }
            Role::User | Role::Tool => {
                let parts = message_to_parts(m, &tc_name_map);
                contents.push(json!({ "role": "user", "parts": parts }));
            }
            Role::Assistant => {
                let parts = message_to_parts(m, &tc_name_map);
                contents.push(json!({ "role": "model", "parts": parts }));
            }
        }
    }

    let mut generation_config = json!({});
    if let Some(mt) = req.max_tokens {
        generation_config["maxOutputTokens"] = json!(mt);
    }
    if let Some(t) = req.temperature {
        generation_config["temperature"] = json!(t);
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": system_parts });
    }
    if !req.tools.is_empty() {
        let function_declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": function_declarations }]);
        if req.tool_choice == crate::ToolChoice::None {
            body["toolConfig"] = json!({ "functionCallingConfig": { "mode": "NONE" } });
        }
    }
    if let Some(map) = req.extra_params.as_object() {
        for (k, v) in map {
            body[k] = v.clone();
        }
    }
    body
}

/// Convert a canonical message into a Gemini `parts` array.
fn message_to_parts(m: &crate::ChatMessage, tc_name_map: &HashMap<String, String>) -> Vec<Value> {
    match &m.content {
        MessageContent::Text(t) => vec![json!({ "text": t })],
        MessageContent::Parts(parts) => {
            if parts.is_empty() {
                return vec![json!({ "text": "" })];
            }
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "text": text }),
                    ContentPart::ImageRef { image_url } => {
                        if let Ok((mime, data)) = crate::types::parse_data_url_parts(image_url) {
                            json!({ "inline_data": { "mime_type": mime, "data": data } })
                        } else {
                            json!({ "file_data": { "file_uri": image_url } })
                        }
                    }
                    ContentPart::AudioRef { audio_ref } => {
                        json!({ "text": format!("[audio attachment: {audio_ref}]") })
                    }
                    ContentPart::FileRef { file_ref } => {
                        json!({ "text": format!("[file attachment: {file_ref}]") })
                    }
                })
                .collect()
        }
        MessageContent::ToolCall { tool_call_id: _, function } => {
            let input: Value = serde_json::from_str(&function.arguments).unwrap_or(json!({}));
            vec![json!({
                "functionCall": {
                    "name": function.name,
                    "args": input,
                }
            })]
        }
        MessageContent::ToolResult { tool_call_id, content } => {
            let fn_name = tc_name_map
                .get(tool_call_id)
                .map(|s| s.as_str())
                .unwrap_or(tool_call_id);
            vec![json!({
                "functionResponse": {
                    "name": fn_name,
                    "response": { "output": content },
                }
            })]
        }
    }
}

/// Translate one streamed chunk into zero-or-more canonical events.
pub(crate) fn parse_stream_chunk(v: &Value, state: &mut StreamState) -> Vec<ProviderEvent> {
    let mut events = Vec::new();

    if let Some(meta) = v.get("usageMetadata") {
        events.push(ProviderEvent::Usage(parse_usage(meta)));
    }

    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                if let Some(text) = part["text"].as_str() {
                    events.push(ProviderEvent::ReasoningDelta(text.to_string()));
                }
                continue;
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let args = serde_json::to_string(&fc["args"]).unwrap_or_default();
                let index = state.next_call_index;
                state.next_call_index += 1;
                events.push(ProviderEvent::ToolCallDelta {
                    index,
                    // Gemini has no opaque call id; the name doubles as one.
                    id: format!("{name}_{index}"),
                    name,
                    arguments: args,
                });
                continue;
            }
            if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(ProviderEvent::ContentDelta(text.to_string()));
                }
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        let finish = if state.next_call_index > 0 {
            FinishReason::ToolCalls
        } else {
            match reason {
                "MAX_TOKENS" => FinishReason::Length,
                "SAFETY" | "PROHIBITED_CONTENT" => FinishReason::ContentFilter,
                _ => FinishReason::Stop,
            }
        };
        events.push(ProviderEvent::Finished(finish));
    }

    events
}

/// Parse a complete (non-streaming) response body.
pub(crate) fn parse_response(v: &Value) -> crate::CompletionResponse {
    let mut state = StreamState::default();
    let events = parse_stream_chunk(v, &mut state);

    let mut resp = crate::CompletionResponse::default();
    for ev in events {
        match ev {
            ProviderEvent::ContentDelta(t) => resp.content.push_str(&t),
            ProviderEvent::ReasoningDelta(t) => {
                resp.reasoning.get_or_insert_with(String::new).push_str(&t)
            }
            ProviderEvent::ToolCallDelta { index, id, name, arguments } => {
                resp.tool_calls.push(crate::AssembledToolCall { index, id, name, arguments })
            }
            ProviderEvent::Finished(f) => resp.finish_reason = Some(f),
            ProviderEvent::Usage(u) => resp.usage = u,
            _ => {}
        }
    }
    resp
}

fn parse_usage(meta: &Value) -> Usage {
    Usage {
        input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        cache_read_tokens: meta["cachedContentTokenCount"].as_u64().unwrap_or(0) as u32,
    }
}

/// Strip the `models/` prefix Gemini puts on every model name.
pub(crate) fn strip_model_prefix(name: &str) -> &str {
    name.strip_prefix("models/").unwrap_or(name)
}
