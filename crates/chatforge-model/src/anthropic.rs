// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic wire dialect (`/v1/messages`).
//!
//! The system prompt is a top-level field, not a conversation turn; tool use
//! and tool results are distinct block types inside `content`; prompt-cache
//! breakpoints are attached automatically at the stable prefix boundaries
//! (system block and last tool definition).

use serde_json::{json, Value};
use tracing::warn;

use crate::{
    CompletionRequest, ContentPart, FinishReason, MessageContent, ProviderEvent, Role,
    ToolChoice, Usage,
};

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the request body for `POST /v1/messages`.
pub(crate) fn build_request(req: &CompletionRequest) -> Value {
    let (system_text, messages) = build_messages(&req.messages);

    let tools: Vec<Value> = req
        .tools
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let mut tool = json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            });
            // Cache the whole tool-definition array as one stable prefix by
            // marking the last entry.
            if i + 1 == req.tools.len() {
                tool["cache_control"] = json!({ "type": "ephemeral" });
            }
            tool
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens.unwrap_or(4096),
        "stream": req.stream,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if !system_text.is_empty() {
        body["system"] = json!([{
            "type": "text",
            "text": system_text,
            "cache_control": { "type": "ephemeral" },
        }]);
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
        if req.tool_choice == ToolChoice::None {
            body["tool_choice"] = json!({ "type": "none" });
        }
    }
    if let Some(map) = req.extra_params.as_object() {
        for (k, v) in map {
            body[k] = v.clone();
        }
    }
    body
}

/// Translate one SSE event into zero-or-more canonical events.
pub(crate) fn parse_stream_event(v: &Value) -> Vec<ProviderEvent> {
    match v["type"].as_str().unwrap_or("") {
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![ProviderEvent::ContentDelta(text.to_string())]
                    }
                }
                "input_json_delta" => vec![ProviderEvent::ToolCallDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("");
                    if text.is_empty() {
                        vec![]
                    } else {
                        vec![ProviderEvent::ReasoningDelta(text.to_string())]
                    }
                }
                // Encrypted integrity blob terminating a thinking block; not
                // human-readable, never surfaced.
                "signature_delta" => vec![],
                _ => vec![],
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                vec![ProviderEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }]
            } else {
                vec![]
            }
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                let finish = match reason {
                    "tool_use" => FinishReason::ToolCalls,
                    "max_tokens" => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
                events.push(ProviderEvent::Finished(finish));
            }
            if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
                events.push(ProviderEvent::Usage(Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_read_tokens: 0,
                }));
            }
            events
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                vec![ProviderEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                    cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0)
                        as u32,
                })]
            } else {
                vec![]
            }
        }
        "message_stop" => vec![ProviderEvent::Done],
        "error" => {
            let msg = v["error"]["message"].as_str().unwrap_or("stream error");
            vec![ProviderEvent::Error(msg.to_string())]
        }
        _ => vec![],
    }
}

/// Parse a complete (non-streaming) response body.
pub(crate) fn parse_response(v: &Value) -> crate::CompletionResponse {
    let mut content = String::new();
    let mut reasoning: Option<String> = None;
    let mut tool_calls = Vec::new();

    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str().unwrap_or("") {
                "text" => content.push_str(block["text"].as_str().unwrap_or("")),
                "thinking" => {
                    if let Some(t) = block["thinking"].as_str() {
                        reasoning = Some(t.to_string());
                    }
                }
                "tool_use" => {
                    tool_calls.push(crate::AssembledToolCall {
                        index: tool_calls.len() as u32,
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = match v["stop_reason"].as_str() {
        Some("tool_use") => Some(FinishReason::ToolCalls),
        Some("max_tokens") => Some(FinishReason::Length),
        Some(_) => Some(FinishReason::Stop),
        None => None,
    };

    crate::CompletionResponse {
        content,
        reasoning,
        tool_calls,
        finish_reason,
        usage: v
            .get("usage")
            .map(|usage| Usage {
                input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                cache_read_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32,
            })
            .unwrap_or_default(),
        response_id: None,
    }
}

/// Convert canonical messages into the Anthropic wire format.
///
/// Returns `(system_text, conversation_messages)`.  The system message is
/// separated out because Anthropic expects it as a top-level `system` field,
/// not as a conversation turn.
pub(crate) fn build_messages(messages: &[crate::ChatMessage]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in messages {
        if m.role == Role::System {
            if let Some(t) = m.as_text() {
                system_text = t.to_string();
            }
            continue;
        }
        let role = match m.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
            Role::System => unreachable!(),
        };
        match &m.content {
            MessageContent::Text(t) => {
                out.push(json!({ "role": role, "content": t }));
            }
            MessageContent::Parts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::ImageRef { image_url } => {
                            if let Ok((mime, data)) = crate::types::parse_data_url_parts(image_url)
                            {
                                json!({
                                    "type": "image",
                                    "source": {
                                        "type": "base64",
                                        "media_type": mime,
                                        "data": data,
                                    }
                                })
                            } else {
                                json!({
                                    "type": "image",
                                    "source": { "type": "url", "url": image_url }
                                })
                            }
                        }
                        ContentPart::AudioRef { audio_ref } => json!({
                            "type": "text",
                            "text": format!("[audio attachment: {audio_ref}]"),
                        }),
                        ContentPart::FileRef { file_ref } => json!({
                            "type": "text",
                            "text": format!("[file attachment: {file_ref}]"),
                        }),
                    })
                    .collect();
                out.push(json!({ "role": role, "content": content }));
            }
            MessageContent::Parts(_) => {
                out.push(json!({ "role": role, "content": "" }));
            }
            MessageContent::ToolCall { tool_call_id, function } => {
                // tool_use.id must match `^[a-zA-Z0-9_-]+$`.  An empty id can
                // arise when a content_block_start was missing from the
                // stream; substitute a stable fallback rather than sending an
                // invalid request.
                let safe_id = if tool_call_id.is_empty() {
                    warn!(
                        tool_name = %function.name,
                        "tool call has empty id when building Anthropic request; \
                         substituting fallback id"
                    );
                    "tc_fallback".to_string()
                } else {
                    tool_call_id.clone()
                };
                out.push(json!({
                    "role": "assistant",
                    "content": [{
                        "type": "tool_use",
                        "id": safe_id,
                        "name": function.name,
                        "input": serde_json::from_str::<Value>(&function.arguments)
                            .unwrap_or(json!({})),
                    }]
                }));
            }
            MessageContent::ToolResult { tool_call_id, content } => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": content,
                    }]
                }));
            }
        }
    }
    (system_text, out)
}
