// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat-Completions wire dialect.
//!
//! Most third-party providers speak the same `/chat/completions` + `/models`
//! SSE streaming format.  This module holds the translation functions between
//! the canonical internal shape and that wire format; the HTTP transport
//! lives in [`crate::provider`].

use serde_json::{json, Value};

use crate::{
    CompletionRequest, CompletionResponse, ContentPart, FinishReason, MessageContent,
    ProviderEvent, ToolChoice, Usage,
};

/// Build the request body for `POST /chat/completions`.
pub(crate) fn build_request(req: &CompletionRequest) -> Value {
    let messages = build_chat_messages(&req.messages);

    let tools: Vec<Value> = req
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "stream": req.stream,
    });
    if req.stream {
        body["stream_options"] = json!({ "include_usage": true });
    }
    if let Some(mt) = req.max_tokens {
        body["max_tokens"] = json!(mt);
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }
    if !tools.is_empty() {
        body["tools"] = json!(tools);
        if req.tool_choice == ToolChoice::None {
            body["tool_choice"] = json!("none");
        }
    }

    // Extra params are merged last so callers can override anything above.
    if let Some(map) = req.extra_params.as_object() {
        for (k, v) in map {
            body[k] = v.clone();
        }
    }

    body
}

/// Parse one SSE `data:` payload into zero-or-more canonical events.
pub(crate) fn parse_stream_chunk(v: &Value) -> Vec<ProviderEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return vec![ProviderEvent::Usage(parse_usage(usage))];
    }

    let choice = &v["choices"][0];
    let mut events = Vec::new();

    let delta = &choice["delta"];

    // Tool call delta — providers may send multiple parallel tool calls in
    // one chunk, each identified by an "index" field that routes argument
    // accumulation in the orchestrator.
    if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
        for tc in tool_calls {
            events.push(ProviderEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            });
        }
    }

    // Reasoning delta — two common field names:
    //   • `reasoning_content` — DeepSeek, Qwen, llama.cpp
    //   • `reasoning`         — OpenRouter and other aggregators
    let reasoning = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(text) = reasoning {
        if !text.is_empty() {
            events.push(ProviderEvent::ReasoningDelta(text.to_string()));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            events.push(ProviderEvent::ContentDelta(text.to_string()));
        }
    }

    if let Some(reason) = choice["finish_reason"].as_str().and_then(FinishReason::from_wire) {
        events.push(ProviderEvent::Finished(reason));
    }

    events
}

/// Parse a complete (non-streaming) response body.
pub(crate) fn parse_response(v: &Value) -> CompletionResponse {
    let choice = &v["choices"][0];
    let message = &choice["message"];

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
        for (i, tc) in calls.iter().enumerate() {
            tool_calls.push(crate::AssembledToolCall {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
            });
        }
    }

    CompletionResponse {
        content: message["content"].as_str().unwrap_or("").to_string(),
        reasoning: message
            .get("reasoning_content")
            .and_then(|r| r.as_str())
            .map(str::to_string),
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().and_then(FinishReason::from_wire),
        usage: v.get("usage").map(parse_usage).unwrap_or_default(),
        response_id: None,
    }
}

fn parse_usage(usage: &Value) -> Usage {
    // OpenAI reports cached tokens in prompt_tokens_details.cached_tokens;
    // DeepSeek reports them as prompt_cache_hit_tokens on the root object.
    let cache_read_tokens = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|t| t.as_u64())
        .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(|t| t.as_u64()))
        .unwrap_or(0) as u32;
    Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        cache_read_tokens,
    }
}

/// Convert canonical messages into the Chat-Completions JSON array.
///
/// **Parallel tool call coalescing**: the wire format requires all tool calls
/// from one assistant turn inside a *single* assistant message as a
/// `tool_calls` array.  ChatForge stores each call as a separate
/// `MessageContent::ToolCall` entry internally, so consecutive `ToolCall`
/// messages are merged into one JSON object here.
pub(crate) fn build_chat_messages(messages: &[crate::ChatMessage]) -> Vec<Value> {
    fn tool_call_to_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
        json!({
            "id": tool_call_id,
            "type": "function",
            "function": {
                "name": function.name,
                "arguments": function.arguments,
            }
        })
    }

    fn part_to_json(p: &ContentPart) -> Value {
        match p {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::ImageRef { image_url } => json!({
                "type": "image_url",
                "image_url": { "url": image_url },
            }),
            // Opaque media references have no wire equivalent here; they are
            // surfaced as deterministic text placeholders.
            ContentPart::AudioRef { audio_ref } => {
                json!({ "type": "text", "text": format!("[audio attachment: {audio_ref}]") })
            }
            ContentPart::FileRef { file_ref } => {
                json!({ "type": "text", "text": format!("[file attachment: {file_ref}]") })
            }
        }
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut calls = vec![tool_call_to_json(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    calls.push(tool_call_to_json(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "tool_calls": calls }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": m.role.as_str(),
                "content": t,
            }),
            MessageContent::Parts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts.iter().map(part_to_json).collect();
                json!({ "role": m.role.as_str(), "content": content })
            }
            MessageContent::Parts(_) => {
                json!({ "role": m.role.as_str(), "content": "" })
            }
            MessageContent::ToolCall { .. } => unreachable!("handled above"),
            MessageContent::ToolResult { tool_call_id, content } => {
                json!({ "role": "tool", "tool_call_id": tool_call_id, "content": content })
            }
        };
        result.push(v);
        i += 1;
    }

    result
}
