// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Responses-API wire dialect (`api.openai.com/v1/responses`).
//!
//! Differs from Chat-Completions in three ways that matter to the pipeline:
//! - the request carries `input` items plus an optional `previous_response_id`
//!   for server-side conversation continuity, so only the turn's new items
//!   are sent when a continuity token exists;
//! - streamed events are typed (`response.output_text.delta`,
//!   `response.function_call_arguments.delta`, `response.reasoning_summary_text.delta`)
//!   and correlate argument fragments by `item_id`, not by array index;
//! - the terminal `response.completed` event carries the new response id that
//!   the persistence layer stores for the next turn.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::{
    CompletionRequest, ContentPart, FinishReason, MessageContent, ProviderEvent, Role,
    ToolChoice, Usage,
};

/// Per-stream translation state.
///
/// The wire format correlates function-call argument fragments by `item_id`;
/// the canonical shape uses dense `u32` indices.  The map assigns indices in
/// order of first appearance.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    call_index_by_item: HashMap<String, u32>,
    next_call_index: u32,
}

impl StreamState {
    fn index_for(&mut self, item_id: &str) -> u32 {
        if let Some(i) = self.call_index_by_item.get(item_id) {
            return *i;
        }
        let i = self.next_call_index;
        self.call_index_by_item.insert(item_id.to_string(), i);
        self.next_call_index += 1;
        i
    }
}

/// Build the request body for `POST /v1/responses`.
pub(crate) fn build_request(req: &CompletionRequest) -> Value {
    let input = build_input_items(req);

    let mut body = json!({
        "model": req.model,
        "input": input,
        "stream": req.stream,
    });
    if let Some(sys) = system_text(req) {
        body["instructions"] = json!(sys);
    }
    if let Some(prev) = &req.previous_response_id {
        body["previous_response_id"] = json!(prev);
    }
    if let Some(mt) = req.max_tokens {
        body["max_output_tokens"] = json!(mt);
    }
    if let Some(effort) = &req.reasoning_effort {
        body["reasoning"] = json!({ "effort": effort });
    }
    if let Some(verbosity) = &req.verbosity {
        body["text"] = json!({ "verbosity": verbosity });
    }
    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
        if req.tool_choice == ToolChoice::None {
            body["tool_choice"] = json!("none");
        }
    }
    if let Some(map) = req.extra_params.as_object() {
        for (k, v) in map {
            body[k] = v.clone();
        }
    }
    body
}

fn system_text(req: &CompletionRequest) -> Option<String> {
    req.messages
        .iter()
        .find(|m| m.role == Role::System)
        .and_then(|m| m.as_text())
        .map(str::to_string)
}

/// Build the `input` array.
///
/// With a continuity token the server already holds the prior turns, so only
/// the trailing run of user/tool items after the last assistant turn is sent.
/// Without one, the full history (minus the system message, which travels as
/// `instructions`) is replayed.
fn build_input_items(req: &CompletionRequest) -> Vec<Value> {
    let messages: &[crate::ChatMessage] = if req.previous_response_id.is_some() {
        let cut = req
            .messages
            .iter()
            .rposition(|m| m.role == Role::Assistant)
            .map(|i| i + 1)
            .unwrap_or(0);
        &req.messages[cut..]
    } else {
        &req.messages[..]
    };

    let mut items = Vec::new();
    for m in messages {
        match &m.content {
            MessageContent::Text(t) => {
                if m.role == Role::System {
                    continue;
                }
                items.push(json!({ "role": m.role.as_str(), "content": t }));
            }
            MessageContent::Parts(parts) => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => {
                            json!({ "type": "input_text", "text": text })
                        }
                        ContentPart::ImageRef { image_url } => {
                            json!({ "type": "input_image", "image_url": image_url })
                        }
                        ContentPart::AudioRef { audio_ref } => json!({
                            "type": "input_text",
                            "text": format!("[audio attachment: {audio_ref}]"),
                        }),
                        ContentPart::FileRef { file_ref } => json!({
                            "type": "input_text",
                            "text": format!("[file attachment: {file_ref}]"),
                        }),
                    })
                    .collect();
                items.push(json!({ "role": m.role.as_str(), "content": content }));
            }
            MessageContent::ToolCall { tool_call_id, function } => {
                items.push(json!({
                    "type": "function_call",
                    "call_id": tool_call_id,
                    "name": function.name,
                    "arguments": function.arguments,
                }));
            }
            MessageContent::ToolResult { tool_call_id, content } => {
                items.push(json!({
                    "type": "function_call_output",
                    "call_id": tool_call_id,
                    "output": content,
                }));
            }
        }
    }
    items
}

/// Translate one typed wire event into zero-or-more canonical events.
pub(crate) fn parse_stream_event(v: &Value, state: &mut StreamState) -> Vec<ProviderEvent> {
    match v["type"].as_str().unwrap_or("") {
        "response.output_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            if delta.is_empty() {
                vec![]
            } else {
                vec![ProviderEvent::ContentDelta(delta.to_string())]
            }
        }
        "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
            let delta = v["delta"].as_str().unwrap_or("");
            if delta.is_empty() {
                vec![]
            } else {
                vec![ProviderEvent::ReasoningDelta(delta.to_string())]
            }
        }
        "response.output_item.added" => {
            let item = &v["item"];
            if item["type"].as_str() == Some("function_call") {
                let item_id = item["id"].as_str().unwrap_or("");
                let index = state.index_for(item_id);
                vec![ProviderEvent::ToolCallDelta {
                    index,
                    id: item["call_id"].as_str().unwrap_or("").to_string(),
                    name: item["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                }]
            } else {
                vec![]
            }
        }
        "response.function_call_arguments.delta" => {
            let item_id = v["item_id"].as_str().unwrap_or("");
            let index = state.index_for(item_id);
            vec![ProviderEvent::ToolCallDelta {
                index,
                id: String::new(),
                name: String::new(),
                arguments: v["delta"].as_str().unwrap_or("").to_string(),
            }]
        }
        "response.completed" => {
            let response = &v["response"];
            let mut events = Vec::new();
            if let Some(id) = response["id"].as_str() {
                events.push(ProviderEvent::ResponseId(id.to_string()));
            }
            if let Some(usage) = response.get("usage").filter(|u| !u.is_null()) {
                events.push(ProviderEvent::Usage(Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                    cache_read_tokens: usage["input_tokens_details"]["cached_tokens"]
                        .as_u64()
                        .unwrap_or(0) as u32,
                }));
            }
            // A turn that produced function calls finishes as tool_calls.
            let finish = if state.next_call_index > 0 {
                FinishReason::ToolCalls
            } else {
                match response["incomplete_details"]["reason"].as_str() {
                    Some("max_output_tokens") => FinishReason::Length,
                    Some("content_filter") => FinishReason::ContentFilter,
                    _ => FinishReason::Stop,
                }
            };
            events.push(ProviderEvent::Finished(finish));
            events.push(ProviderEvent::Done);
            events
        }
        "response.failed" => {
            let msg = v["response"]["error"]["message"]
                .as_str()
                .unwrap_or("response failed")
                .to_string();
            vec![ProviderEvent::Error(msg), ProviderEvent::Done]
        }
        _ => vec![],
    }
}

/// Parse a complete (non-streaming) response body.
pub(crate) fn parse_response(v: &Value) -> crate::CompletionResponse {
    let mut content = String::new();
    let mut reasoning: Option<String> = None;
    let mut tool_calls = Vec::new();

    if let Some(output) = v["output"].as_array() {
        for item in output {
            match item["type"].as_str().unwrap_or("") {
                "message" => {
                    if let Some(parts) = item["content"].as_array() {
                        for p in parts {
                            if p["type"].as_str() == Some("output_text") {
                                content.push_str(p["text"].as_str().unwrap_or(""));
                            }
                        }
                    }
                }
                "reasoning" => {
                    if let Some(parts) = item["summary"].as_array() {
                        let text: String = parts
                            .iter()
                            .filter_map(|p| p["text"].as_str())
                            .collect::<Vec<_>>()
                            .join("\n");
                        if !text.is_empty() {
                            reasoning = Some(text);
                        }
                    }
                }
                "function_call" => {
                    tool_calls.push(crate::AssembledToolCall {
                        index: tool_calls.len() as u32,
                        id: item["call_id"].as_str().unwrap_or("").to_string(),
                        name: item["name"].as_str().unwrap_or("").to_string(),
                        arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() {
        Some(FinishReason::ToolCalls)
    } else {
        match v["incomplete_details"]["reason"].as_str() {
            Some("max_output_tokens") => Some(FinishReason::Length),
            Some("content_filter") => Some(FinishReason::ContentFilter),
            _ => Some(FinishReason::Stop),
        }
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
                cache_read_tokens: usage["input_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0) as u32,
            })
            .unwrap_or_default(),
        response_id: v["id"].as_str().map(str::to_string),
    }
}
