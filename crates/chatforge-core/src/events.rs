// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::Serialize;
use serde_json::Value;

/// Typed events written to the client stream.
///
/// Serialized as `data: <json>\n\n` frames with a top-level `type`
/// discriminator; the framer appends the terminal `data: [DONE]\n\n` frame
/// itself, so there is no `done` variant here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ContentDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    /// A (possibly fragmentary) tool call announcement.  Fragments for one
    /// call share `id`/`index`; `arguments_fragment` concatenates to the
    /// full argument JSON.
    ToolCall {
        id: String,
        index: u32,
        name: String,
        arguments_fragment: String,
    },
    /// A completed tool execution.  Emitted in call-index order regardless
    /// of completion order.
    ToolOutput {
        id: String,
        index: u32,
        payload: Value,
    },
    Usage {
        input_tokens: u32,
        output_tokens: u32,
        cache_read_tokens: u32,
    },
    /// Reserved for the judge flow; carried opaquely.
    Evaluation {
        payload: Value,
    },
    Error {
        kind: String,
        message: String,
    },
}
