// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// User messages may mix text with opaque media references.  Media parts
/// carry blob identifiers minted by the upload routes; the pipeline treats
/// them as metadata and never dereferences them itself.  Image parts may
/// also carry a data URL (`data:<mime>;base64,<b64>`) or HTTPS URL for
/// providers that accept inline content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef {
        /// Data URL, HTTPS URL, or blob identifier.
        image_url: String,
    },
    AudioRef {
        audio_ref: String,
    },
    FileRef {
        file_ref: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(image_url: impl Into<String>) -> Self {
        Self::ImageRef { image_url: image_url.into() }
    }
}

// ─── Data URL helpers ─────────────────────────────────────────────────────────

/// Parse a data URL of the form `data:<mime>;base64,<b64>` and return
/// `Ok((mime_type, base64_string))`.  Returns `Err` for non-data-URLs so
/// callers can fall back to treating the string as a plain HTTPS URL.
pub fn parse_data_url_parts(url: &str) -> Result<(String, String), &'static str> {
    let rest = url.strip_prefix("data:").ok_or("not a data URL")?;
    let (meta, b64) = rest.split_once(',').ok_or("malformed data URL")?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    Ok((mime, b64.to_string()))
}

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: MessageContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: MessageContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: MessageContent::Text(text.into()) }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall { name: name.into(), arguments: arguments.into() },
            },
        }
    }

    /// Construct a user message from a list of content parts.
    ///
    /// An empty list falls back to `MessageContent::Text("")`; a single text
    /// part collapses to `MessageContent::Text` for cleaner serialization.
    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = if parts.is_empty() {
            MessageContent::Text(String::new())
        } else if parts.len() == 1 {
            if let ContentPart::Text { text } = &parts[0] {
                MessageContent::Text(text.clone())
            } else {
                MessageContent::Parts(parts)
            }
        } else {
            MessageContent::Parts(parts)
        };
        Self { role: Role::User, content }
    }

    /// Return the plain text of this message, if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The content of a message.
///
/// - `Text` – simple string (most messages)
/// - `Parts` – mixed text + media references for multimodal user turns
/// - `ToolCall` – the assistant requests a tool invocation
/// - `ToolResult` – the result of a tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A tool schema provided to the model, in OpenAI function-spec shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Constraint on whether the model may call tools this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// The model decides.
    #[default]
    Auto,
    /// Tool calls are forbidden — used for the final wrap-up turn once the
    /// iteration cap is reached.
    None,
}

/// Request sent to a model provider, in the canonical internal shape.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Reasoning directive (`low` / `medium` / `high`).  Dropped by the
    /// sanitizer for providers that do not advertise support.
    pub reasoning_effort: Option<String>,
    /// Output-length directive for Responses-API models.  Dropped by the
    /// sanitizer for providers that do not advertise support.
    pub verbosity: Option<String>,
    /// Server-side conversation continuity token (Responses API only).
    /// Cleared on message edits; forks start fresh.
    pub previous_response_id: Option<String>,
    /// Free-form extra parameters merged verbatim into the wire body.
    /// Keys from this object override anything the adapter set.
    pub extra_params: serde_json::Value,
}

/// Why the model stopped emitting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "length" => Some(Self::Length),
            "tool_calls" => Some(Self::ToolCalls),
            "content_filter" => Some(Self::ContentFilter),
            _ => None,
        }
    }
}

/// A single streamed event from the model, already translated from the
/// upstream wire format into the canonical shape.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    /// A text delta streamed from the model
    ContentDelta(String),
    /// A reasoning/thinking delta from the model
    ReasoningDelta(String),
    /// A (possibly fragmentary) tool-call delta.  `index` routes accumulation
    /// of argument fragments across chunks; `id`/`name` are empty on pure
    /// argument fragments.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// The upstream reported why this turn ended.
    Finished(FinishReason),
    /// The Responses API minted a new server-side continuity token.
    ResponseId(String),
    /// Final usage statistics
    Usage(Usage),
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens served from the provider's prompt cache.
    pub cache_read_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// A fully-assembled (non-streaming) completion.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<AssembledToolCall>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Usage,
    /// Continuity token for the Responses API; `None` elsewhere.
    pub response_id: Option<String>,
}

/// A complete tool call after all argument fragments were accumulated.
#[derive(Debug, Clone)]
pub struct AssembledToolCall {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
