// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// Ambient context handed to every tool execution.
///
/// Handlers must honor `cancel`: long-running I/O should be raced against it
/// and return an error output when it fires.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub conversation_id: String,
    pub request_id: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// A context for tests and internal invocations.
    pub fn detached(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: String::new(),
            request_id: String::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content; serialized verbatim into the tool-result message.
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: content.into(), is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), content: msg.into(), is_error: true }
    }

    /// Error output in the structured shape the orchestrator emits for
    /// rejected arguments: `{"error": "invalid_arguments", "detail": …}`.
    pub fn invalid_arguments(call_id: impl Into<String>, detail: impl Into<String>) -> Self {
        let payload = serde_json::json!({
            "error": "invalid_arguments",
            "detail": detail.into(),
        });
        Self { call_id: call_id.into(), content: payload.to_string(), is_error: true }
    }
}

/// Credential requirements of a tool, surfaced by `GET /v1/tools` and used by
/// the strategy selector to filter out tools whose key is missing.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyStatus {
    pub requires_api_key: bool,
    pub has_api_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_key_label: Option<String>,
}

impl ApiKeyStatus {
    pub fn not_required() -> Self {
        Self { requires_api_key: false, has_api_key: true, missing_key_label: None }
    }

    pub fn with_key(present: bool, label: &str) -> Self {
        Self {
            requires_api_key: true,
            has_api_key: present,
            missing_key_label: (!present).then(|| label.to_string()),
        }
    }

    /// A tool is usable when it either needs no key or has one configured.
    pub fn usable(&self) -> bool {
        !self.requires_api_key || self.has_api_key
    }
}

/// Trait that every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Credential status; tools without external credentials use the default.
    fn api_key_status(&self) -> ApiKeyStatus {
        ApiKeyStatus::not_required()
    }
    /// Validate parsed arguments before execution.  The default checks the
    /// declared `required` fields are present; tools with richer constraints
    /// override this.
    fn validate(&self, args: &Value) -> Result<(), String> {
        validate_required(&self.parameters_schema(), args)
    }
    /// Execute the tool.  Errors are reported via [`ToolOutput::err`], never
    /// by propagating upward — the model reacts to tool failures itself.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput;
}

/// Schema-driven argument check: the payload must be an object and every
/// `required` property must be present.
pub(crate) fn validate_required(schema: &Value, args: &Value) -> Result<(), String> {
    if !args.is_object() {
        return Err("arguments must be a JSON object".into());
    }
    if let Some(required) = schema["required"].as_array() {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if args.get(field).is_none() {
                return Err(format!("missing required field '{field}'"));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
