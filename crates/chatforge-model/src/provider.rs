// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    anthropic, gemini, openai_compat, openai_responses, CompletionRequest, CompletionResponse,
    ProviderEvent,
};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// Upstream provider families the proxy can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    GenericOpenAiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::GenericOpenAiCompatible => "generic_openai_compatible",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "gemini" => Some(Self::Gemini),
            "generic_openai_compatible" => Some(Self::GenericOpenAiCompatible),
            _ => None,
        }
    }
}

/// Wire format spoken on the socket.  Selected from `(kind, base_url)`:
/// the provider type is the primary key, the host match a secondary
/// condition — only `openai` against `api.openai.com` gets the Responses API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireDialect {
    ChatCompletions,
    Responses,
    Anthropic,
    Gemini,
}

pub fn select_dialect(kind: ProviderKind, base_url: &str) -> WireDialect {
    match kind {
        ProviderKind::OpenAi => {
            let host = reqwest::Url::parse(base_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            if host.as_deref() == Some("api.openai.com") {
                WireDialect::Responses
            } else {
                WireDialect::ChatCompletions
            }
        }
        ProviderKind::Anthropic => WireDialect::Anthropic,
        ProviderKind::Gemini => WireDialect::Gemini,
        ProviderKind::GenericOpenAiCompatible => WireDialect::ChatCompletions,
    }
}

/// What a provider advertises support for, read from its metadata bag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderCaps {
    pub reasoning_effort: bool,
    pub verbosity: bool,
    pub images: bool,
}

impl ProviderCaps {
    /// Derive capabilities from a provider record's metadata.  Fields default
    /// per dialect when the metadata does not say otherwise.
    pub fn from_metadata(dialect: WireDialect, metadata: &Value) -> Self {
        let flag = |key: &str, default: bool| -> bool {
            metadata.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
        };
        Self {
            reasoning_effort: flag("supports_reasoning_effort", dialect == WireDialect::Responses),
            verbosity: flag("supports_verbosity", dialect == WireDialect::Responses),
            images: flag("supports_images", true),
        }
    }
}

/// Connection settings for one upstream provider record.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Stable provider-record id, echoed in logs and persisted with messages.
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Decrypted API key.  Only ever leaves the process inside the
    /// provider-specific auth header.
    pub api_key: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    /// Free-form metadata (capability flags, model filter).
    pub metadata: Value,
}

/// Errors from the provider transport, classified for the pipeline taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream rejected credentials")]
    Unauthorized,
    #[error("upstream rate limit exceeded")]
    RateLimited,
    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("missing API key for provider")]
    MissingKey,
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Classify an upstream non-2xx status.  Bodies are kept short and never
/// forwarded verbatim to clients.
fn classify_status(status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Unauthorized,
        429 => ProviderError::RateLimited,
        _ => ProviderError::Upstream {
            status,
            message: truncate_body(body),
        },
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

/// Anything that can serve completions: the HTTP transport in production,
/// a scripted mock in tests.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider-record id for logs and persistence.
    fn id(&self) -> &str;

    /// One-shot completion.
    async fn request(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Streaming completion.
    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ProviderError>;

    /// Model ids available upstream.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;
}

/// HTTP transport for one upstream provider record.
pub struct HttpProvider {
    config: ProviderConfig,
    dialect: WireDialect,
    client: reqwest::Client,
}

/// Gemini 429 backoff: base 500 ms, doubling, capped at 8 s, ±20 % jitter.
const RETRY_BASE_MS: u64 = 500;
const RETRY_CAP_MS: u64 = 8_000;
const RETRY_MAX_ATTEMPTS: u32 = 5;
const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(10);

fn backoff_delay(attempt: u32) -> Duration {
    let base = (RETRY_BASE_MS << attempt).min(RETRY_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((base as f64 * jitter) as u64)
}

impl HttpProvider {
    pub fn new(config: ProviderConfig, connect_timeout: Duration) -> Result<Self, ProviderError> {
        let dialect = select_dialect(config.kind, &config.base_url);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        Ok(Self { config, dialect, client })
    }

    pub fn dialect(&self) -> WireDialect {
        self.dialect
    }

    pub fn caps(&self) -> ProviderCaps {
        ProviderCaps::from_metadata(self.dialect, &self.config.metadata)
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn completion_url(&self, model: &str, stream: bool) -> String {
        match self.dialect {
            WireDialect::ChatCompletions => format!("{}/chat/completions", self.base()),
            WireDialect::Responses => format!("{}/responses", self.base()),
            WireDialect::Anthropic => format!("{}/v1/messages", self.base()),
            WireDialect::Gemini => {
                let op = if stream {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                format!("{}/v1beta/models/{}:{}", self.base(), model, op)
            }
        }
    }

    fn models_url(&self) -> String {
        match self.dialect {
            WireDialect::ChatCompletions | WireDialect::Responses => {
                format!("{}/models", self.base())
            }
            WireDialect::Anthropic => format!("{}/v1/models", self.base()),
            WireDialect::Gemini => format!("{}/v1beta/models", self.base()),
        }
    }

    /// Attach the provider-specific auth header plus any extra headers.
    fn authorize(&self, mut req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder, ProviderError> {
        match self.dialect {
            WireDialect::ChatCompletions | WireDialect::Responses => {
                // Generic OpenAI-compatible local servers may run keyless.
                if let Some(key) = &self.config.api_key {
                    req = req.bearer_auth(key);
                } else if self.config.kind == ProviderKind::OpenAi {
                    return Err(ProviderError::MissingKey);
                }
            }
            WireDialect::Anthropic => {
                let key = self.config.api_key.as_deref().ok_or(ProviderError::MissingKey)?;
                req = req
                    .header("x-api-key", key)
                    .header("anthropic-version", anthropic::ANTHROPIC_VERSION);
            }
            WireDialect::Gemini => {
                let key = self.config.api_key.as_deref().ok_or(ProviderError::MissingKey)?;
                req = req.header("x-goog-api-key", key);
            }
        }
        for (name, val) in &self.config.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }
        Ok(req)
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        match self.dialect {
            WireDialect::ChatCompletions => openai_compat::build_request(req),
            WireDialect::Responses => openai_responses::build_request(req),
            WireDialect::Anthropic => anthropic::build_request(req),
            WireDialect::Gemini => gemini::build_request(req),
        }
    }

    async fn send(&self, req: &CompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let url = self.completion_url(&req.model, req.stream);
        let body = self.build_body(req);
        debug!(
            provider = %self.config.id,
            model = %req.model,
            dialect = ?self.dialect,
            stream = req.stream,
            tool_count = req.tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let retriable_429 = self.dialect == WireDialect::Gemini;
        let mut attempt = 0u32;
        loop {
            let http_req = self.authorize(self.client.post(&url))?.json(&body);
            let resp = http_req.send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }
            let text = resp.text().await.unwrap_or_default();
            let err = classify_status(status.as_u16(), &text);
            if retriable_429
                && matches!(err, ProviderError::RateLimited)
                && attempt + 1 < RETRY_MAX_ATTEMPTS
            {
                let delay = backoff_delay(attempt);
                warn!(
                    provider = %self.config.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited; backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(err);
        }
    }
}

/// Per-dialect stream translation state carried across chunks.
enum DialectState {
    ChatCompletions,
    Responses(openai_responses::StreamState),
    Anthropic,
    Gemini(gemini::StreamState),
}

impl DialectState {
    fn parse_data(&mut self, data: &str) -> Vec<Result<ProviderEvent, ProviderError>> {
        if data == "[DONE]" {
            return vec![Ok(ProviderEvent::Done)];
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            // Fragmentary or non-JSON payloads are skipped; the line buffer
            // already guarantees complete lines so this is a real anomaly.
            Err(_) => return vec![],
        };
        let events = match self {
            Self::ChatCompletions => openai_compat::parse_stream_chunk(&v),
            Self::Responses(state) => openai_responses::parse_stream_event(&v, state),
            Self::Anthropic => anthropic::parse_stream_event(&v),
            Self::Gemini(state) => gemini::parse_stream_chunk(&v, state),
        };
        events.into_iter().map(Ok).collect()
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, translating each
/// `data:` payload through the dialect state.
///
/// A trailing incomplete line stays in `buf` so the next TCP chunk can extend
/// it — a single SSE event is routinely split across packets, and parsing a
/// half line would silently drop tool-call fragments.
fn drain_sse_lines(
    buf: &mut String,
    state: &mut DialectState,
) -> Vec<Result<ProviderEvent, ProviderError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(data) = line.strip_prefix("data: ") {
            let data = data.trim();
            if !data.is_empty() {
                events.extend(state.parse_data(data));
            }
        }
    }
    events
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn request(&self, mut req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        req.stream = false;
        let resp = self.send(&req).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(match self.dialect {
            WireDialect::ChatCompletions => openai_compat::parse_response(&v),
            WireDialect::Responses => openai_responses::parse_response(&v),
            WireDialect::Anthropic => anthropic::parse_response(&v),
            WireDialect::Gemini => gemini::parse_response(&v),
        })
    }

    async fn stream(&self, mut req: CompletionRequest) -> Result<EventStream, ProviderError> {
        req.stream = true;
        let resp = self.send(&req).await?;

        let state = match self.dialect {
            WireDialect::ChatCompletions => DialectState::ChatCompletions,
            WireDialect::Responses => DialectState::Responses(Default::default()),
            WireDialect::Anthropic => DialectState::Anthropic,
            WireDialect::Gemini => DialectState::Gemini(Default::default()),
        };

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan((String::new(), state), |(buf, state), chunk| {
                let events = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_sse_lines(buf, state)
                    }
                    Err(e) => vec![Err(ProviderError::from(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }

    /// List model ids via the dialect's listing endpoint.  Idempotent read:
    /// retried once on network errors, with the Gemini 429 policy on top.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = self.models_url();
        let mut attempt = 0u32;
        loop {
            let req = self
                .authorize(self.client.get(&url))?
                .timeout(MODEL_LIST_TIMEOUT);
            let result = req.send().await;
            let resp = match result {
                Ok(r) => r,
                Err(e) if attempt == 0 => {
                    warn!(provider = %self.config.id, error = %e, "model listing failed; retrying");
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                let err = classify_status(status.as_u16(), &text);
                if self.dialect == WireDialect::Gemini
                    && matches!(err, ProviderError::RateLimited)
                    && attempt + 1 < RETRY_MAX_ATTEMPTS
                {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
            let v: Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            return Ok(parse_model_listing(self.dialect, &v));
        }
    }
}

fn parse_model_listing(dialect: WireDialect, v: &Value) -> Vec<String> {
    let mut names: Vec<String> = match dialect {
        WireDialect::Gemini => v["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|n| gemini::strip_model_prefix(n).to_string())
                    .collect()
            })
            .unwrap_or_default(),
        _ => v["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
    };
    names.sort();
    names
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Dialect selection ─────────────────────────────────────────────────────

    #[test]
    fn openai_on_official_host_gets_responses_dialect() {
        assert_eq!(
            select_dialect(ProviderKind::OpenAi, "https://api.openai.com/v1"),
            WireDialect::Responses
        );
    }

    #[test]
    fn openai_on_other_host_gets_chat_completions() {
        assert_eq!(
            select_dialect(ProviderKind::OpenAi, "https://my-proxy.example.com/v1"),
            WireDialect::ChatCompletions
        );
    }

    #[test]
    fn anthropic_and_gemini_get_dedicated_dialects() {
        assert_eq!(
            select_dialect(ProviderKind::Anthropic, "https://api.anthropic.com"),
            WireDialect::Anthropic
        );
        assert_eq!(
            select_dialect(ProviderKind::Gemini, "https://generativelanguage.googleapis.com"),
            WireDialect::Gemini
        );
    }

    #[test]
    fn generic_compatible_always_chat_completions() {
        assert_eq!(
            select_dialect(ProviderKind::GenericOpenAiCompatible, "http://localhost:11434/v1"),
            WireDialect::ChatCompletions
        );
    }

    // ── Status classification ─────────────────────────────────────────────────

    #[test]
    fn status_401_classified_unauthorized() {
        assert!(matches!(classify_status(401, ""), ProviderError::Unauthorized));
        assert!(matches!(classify_status(403, ""), ProviderError::Unauthorized));
    }

    #[test]
    fn status_429_classified_rate_limited() {
        assert!(matches!(classify_status(429, ""), ProviderError::RateLimited));
    }

    #[test]
    fn status_500_keeps_status_and_truncates_body() {
        let long_body = "x".repeat(1000);
        match classify_status(502, &long_body) {
            ProviderError::Upstream { status, message } => {
                assert_eq!(status, 502);
                assert!(message.len() < 400);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // ── Backoff ───────────────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_and_caps() {
        for attempt in 0..8 {
            let d = backoff_delay(attempt).as_millis() as u64;
            let nominal = (RETRY_BASE_MS << attempt).min(RETRY_CAP_MS);
            let lo = nominal * 8 / 10;
            let hi = nominal * 12 / 10;
            assert!(d >= lo && d <= hi, "attempt {attempt}: {d} outside [{lo}, {hi}]");
        }
    }

    // ── Provider kind round trip ──────────────────────────────────────────────

    #[test]
    fn provider_kind_round_trips() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::Anthropic,
            ProviderKind::Gemini,
            ProviderKind::GenericOpenAiCompatible,
        ] {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("mistral"), None);
    }

    // ── Capability defaults ───────────────────────────────────────────────────

    #[test]
    fn responses_dialect_defaults_to_reasoning_support() {
        let caps = ProviderCaps::from_metadata(WireDialect::Responses, &Value::Null);
        assert!(caps.reasoning_effort);
        assert!(caps.verbosity);
    }

    #[test]
    fn chat_completions_defaults_to_no_reasoning_support() {
        let caps = ProviderCaps::from_metadata(WireDialect::ChatCompletions, &Value::Null);
        assert!(!caps.reasoning_effort);
        assert!(!caps.verbosity);
    }

    #[test]
    fn metadata_overrides_capability_defaults() {
        let meta = serde_json::json!({ "supports_reasoning_effort": true, "supports_images": false });
        let caps = ProviderCaps::from_metadata(WireDialect::ChatCompletions, &meta);
        assert!(caps.reasoning_effort);
        assert!(!caps.images);
    }

    // ── SSE line buffering ────────────────────────────────────────────────────

    #[test]
    fn drain_handles_single_complete_line() {
        let mut state = DialectState::ChatCompletions;
        let mut buf = format!(
            "data: {}\n",
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#
        );
        let events = drain_sse_lines(&mut buf, &mut state);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].as_ref().unwrap(),
            ProviderEvent::ContentDelta(t) if t == "hi"
        ));
        assert!(buf.is_empty(), "buffer should be drained");
    }

    #[test]
    fn drain_retains_incomplete_last_line() {
        let mut state = DialectState::ChatCompletions;
        let partial = "data: {\"choices\":[{\"delta\":{\"content\":\"hel";
        let mut buf = partial.to_string();
        let events = drain_sse_lines(&mut buf, &mut state);
        assert!(events.is_empty(), "no complete line yet");
        assert_eq!(buf, partial, "partial line must stay in buffer");
    }

    #[test]
    fn event_split_across_two_chunks_is_reassembled() {
        let mut state = DialectState::ChatCompletions;
        let full = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_time","arguments":""}}]}}]}"#;
        let split = full.len() / 2;

        let mut buf = String::new();
        buf.push_str(&full[..split]);
        assert!(drain_sse_lines(&mut buf, &mut state).is_empty());

        buf.push_str(&full[split..]);
        buf.push('\n');
        let events = drain_sse_lines(&mut buf, &mut state);
        assert_eq!(events.len(), 1);
        match events[0].as_ref().unwrap() {
            ProviderEvent::ToolCallDelta { index, id, name, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_time");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_events_in_one_chunk_all_parsed() {
        let mut state = DialectState::ChatCompletions;
        let mut buf = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        )
        .to_string();
        let events = drain_sse_lines(&mut buf, &mut state);
        assert_eq!(events.len(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn done_sentinel_yields_done_event() {
        let mut state = DialectState::ChatCompletions;
        let mut buf = "data: [DONE]\n".to_string();
        let events = drain_sse_lines(&mut buf, &mut state);
        assert!(matches!(events[0].as_ref().unwrap(), ProviderEvent::Done));
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let mut state = DialectState::ChatCompletions;
        let mut buf = format!(
            "data: {}\r\n",
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#
        );
        let events = drain_sse_lines(&mut buf, &mut state);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut state = DialectState::ChatCompletions;
        let mut buf = ": keep-alive\n\n".to_string();
        assert!(drain_sse_lines(&mut buf, &mut state).is_empty());
    }

    // ── Model listing ─────────────────────────────────────────────────────────

    #[test]
    fn openai_model_listing_parsed_from_data_array() {
        let v = serde_json::json!({
            "data": [{ "id": "gpt-4.1" }, { "id": "gpt-4.1-mini" }]
        });
        let names = parse_model_listing(WireDialect::ChatCompletions, &v);
        assert_eq!(names, vec!["gpt-4.1", "gpt-4.1-mini"]);
    }

    #[test]
    fn gemini_model_listing_strips_prefix() {
        let v = serde_json::json!({
            "models": [
                { "name": "models/gemini-2.0-flash" },
                { "name": "models/gemini-2.5-pro" }
            ]
        });
        let names = parse_model_listing(WireDialect::Gemini, &v);
        assert_eq!(names, vec!["gemini-2.0-flash", "gemini-2.5-pro"]);
    }
}
