// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::{json, Value};

use chatforge_db::DbError;
use chatforge_model::ProviderError;

/// Pipeline-wide error taxonomy.  Every error that reaches a client is one
/// of these kinds; the HTTP status follows from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ValidationError,
    Conflict,
    Unauthorized,
    NotFound,
    LimitExceeded,
    ProviderError,
    Aborted,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::LimitExceeded => "limit_exceeded",
            Self::ProviderError => "provider_error",
            Self::Aborted => "aborted",
            Self::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::ValidationError => 400,
            Self::Conflict => 409,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::LimitExceeded => 429,
            Self::ProviderError => 502,
            // Client went away; nothing meaningful left to send over HTTP.
            Self::Aborted => 499,
            Self::InternalError => 500,
        }
    }
}

/// Structured error carried through the pipeline and serialized as
/// `{"error": kind, "message": …, "error_code"?: …}` at the edge.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub error_code: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), error_code: None }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound, "not found")
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "request aborted")
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::InternalError, message.to_string())
    }

    /// Wire body for the HTTP error envelope.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "error": self.kind.as_str(),
            "message": self.message,
        });
        if let Some(code) = &self.error_code {
            body["error_code"] = json!(code);
        }
        body
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict { .. } => {
                Self::new(ErrorKind::Conflict, e.to_string()).with_code("conflict")
            }
            DbError::NotFound => Self::not_found(),
            DbError::TerminalMessage(_) => Self::internal(e),
            other => Self::internal(other),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::RateLimited => {
                Self::new(ErrorKind::LimitExceeded, "upstream rate limit exceeded")
            }
            // Upstream bodies are sanitized here: the client sees a short
            // classification, details stay in the server log.
            ProviderError::Unauthorized => {
                Self::new(ErrorKind::ProviderError, "upstream rejected provider credentials")
            }
            ProviderError::Upstream { status, .. } => Self::new(
                ErrorKind::ProviderError,
                format!("upstream returned status {status}"),
            ),
            ProviderError::Network(_) | ProviderError::Timeout => {
                Self::new(ErrorKind::ProviderError, "upstream unreachable")
            }
            ProviderError::MissingKey => {
                Self::validation("provider has no API key configured")
            }
            ProviderError::InvalidResponse(_) => {
                Self::new(ErrorKind::ProviderError, "upstream returned an invalid response")
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
