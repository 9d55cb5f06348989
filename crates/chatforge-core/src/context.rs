// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// Per-request state assembled by the pipeline and threaded through the
/// orchestrator, tools, and persistence.  Lives for one HTTP request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub conversation_id: String,
    /// Client-supplied request identifier (or a generated one); keys the
    /// abort registry together with `user_id`.
    pub request_id: String,
    pub provider_id: Option<String>,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        request_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            request_id: request_id.into(),
            provider_id: None,
            cancel,
            started_at: Instant::now(),
        }
    }
}
