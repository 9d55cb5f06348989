// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;

/// Process-wide mapping from `(user_id, request_id)` to a cancellation
/// handle.
///
/// The map's shard locks are held only for map operations, never across
/// I/O; the tokens themselves are cheap clones that outlive the entry.
/// Entries are removed by [`AbortGuard`] on every exit path.
#[derive(Default)]
pub struct AbortRegistry {
    handles: DashMap<(String, String), CancellationToken>,
}

impl AbortRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handle for the request.  A duplicate active registration
    /// for the same `request_id` under the same user is an error.
    pub fn register(
        self: &Arc<Self>,
        user_id: &str,
        request_id: &str,
    ) -> Result<AbortGuard, ApiError> {
        let key = (user_id.to_string(), request_id.to_string());
        let token = CancellationToken::new();
        // Entry-based insert keeps check-and-insert atomic per shard.
        match self.handles.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ApiError::validation(format!(
                "request_id {request_id} is already active"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(AbortGuard { registry: Arc::clone(self), key, token })
            }
        }
    }

    /// Signal the handle if present.  Idempotent and safe to race with
    /// register and unregister.  Returns `true` only when a live, not yet
    /// signalled registration was found — a repeat stop reports `false`.
    pub fn signal(&self, user_id: &str, request_id: &str) -> bool {
        let key = (user_id.to_string(), request_id.to_string());
        match self.handles.get(&key) {
            Some(token) => {
                let already = token.is_cancelled();
                token.cancel();
                if !already {
                    debug!(user_id, request_id, "abort signalled");
                }
                !already
            }
            None => false,
        }
    }

    pub fn is_registered(&self, user_id: &str, request_id: &str) -> bool {
        self.handles
            .contains_key(&(user_id.to_string(), request_id.to_string()))
    }

    fn unregister(&self, key: &(String, String)) {
        self.handles.remove(key);
    }
}

/// RAII registration handle: dropping it removes the registry entry, so
/// every exit path — success, error, panic unwind — cleans up.
pub struct AbortGuard {
    registry: Arc<AbortRegistry>,
    key: (String, String),
    token: CancellationToken,
}

impl AbortGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.key);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
