// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Errors surfaced by the persistence coordinator.
///
/// `Conflict` and `NotFound` map directly onto the pipeline's error
/// taxonomy; everything else is internal.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Optimistic-lock failure: the client's `expected_last_seq` no longer
    /// matches the conversation's current last sequence number.
    #[error("optimistic lock failure: expected last seq {expected}, current is {current}")]
    Conflict { expected: i64, current: i64 },

    /// Entity missing, or not owned by the requesting user (the two are
    /// indistinguishable on purpose).
    #[error("not found")]
    NotFound,

    /// Attempt to append events to a message already in a terminal state.
    #[error("message {0} is terminal")]
    TerminalMessage(String),

    #[error("encryption unavailable: no master key configured")]
    NoMasterKey,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

impl DbError {
    pub(crate) fn internal(e: impl std::fmt::Display) -> Self {
        Self::Internal(e.to_string())
    }
}
