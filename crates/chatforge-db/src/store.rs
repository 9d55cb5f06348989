// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags};
use rusqlite_migration::{Migrations, M};
use tracing::debug;

use crate::crypto::KeyCipher;
use crate::error::DbError;

/// Read connections opened against an on-disk database.  WAL lets them run
/// concurrently with each other and with the writer.
const READ_POOL_SIZE: usize = 4;

/// Persistence coordinator.
///
/// Mutations go through a single writer connection behind a mutex — SQLite
/// allows one writer at a time regardless, and the mutex doubles as the
/// per-conversation serialization point.  Reads go through a round-robin
/// pool of read-only WAL connections, so queries against one conversation
/// never wait behind an unrelated conversation's write.  No transaction is
/// ever held across an await point: every database closure runs to
/// completion inside `spawn_blocking`.
///
/// Streaming message events are buffered in memory per message and flushed
/// to durable storage by [`checkpoint`](crate::Db::checkpoint) — periodically
/// during long streams and unconditionally on abort or finalize.
#[derive(Clone)]
pub struct Db {
    writer: Arc<Mutex<Connection>>,
    /// Empty for in-memory databases (each in-memory connection would be a
    /// separate private database); reads then fall back to the writer.
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
    pub(crate) cipher: Option<KeyCipher>,
    pub(crate) pending: Arc<Mutex<HashMap<String, PendingEvents>>>,
}

/// Buffered, not-yet-durable events for one streaming message.
#[derive(Debug, Default)]
pub(crate) struct PendingEvents {
    pub next_event_seq: i64,
    pub rows: Vec<(i64, String, String)>, // (event_seq, kind, payload_json)
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE users (
            id              TEXT PRIMARY KEY,
            email           TEXT NOT NULL UNIQUE,
            api_token_hash  TEXT NOT NULL UNIQUE,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE conversations (
            id                  TEXT PRIMARY KEY,
            user_id             TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            title               TEXT,
            settings_json       TEXT NOT NULL DEFAULT '{}',
            metadata_json       TEXT NOT NULL DEFAULT '{}',
            deleted             INTEGER NOT NULL DEFAULT 0,
            next_seq            INTEGER NOT NULL DEFAULT 1,
            provider_state_json TEXT,
            forked_from         TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );
        CREATE INDEX idx_conversations_user ON conversations(user_id, updated_at);

        CREATE TABLE messages (
            id                TEXT PRIMARY KEY,
            conversation_id   TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            user_id           TEXT NOT NULL,
            seq               INTEGER NOT NULL,
            client_message_id TEXT NOT NULL,
            role              TEXT NOT NULL,
            status            TEXT NOT NULL,
            content_text      TEXT NOT NULL DEFAULT '',
            content_json      TEXT,
            reasoning_json    TEXT,
            parent_id         TEXT,
            provider_id       TEXT,
            model             TEXT,
            usage_json        TEXT,
            deleted           INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL,
            UNIQUE(conversation_id, seq),
            UNIQUE(conversation_id, client_message_id)
        );

        CREATE TABLE message_events (
            message_id   TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            event_seq    INTEGER NOT NULL,
            kind         TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            PRIMARY KEY (message_id, event_seq)
        );

        CREATE TABLE tool_calls (
            message_id     TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            call_index     INTEGER NOT NULL,
            tool_name      TEXT NOT NULL,
            arguments_json TEXT NOT NULL,
            text_offset    INTEGER NOT NULL DEFAULT 0,
            status         TEXT NOT NULL,
            output_ref     TEXT,
            started_at     TEXT,
            completed_at   TEXT,
            PRIMARY KEY (message_id, call_index)
        );

        CREATE TABLE providers (
            id                 TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            provider_type      TEXT NOT NULL,
            base_url           TEXT NOT NULL,
            api_key_enc        TEXT,
            enabled            INTEGER NOT NULL DEFAULT 1,
            is_default         INTEGER NOT NULL DEFAULT 0,
            extra_headers_json TEXT NOT NULL DEFAULT '[]',
            metadata_json      TEXT NOT NULL DEFAULT '{}',
            created_at         TEXT NOT NULL
        );
        CREATE INDEX idx_providers_user ON providers(user_id);

        CREATE TABLE user_settings (
            user_id             TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            max_tool_iterations INTEGER,
            default_model       TEXT,
            default_provider_id TEXT,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE journal_entries (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            text       TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX idx_journal_user ON journal_entries(user_id, id);
        "#,
    )])
}

impl Db {
    /// Open (or create) the database file and bring the schema up to date,
    /// then open the read pool against the migrated file.
    pub async fn open(path: PathBuf, master_key_hex: Option<&str>) -> Result<Self, DbError> {
        let cipher = master_key_hex.map(KeyCipher::from_hex).transpose()?;
        let (writer, readers) = tokio::task::spawn_blocking(
            move || -> Result<(Connection, Vec<Mutex<Connection>>), DbError> {
                let mut writer = Connection::open(&path)?;
                // journal_mode returns a result row; query_row consumes it.
                writer.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
                writer.pragma_update(None, "foreign_keys", "ON")?;
                migrations()
                    .to_latest(&mut writer)
                    .map_err(DbError::internal)?;

                let mut readers = Vec::with_capacity(READ_POOL_SIZE);
                for _ in 0..READ_POOL_SIZE {
                    let reader = Connection::open_with_flags(
                        &path,
                        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                    )?;
                    readers.push(Mutex::new(reader));
                }
                Ok((writer, readers))
            },
        )
        .await
        .map_err(DbError::internal)??;

        debug!(readers = readers.len(), "database open");
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
            cipher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// In-memory database for tests.  A private in-memory database is only
    /// visible to the connection that created it, so there is no read pool
    /// here — reads fall back to the writer.
    pub async fn open_in_memory(master_key_hex: Option<&str>) -> Result<Self, DbError> {
        let cipher = master_key_hex.map(KeyCipher::from_hex).transpose()?;
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, DbError> {
            let mut conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            migrations()
                .to_latest(&mut conn)
                .map_err(DbError::internal)?;
            Ok(conn)
        })
        .await
        .map_err(DbError::internal)??;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
            cipher,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Run a mutation against the writer connection on the blocking pool.
    ///
    /// The writer mutex is held only for the closure's duration; callers
    /// never hold it across an await point.
    pub(crate) async fn run_blocking<F, R>(&self, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<R, DbError> + Send + 'static,
        R: Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut conn = writer.lock().expect("writer mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(DbError::internal)?
    }

    /// Run a read-only query on the blocking pool.
    ///
    /// Round-robins over the read pool so queries against different
    /// conversations proceed concurrently instead of queueing behind the
    /// writer.  Falls back to the writer when no pool exists (in-memory).
    pub(crate) async fn run_read<F, R>(&self, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<R, DbError> + Send + 'static,
        R: Send + 'static,
    {
        let readers = Arc::clone(&self.readers);
        let writer = Arc::clone(&self.writer);
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed);
        tokio::task::spawn_blocking(move || {
            if readers.is_empty() {
                let mut conn = writer.lock().expect("writer mutex poisoned");
                return f(&mut conn);
            }
            let mut conn = readers[slot % readers.len()]
                .lock()
                .expect("reader mutex poisoned");
            f(&mut conn)
        })
        .await
        .map_err(DbError::internal)?
    }

    pub(crate) fn cipher(&self) -> Result<&KeyCipher, DbError> {
        self.cipher.as_ref().ok_or(DbError::NoMasterKey)
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<(), DbError> {
        self.run_read(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
