// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::conversations::get_conversation_tx;
use crate::error::DbError;
use crate::store::{now, Db, PendingEvents};

/// Message lifecycle states.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const STREAMING: &str = "streaming";
    pub const FINAL: &str = "final";
    pub const ERROR: &str = "error";
    pub const ABORTED: &str = "aborted";

    pub fn is_terminal(s: &str) -> bool {
        matches!(s, FINAL | ERROR | ABORTED)
    }
}

/// Append-only event kinds; replaying a message's events in `event_seq`
/// order reconstructs the assistant message.
pub mod event_kind {
    pub const CONTENT_CHUNK: &str = "content_chunk";
    pub const REASONING_CHUNK: &str = "reasoning_chunk";
    pub const TOOL_CALL: &str = "tool_call";
    pub const TOOL_RESULT: &str = "tool_result";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub seq: i64,
    pub client_message_id: String,
    pub role: String,
    pub status: String,
    pub content_text: String,
    pub content_json: Option<Value>,
    pub reasoning: Option<Value>,
    pub provider_id: Option<String>,
    pub model: Option<String>,
    pub usage: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageEventRow {
    pub message_id: String,
    pub event_seq: i64,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct ToolCallRow {
    pub call_index: i64,
    pub tool_name: String,
    pub arguments_json: String,
    pub text_offset: i64,
    pub status: String,
    pub output_ref: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

const MESSAGE_COLS: &str = "id, conversation_id, user_id, seq, client_message_id, role, status, \
     content_text, content_json, reasoning_json, provider_id, model, usage_json, \
     created_at, updated_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let content_json: Option<String> = row.get(8)?;
    let reasoning_json: Option<String> = row.get(9)?;
    let usage_json: Option<String> = row.get(12)?;
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        user_id: row.get(2)?,
        seq: row.get(3)?,
        client_message_id: row.get(4)?,
        role: row.get(5)?,
        status: row.get(6)?,
        content_text: row.get(7)?,
        content_json: content_json.and_then(|s| serde_json::from_str(&s).ok()),
        reasoning: reasoning_json.and_then(|s| serde_json::from_str(&s).ok()),
        provider_id: row.get(10)?,
        model: row.get(11)?,
        usage: usage_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

/// Allocate the next sequence number inside an open transaction.
///
/// The caller supplies the client's optimistic-lock token; a mismatch with
/// the conversation's current last seq is a [`DbError::Conflict`].
fn allocate_seq(
    conn: &Connection,
    conversation_id: &str,
    expected_last_seq: Option<i64>,
) -> Result<i64, DbError> {
    let next_seq: i64 = conn.query_row(
        "SELECT next_seq FROM conversations WHERE id = ?",
        params![conversation_id],
        |row| row.get(0),
    )?;
    let current_last = next_seq - 1;
    if let Some(expected) = expected_last_seq {
        if expected != current_last {
            return Err(DbError::Conflict { expected, current: current_last });
        }
    }
    conn.execute(
        "UPDATE conversations SET next_seq = ?, updated_at = ? WHERE id = ?",
        params![next_seq + 1, now(), conversation_id],
    )?;
    Ok(next_seq)
}

fn insert_message(conn: &Connection, msg: &MessageRow) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO messages \
         (id, conversation_id, user_id, seq, client_message_id, role, status, \
          content_text, content_json, reasoning_json, provider_id, model, usage_json, \
          created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            msg.id,
            msg.conversation_id,
            msg.user_id,
            msg.seq,
            msg.client_message_id,
            msg.role,
            msg.status,
            msg.content_text,
            msg.content_json.as_ref().map(|v| v.to_string()),
            msg.reasoning.as_ref().map(|v| v.to_string()),
            msg.provider_id,
            msg.model,
            msg.usage.as_ref().map(|v| v.to_string()),
            msg.created_at,
            msg.updated_at,
        ],
    )?;
    Ok(())
}

impl Db {
    /// Append a user message with optimistic locking.
    ///
    /// Counter increment, seq allocation, and row insert happen in one
    /// transaction; `Conflict` is returned without mutating anything.
    pub async fn append_user_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        expected_last_seq: i64,
        content_text: String,
        content_json: Option<Value>,
        client_message_id: String,
    ) -> Result<MessageRow, DbError> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            get_conversation_tx(&tx, &user_id, &conversation_id)?;
            let seq = allocate_seq(&tx, &conversation_id, Some(expected_last_seq))?;
            let msg = MessageRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                seq,
                client_message_id,
                role: "user".into(),
                status: status::FINAL.into(),
                content_text,
                content_json,
                reasoning: None,
                provider_id: None,
                model: None,
                usage: None,
                created_at: now(),
                updated_at: now(),
            };
            insert_message(&tx, &msg)?;
            tx.commit()?;
            Ok(msg)
        })
        .await
    }

    /// Create the assistant placeholder in `streaming` status with the next
    /// seq.  No optimistic lock here: the placeholder follows the user
    /// message appended in the same pipeline invocation.
    pub async fn begin_assistant_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        provider_id: Option<String>,
        model: Option<String>,
    ) -> Result<MessageRow, DbError> {
        let conversation_id = conversation_id.to_string();
        let user_id = user_id.to_string();
        let pending = self.pending.clone();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            get_conversation_tx(&tx, &user_id, &conversation_id)?;
            let seq = allocate_seq(&tx, &conversation_id, None)?;
            let msg = MessageRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                seq,
                client_message_id: Uuid::new_v4().to_string(),
                role: "assistant".into(),
                status: status::STREAMING.into(),
                content_text: String::new(),
                content_json: None,
                reasoning: None,
                provider_id,
                model,
                usage: None,
                created_at: now(),
                updated_at: now(),
            };
            insert_message(&tx, &msg)?;
            tx.commit()?;
            pending
                .lock()
                .expect("pending mutex poisoned")
                .insert(msg.id.clone(), PendingEvents::default());
            Ok(msg)
        })
        .await
    }

    /// Buffer one event for a streaming message and return its `event_seq`.
    ///
    /// Events become durable on the next [`checkpoint`](Db::checkpoint).
    /// Terminal messages reject appends.
    pub async fn append_event(
        &self,
        message_id: &str,
        kind: &str,
        payload: Value,
    ) -> Result<i64, DbError> {
        let message_id_owned = message_id.to_string();
        let current: String = self
            .run_read(move |conn| {
                conn.query_row(
                    "SELECT status FROM messages WHERE id = ?",
                    params![message_id_owned],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(DbError::NotFound)
            })
            .await?;
        if status::is_terminal(&current) {
            return Err(DbError::TerminalMessage(message_id.to_string()));
        }

        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let buf = pending.entry(message_id.to_string()).or_default();
        let event_seq = buf.next_event_seq;
        buf.next_event_seq += 1;
        buf.rows.push((event_seq, kind.to_string(), payload.to_string()));
        Ok(event_seq)
    }

    /// Flush all buffered events for `message_id` to durable storage.
    ///
    /// Called periodically during long streams and unconditionally on abort,
    /// disconnect, and finalize.  Idempotent when the buffer is empty.
    pub async fn checkpoint(&self, message_id: &str) -> Result<(), DbError> {
        let rows = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            match pending.get_mut(message_id) {
                Some(buf) if !buf.rows.is_empty() => std::mem::take(&mut buf.rows),
                _ => return Ok(()),
            }
        };
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            for (event_seq, kind, payload) in &rows {
                tx.execute(
                    "INSERT INTO message_events \
                     (message_id, event_seq, kind, payload_json, created_at) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![message_id, event_seq, kind, payload, now()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Transition a streaming message into a terminal state, writing the
    /// canonical content and all tool-call rows derived from the
    /// accumulated events.  Performs a final checkpoint first.
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_message(
        &self,
        message_id: &str,
        final_status: &str,
        content_text: String,
        content_json: Option<Value>,
        reasoning: Option<Value>,
        usage: Option<Value>,
        tool_calls: Vec<ToolCallRow>,
    ) -> Result<(), DbError> {
        debug_assert!(status::is_terminal(final_status));
        self.checkpoint(message_id).await?;
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(message_id);

        let message_id = message_id.to_string();
        let final_status = final_status.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let current: String = tx
                .query_row(
                    "SELECT status FROM messages WHERE id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(DbError::NotFound)?;
            if status::is_terminal(&current) {
                return Err(DbError::TerminalMessage(message_id.clone()));
            }
            tx.execute(
                "UPDATE messages SET status = ?, content_text = ?, content_json = ?, \
                 reasoning_json = ?, usage_json = ?, updated_at = ? WHERE id = ?",
                params![
                    final_status,
                    content_text,
                    content_json.as_ref().map(|v| v.to_string()),
                    reasoning.as_ref().map(|v| v.to_string()),
                    usage.as_ref().map(|v| v.to_string()),
                    now(),
                    message_id,
                ],
            )?;
            for tc in &tool_calls {
                tx.execute(
                    "INSERT INTO tool_calls \
                     (message_id, call_index, tool_name, arguments_json, text_offset, \
                      status, output_ref, started_at, completed_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        message_id,
                        tc.call_index,
                        tc.tool_name,
                        tc.arguments_json,
                        tc.text_offset,
                        tc.status,
                        tc.output_ref,
                        tc.started_at,
                        tc.completed_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Live messages of a conversation in sequence order.
    pub async fn list_messages(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<MessageRow>, DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.run_read(move |conn| {
            get_conversation_tx(conn, &user_id, &conversation_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLS} FROM messages \
                 WHERE conversation_id = ? AND user_id = ? AND deleted = 0 \
                 ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map(params![conversation_id, user_id], row_to_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Durable events of one message in `event_seq` order.
    pub async fn list_events(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<MessageEventRow>, DbError> {
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();
        self.run_read(move |conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM messages WHERE id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.as_deref() != Some(user_id.as_str()) {
                return Err(DbError::NotFound);
            }
            let mut stmt = conn.prepare(
                "SELECT message_id, event_seq, kind, payload_json FROM message_events \
                 WHERE message_id = ? ORDER BY event_seq ASC",
            )?;
            let rows = stmt.query_map(params![message_id], |row| {
                let payload: String = row.get(3)?;
                Ok(MessageEventRow {
                    message_id: row.get(0)?,
                    event_seq: row.get(1)?,
                    kind: row.get(2)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Tool-call rows of one message in `call_index` order.
    pub async fn list_tool_calls(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<ToolCallRow>, DbError> {
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();
        self.run_read(move |conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM messages WHERE id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.as_deref() != Some(user_id.as_str()) {
                return Err(DbError::NotFound);
            }
            let mut stmt = conn.prepare(
                "SELECT call_index, tool_name, arguments_json, text_offset, status, \
                        output_ref, started_at, completed_at \
                 FROM tool_calls WHERE message_id = ? ORDER BY call_index ASC",
            )?;
            let rows = stmt.query_map(params![message_id], |row| {
                Ok(ToolCallRow {
                    call_index: row.get(0)?,
                    tool_name: row.get(1)?,
                    arguments_json: row.get(2)?,
                    text_offset: row.get(3)?,
                    status: row.get(4)?,
                    output_ref: row.get(5)?,
                    started_at: row.get(6)?,
                    completed_at: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Edit a message identified by its client id.
    ///
    /// Forks the conversation at the edited message — the fork carries the
    /// prefix through the edit (with the new content) and cleared
    /// provider-side state — then soft-removes the original's tail beyond
    /// the edit point.  Returns the edited message copy and the fork id.
    pub async fn edit_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        client_message_id: &str,
        new_content_text: String,
        new_content_json: Option<Value>,
        expected_last_seq: i64,
    ) -> Result<(MessageRow, String), DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        let client_message_id = client_message_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let conv = get_conversation_tx(&tx, &user_id, &conversation_id)?;
            let current_last = conv.next_seq - 1;
            if expected_last_seq != current_last {
                return Err(DbError::Conflict {
                    expected: expected_last_seq,
                    current: current_last,
                });
            }

            let edited = tx
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLS} FROM messages \
                         WHERE conversation_id = ? AND client_message_id = ? AND deleted = 0"
                    ),
                    params![conversation_id, client_message_id],
                    row_to_message,
                )
                .optional()?
                .ok_or(DbError::NotFound)?;

            // New conversation sharing the prefix; provider-side continuity
            // state starts cleared — forks are fresh as far as the upstream
            // is concerned.
            let fork_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO conversations \
                 (id, user_id, title, settings_json, metadata_json, next_seq, \
                  provider_state_json, forked_from, created_at, updated_at) \
                 SELECT ?, user_id, title, settings_json, metadata_json, ?, \
                        NULL, id, ?, ? \
                 FROM conversations WHERE id = ?",
                params![fork_id, edited.seq + 1, now(), now(), conversation_id],
            )?;

            // Copy the prefix (client_message_id preserved so the edited
            // message stays addressable in the fork).
            let prefix: Vec<MessageRow> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {MESSAGE_COLS} FROM messages \
                     WHERE conversation_id = ? AND seq <= ? AND deleted = 0 \
                     ORDER BY seq ASC"
                ))?;
                let rows = stmt.query_map(params![conversation_id, edited.seq], row_to_message)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let mut edited_copy: Option<MessageRow> = None;
            for mut msg in prefix {
                msg.conversation_id = fork_id.clone();
                let is_edited = msg.client_message_id == client_message_id;
                if is_edited {
                    msg.content_text = new_content_text.clone();
                    msg.content_json = new_content_json.clone();
                    msg.updated_at = now();
                }
                msg.id = Uuid::new_v4().to_string();
                insert_message(&tx, &msg)?;
                if is_edited {
                    edited_copy = Some(msg);
                }
            }

            // Update the original in place and soft-remove its tail.
            tx.execute(
                "UPDATE messages SET content_text = ?, content_json = ?, updated_at = ? \
                 WHERE conversation_id = ? AND client_message_id = ?",
                params![
                    new_content_text,
                    new_content_json.as_ref().map(|v| v.to_string()),
                    now(),
                    conversation_id,
                    client_message_id,
                ],
            )?;
            tx.execute(
                "UPDATE messages SET deleted = 1, updated_at = ? \
                 WHERE conversation_id = ? AND seq > ?",
                params![now(), conversation_id, edited.seq],
            )?;
            tx.execute(
                "UPDATE conversations SET next_seq = ?, provider_state_json = NULL, \
                 updated_at = ? WHERE id = ?",
                params![edited.seq + 1, now(), conversation_id],
            )?;

            tx.commit()?;
            let edited_copy = edited_copy.ok_or_else(|| {
                DbError::Internal("edited message missing from copied prefix".into())
            })?;
            Ok((edited_copy, fork_id))
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationSettings;
    use serde_json::json;

    async fn fixture() -> (Db, String, String) {
        let db = Db::open_in_memory(None).await.unwrap();
        let (user, _) = db.create_user("a@example.com").await.unwrap();
        let conv = db
            .create_conversation(&user.id, None, ConversationSettings::default())
            .await
            .unwrap();
        (db, user.id, conv.id)
    }

    async fn append(db: &Db, user: &str, conv: &str, expected: i64, text: &str) -> MessageRow {
        db.append_user_message(
            conv,
            user,
            expected,
            text.to_string(),
            None,
            Uuid::new_v4().to_string(),
        )
        .await
        .unwrap()
    }

    // ── Sequence allocation and optimistic locking ────────────────────────────

    #[tokio::test]
    async fn seqs_are_dense_from_one() {
        let (db, user, conv) = fixture().await;
        let m1 = append(&db, &user, &conv, 0, "first").await;
        let m2 = append(&db, &user, &conv, 1, "second").await;
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
        let c = db.get_conversation(&user, &conv).await.unwrap();
        assert_eq!(c.next_seq, 3);
    }

    #[tokio::test]
    async fn stale_expected_seq_conflicts() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "first").await;
        let err = db
            .append_user_message(&conv, &user, 0, "again".into(), None, "c2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { expected: 0, current: 1 }));
        // The failed append must not have consumed a seq.
        let c = db.get_conversation(&user, &conv).await.unwrap();
        assert_eq!(c.next_seq, 2);
    }

    #[tokio::test]
    async fn two_appends_with_same_token_one_wins() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "base").await;

        let a = db.append_user_message(&conv, &user, 1, "a".into(), None, "ca".into());
        let b = db.append_user_message(&conv, &user, 1, "b".into(), None, "cb".into());
        let (ra, rb) = tokio::join!(a, b);
        let outcomes = [ra.is_ok(), rb.is_ok()];
        assert_eq!(
            outcomes.iter().filter(|ok| **ok).count(),
            1,
            "exactly one append must win"
        );
        let msgs = db.list_messages(&user, &conv).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs.last().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn append_scoped_to_owner() {
        let (db, user, conv) = fixture().await;
        let (other, _) = db.create_user("b@example.com").await.unwrap();
        let err = db
            .append_user_message(&conv, &other.id, 0, "x".into(), None, "c".into())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
        let _ = user;
    }

    // ── Event log, checkpoint, finalize ───────────────────────────────────────

    #[tokio::test]
    async fn events_buffer_until_checkpoint() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "q").await;
        let msg = db
            .begin_assistant_message(&conv, &user, None, Some("m1".into()))
            .await
            .unwrap();
        assert_eq!(msg.status, status::STREAMING);

        let s0 = db
            .append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": "hel" }))
            .await
            .unwrap();
        let s1 = db
            .append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": "lo" }))
            .await
            .unwrap();
        assert_eq!((s0, s1), (0, 1), "event seqs dense from 0");

        // Nothing durable yet.
        assert!(db.list_events(&user, &msg.id).await.unwrap().is_empty());

        db.checkpoint(&msg.id).await.unwrap();
        let events = db.list_events(&user, &msg.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["text"], "hel");

        // Further events continue the dense numbering after a flush.
        let s2 = db
            .append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": "!" }))
            .await
            .unwrap();
        assert_eq!(s2, 2);
        db.checkpoint(&msg.id).await.unwrap();
        assert_eq!(db.list_events(&user, &msg.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn replaying_events_reconstructs_content() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "q").await;
        let msg = db
            .begin_assistant_message(&conv, &user, None, None)
            .await
            .unwrap();
        for chunk in ["he", "llo", " world"] {
            db.append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": chunk }))
                .await
                .unwrap();
        }
        db.finalize_message(
            &msg.id,
            status::FINAL,
            "hello world".into(),
            None,
            None,
            None,
            vec![],
        )
        .await
        .unwrap();

        let events = db.list_events(&user, &msg.id).await.unwrap();
        let replayed: String = events
            .iter()
            .filter(|e| e.kind == event_kind::CONTENT_CHUNK)
            .filter_map(|e| e.payload["text"].as_str())
            .collect();
        let msgs = db.list_messages(&user, &conv).await.unwrap();
        assert_eq!(replayed, msgs.last().unwrap().content_text);
    }

    #[tokio::test]
    async fn terminal_message_rejects_events() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "q").await;
        let msg = db
            .begin_assistant_message(&conv, &user, None, None)
            .await
            .unwrap();
        db.finalize_message(&msg.id, status::FINAL, "done".into(), None, None, None, vec![])
            .await
            .unwrap();
        let err = db
            .append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": "late" }))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TerminalMessage(_)));
        // Double finalize is rejected too.
        assert!(db
            .finalize_message(&msg.id, status::ERROR, String::new(), None, None, None, vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn finalize_writes_tool_call_rows_in_index_order() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "q").await;
        let msg = db
            .begin_assistant_message(&conv, &user, None, None)
            .await
            .unwrap();
        db.finalize_message(
            &msg.id,
            status::FINAL,
            "done".into(),
            None,
            None,
            Some(json!({ "input_tokens": 10 })),
            vec![
                ToolCallRow {
                    call_index: 1,
                    tool_name: "web_search".into(),
                    arguments_json: "{}".into(),
                    text_offset: 5,
                    status: "success".into(),
                    output_ref: Some("results".into()),
                    started_at: None,
                    completed_at: None,
                },
                ToolCallRow {
                    call_index: 0,
                    tool_name: "get_time".into(),
                    arguments_json: "{}".into(),
                    text_offset: 0,
                    status: "success".into(),
                    output_ref: Some("12:00".into()),
                    started_at: None,
                    completed_at: None,
                },
            ],
        )
        .await
        .unwrap();

        let calls = db.list_tool_calls(&user, &msg.id).await.unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].call_index, 0);
        assert_eq!(calls[0].tool_name, "get_time");
        assert_eq!(calls[1].call_index, 1);
    }

    #[tokio::test]
    async fn abort_checkpoint_persists_partial_events() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "q").await;
        let msg = db
            .begin_assistant_message(&conv, &user, None, None)
            .await
            .unwrap();
        db.append_event(&msg.id, event_kind::CONTENT_CHUNK, json!({ "text": "partial" }))
            .await
            .unwrap();
        db.finalize_message(&msg.id, status::ABORTED, "partial".into(), None, None, None, vec![])
            .await
            .unwrap();

        let msgs = db.list_messages(&user, &conv).await.unwrap();
        assert_eq!(msgs.last().unwrap().status, status::ABORTED);
        let events = db.list_events(&user, &msg.id).await.unwrap();
        assert_eq!(events.len(), 1, "events before abort must be durable");
    }

    // ── Edit / fork ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn edit_forks_and_truncates() {
        let (db, user, conv) = fixture().await;
        let m1 = append(&db, &user, &conv, 0, "first").await;
        append(&db, &user, &conv, 1, "second").await;
        append(&db, &user, &conv, 2, "third").await;

        let (edited, fork_id) = db
            .edit_message(&user, &conv, &m1.client_message_id, "rewritten".into(), None, 3)
            .await
            .unwrap();
        assert_eq!(edited.content_text, "rewritten");
        assert_eq!(edited.conversation_id, fork_id);

        // Fork holds the prefix through the edit, addressable by client id.
        let fork_msgs = db.list_messages(&user, &fork_id).await.unwrap();
        assert_eq!(fork_msgs.len(), 1);
        assert_eq!(fork_msgs[0].client_message_id, m1.client_message_id);
        assert_eq!(fork_msgs[0].content_text, "rewritten");

        // Original is truncated to seq ≤ 1.
        let orig_msgs = db.list_messages(&user, &conv).await.unwrap();
        assert_eq!(orig_msgs.len(), 1);
        assert_eq!(orig_msgs[0].seq, 1);
        let c = db.get_conversation(&user, &conv).await.unwrap();
        assert_eq!(c.next_seq, 2);

        // Fork metadata: parent pointer set, provider state cleared.
        let fork = db.get_conversation(&user, &fork_id).await.unwrap();
        assert_eq!(fork.forked_from.as_deref(), Some(conv.as_str()));
        assert!(fork.provider_state.is_none());
        assert_eq!(fork.next_seq, 2);
    }

    #[tokio::test]
    async fn edit_clears_provider_state_on_original() {
        let (db, user, conv) = fixture().await;
        let m1 = append(&db, &user, &conv, 0, "first").await;
        db.set_provider_state(&user, &conv, Some("resp_9".into()))
            .await
            .unwrap();

        db.edit_message(&user, &conv, &m1.client_message_id, "new".into(), None, 1)
            .await
            .unwrap();
        let c = db.get_conversation(&user, &conv).await.unwrap();
        assert!(c.provider_state.is_none());
    }

    #[tokio::test]
    async fn edit_with_stale_token_conflicts() {
        let (db, user, conv) = fixture().await;
        let m1 = append(&db, &user, &conv, 0, "first").await;
        append(&db, &user, &conv, 1, "second").await;
        let err = db
            .edit_message(&user, &conv, &m1.client_message_id, "new".into(), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
    }

    #[tokio::test]
    async fn edit_unknown_message_not_found() {
        let (db, user, conv) = fixture().await;
        append(&db, &user, &conv, 0, "first").await;
        let err = db
            .edit_message(&user, &conv, "ghost", "new".into(), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound));
    }
}
