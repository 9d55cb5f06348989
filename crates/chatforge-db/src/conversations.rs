// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DbError;
use crate::store::{now, Db};

/// Settings snapshot carried by every conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools_enabled: bool,
    #[serde(default)]
    pub streaming_enabled: bool,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub quality_level: Option<String>,
    #[serde(default)]
    pub custom_params_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub settings: ConversationSettings,
    pub metadata: Value,
    pub next_seq: i64,
    /// Provider-side continuity state (`{"previous_response_id": …}`).
    pub provider_state: Option<Value>,
    pub forked_from: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub(crate) fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let settings_json: String = row.get(3)?;
    let metadata_json: String = row.get(4)?;
    let provider_state_json: Option<String> = row.get(6)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        settings: serde_json::from_str(&settings_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        next_seq: row.get(5)?,
        provider_state: provider_state_json.and_then(|s| serde_json::from_str(&s).ok()),
        forked_from: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

pub(crate) const CONVERSATION_COLS: &str = "id, user_id, title, settings_json, metadata_json, \
     next_seq, provider_state_json, forked_from, created_at, updated_at";

/// Fetch a live conversation scoped to its owner.  Missing and not-owned are
/// the same error.
pub(crate) fn get_conversation_tx(
    conn: &Connection,
    user_id: &str,
    conversation_id: &str,
) -> Result<Conversation, DbError> {
    conn.query_row(
        &format!(
            "SELECT {CONVERSATION_COLS} FROM conversations \
             WHERE id = ? AND user_id = ? AND deleted = 0"
        ),
        params![conversation_id, user_id],
        row_to_conversation,
    )
    .optional()?
    .ok_or(DbError::NotFound)
}

impl Db {
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<String>,
        settings: ConversationSettings,
    ) -> Result<Conversation, DbError> {
        let conv = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title,
            settings,
            metadata: Value::Object(Default::default()),
            next_seq: 1,
            provider_state: None,
            forked_from: None,
            created_at: now(),
            updated_at: now(),
        };
        let insert = conv.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO conversations \
                 (id, user_id, title, settings_json, metadata_json, next_seq, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    insert.id,
                    insert.user_id,
                    insert.title,
                    serde_json::to_string(&insert.settings).map_err(DbError::internal)?,
                    insert.metadata.to_string(),
                    insert.next_seq,
                    insert.created_at,
                    insert.updated_at,
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(conv)
    }

    pub async fn get_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation, DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.run_read(move |conn| get_conversation_tx(conn, &user_id, &conversation_id))
            .await
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, DbError> {
        let user_id = user_id.to_string();
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLS} FROM conversations \
                 WHERE user_id = ? AND deleted = 0 ORDER BY updated_at DESC"
            ))?;
            let rows = stmt.query_map(params![user_id], row_to_conversation)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Soft delete; rows stay for audit and retention sweeping.
    pub async fn delete_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let n = conn.execute(
                "UPDATE conversations SET deleted = 1, updated_at = ? \
                 WHERE id = ? AND user_id = ? AND deleted = 0",
                params![now(), conversation_id, user_id],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
        .await
    }

    pub async fn update_conversation_settings(
        &self,
        user_id: &str,
        conversation_id: &str,
        settings: ConversationSettings,
    ) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let n = conn.execute(
                "UPDATE conversations SET settings_json = ?, updated_at = ? \
                 WHERE id = ? AND user_id = ? AND deleted = 0",
                params![
                    serde_json::to_string(&settings).map_err(DbError::internal)?,
                    now(),
                    conversation_id,
                    user_id,
                ],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Store the Responses-API continuity token for the next turn.
    pub async fn set_provider_state(
        &self,
        user_id: &str,
        conversation_id: &str,
        previous_response_id: Option<String>,
    ) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.run_blocking(move |conn| {
            let state = previous_response_id
                .map(|id| serde_json::json!({ "previous_response_id": id }).to_string());
            let n = conn.execute(
                "UPDATE conversations SET provider_state_json = ?, updated_at = ? \
                 WHERE id = ? AND user_id = ? AND deleted = 0",
                params![state, now(), conversation_id, user_id],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
        .await
    }

    /// Soft-delete conversations beyond the per-user caps and retention
    /// window.  Returns how many were swept.
    pub async fn sweep_retention(
        &self,
        max_conversations_per_user: u32,
        retention_days: u32,
    ) -> Result<usize, DbError> {
        self.run_blocking(move |conn| {
            let cutoff = (chrono::Utc::now()
                - chrono::Duration::days(retention_days as i64))
            .to_rfc3339();
            let mut swept = conn.execute(
                "UPDATE conversations SET deleted = 1 WHERE deleted = 0 AND updated_at < ?",
                params![cutoff],
            )?;
            // Oldest conversations past the per-user cap.
            swept += conn.execute(
                "UPDATE conversations SET deleted = 1 WHERE deleted = 0 AND id IN ( \
                   SELECT id FROM ( \
                     SELECT id, row_number() OVER ( \
                       PARTITION BY user_id ORDER BY updated_at DESC \
                     ) AS rn FROM conversations WHERE deleted = 0 \
                   ) WHERE rn > ? \
                 )",
                params![max_conversations_per_user as i64],
            )?;
            Ok(swept)
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
