// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::params;

use crate::error::DbError;
use crate::store::{now, Db};

#[derive(Debug, Clone)]
pub struct JournalRow {
    pub id: i64,
    pub user_id: String,
    pub text: String,
    pub created_at: String,
}

impl Db {
    pub async fn journal_append(&self, user_id: &str, text: &str) -> Result<i64, DbError> {
        let user_id = user_id.to_string();
        let text = text.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO journal_entries (user_id, text, created_at) VALUES (?, ?, ?)",
                params![user_id, text, now()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn journal_list(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<JournalRow>, DbError> {
        let user_id = user_id.to_string();
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, text, created_at FROM journal_entries \
                 WHERE user_id = ? ORDER BY id DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok(JournalRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    text: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn journal_search(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<JournalRow>, DbError> {
        let user_id = user_id.to_string();
        // Escape LIKE wildcards so user text matches literally.
        let pattern = format!(
            "%{}%",
            query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, text, created_at FROM journal_entries \
                 WHERE user_id = ? AND text LIKE ? ESCAPE '\\' ORDER BY id DESC LIMIT ?",
            )?;
            let rows = stmt.query_map(params![user_id, pattern, limit as i64], |row| {
                Ok(JournalRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    text: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
