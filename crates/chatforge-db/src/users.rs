// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::crypto::{token_hash, token_matches};
use crate::error::DbError;
use crate::store::{now, Db};

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: String,
}

/// Per-user orchestrator settings; absent columns fall back to server config.
#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub max_tool_iterations: Option<u32>,
    pub default_model: Option<String>,
    pub default_provider_id: Option<String>,
}

impl Db {
    /// Create a user and mint their bearer token.  The raw token is returned
    /// exactly once; only its digest is stored.
    pub async fn create_user(&self, email: &str) -> Result<(User, String), DbError> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            created_at: now(),
        };
        let token = format!("cfk_{}", Uuid::new_v4().simple());
        let hash = token_hash(&token);

        let insert = user.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO users (id, email, api_token_hash, created_at) VALUES (?, ?, ?, ?)",
                params![insert.id, insert.email, hash, insert.created_at],
            )?;
            Ok(())
        })
        .await?;

        Ok((user, token))
    }

    /// Resolve a bearer token to its user.  Constant-time comparison against
    /// the stored digest; returns `None` for unknown or revoked tokens.
    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>, DbError> {
        let hash = token_hash(token);
        let token = token.to_string();
        self.run_read(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, email, api_token_hash, created_at FROM users \
                     WHERE api_token_hash = ?",
                    params![hash],
                    |row| {
                        Ok((
                            User {
                                id: row.get(0)?,
                                email: row.get(1)?,
                                created_at: row.get(3)?,
                            },
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row.and_then(|(user, stored)| token_matches(&token, &stored).then_some(user)))
        })
        .await
    }

    pub async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, DbError> {
        let user_id = user_id.to_string();
        self.run_read(move |conn| {
            let row = conn
                .query_row(
                    "SELECT max_tool_iterations, default_model, default_provider_id \
                     FROM user_settings WHERE user_id = ?",
                    params![user_id],
                    |row| {
                        Ok(UserSettings {
                            max_tool_iterations: row.get::<_, Option<i64>>(0)?.map(|n| n as u32),
                            default_model: row.get(1)?,
                            default_provider_id: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or_default())
        })
        .await
    }

    pub async fn put_user_settings(
        &self,
        user_id: &str,
        settings: UserSettings,
    ) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO user_settings \
                 (user_id, max_tool_iterations, default_model, default_provider_id, updated_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(user_id) DO UPDATE SET \
                   max_tool_iterations = excluded.max_tool_iterations, \
                   default_model = excluded.default_model, \
                   default_provider_id = excluded.default_provider_id, \
                   updated_at = excluded.updated_at",
                params![
                    user_id,
                    settings.max_tool_iterations.map(|n| n as i64),
                    settings.default_model,
                    settings.default_provider_id,
                    now(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_resolve_user_by_token() {
        let db = Db::open_in_memory(None).await.unwrap();
        let (user, token) = db.create_user("a@example.com").await.unwrap();
        assert!(token.starts_with("cfk_"));

        let resolved = db.user_by_token(&token).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);
        assert_eq!(resolved.email, "a@example.com");
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_none() {
        let db = Db::open_in_memory(None).await.unwrap();
        db.create_user("a@example.com").await.unwrap();
        assert!(db.user_by_token("cfk_bogus").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let db = Db::open_in_memory(None).await.unwrap();
        db.create_user("a@example.com").await.unwrap();
        assert!(db.create_user("a@example.com").await.is_err());
    }

    #[tokio::test]
    async fn settings_default_then_round_trip() {
        let db = Db::open_in_memory(None).await.unwrap();
        let (user, _) = db.create_user("a@example.com").await.unwrap();

        let s = db.get_user_settings(&user.id).await.unwrap();
        assert!(s.max_tool_iterations.is_none());

        db.put_user_settings(
            &user.id,
            UserSettings {
                max_tool_iterations: Some(5),
                default_model: Some("m1".into()),
                default_provider_id: None,
            },
        )
        .await
        .unwrap();

        let s = db.get_user_settings(&user.id).await.unwrap();
        assert_eq!(s.max_tool_iterations, Some(5));
        assert_eq!(s.default_model.as_deref(), Some("m1"));

        // Upsert replaces.
        db.put_user_settings(
            &user.id,
            UserSettings { max_tool_iterations: Some(7), ..Default::default() },
        )
        .await
        .unwrap();
        let s = db.get_user_settings(&user.id).await.unwrap();
        assert_eq!(s.max_tool_iterations, Some(7));
        assert!(s.default_model.is_none());
    }
}
