// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DbError;
use crate::store::{now, Db};

/// A stored provider record.  `api_key` here is the *sealed* form; use
/// [`Db::provider_api_key`] to obtain the plaintext for an outbound request.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: String,
    pub user_id: String,
    pub provider_type: String,
    pub base_url: String,
    pub has_api_key: bool,
    pub enabled: bool,
    pub is_default: bool,
    pub extra_headers: Vec<(String, String)>,
    pub metadata: Value,
    pub created_at: String,
}

pub struct NewProvider {
    pub provider_type: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub is_default: bool,
    pub extra_headers: Vec<(String, String)>,
    pub metadata: Value,
}

const PROVIDER_COLS: &str = "id, user_id, provider_type, base_url, api_key_enc, enabled, \
     is_default, extra_headers_json, metadata_json, created_at";

fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderRecord> {
    let api_key_enc: Option<String> = row.get(4)?;
    let headers_json: String = row.get(7)?;
    let metadata_json: String = row.get(8)?;
    Ok(ProviderRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider_type: row.get(2)?,
        base_url: row.get(3)?,
        has_api_key: api_key_enc.is_some(),
        enabled: row.get::<_, i64>(5)? != 0,
        is_default: row.get::<_, i64>(6)? != 0,
        extra_headers: serde_json::from_str(&headers_json).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
        created_at: row.get(9)?,
    })
}

impl Db {
    /// Create a provider record, sealing the API key at rest.  Marking it
    /// default clears any previous default in the same transaction, keeping
    /// at most one `is_default` per user.
    pub async fn create_provider(
        &self,
        user_id: &str,
        new: NewProvider,
    ) -> Result<ProviderRecord, DbError> {
        let sealed = match &new.api_key {
            Some(key) => Some(self.cipher()?.encrypt(key)?),
            None => None,
        };
        let user_id = user_id.to_string();
        let id = Uuid::new_v4().to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            if new.is_default {
                tx.execute(
                    "UPDATE providers SET is_default = 0 WHERE user_id = ?",
                    params![user_id],
                )?;
            }
            tx.execute(
                "INSERT INTO providers \
                 (id, user_id, provider_type, base_url, api_key_enc, enabled, is_default, \
                  extra_headers_json, metadata_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
                params![
                    id,
                    user_id,
                    new.provider_type,
                    new.base_url,
                    sealed,
                    new.is_default as i64,
                    serde_json::to_string(&new.extra_headers).map_err(DbError::internal)?,
                    new.metadata.to_string(),
                    now(),
                ],
            )?;
            let record = tx.query_row(
                &format!("SELECT {PROVIDER_COLS} FROM providers WHERE id = ?"),
                params![id],
                row_to_provider,
            )?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    pub async fn get_provider(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<ProviderRecord, DbError> {
        let user_id = user_id.to_string();
        let provider_id = provider_id.to_string();
        self.run_read(move |conn| {
            conn.query_row(
                &format!("SELECT {PROVIDER_COLS} FROM providers WHERE id = ? AND user_id = ?"),
                params![provider_id, user_id],
                row_to_provider,
            )
            .optional()?
            .ok_or(DbError::NotFound)
        })
        .await
    }

    /// The user's default provider, if one is marked.
    pub async fn default_provider(&self, user_id: &str) -> Result<Option<ProviderRecord>, DbError> {
        let user_id = user_id.to_string();
        self.run_read(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {PROVIDER_COLS} FROM providers \
                         WHERE user_id = ? AND is_default = 1 AND enabled = 1"
                    ),
                    params![user_id],
                    row_to_provider,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_providers(&self, user_id: &str) -> Result<Vec<ProviderRecord>, DbError> {
        let user_id = user_id.to_string();
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PROVIDER_COLS} FROM providers WHERE user_id = ? ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], row_to_provider)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Decrypt the stored API key for an outbound request.  This is the only
    /// accessor that returns the plaintext.
    pub async fn provider_api_key(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<Option<String>, DbError> {
        let user_id_q = user_id.to_string();
        let provider_id = provider_id.to_string();
        let sealed: Option<String> = self
            .run_read(move |conn| {
                conn.query_row(
                    "SELECT api_key_enc FROM providers WHERE id = ? AND user_id = ?",
                    params![provider_id, user_id_q],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(DbError::NotFound)
            })
            .await?;
        match sealed {
            Some(s) => Ok(Some(self.cipher()?.decrypt(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn set_default_provider(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        let provider_id = provider_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let n = tx.execute(
                "UPDATE providers SET is_default = 1 WHERE id = ? AND user_id = ?",
                params![provider_id, user_id],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
            tx.execute(
                "UPDATE providers SET is_default = 0 WHERE user_id = ? AND id != ?",
                params![user_id, provider_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_provider(&self, user_id: &str, provider_id: &str) -> Result<(), DbError> {
        let user_id = user_id.to_string();
        let provider_id = provider_id.to_string();
        self.run_blocking(move |conn| {
            let n = conn.execute(
                "DELETE FROM providers WHERE id = ? AND user_id = ?",
                params![provider_id, user_id],
            )?;
            if n == 0 {
                return Err(DbError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "abababababababababababababababababababababababababababababababab";

    async fn fixture() -> (Db, String) {
        let db = Db::open_in_memory(Some(MASTER)).await.unwrap();
        let (user, _) = db.create_user("a@example.com").await.unwrap();
        (db, user.id)
    }

    fn new_provider(default: bool) -> NewProvider {
        NewProvider {
            provider_type: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key: Some("sk-ant-secret".into()),
            is_default: default,
            extra_headers: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn create_seals_key_and_round_trips() {
        let (db, user) = fixture().await;
        let record = db.create_provider(&user, new_provider(true)).await.unwrap();
        assert!(record.has_api_key);

        let key = db.provider_api_key(&user, &record.id).await.unwrap();
        assert_eq!(key.as_deref(), Some("sk-ant-secret"));
    }

    #[tokio::test]
    async fn sealed_key_is_not_plaintext_in_storage() {
        let (db, user) = fixture().await;
        let record = db.create_provider(&user, new_provider(true)).await.unwrap();
        let raw: String = db
            .run_blocking({
                let id = record.id.clone();
                move |conn| {
                    Ok(conn.query_row(
                        "SELECT api_key_enc FROM providers WHERE id = ?",
                        params![id],
                        |row| row.get(0),
                    )?)
                }
            })
            .await
            .unwrap();
        assert!(!raw.contains("sk-ant-secret"));
    }

    #[tokio::test]
    async fn at_most_one_default_per_user() {
        let (db, user) = fixture().await;
        let a = db.create_provider(&user, new_provider(true)).await.unwrap();
        let b = db.create_provider(&user, new_provider(true)).await.unwrap();

        let records = db.list_providers(&user).await.unwrap();
        let defaults: Vec<_> = records.iter().filter(|r| r.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, b.id);

        db.set_default_provider(&user, &a.id).await.unwrap();
        let records = db.list_providers(&user).await.unwrap();
        let defaults: Vec<_> = records.iter().filter(|r| r.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, a.id);
    }

    #[tokio::test]
    async fn default_provider_lookup() {
        let (db, user) = fixture().await;
        assert!(db.default_provider(&user).await.unwrap().is_none());
        let a = db.create_provider(&user, new_provider(true)).await.unwrap();
        assert_eq!(db.default_provider(&user).await.unwrap().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn provider_scoped_to_owner() {
        let (db, user) = fixture().await;
        let (other, _) = db.create_user("b@example.com").await.unwrap();
        let record = db.create_provider(&user, new_provider(false)).await.unwrap();
        assert!(db.get_provider(&other.id, &record.id).await.is_err());
        assert!(db.provider_api_key(&other.id, &record.id).await.is_err());
        assert!(db.delete_provider(&other.id, &record.id).await.is_err());
    }

    #[tokio::test]
    async fn create_without_master_key_fails_when_key_present() {
        let db = Db::open_in_memory(None).await.unwrap();
        let (user, _) = db.create_user("a@example.com").await.unwrap();
        let err = db.create_provider(&user.id, new_provider(false)).await.unwrap_err();
        assert!(matches!(err, DbError::NoMasterKey));
    }

    #[tokio::test]
    async fn keyless_provider_allowed_without_master_key() {
        let db = Db::open_in_memory(None).await.unwrap();
        let (user, _) = db.create_user("a@example.com").await.unwrap();
        let record = db
            .create_provider(
                &user.id,
                NewProvider {
                    provider_type: "generic_openai_compatible".into(),
                    base_url: "http://localhost:11434/v1".into(),
                    api_key: None,
                    is_default: false,
                    extra_headers: vec![],
                    metadata: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        assert!(!record.has_api_key);
        assert!(db
            .provider_api_key(&user.id, &record.id)
            .await
            .unwrap()
            .is_none());
    }
}
