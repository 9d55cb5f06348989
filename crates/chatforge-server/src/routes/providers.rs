// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider CRUD.  API keys go in, never come back out: responses only ever
//! carry `has_api_key`.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};

use chatforge_core::ApiError;
use chatforge_db::{NewProvider, ProviderRecord};
use chatforge_model::ProviderKind;

use crate::auth::Principal;
use crate::error::HttpError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateProviderBody {
    pub provider_type: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
    #[serde(default)]
    pub metadata: Value,
}

fn default_base_url(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
        ProviderKind::Anthropic => Some("https://api.anthropic.com"),
        ProviderKind::Gemini => Some("https://generativelanguage.googleapis.com"),
        ProviderKind::GenericOpenAiCompatible => None,
    }
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Principal,
    Json(body): Json<CreateProviderBody>,
) -> Result<Json<Value>, HttpError> {
    let kind = ProviderKind::parse(&body.provider_type).ok_or_else(|| {
        ApiError::validation(format!("unknown provider type '{}'", body.provider_type))
    })?;
    let base_url = body
        .base_url
        .or_else(|| default_base_url(kind).map(str::to_string))
        .ok_or_else(|| {
            ApiError::validation("base_url is required for generic_openai_compatible providers")
        })?;
    let metadata = if body.metadata.is_null() { json!({}) } else { body.metadata };

    let record = state
        .db
        .create_provider(
            &user.id,
            NewProvider {
                provider_type: body.provider_type,
                base_url,
                api_key: body.api_key,
                is_default: body.is_default,
                extra_headers: body.extra_headers,
                metadata,
            },
        )
        .await?;
    Ok(Json(provider_json(&record)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Principal,
) -> Result<Json<Value>, HttpError> {
    let records = state.db.list_providers(&user.id).await?;
    Ok(Json(json!({
        "providers": records.iter().map(provider_json).collect::<Vec<_>>()
    })))
}

pub async fn set_default(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    state.db.set_default_provider(&user.id, &id).await?;
    Ok(Json(json!({ "default": id })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    state.db.delete_provider(&user.id, &id).await?;
    Ok(Json(json!({ "deleted": true })))
}

fn provider_json(record: &ProviderRecord) -> Value {
    json!({
        "id": record.id,
        "provider_type": record.provider_type,
        "base_url": record.base_url,
        "has_api_key": record.has_api_key,
        "enabled": record.enabled,
        "is_default": record.is_default,
        "extra_headers": record.extra_headers,
        "metadata": record.metadata,
        "created_at": record.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_urls_cover_hosted_kinds() {
        assert!(default_base_url(ProviderKind::OpenAi).unwrap().contains("api.openai.com"));
        assert!(default_base_url(ProviderKind::Anthropic).unwrap().contains("anthropic"));
        assert!(default_base_url(ProviderKind::Gemini).unwrap().contains("googleapis"));
        assert!(default_base_url(ProviderKind::GenericOpenAiCompatible).is_none());
    }

    #[test]
    fn provider_json_never_carries_key_material() {
        let record = ProviderRecord {
            id: "p1".into(),
            user_id: "u1".into(),
            provider_type: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            has_api_key: true,
            enabled: true,
            is_default: true,
            extra_headers: vec![],
            metadata: json!({}),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        let body = provider_json(&record);
        assert_eq!(body["has_api_key"], json!(true));
        assert!(body.get("api_key").is_none());
        assert!(body.get("api_key_enc").is_none());
    }
}
