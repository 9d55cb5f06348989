// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /v1/models` — merged model listing across the caller's enabled
//! providers, served through the process-wide TTL cache.

use std::time::Duration;

use axum::extract::State;
use axum::response::Json;
use axum::Extension;
use serde_json::{json, Value};
use tracing::warn;

use chatforge_model::{HttpProvider, ModelProvider, ProviderConfig, ProviderKind};

use crate::auth::Principal;
use crate::error::HttpError;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Principal,
) -> Result<Json<Value>, HttpError> {
    let records = state.db.list_providers(&user.id).await?;
    let connect_timeout = Duration::from_secs(state.config.orchestrator.connect_timeout_secs);

    let mut data: Vec<Value> = Vec::new();
    for record in records.into_iter().filter(|r| r.enabled) {
        let names = match state.models_cache.get(&record.id) {
            Some(cached) => cached,
            None => {
                let Some(kind) = ProviderKind::parse(&record.provider_type) else {
                    continue;
                };
                let api_key = match state.db.provider_api_key(&user.id, &record.id).await {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(provider = %record.id, error = %e, "key unavailable; skipping");
                        continue;
                    }
                };
                let provider = match HttpProvider::new(
                    ProviderConfig {
                        id: record.id.clone(),
                        kind,
                        base_url: record.base_url.clone(),
                        api_key,
                        extra_headers: record.extra_headers.clone(),
                        metadata: record.metadata.clone(),
                    },
                    connect_timeout,
                ) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(provider = %record.id, error = %e, "provider unusable; skipping");
                        continue;
                    }
                };
                match provider.list_models().await {
                    Ok(names) => {
                        state.models_cache.put(&record.id, names.clone());
                        names
                    }
                    Err(e) => {
                        // Listing is best-effort; a dead upstream must not
                        // take the whole endpoint down.
                        warn!(provider = %record.id, error = %e, "model listing failed");
                        continue;
                    }
                }
            }
        };

        // Optional per-provider model filter from metadata.
        let filter: Option<Vec<String>> = record.metadata["model_filter"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
        for name in names {
            if let Some(filter) = &filter {
                if !filter.iter().any(|f| name.contains(f.as_str())) {
                    continue;
                }
            }
            data.push(json!({
                "id": name,
                "object": "model",
                "owned_by": record.provider_type,
                "provider_id": record.id,
            }));
        }
    }

    Ok(Json(json!({ "object": "list", "data": data })))
}
