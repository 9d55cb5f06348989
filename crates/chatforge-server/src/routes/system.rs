// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Liveness and per-user settings.

use axum::extract::State;
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};

use chatforge_core::ApiError;
use chatforge_db::UserSettings;

use crate::auth::Principal;
use crate::error::HttpError;
use crate::state::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(json!({ "status": if db_ok { "ok" } else { "degraded" }, "database": db_ok }))
}

pub async fn get_settings(
    State(state): State<AppState>,
    Extension(user): Principal,
) -> Result<Json<Value>, HttpError> {
    let settings = state.db.get_user_settings(&user.id).await?;
    Ok(Json(settings_json(&settings, &state)))
}

#[derive(Deserialize)]
pub struct PutSettingsBody {
    pub max_tool_iterations: Option<u32>,
    pub default_model: Option<String>,
    pub default_provider_id: Option<String>,
}

pub async fn put_settings(
    State(state): State<AppState>,
    Extension(user): Principal,
    Json(body): Json<PutSettingsBody>,
) -> Result<Json<Value>, HttpError> {
    if let Some(n) = body.max_tool_iterations {
        if !(1..=50).contains(&n) {
            return Err(ApiError::validation("max_tool_iterations must be in 1..=50").into());
        }
    }
    let settings = UserSettings {
        max_tool_iterations: body.max_tool_iterations,
        default_model: body.default_model,
        default_provider_id: body.default_provider_id,
    };
    state.db.put_user_settings(&user.id, settings).await?;
    let settings = state.db.get_user_settings(&user.id).await?;
    Ok(Json(settings_json(&settings, &state)))
}

fn settings_json(settings: &UserSettings, state: &AppState) -> Value {
    json!({
        "max_tool_iterations": settings
            .max_tool_iterations
            .unwrap_or(state.config.orchestrator.max_tool_iterations),
        "default_model": settings.default_model,
        "default_provider_id": settings.default_provider_id,
    })
}
