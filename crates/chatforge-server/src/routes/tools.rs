// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `GET /v1/tools` — tool discovery with per-tool credential status.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let tools: Vec<Value> = state
        .tools
        .schemas()
        .into_iter()
        .map(|s| {
            json!({
                "type": "function",
                "function": {
                    "name": s.name,
                    "description": s.description,
                    "parameters": s.parameters,
                }
            })
        })
        .collect();
    let status: Value = serde_json::to_value(state.tools.api_key_status()).unwrap_or_default();
    Json(json!({
        "tools": tools,
        "tool_api_key_status": status,
    }))
}
