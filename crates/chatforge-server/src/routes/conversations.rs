// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation CRUD plus the intent-envelope edit route.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use serde_json::{json, Value};

use chatforge_core::ApiError;
use chatforge_db::{Conversation, ConversationSettings, MessageRow};

use crate::auth::Principal;
use crate::error::HttpError;
use crate::intent::{self, IntentEnvelope};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateConversationBody {
    pub title: Option<String>,
    #[serde(default)]
    pub settings: ConversationSettings,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(user): Principal,
    Json(body): Json<CreateConversationBody>,
) -> Result<Json<Value>, HttpError> {
    let conv = state
        .db
        .create_conversation(&user.id, body.title, body.settings)
        .await?;
    Ok(Json(conversation_json(&conv)))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(user): Principal,
) -> Result<Json<Value>, HttpError> {
    let conversations = state.db.list_conversations(&user.id).await?;
    let items: Vec<Value> = conversations.iter().map(conversation_json).collect();
    Ok(Json(json!({ "conversations": items })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let conv = state.db.get_conversation(&user.id, &id).await?;
    let messages = state.db.list_messages(&user.id, &id).await?;
    let mut body = conversation_json(&conv);
    body["messages"] = json!(messages.iter().map(message_json).collect::<Vec<_>>());
    Ok(Json(body))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    state.db.delete_conversation(&user.id, &id).await?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct UpdateSettingsBody {
    pub settings: ConversationSettings,
}

pub async fn update_settings(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path(id): Path<String>,
    Json(body): Json<UpdateSettingsBody>,
) -> Result<Json<Value>, HttpError> {
    state
        .db
        .update_conversation_settings(&user.id, &id, body.settings)
        .await?;
    let conv = state.db.get_conversation(&user.id, &id).await?;
    Ok(Json(conversation_json(&conv)))
}

#[derive(Deserialize)]
pub struct EditBody {
    pub intent: Option<IntentEnvelope>,
}

/// `POST /v1/conversations/:id/messages/:message_id/edit` — edit via fork.
///
/// Unlike the chat route, a stale optimistic-lock token here is a plain
/// taxonomy `conflict` (HTTP 409).
pub async fn edit_message(
    State(state): State<AppState>,
    Extension(user): Principal,
    Path((conversation_id, message_id)): Path<(String, String)>,
    Json(body): Json<EditBody>,
) -> Result<Json<Value>, HttpError> {
    let edit = intent::validate_edit(body.intent)?;
    if edit.message_id != message_id {
        return Err(ApiError::validation("intent.message_id does not match the route").into());
    }
    let (text, json_form) = intent::split_content(&edit.content);
    let (message, fork_id) = state
        .db
        .edit_message(
            &user.id,
            &conversation_id,
            &message_id,
            text,
            json_form,
            edit.expected_last_seq,
        )
        .await?;
    Ok(Json(json!({
        "message": message_json(&message),
        "new_conversation_id": fork_id,
    })))
}

fn conversation_json(conv: &Conversation) -> Value {
    json!({
        "id": conv.id,
        "title": conv.title,
        "settings": conv.settings,
        "metadata": conv.metadata,
        "last_seq": conv.next_seq - 1,
        "forked_from": conv.forked_from,
        "created_at": conv.created_at,
        "updated_at": conv.updated_at,
    })
}

fn message_json(msg: &MessageRow) -> Value {
    json!({
        "id": msg.client_message_id,
        "seq": msg.seq,
        "role": msg.role,
        "status": msg.status,
        "content": msg.content_json.clone().unwrap_or(Value::String(msg.content_text.clone())),
        "model": msg.model,
        "provider_id": msg.provider_id,
        "usage": msg.usage,
        "created_at": msg.created_at,
    })
}
