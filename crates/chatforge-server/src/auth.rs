// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer-token authentication.
//!
//! Every route behind the middleware sees an [`AuthUser`] extension; the
//! token is validated against the stored digest in constant time.  Handlers
//! never see the token itself.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use axum::Extension;

use chatforge_core::ApiError;

use crate::error::HttpError;
use crate::state::AppState;

/// The authenticated principal attached to every request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let user = state
        .db
        .user_by_token(token)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::unauthorized("invalid token"))?;

    request
        .extensions_mut()
        .insert(AuthUser { id: user.id, email: user.email });
    Ok(next.run(request).await)
}

/// Convenience alias used in handler signatures.
pub type Principal = Extension<AuthUser>;
