// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP surface of the ChatForge backend.
//!
//! Every route sits behind the bearer-token middleware except `/healthz`.
//! The chat pipeline lives in [`routes::chat`]; SSE framing in [`sse`].

pub mod auth;
pub mod error;
pub mod intent;
pub mod routes;
pub mod sse;
pub mod state;

use axum::http::Method;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

pub use state::{spawn_retention_sweeper, AppState as ServerState};

/// Assemble the application router.
pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/v1/chat/completions", post(routes::chat::chat_completions))
        .route("/v1/chat/completions/stop", post(routes::chat::stop))
        .route("/v1/tools", get(routes::tools::list))
        .route("/v1/models", get(routes::models::list))
        .route(
            "/v1/conversations",
            get(routes::conversations::list).post(routes::conversations::create),
        )
        .route(
            "/v1/conversations/:id",
            get(routes::conversations::get).delete(routes::conversations::delete),
        )
        .route("/v1/conversations/:id/settings", put(routes::conversations::update_settings))
        .route(
            "/v1/conversations/:id/messages/:message_id/edit",
            post(routes::conversations::edit_message),
        )
        .route(
            "/v1/providers",
            get(routes::providers::list).post(routes::providers::create),
        )
        .route("/v1/providers/:id", delete(routes::providers::delete))
        .route("/v1/providers/:id/default", post(routes::providers::set_default))
        .route(
            "/v1/user/settings",
            get(routes::system::get_settings).put(routes::system::put_settings),
        )
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    let mut app = Router::new()
        .route("/healthz", get(routes::system::healthz))
        .merge(authed);

    if state.config.server.permissive_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app.with_state(state)
}

/// Bind and serve until the process is stopped.  Spawns the background
/// sweepers (retention, model-list cache) alongside the listener.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.server.bind.clone();

    spawn_retention_sweeper(state.db.clone(), state.config.clone());
    state.models_cache.spawn_sweeper();
    state.fetch_cache.spawn_sweeper();

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
