//! Parley HTTP REST API
//!
//! Axum-based server exposing the session lifecycle, chat and health
//! endpoints. Handlers are thin: they extract the caller and the payload and
//! delegate to [`SessionService`], which is directly testable without axum.
//!
//! Endpoints (all under `/api/v1` require `X-User-ID`):
//! - POST   /chat: send with an implicit session
//! - POST   /chat/abort: abort by session id
//! - POST   /chat/sessions: create session
//! - GET    /chat/sessions: list sessions
//! - GET    /chat/sessions/search: keyword search
//! - GET    /chat/sessions/:id: get session
//! - PATCH  /chat/sessions/:id: update session
//! - DELETE /chat/sessions/:id: soft-delete
//! - POST   /chat/sessions/:id/pin: pin (`?pinned=bool`)
//! - POST   /chat/sessions/:id/archive: archive (`?archived=bool`)
//! - POST   /chat/sessions/:id/messages: send message
//! - GET    /chat/sessions/:id/messages: list messages
//! - GET    /chat/messages/:id: get message
//! - POST   /chat/messages/:id/abort: abort the generation owning a message
//! - GET    /health: health report

pub mod chat;
pub mod envelope;
pub mod health;
pub mod messages;
pub mod middleware;
pub mod sessions;

use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use parley_core::error::{AppError, ErrorCode};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;

use crate::subsystems::health::HealthProbe;
use crate::subsystems::lifecycle::SessionService;
use envelope::ApiError;

/// Shared state for all HTTP handlers
pub struct HttpState {
    pub sessions: Arc<SessionService>,
    pub health: Arc<HealthProbe>,
    pub cors_origins: Vec<String>,
}

/// Build the Axum router with all endpoints and the middleware stack.
pub fn build_router(state: Arc<HttpState>) -> Router {
    let api = Router::new()
        .route("/chat", post(chat::send_chat))
        .route("/chat/abort", post(chat::abort_chat))
        .route(
            "/chat/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route("/chat/sessions/search", get(sessions::search_sessions))
        .route(
            "/chat/sessions/:id",
            get(sessions::get_session)
                .patch(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route("/chat/sessions/:id/pin", post(sessions::pin_session))
        .route("/chat/sessions/:id/archive", post(sessions::archive_session))
        .route(
            "/chat/sessions/:id/messages",
            post(messages::send_message).get(messages::list_messages),
        )
        .route("/chat/messages/:id", get(messages::get_message))
        .route("/chat/messages/:id/abort", post(messages::abort_message))
        .route_layer(axum::middleware::from_fn(middleware::require_user));

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
        .fallback(not_found)
        .layer(middleware::cors_layer(&state.cors_origins))
        .layer(axum::middleware::from_fn(middleware::preflight_no_content))
        .layer(axum::middleware::from_fn(middleware::request_context))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .with_state(state)
}

async fn not_found() -> ApiError {
    ApiError(AppError::new(ErrorCode::NotFound, "route not found"))
}

/// Start the HTTP server on `addr`.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    addr: &str,
    state: Arc<HttpState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Parley HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}
