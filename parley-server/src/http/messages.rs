//! Message handlers: send/list within a session, get and abort by message id.

use std::sync::Arc;

use axum::extract::{Path, State};
use parley_core::models::Message;
use tokio_util::sync::CancellationToken;

use super::envelope::{ok, ApiJson, ApiQuery, ApiResult};
use super::middleware::CurrentUser;
use super::HttpState;
use crate::subsystems::lifecycle::{PageParams, PageResult, SendMessageRequest};
use crate::subsystems::orchestrator::{AbortOutcome, ChatResponse};

pub async fn send_message(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
    ApiJson(req): ApiJson<SendMessageRequest>,
) -> ApiResult<ChatResponse> {
    // Dropped with the handler future when the client disconnects.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    ok(state
        .sessions
        .send_message(&cancel, &user_id, &session_id, req)
        .await?)
}

pub async fn list_messages(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
    ApiQuery(params): ApiQuery<PageParams>,
) -> ApiResult<PageResult<Message>> {
    ok(state
        .sessions
        .list_messages(&user_id, &session_id, params)
        .await?)
}

pub async fn get_message(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(message_id): Path<String>,
) -> ApiResult<Message> {
    ok(state.sessions.get_message(&user_id, &message_id).await?)
}

pub async fn abort_message(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(message_id): Path<String>,
) -> ApiResult<AbortOutcome> {
    ok(state.sessions.abort_message(&user_id, &message_id).await?)
}
