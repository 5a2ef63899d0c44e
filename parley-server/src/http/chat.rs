//! `/api/v1/chat` handlers: send with an implicit session, abort by session id.

use std::sync::Arc;

use axum::extract::State;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::envelope::{ok, ApiJson, ApiResult};
use super::middleware::CurrentUser;
use super::HttpState;
use crate::subsystems::orchestrator::{AbortOutcome, ChatRequest, ChatResponse};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    #[serde(default)]
    pub session_id: String,
}

pub async fn send_chat(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(req): ApiJson<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    ok(state.sessions.chat(&cancel, &user_id, req).await?)
}

pub async fn abort_chat(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(req): ApiJson<AbortRequest>,
) -> ApiResult<AbortOutcome> {
    ok(state.sessions.abort_chat(&user_id, &req.session_id).await?)
}
