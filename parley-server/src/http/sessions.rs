//! `/api/v1/chat/sessions` handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use parley_core::models::Session;
use serde::Deserialize;

use super::envelope::{created, ok, ApiJson, ApiQuery, ApiResult};
use super::middleware::CurrentUser;
use super::HttpState;
use crate::subsystems::lifecycle::{
    CreateSessionRequest, ListSessionsQuery, PageResult, SearchSessionsQuery, UpdateSessionRequest,
};

#[derive(Debug, Deserialize)]
pub struct PinQuery {
    pub pinned: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub archived: Option<bool>,
}

pub async fn create_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    ApiJson(req): ApiJson<CreateSessionRequest>,
) -> ApiResult<Session> {
    created(state.sessions.create_session(&user_id, req).await?)
}

pub async fn list_sessions(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    ApiQuery(query): ApiQuery<ListSessionsQuery>,
) -> ApiResult<PageResult<Session>> {
    ok(state.sessions.list_sessions(&user_id, query).await?)
}

pub async fn search_sessions(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    ApiQuery(query): ApiQuery<SearchSessionsQuery>,
) -> ApiResult<PageResult<Session>> {
    ok(state.sessions.search_sessions(&user_id, query).await?)
}

pub async fn get_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<Session> {
    ok(state.sessions.get_session(&user_id, &session_id).await?)
}

pub async fn update_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
    ApiJson(req): ApiJson<UpdateSessionRequest>,
) -> ApiResult<Session> {
    ok(state.sessions.update_session(&user_id, &session_id, req).await?)
}

pub async fn delete_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
) -> ApiResult<()> {
    ok(state.sessions.delete_session(&user_id, &session_id).await?)
}

pub async fn pin_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
    ApiQuery(query): ApiQuery<PinQuery>,
) -> ApiResult<()> {
    let pinned = query.pinned.unwrap_or(true);
    ok(state.sessions.pin_session(&user_id, &session_id, pinned).await?)
}

pub async fn archive_session(
    State(state): State<Arc<HttpState>>,
    CurrentUser(user_id): CurrentUser,
    Path(session_id): Path<String>,
    ApiQuery(query): ApiQuery<ArchiveQuery>,
) -> ApiResult<()> {
    let archived = query.archived.unwrap_or(true);
    ok(state.sessions.archive_session(&user_id, &session_id, archived).await?)
}
