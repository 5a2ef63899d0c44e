//! SessionLifecycle: user-facing session and message operations.
//!
//! Every operation takes the authenticated user id and checks ownership by
//! reading the session; message operations resolve the owning session first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_core::error::{AppError, ErrorCode};
use parley_core::models::{Message, SamplingDefaults, Session};
use parley_core::store::{MessageStore, Page, SessionFilter, SessionOrder, SessionPatch, StoreError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::orchestrator::{AbortOutcome, ChatOrchestrator, ChatRequest, ChatResponse, DEFAULT_SESSION_TITLE};

pub const MAX_TITLE_CHARS: usize = 200;

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub title: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSessionRequest {
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingDefaults,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub options: SamplingDefaults,
}

/// Raw paging input; validated into a [`Page`].
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    pub page_no: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageParams {
    pub fn from_query(page_no: Option<u32>, page_size: Option<u32>) -> Self {
        Self { page_no, page_size }
    }

    pub fn validate(self) -> Result<Page, AppError> {
        let number = self.page_no.unwrap_or(1);
        let size = self.page_size.unwrap_or(Page::DEFAULT_SIZE);
        if number < 1 {
            return Err(AppError::validation("pageNo must be at least 1"));
        }
        if !(1..=Page::MAX_SIZE).contains(&size) {
            return Err(AppError::validation(format!(
                "pageSize must be between 1 and {}",
                Page::MAX_SIZE
            )));
        }
        Ok(Page::new(number, size))
    }
}

/// Query strings cannot use `#[serde(flatten)]` (values arrive as strings),
/// so paging fields are repeated here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub page_no: Option<u32>,
    pub page_size: Option<u32>,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
    pub model: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSessionsQuery {
    pub page_no: Option<u32>,
    pub page_size: Option<u32>,
    pub keyword: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page_no: u32,
    pub page_size: u32,
}

impl<T> PageResult<T> {
    fn new((items, total): (Vec<T>, u64), page: Page) -> Self {
        Self {
            items,
            total,
            page_no: page.number,
            page_size: page.size,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct SessionService {
    store: Arc<dyn MessageStore>,
    orchestrator: Arc<ChatOrchestrator>,
}

impl SessionService {
    pub fn new(store: Arc<dyn MessageStore>, orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self { store, orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<ChatOrchestrator> {
        &self.orchestrator
    }

    pub async fn create_session(&self, user_id: &str, req: CreateSessionRequest) -> Result<Session, AppError> {
        let title = match req.title {
            Some(title) => validate_title(title)?,
            None => DEFAULT_SESSION_TITLE.to_string(),
        };
        req.sampling.validate().map_err(AppError::validation)?;

        let model = req
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.orchestrator.default_model().to_string());

        let mut session = Session::new(user_id, title, model);
        session.system_prompt = req.system_prompt;
        session.sampling = req.sampling;

        self.store.create_session(&session).await.map_err(internal)?;
        tracing::info!(session_id = %session.id, user_id = %user_id, "Session created");
        Ok(session)
    }

    pub async fn get_session(&self, user_id: &str, session_id: &str) -> Result<Session, AppError> {
        self.orchestrator.owned_session(user_id, session_id).await
    }

    pub async fn list_sessions(&self, user_id: &str, query: ListSessionsQuery) -> Result<PageResult<Session>, AppError> {
        let page = PageParams::from_query(query.page_no, query.page_size).validate()?;
        let order = match query.order_by.as_deref() {
            None | Some("") => SessionOrder::default(),
            Some(value) => SessionOrder::parse(value)
                .ok_or_else(|| AppError::validation(format!("unknown orderBy '{}'", value)))?,
        };
        let filter = SessionFilter {
            pinned: query.pinned,
            archived: query.archived,
            model: query.model.filter(|m| !m.is_empty()),
            created_after: query.created_after,
            created_before: query.created_before,
            order,
        };

        let found = self
            .store
            .list_sessions(user_id, &filter, page)
            .await
            .map_err(data_load)?;
        Ok(PageResult::new(found, page))
    }

    pub async fn update_session(
        &self,
        user_id: &str,
        session_id: &str,
        req: UpdateSessionRequest,
    ) -> Result<Session, AppError> {
        let title = req.title.map(validate_title).transpose()?;
        req.sampling.validate().map_err(AppError::validation)?;

        let session = self.orchestrator.owned_session(user_id, session_id).await?;
        let patch = SessionPatch {
            title,
            system_prompt: req.system_prompt,
            sampling: req.sampling,
            pinned: req.pinned,
            archived: req.archived,
        };
        if patch.is_empty() {
            return Ok(session);
        }

        self.store
            .update_session_fields(&session.id, &patch)
            .await
            .map_err(not_found_or(ErrorCode::SessionNotFound))?;
        self.orchestrator.owned_session(user_id, session_id).await
    }

    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> Result<(), AppError> {
        let session = self.orchestrator.owned_session(user_id, session_id).await?;
        self.store
            .soft_delete_session(&session.id)
            .await
            .map_err(not_found_or(ErrorCode::SessionNotFound))?;
        self.orchestrator.registry().cancel(&session.id);
        tracing::info!(session_id = %session.id, user_id = %user_id, "Session deleted");
        Ok(())
    }

    pub async fn search_sessions(&self, user_id: &str, query: SearchSessionsQuery) -> Result<PageResult<Session>, AppError> {
        let page = PageParams::from_query(query.page_no, query.page_size).validate()?;
        let keyword = query
            .keyword
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::validation("keyword must not be empty"))?;

        let found = self
            .store
            .search_sessions(user_id, &keyword, page)
            .await
            .map_err(data_load)?;
        Ok(PageResult::new(found, page))
    }

    pub async fn pin_session(&self, user_id: &str, session_id: &str, pinned: bool) -> Result<(), AppError> {
        self.set_flags(user_id, session_id, SessionPatch { pinned: Some(pinned), ..Default::default() })
            .await
    }

    pub async fn archive_session(&self, user_id: &str, session_id: &str, archived: bool) -> Result<(), AppError> {
        self.set_flags(user_id, session_id, SessionPatch { archived: Some(archived), ..Default::default() })
            .await
    }

    async fn set_flags(&self, user_id: &str, session_id: &str, patch: SessionPatch) -> Result<(), AppError> {
        let session = self.orchestrator.owned_session(user_id, session_id).await?;
        self.store
            .update_session_fields(&session.id, &patch)
            .await
            .map_err(not_found_or(ErrorCode::SessionNotFound))
    }

    /// Send within an existing session. Unlike [`SessionService::chat`], an
    /// unknown session id is an error here.
    pub async fn send_message(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        session_id: &str,
        req: SendMessageRequest,
    ) -> Result<ChatResponse, AppError> {
        let session = self.orchestrator.owned_session(user_id, session_id).await?;
        self.orchestrator
            .send_in_session(
                cancel,
                &session,
                ChatRequest {
                    session_id: Some(session.id.clone()),
                    message: req.message,
                    model: None,
                    options: req.options,
                },
            )
            .await
    }

    /// Send with an optional session id; a new session is created when absent or unknown.
    pub async fn chat(&self, cancel: &CancellationToken, user_id: &str, req: ChatRequest) -> Result<ChatResponse, AppError> {
        self.orchestrator.send(cancel, user_id, req).await
    }

    pub async fn list_messages(
        &self,
        user_id: &str,
        session_id: &str,
        params: PageParams,
    ) -> Result<PageResult<Message>, AppError> {
        let page = params.validate()?;
        let session = self.orchestrator.owned_session(user_id, session_id).await?;
        let found = self
            .store
            .list_messages(&session.id, page)
            .await
            .map_err(data_load)?;
        Ok(PageResult::new(found, page))
    }

    pub async fn get_message(&self, user_id: &str, message_id: &str) -> Result<Message, AppError> {
        let message = self
            .store
            .get_message(message_id)
            .await
            .map_err(not_found_or(ErrorCode::MessageNotFound))?;

        match self.orchestrator.owned_session(user_id, &message.session_id).await {
            Ok(_) => Ok(message),
            Err(e) if e.code == ErrorCode::SessionNotFound => Err(AppError::from_code(ErrorCode::MessageNotFound)),
            Err(e) if e.code == ErrorCode::SessionAccessDenied => {
                Err(AppError::from_code(ErrorCode::MessageAccessDenied))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn abort_chat(&self, user_id: &str, session_id: &str) -> Result<AbortOutcome, AppError> {
        if session_id.trim().is_empty() {
            return Err(AppError::validation("sessionId must not be empty"));
        }
        self.orchestrator.abort(user_id, session_id).await
    }

    pub async fn abort_message(&self, user_id: &str, message_id: &str) -> Result<AbortOutcome, AppError> {
        self.orchestrator.abort_message(user_id, message_id).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_title(title: String) -> Result<String, AppError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("title must not be empty"));
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(AppError::validation(format!(
            "title must be at most {} characters",
            MAX_TITLE_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

fn not_found_or(code: ErrorCode) -> impl Fn(StoreError) -> AppError {
    move |e| {
        if e.is_not_found() {
            AppError::from_code(code)
        } else {
            internal(e)
        }
    }
}

fn data_load(e: StoreError) -> AppError {
    AppError::with_source(ErrorCode::DataLoad, ErrorCode::DataLoad.default_message(), e)
}

fn internal(e: StoreError) -> AppError {
    AppError::internal(e)
}

// ============================================================================
// TESTS
// ============================================================================
