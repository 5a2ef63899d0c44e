//! ChatOrchestrator: one chat turn, end to end
//!
//! Resolves (or implicitly creates) the session, registers a cancellation
//! handle, calls the generation client inside a store transaction and commits
//! the user/assistant pair together with the session counters. A failed or
//! cancelled generation rolls the whole turn back.

use std::sync::Arc;

use parley_core::error::{AppError, ErrorCode};
use parley_core::generation::{
    GenerateOptions, GenerationClient, GenerationError, Prompt, PromptTurn, TokenUsage,
};
use parley_core::models::{Message, MessageRole, SamplingDefaults, Session};
use parley_core::store::{insert_with_next_sequence, MessageStore, StoreError, StoreTx};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;

/// Longest title derived from a first message, in characters.
pub const IMPLICIT_TITLE_MAX_CHARS: usize = 50;
pub const DEFAULT_SESSION_TITLE: &str = "New chat";

// ============================================================================
// Request / Response types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: String,
    /// Model preference, used only when a session is created implicitly.
    pub model: Option<String>,
    #[serde(flatten)]
    pub options: SamplingDefaults,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    /// Assistant reply text.
    pub message: String,
    pub model: String,
    pub usage: TokenUsage,
    pub user_message: Message,
    pub assistant_message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortOutcome {
    /// Whether a generation was actually in flight.
    pub aborted: bool,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct ChatOrchestrator {
    store: Arc<dyn MessageStore>,
    registry: Arc<SessionRegistry>,
    generator: Option<Arc<dyn GenerationClient>>,
    default_model: String,
    history_window: u32,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<SessionRegistry>,
        generator: Option<Arc<dyn GenerationClient>>,
        default_model: impl Into<String>,
        history_window: u32,
    ) -> Self {
        Self {
            store,
            registry,
            generator,
            default_model: default_model.into(),
            history_window,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Execute one turn. `cancel` is the caller's request-scoped token.
    /// An absent or unknown `session_id` creates a new session.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        request: ChatRequest,
    ) -> Result<ChatResponse, AppError> {
        let generator = self.prepare(&request)?;
        let session = self.resolve_session(user_id, &request).await?;
        self.execute(generator.as_ref(), cancel, &session, &request).await
    }

    /// Execute one turn in a session the caller has already resolved and
    /// checked. Never creates a session; `request.session_id` is ignored.
    pub async fn send_in_session(
        &self,
        cancel: &CancellationToken,
        session: &Session,
        request: ChatRequest,
    ) -> Result<ChatResponse, AppError> {
        let generator = self.prepare(&request)?;
        self.execute(generator.as_ref(), cancel, session, &request).await
    }

    fn prepare(&self, request: &ChatRequest) -> Result<Arc<dyn GenerationClient>, AppError> {
        if request.message.trim().is_empty() {
            return Err(AppError::validation("message must not be empty"));
        }
        request.options.validate().map_err(AppError::validation)?;

        self.generator.clone().ok_or_else(|| {
            AppError::new(
                ErrorCode::ServiceUnavailable,
                "generation backend is not configured",
            )
        })
    }

    async fn execute(
        &self,
        generator: &dyn GenerationClient,
        cancel: &CancellationToken,
        session: &Session,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AppError> {
        let (turn_cancel, guard) = self.registry.register(&session.id, cancel);
        let result = self.run_turn(generator, &turn_cancel, session, request).await;
        guard.revoke();

        result
    }

    /// Cancel the in-flight generation of a session. Succeeds when nothing is running.
    pub async fn abort(&self, user_id: &str, session_id: &str) -> Result<AbortOutcome, AppError> {
        let session = self.owned_session(user_id, session_id).await?;
        let aborted = self.registry.cancel(&session.id);
        tracing::info!(session_id = %session.id, user_id = %user_id, aborted, "Abort requested");
        Ok(AbortOutcome { aborted })
    }

    /// Cancel the generation of the session that owns `message_id`.
    /// An unknown message is treated as already finished.
    pub async fn abort_message(&self, user_id: &str, message_id: &str) -> Result<AbortOutcome, AppError> {
        let message = match self.store.get_message(message_id).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => {
                tracing::debug!(message_id = %message_id, "Abort for unknown message");
                return Ok(AbortOutcome { aborted: false });
            }
            Err(e) => return Err(load_failed(e)),
        };

        let session = match self.store.get_session(&message.session_id).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                return Err(AppError::from_code(ErrorCode::MessageNotFound));
            }
            Err(e) => return Err(load_failed(e)),
        };
        if !session.is_owned_by(user_id) {
            tracing::warn!(
                message_id = %message_id,
                user_id = %user_id,
                "Message abort denied: not owner"
            );
            return Err(AppError::from_code(ErrorCode::MessageAccessDenied));
        }

        let aborted = self.registry.cancel(&session.id);
        tracing::info!(session_id = %session.id, message_id = %message_id, aborted, "Abort requested");
        Ok(AbortOutcome { aborted })
    }

    /// Load a session and check it belongs to `user_id`.
    pub async fn owned_session(&self, user_id: &str, session_id: &str) -> Result<Session, AppError> {
        let session = self.store.get_session(session_id).await.map_err(|e| {
            if e.is_not_found() {
                AppError::from_code(ErrorCode::SessionNotFound)
            } else {
                load_failed(e)
            }
        })?;

        if !session.is_owned_by(user_id) {
            tracing::warn!(
                session_id = %session_id,
                user_id = %user_id,
                "Session access denied: not owner"
            );
            return Err(AppError::from_code(ErrorCode::SessionAccessDenied));
        }
        Ok(session)
    }

    async fn resolve_session(&self, user_id: &str, request: &ChatRequest) -> Result<Session, AppError> {
        let requested = request.session_id.as_deref().filter(|id| !id.trim().is_empty());

        if let Some(session_id) = requested {
            match self.owned_session(user_id, session_id).await {
                Ok(session) => return Ok(session),
                Err(e) if e.code == ErrorCode::SessionNotFound => {
                    tracing::warn!(
                        session_id = %session_id,
                        user_id = %user_id,
                        "Unknown session id, creating a new session"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let model = request
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let session = Session::new(user_id, implicit_title(&request.message), model);

        self.store.create_session(&session).await.map_err(|e| {
            AppError::with_source(ErrorCode::MessageSendFailed, "failed to create session", e)
        })?;
        tracing::info!(session_id = %session.id, user_id = %user_id, "Created implicit session");
        Ok(session)
    }

    async fn run_turn(
        &self,
        generator: &dyn GenerationClient,
        cancel: &CancellationToken,
        session: &Session,
        request: &ChatRequest,
    ) -> Result<ChatResponse, AppError> {
        let history = self
            .store
            .recent_messages(&session.id, self.history_window)
            .await
            .map_err(load_failed)?;

        let prompt = build_prompt(session, history, &request.message);
        let options = GenerateOptions::from_sampling(
            Some(session.model.clone()),
            request.options.or(session.sampling),
        );

        let mut tx = self.store.begin().await.map_err(send_failed)?;

        // Another turn on this session may hold the sequence; wait for it
        // only as long as this turn is still wanted.
        let mut user_message = Message::draft(&session.id, MessageRole::User, &request.message);
        let inserted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = insert_with_next_sequence(tx.as_mut(), &mut user_message) => Some(result),
        };
        match inserted {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                rollback(tx, &session.id).await;
                log_failure(&session.id, "store", &e);
                return Err(send_failed(e));
            }
            None => {
                rollback(tx, &session.id).await;
                return Err(turn_cancelled(&session.id, GenerationError::Cancelled));
            }
        }

        let generation = match generator.generate(cancel, &prompt, &options).await {
            Ok(_) if cancel.is_cancelled() => {
                rollback(tx, &session.id).await;
                return Err(turn_cancelled(&session.id, GenerationError::Cancelled));
            }
            Ok(generation) => generation,
            Err(e) => {
                rollback(tx, &session.id).await;
                return Err(generation_failed(&session.id, cancel, e));
            }
        };

        let mut assistant_message =
            Message::draft(&session.id, MessageRole::Assistant, &generation.text);
        assistant_message.token_count = generation.usage.completion_tokens;
        assistant_message.metadata = Some(serde_json::json!({
            "model": generation.model,
            "usage": generation.usage,
        }));

        if let Err(e) = commit_turn(tx, &mut assistant_message).await {
            log_failure(&session.id, "store", &e);
            return Err(send_failed(e));
        }

        tracing::info!(
            session_id = %session.id,
            user_sequence = user_message.sequence,
            assistant_sequence = assistant_message.sequence,
            total_tokens = generation.usage.total_tokens,
            "Chat turn committed"
        );

        Ok(ChatResponse {
            session_id: session.id.clone(),
            message: generation.text,
            model: generation.model,
            usage: generation.usage,
            user_message,
            assistant_message,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Insert the assistant reply, bump the counters and commit; rolls back on failure.
async fn commit_turn(mut tx: Box<dyn StoreTx>, assistant: &mut Message) -> Result<(), StoreError> {
    let session_id = assistant.session_id.clone();
    let staged = async {
        insert_with_next_sequence(tx.as_mut(), assistant).await?;
        tx.update_last_message(&session_id, &assistant.id).await?;
        tx.increment_message_count(&session_id, 2).await
    }
    .await;

    match staged {
        Ok(()) => tx.commit().await,
        Err(e) => {
            rollback(tx, &session_id).await;
            Err(e)
        }
    }
}

async fn rollback(tx: Box<dyn StoreTx>, session_id: &str) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(session_id = %session_id, error = %e, "Rollback failed");
    }
}

fn log_failure(session_id: &str, category: &str, error: &dyn std::error::Error) {
    tracing::error!(session_id = %session_id, category, error = %error, "Chat turn failed");
}

fn generation_failed(session_id: &str, cancel: &CancellationToken, e: GenerationError) -> AppError {
    if e.is_cancelled() || cancel.is_cancelled() {
        return turn_cancelled(session_id, e);
    }

    log_failure(session_id, e.kind().as_str(), &e);
    AppError::with_source(ErrorCode::AiService, ErrorCode::AiService.default_message(), e)
}

fn turn_cancelled(session_id: &str, e: GenerationError) -> AppError {
    tracing::info!(session_id = %session_id, category = "cancelled", "Chat turn cancelled");
    AppError::with_source(
        ErrorCode::ContextCancelled,
        ErrorCode::ContextCancelled.default_message(),
        e,
    )
}

/// A session soft-deleted mid-turn surfaces as not-found.
fn send_failed(e: StoreError) -> AppError {
    if e.is_not_found() {
        return AppError::with_source(
            ErrorCode::SessionNotFound,
            ErrorCode::SessionNotFound.default_message(),
            e,
        );
    }
    AppError::with_source(
        ErrorCode::MessageSendFailed,
        ErrorCode::MessageSendFailed.default_message(),
        e,
    )
}

fn load_failed(e: StoreError) -> AppError {
    AppError::with_source(ErrorCode::DataLoad, ErrorCode::DataLoad.default_message(), e)
}

/// First line of the message, trimmed and cut to [`IMPLICIT_TITLE_MAX_CHARS`].
pub fn implicit_title(message: &str) -> String {
    let first_line = message.lines().map(str::trim).find(|l| !l.is_empty());
    match first_line {
        Some(line) => line.chars().take(IMPLICIT_TITLE_MAX_CHARS).collect(),
        None => DEFAULT_SESSION_TITLE.to_string(),
    }
}

fn build_prompt(session: &Session, history: Vec<Message>, message: &str) -> Prompt {
    Prompt {
        system: session.system_prompt.clone(),
        history: history
            .into_iter()
            .filter(|m| m.error.is_none())
            .map(|m| PromptTurn {
                role: m.role,
                text: m.content,
            })
            .collect(),
        message: message.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::test_support::StubGenerator;
    use parley_core::store::{MemoryMessageStore, Page, SessionFilter};
    use std::time::{Duration, Instant};

    struct Harness {
        store: MemoryMessageStore,
        registry: Arc<SessionRegistry>,
        orchestrator: Arc<ChatOrchestrator>,
    }

    fn harness(generator: Option<Arc<StubGenerator>>) -> Harness {
        let store = MemoryMessageStore::new();
        let registry = Arc::new(SessionRegistry::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let orchestrator = Arc::new(ChatOrchestrator::new(
            Arc::new(store.clone()),
            Arc::clone(&registry),
            generator.map(|g| g as Arc<dyn GenerationClient>),
            "default-model",
            20,
        ));
        Harness {
            store,
            registry,
            orchestrator,
        }
    }

    fn chat(message: &str, session_id: Option<&str>) -> ChatRequest {
        ChatRequest {
            session_id: session_id.map(str::to_string),
            message: message.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_implicit_session_turn() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let response = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("hi there\nsecond line", None))
            .await
            .unwrap();

        assert!(!response.session_id.is_empty());
        assert_eq!(response.message, "echo: hi there\nsecond line");
        assert_eq!(response.user_message.sequence, 1);
        assert_eq!(response.assistant_message.sequence, 2);
        assert_eq!(response.assistant_message.token_count, 6);

        let session = h.store.get_session(&response.session_id).await.unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.title, "hi there");
        assert_eq!(session.model, "default-model");
        assert_eq!(session.message_count, 2);
        assert_eq!(session.last_message_id.as_deref(), Some(response.assistant_message.id.as_str()));
        assert!(h.registry.is_empty(), "handle must be deregistered");
    }

    #[tokio::test]
    async fn test_history_and_options_reach_generator() {
        let stub = Arc::new(StubGenerator::echo());
        let h = harness(Some(Arc::clone(&stub)));
        let cancel = CancellationToken::new();

        let mut session = Session::new("u1", "t", "session-model");
        session.system_prompt = Some("be terse".into());
        session.sampling.temperature = Some(0.3);
        session.sampling.max_tokens = Some(64);
        h.store.create_session(&session).await.unwrap();

        h.orchestrator.send(&cancel, "u1", chat("one", Some(&session.id))).await.unwrap();

        let mut second = chat("two", Some(&session.id));
        second.options.temperature = Some(1.5);
        h.orchestrator.send(&cancel, "u1", second).await.unwrap();

        let prompt = stub.last_prompt.lock().unwrap().clone().unwrap();
        assert_eq!(prompt.system.as_deref(), Some("be terse"));
        assert_eq!(prompt.history.len(), 2);
        assert_eq!(prompt.history[0].role, MessageRole::User);
        assert_eq!(prompt.history[1].text, "echo: one");
        assert_eq!(prompt.message, "two");

        let options = stub.last_options.lock().unwrap().clone().unwrap();
        assert_eq!(options.model.as_deref(), Some("session-model"));
        assert_eq!(options.temperature, Some(1.5));
        assert_eq!(options.max_tokens, Some(64));
    }

    #[tokio::test]
    async fn test_unknown_session_id_creates_new_session() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let response = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("hello", Some("missing-id")))
            .await
            .unwrap();
        assert_ne!(response.session_id, "missing-id");
    }

    #[tokio::test]
    async fn test_foreign_session_is_denied() {
        let stub = Arc::new(StubGenerator::echo());
        let h = harness(Some(Arc::clone(&stub)));
        let session = Session::new("u1", "mine", "m");
        h.store.create_session(&session).await.unwrap();

        let err = h
            .orchestrator
            .send(&CancellationToken::new(), "u2", chat("hi", Some(&session.id)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionAccessDenied);
        assert_eq!(stub.calls(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_rolls_back() {
        let h = harness(Some(Arc::new(StubGenerator::failing())));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let err = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("hi", Some(&session.id)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AiService);
        assert!(err.cause().is_some());

        let (messages, total) = h.store.list_messages(&session.id, Page::default()).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(total, 0);
        assert_eq!(h.store.get_session(&session.id).await.unwrap().message_count, 0);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_abort_cancels_in_flight_turn() {
        let h = harness(Some(Arc::new(StubGenerator::slow(Duration::from_secs(5)))));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let orchestrator = Arc::clone(&h.orchestrator);
        let session_id = session.id.clone();
        let started = Instant::now();
        let turn = tokio::spawn(async move {
            orchestrator
                .send(&CancellationToken::new(), "u1", chat("slow", Some(&session_id)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let outcome = h.orchestrator.abort("u1", &session.id).await.unwrap();
        assert!(outcome.aborted);

        let err = turn.await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextCancelled);
        assert!(started.elapsed() < Duration::from_secs(1));

        let (_, total) = h.store.list_messages(&session.id, Page::default()).await.unwrap();
        assert_eq!(total, 0);

        let again = h.orchestrator.abort("u1", &session.id).await.unwrap();
        assert!(!again.aborted);
    }

    #[tokio::test]
    async fn test_abort_cancels_overlapping_turns() {
        let h = harness(Some(Arc::new(StubGenerator::slow(Duration::from_secs(2)))));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let spawn_turn = |message: &'static str| {
            let orchestrator = Arc::clone(&h.orchestrator);
            let session_id = session.id.clone();
            tokio::spawn(async move {
                orchestrator
                    .send(&CancellationToken::new(), "u1", chat(message, Some(&session_id)))
                    .await
            })
        };

        let started = Instant::now();
        let generating = spawn_turn("first");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let queued = spawn_turn("second");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.registry.len(), 1);

        assert!(h.orchestrator.abort("u1", &session.id).await.unwrap().aborted);

        let first = generating.await.unwrap().unwrap_err();
        let second = queued.await.unwrap().unwrap_err();
        assert_eq!(first.code, ErrorCode::ContextCancelled);
        assert_eq!(second.code, ErrorCode::ContextCancelled);
        assert!(started.elapsed() < Duration::from_secs(1));

        let (_, total) = h.store.list_messages(&session.id, Page::default()).await.unwrap();
        assert_eq!(total, 0);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_queued_turn_observes_caller_cancellation() {
        let h = harness(Some(Arc::new(StubGenerator::slow(Duration::from_millis(500)))));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let orchestrator = Arc::clone(&h.orchestrator);
        let session_id = session.id.clone();
        let generating = tokio::spawn(async move {
            orchestrator
                .send(&CancellationToken::new(), "u1", chat("first", Some(&session_id)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = h
            .orchestrator
            .send(&cancel, "u1", chat("second", Some(&session.id)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextCancelled);
        assert!(started.elapsed() < Duration::from_millis(300));

        // the turn already generating is unaffected
        let first = generating.await.unwrap().unwrap();
        assert_eq!(first.user_message.sequence, 1);
        assert_eq!(first.assistant_message.sequence, 2);
        let (_, total) = h.store.list_messages(&session.id, Page::default()).await.unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_send_in_session_never_creates_a_session() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();
        h.store.soft_delete_session(&session.id).await.unwrap();

        let err = h
            .orchestrator
            .send_in_session(&CancellationToken::new(), &session, chat("hi", Some(&session.id)))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SessionNotFound);

        let (sessions, total) = h
            .store
            .list_sessions("u1", &SessionFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 0, "unexpected sessions: {:?}", sessions);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_caller_cancellation_maps_to_context_cancelled() {
        let h = harness(Some(Arc::new(StubGenerator::slow(Duration::from_secs(5)))));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = h.orchestrator.send(&cancel, "u1", chat("hi", None)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextCancelled);
    }

    #[tokio::test]
    async fn test_abort_checks_ownership() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let denied = h.orchestrator.abort("u2", &session.id).await.unwrap_err();
        let missing = h.orchestrator.abort("u1", "nope").await.unwrap_err();
        assert_eq!(denied.code.external(), ErrorCode::SessionAccessDenied);
        assert_eq!(missing.code.external(), ErrorCode::SessionAccessDenied);
    }

    #[tokio::test]
    async fn test_abort_message() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let response = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("hi", None))
            .await
            .unwrap();
        let message_id = response.user_message.id;

        assert!(!h.orchestrator.abort_message("u1", &message_id).await.unwrap().aborted);
        assert!(!h.orchestrator.abort_message("u1", "unknown").await.unwrap().aborted);
        let err = h.orchestrator.abort_message("u2", &message_id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::MessageAccessDenied);
    }

    #[tokio::test]
    async fn test_missing_generator_is_service_unavailable() {
        let h = harness(None);
        let err = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("hi", None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_validation() {
        let h = harness(Some(Arc::new(StubGenerator::echo())));
        let err = h
            .orchestrator
            .send(&CancellationToken::new(), "u1", chat("   ", None))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);

        let mut bad = chat("hi", None);
        bad.options.top_p = Some(1.5);
        let err = h.orchestrator.send(&CancellationToken::new(), "u1", bad).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
    }

    #[tokio::test]
    async fn test_concurrent_turns_keep_sequences_dense() {
        let h = harness(Some(Arc::new(StubGenerator::slow(Duration::from_millis(10)))));
        let session = Session::new("u1", "t", "m");
        h.store.create_session(&session).await.unwrap();

        let turns: Vec<_> = (0..6)
            .map(|i| {
                let orchestrator = Arc::clone(&h.orchestrator);
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    orchestrator
                        .send(
                            &CancellationToken::new(),
                            "u1",
                            chat(&format!("turn {}", i), Some(&session_id)),
                        )
                        .await
                })
            })
            .collect();

        for turn in futures::future::join_all(turns).await {
            let response = turn.unwrap().unwrap();
            assert_eq!(response.assistant_message.sequence, response.user_message.sequence + 1);
        }

        let (messages, total) = h.store.list_messages(&session.id, Page::new(1, 100)).await.unwrap();
        assert_eq!(total, 12);
        let sequences: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, (1..=12).collect::<Vec<_>>());
        assert_eq!(h.store.get_session(&session.id).await.unwrap().message_count, 12);
    }

    #[test]
    fn test_implicit_title() {
        assert_eq!(implicit_title("  hello\nworld"), "hello");
        assert_eq!(implicit_title("\n\n"), DEFAULT_SESSION_TITLE);
        let long = "x".repeat(80);
        assert_eq!(implicit_title(&long).chars().count(), IMPLICIT_TITLE_MAX_CHARS);
        assert_eq!(implicit_title("日本語のタイトル"), "日本語のタイトル");
    }
}
