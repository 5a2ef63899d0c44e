//! MessageStore: durable storage for sessions and messages.
//!
//! The contract is expressed as two traits:
//! - [`MessageStore`]: pool-level reads and single-statement writes
//! - [`StoreTx`]: a scoped transaction; dropping it without `commit` rolls back
//!
//! Two implementations ship with the crate: [`PgMessageStore`] (sqlx/Postgres)
//! and [`MemoryMessageStore`] (process-local, for development and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Message, SamplingDefaults, Session};

pub mod memory;
pub mod postgres;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

/// Attempts at `next_sequence` + insert before giving up on a contended session.
pub const MAX_SEQUENCE_ATTEMPTS: usize = 3;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Another writer took this `(session_id, sequence)` first.
    #[error("sequence {sequence} already taken in session {session_id}")]
    SequenceConflict { session_id: String, sequence: i64 },

    #[error("could not allocate a message sequence after {attempts} attempts")]
    Serialization { attempts: usize },

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn session_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    pub fn message_not_found(id: &str) -> Self {
        StoreError::NotFound {
            entity: "message",
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

// ============================================================================
// Query types
// ============================================================================

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 20;
    pub const MAX_SIZE: u32 = 100;

    pub fn new(number: u32, size: u32) -> Self {
        Self { number, size }
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.number.saturating_sub(1)) * i64::from(self.size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            number: 1,
            size: Self::DEFAULT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionOrder {
    #[default]
    UpdatedDesc,
    CreatedDesc,
    PinnedThenUpdatedDesc,
}

impl SessionOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "updated_desc" => Some(SessionOrder::UpdatedDesc),
            "created_desc" => Some(SessionOrder::CreatedDesc),
            "pinned_updated_desc" => Some(SessionOrder::PinnedThenUpdatedDesc),
            _ => None,
        }
    }
}

/// Listing filters. Soft-deleted sessions are always excluded.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
    pub model: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub order: SessionOrder,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        !session.deleted
            && self.pinned.map_or(true, |p| session.pinned == p)
            && self.archived.map_or(true, |a| session.archived == a)
            && self.model.as_deref().map_or(true, |m| session.model == m)
            && self.created_after.map_or(true, |t| session.created_at > t)
            && self.created_before.map_or(true, |t| session.created_at < t)
    }
}

/// The closed set of updatable session attributes; `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub sampling: SamplingDefaults,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.system_prompt.is_none()
            && self.sampling == SamplingDefaults::default()
            && self.pinned.is_none()
            && self.archived.is_none()
    }

    pub fn apply(&self, session: &mut Session) {
        if let Some(title) = &self.title {
            session.title = title.clone();
        }
        if let Some(prompt) = &self.system_prompt {
            session.system_prompt = Some(prompt.clone());
        }
        session.sampling = self.sampling.or(session.sampling);
        if let Some(pinned) = self.pinned {
            session.pinned = pinned;
        }
        if let Some(archived) = self.archived {
            session.archived = archived;
        }
    }
}

// ============================================================================
// Contracts
// ============================================================================

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;

    /// Soft-deleted sessions are reported as not found.
    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError>;

    async fn list_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError>;

    async fn update_session_fields(
        &self,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<(), StoreError>;

    async fn soft_delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Case-insensitive substring match on title and most-recent message content.
    async fn search_sessions(
        &self,
        user_id: &str,
        keyword: &str,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Message, StoreError>;

    /// Ordered by sequence ascending.
    async fn list_messages(
        &self,
        session_id: &str,
        page: Page,
    ) -> Result<(Vec<Message>, u64), StoreError>;

    /// The last `limit` messages of a session, in ascending sequence order.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Writes that must land together. Dropping without `commit` rolls back.
#[async_trait]
pub trait StoreTx: Send {
    /// One greater than the highest sequence in the session, as seen by this
    /// transaction (its own uncommitted inserts included).
    async fn next_sequence(&mut self, session_id: &str) -> Result<i64, StoreError>;

    /// Persists `message`, filling in `id` and `created_at`. Returns
    /// [`StoreError::SequenceConflict`] when the sequence is already taken;
    /// the transaction stays usable in that case.
    async fn create_message(&mut self, message: &mut Message) -> Result<(), StoreError>;

    async fn increment_message_count(&mut self, session_id: &str, by: i32) -> Result<(), StoreError>;

    /// Also bumps the session's `updated_at`.
    async fn update_last_message(&mut self, session_id: &str, message_id: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Allocate the next sequence and insert, retrying on conflicts up to
/// [`MAX_SEQUENCE_ATTEMPTS`] times.
pub async fn insert_with_next_sequence(
    tx: &mut dyn StoreTx,
    message: &mut Message,
) -> Result<(), StoreError> {
    for attempt in 1..=MAX_SEQUENCE_ATTEMPTS {
        message.sequence = tx.next_sequence(&message.session_id).await?;
        match tx.create_message(message).await {
            Ok(()) => return Ok(()),
            Err(StoreError::SequenceConflict { session_id, sequence }) => {
                tracing::debug!(
                    session_id = %session_id,
                    sequence,
                    attempt,
                    "Sequence conflict, retrying allocation"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Err(StoreError::Serialization {
        attempts: MAX_SEQUENCE_ATTEMPTS,
    })
}

/// Escape LIKE metacharacters so a keyword matches literally.
pub fn escape_like(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len() + 2);
    for c in keyword.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
