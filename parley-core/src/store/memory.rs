//! Process-local MessageStore.
//!
//! Transactions buffer their writes and apply them on commit. A transaction
//! holds a per-session write lock from its first sequence allocation until it
//! finishes, which mirrors how Postgres blocks a second inserter on the
//! `(session_id, sequence)` unique index: concurrent turns on one session are
//! serialised and sequences stay dense even when a turn rolls back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use super::{MessageStore, Page, SessionFilter, SessionOrder, SessionPatch, StoreError, StoreTx};
use crate::models::{Message, Session};

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Message>,
    /// session id -> sequence -> message id
    sequences: HashMap<String, BTreeMap<i64, String>>,
}

impl State {
    fn live_session(&self, session_id: &str) -> Result<&Session, StoreError> {
        self.sessions
            .get(session_id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| StoreError::session_not_found(session_id))
    }

    fn live_session_mut(&mut self, session_id: &str) -> Result<&mut Session, StoreError> {
        self.sessions
            .get_mut(session_id)
            .filter(|s| !s.deleted)
            .ok_or_else(|| StoreError::session_not_found(session_id))
    }

    fn max_sequence(&self, session_id: &str) -> i64 {
        self.sequences
            .get(session_id)
            .and_then(|seqs| seqs.keys().next_back().copied())
            .unwrap_or(0)
    }

    fn last_message_content(&self, session: &Session) -> Option<&str> {
        session
            .last_message_id
            .as_ref()
            .and_then(|id| self.messages.get(id))
            .map(|m| m.content.as_str())
    }
}

#[derive(Default)]
struct Inner {
    state: RwLock<State>,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// In-memory store; cheap to clone, clones share state.
#[derive(Clone, Default)]
pub struct MemoryMessageStore {
    inner: Arc<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T: Clone>(items: &[T], page: Page) -> Vec<T> {
    items
        .iter()
        .skip(page.offset() as usize)
        .take(page.size as usize)
        .cloned()
        .collect()
}

fn sort_sessions(sessions: &mut [Session], order: SessionOrder) {
    sessions.sort_by(|a, b| {
        let primary = match order {
            SessionOrder::UpdatedDesc => b.updated_at.cmp(&a.updated_at),
            SessionOrder::CreatedDesc => b.created_at.cmp(&a.created_at),
            SessionOrder::PinnedThenUpdatedDesc => b
                .pinned
                .cmp(&a.pinned)
                .then_with(|| b.updated_at.cmp(&a.updated_at)),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::Corrupt(format!(
                "session '{}' already exists",
                session.id
            )));
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let state = self.inner.read();
        let session = state.live_session(session_id)?.clone();
        Ok(session)
    }

    async fn list_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let state = self.inner.read();
        let mut matched: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && filter.matches(s))
            .cloned()
            .collect();
        sort_sessions(&mut matched, filter.order);
        let total = matched.len() as u64;
        Ok((paginate(&matched, page), total))
    }

    async fn update_session_fields(
        &self,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let session = state.live_session_mut(session_id)?;
        patch.apply(session);
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut state = self.inner.write();
        let session = state.live_session_mut(session_id)?;
        session.deleted = true;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn search_sessions(
        &self,
        user_id: &str,
        keyword: &str,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let needle = keyword.to_lowercase();
        let state = self.inner.read();
        let mut matched: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && !s.deleted)
            .filter(|s| {
                s.title.to_lowercase().contains(&needle)
                    || state
                        .last_message_content(s)
                        .map_or(false, |c| c.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        sort_sessions(&mut matched, SessionOrder::UpdatedDesc);
        let total = matched.len() as u64;
        Ok((paginate(&matched, page), total))
    }

    async fn get_message(&self, message_id: &str) -> Result<Message, StoreError> {
        let state = self.inner.read();
        let message = state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::message_not_found(message_id))?;
        Ok(message)
    }

    async fn list_messages(
        &self,
        session_id: &str,
        page: Page,
    ) -> Result<(Vec<Message>, u64), StoreError> {
        let state = self.inner.read();
        let ordered: Vec<Message> = state
            .sequences
            .get(session_id)
            .map(|seqs| {
                seqs.values()
                    .filter_map(|id| state.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        let total = ordered.len() as u64;
        Ok((paginate(&ordered, page), total))
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let state = self.inner.read();
        let mut recent: Vec<Message> = state
            .sequences
            .get(session_id)
            .map(|seqs| {
                seqs.values()
                    .rev()
                    .take(limit as usize)
                    .filter_map(|id| state.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        recent.reverse();
        Ok(recent)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            guards: HashMap::new(),
            pending: Vec::new(),
            count_deltas: HashMap::new(),
            last_message: HashMap::new(),
        }))
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct MemoryTx {
    inner: Arc<Inner>,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    pending: Vec<Message>,
    count_deltas: HashMap<String, i32>,
    last_message: HashMap<String, String>,
}

impl MemoryTx {
    async fn lock_session(&mut self, session_id: &str) {
        if !self.guards.contains_key(session_id) {
            let guard = self.inner.session_lock(session_id).lock_owned().await;
            self.guards.insert(session_id.to_string(), guard);
        }
    }

    fn pending_max(&self, session_id: &str) -> i64 {
        self.pending
            .iter()
            .filter(|m| m.session_id == session_id)
            .map(|m| m.sequence)
            .max()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn next_sequence(&mut self, session_id: &str) -> Result<i64, StoreError> {
        self.lock_session(session_id).await;
        let committed = self.inner.read().max_sequence(session_id);
        Ok(committed.max(self.pending_max(session_id)) + 1)
    }

    async fn create_message(&mut self, message: &mut Message) -> Result<(), StoreError> {
        self.lock_session(&message.session_id).await;
        {
            let state = self.inner.read();
            state.live_session(&message.session_id)?;
            let taken = state
                .sequences
                .get(&message.session_id)
                .map_or(false, |seqs| seqs.contains_key(&message.sequence));
            if taken {
                return Err(StoreError::SequenceConflict {
                    session_id: message.session_id.clone(),
                    sequence: message.sequence,
                });
            }
        }
        let pending_taken = self
            .pending
            .iter()
            .any(|m| m.session_id == message.session_id && m.sequence == message.sequence);
        if pending_taken {
            return Err(StoreError::SequenceConflict {
                session_id: message.session_id.clone(),
                sequence: message.sequence,
            });
        }

        message.id = uuid::Uuid::new_v4().to_string();
        message.created_at = Utc::now();
        self.pending.push(message.clone());
        Ok(())
    }

    async fn increment_message_count(&mut self, session_id: &str, by: i32) -> Result<(), StoreError> {
        self.inner.read().live_session(session_id)?;
        *self.count_deltas.entry(session_id.to_string()).or_insert(0) += by;
        Ok(())
    }

    async fn update_last_message(&mut self, session_id: &str, message_id: &str) -> Result<(), StoreError> {
        self.inner.read().live_session(session_id)?;
        self.last_message
            .insert(session_id.to_string(), message_id.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTx {
            inner,
            guards,
            pending,
            count_deltas,
            last_message,
        } = *self;

        {
            let mut state = inner.write();
            let now = Utc::now();
            for message in pending {
                state
                    .sequences
                    .entry(message.session_id.clone())
                    .or_default()
                    .insert(message.sequence, message.id.clone());
                state.messages.insert(message.id.clone(), message);
            }
            for (session_id, delta) in count_deltas {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.message_count += delta;
                    session.updated_at = now;
                }
            }
            for (session_id, message_id) in last_message {
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.last_message_id = Some(message_id);
                    session.updated_at = now;
                }
            }
        }

        drop(guards);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
