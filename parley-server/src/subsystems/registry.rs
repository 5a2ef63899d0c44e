//! SessionRegistry: process-local map of session id → cancellation handle
//!
//! Each session with work in flight has exactly one handle. The handle owns a
//! session-level token, and every turn running on that session gets a child
//! of it, so an explicit abort cancels all of them. Each turn token is also
//! tied to the caller's own token, so the client going away cancels that one
//! turn only. The handle is removed when its last turn finishes, when it is
//! cancelled, or by the reaper once idle longer than `idle_timeout`.
//!
//! Locking: one `RwLock` guards the map. `get` only takes the shared lock and
//! bumps an atomic last-access stamp, so it cannot race a removal (which needs
//! the exclusive lock).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parley_core::config::RegistryConfig;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

struct Entry {
    token: CancellationToken,
    created_at: DateTime<Utc>,
    /// Milliseconds since the registry's epoch.
    last_access: AtomicU64,
    /// Identifies this handle; a re-created handle for the same id gets a new one.
    generation: u64,
    /// Turns currently registered against this handle.
    turns: usize,
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    epoch: Instant,
    next_generation: AtomicU64,
    idle_timeout: Duration,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release one turn of the handle identified by `generation`; the last
    /// turn out cancels and removes the handle.
    fn release(&self, session_id: &str, generation: u64) {
        let mut entries = self.write();
        let Some(entry) = entries
            .get_mut(session_id)
            .filter(|entry| entry.generation == generation)
        else {
            return;
        };

        entry.turns = entry.turns.saturating_sub(1);
        if entry.turns == 0 {
            if let Some(entry) = entries.remove(session_id) {
                entry.token.cancel();
            }
        }
    }

    fn reap(&self) -> usize {
        let now = self.now_ms();
        let idle_ms = self.idle_timeout.as_millis() as u64;
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|session_id, entry| {
            let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
            let expired = idle > idle_ms || entry.token.is_cancelled();
            if expired {
                entry.token.cancel();
                tracing::debug!(
                    session_id = %session_id,
                    idle_ms = idle,
                    turns = entry.turns,
                    age_secs = (Utc::now() - entry.created_at).num_seconds(),
                    "Reaped session handle"
                );
            }
            !expired
        });
        before - entries.len()
    }
}

struct Reaper {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Concurrent session-id → cancellation handle map with a background reaper.
pub struct SessionRegistry {
    inner: Arc<Inner>,
    cleanup_interval: Duration,
    reaper: Mutex<Option<Reaper>>,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                epoch: Instant::now(),
                next_generation: AtomicU64::new(1),
                idle_timeout,
            }),
            cleanup_interval,
            reaper: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::new(config.idle_timeout(), config.cleanup_interval())
    }

    /// Allocate a fresh session id and register a handle for it.
    pub fn create(&self, parent: &CancellationToken) -> (String, CancellationToken, RevokeGuard) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (token, guard) = self.register(&session_id, parent);
        (session_id, token, guard)
    }

    /// Register a turn on `session_id`, joining the session's handle or
    /// creating it. The returned token fires when the handle is cancelled or
    /// when `parent` is. Must be called from within a tokio runtime.
    pub fn register(&self, session_id: &str, parent: &CancellationToken) -> (CancellationToken, RevokeGuard) {
        let now = self.inner.now_ms();
        let new_entry = || Entry {
            token: CancellationToken::new(),
            created_at: Utc::now(),
            last_access: AtomicU64::new(now),
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
            turns: 0,
        };

        let (turn, generation) = {
            let mut entries = self.inner.write();
            let entry = entries.entry(session_id.to_string()).or_insert_with(new_entry);
            if entry.token.is_cancelled() {
                *entry = new_entry();
            }
            entry.turns += 1;
            entry.last_access.store(now, Ordering::Relaxed);
            if entry.turns > 1 {
                tracing::debug!(session_id = %session_id, turns = entry.turns, "Joined live session handle");
            }
            (entry.token.child_token(), entry.generation)
        };

        link_parent(parent.clone(), turn.clone());

        let guard = RevokeGuard {
            inner: Arc::clone(&self.inner),
            session_id: session_id.to_string(),
            token: turn.clone(),
            generation,
            revoked: false,
        };
        (turn, guard)
    }

    /// Look up a handle, refreshing its last-access time.
    pub fn get(&self, session_id: &str) -> Option<CancellationToken> {
        let entries = self.inner.read();
        let entry = entries.get(session_id)?;
        entry.last_access.store(self.inner.now_ms(), Ordering::Relaxed);
        Some(entry.token.clone())
    }

    /// Cancel every turn on the session and remove its handle. Returns
    /// `false` when no handle was registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.inner.write().remove(session_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove unconditionally, firing the cancellation to release any waiters.
    pub fn remove(&self, session_id: &str) {
        self.cancel(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One reaper pass. Returns the number of handles removed.
    pub fn reap(&self) -> usize {
        self.inner.reap()
    }

    /// Spawn the reaper. Calling `start` on a running registry is a no-op.
    pub fn start(&self) {
        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return;
        }

        let stop = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let period = self.cleanup_interval;
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval's first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reaped = inner.reap();
                        if reaped > 0 {
                            tracing::info!(reaped, "Session reaper removed idle handles");
                        }
                    }
                    _ = stopped.cancelled() => {
                        tracing::info!("Session reaper shutting down");
                        break;
                    }
                }
            }
        });

        tracing::info!(
            idle_timeout_ms = self.inner.idle_timeout.as_millis() as u64,
            cleanup_interval_ms = period.as_millis() as u64,
            "Session reaper started"
        );
        *reaper = Some(Reaper { stop, handle });
    }

    /// Stop the reaper, wait for it, then cancel and drop every remaining handle.
    pub async fn stop(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(reaper) = reaper {
            reaper.stop.cancel();
            if let Err(e) = reaper.handle.await {
                tracing::warn!(error = %e, "Session reaper task failed");
            }
        }

        let drained: Vec<Entry> = self.inner.write().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            tracing::info!(cancelled = drained.len(), "Cancelled remaining session handles");
        }
    }
}

/// Forward a cancellation of `parent` to `turn`. The task ends as soon as
/// either fires, and `turn` always fires when its guard is revoked.
fn link_parent(parent: CancellationToken, turn: CancellationToken) {
    if parent.is_cancelled() {
        turn.cancel();
        return;
    }
    tokio::spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => turn.cancel(),
            _ = turn.cancelled() => {}
        }
    });
}

/// Capability to cancel one turn and release its hold on the session handle.
/// Dropping it revokes.
pub struct RevokeGuard {
    inner: Arc<Inner>,
    session_id: String,
    token: CancellationToken,
    generation: u64,
    revoked: bool,
}

impl RevokeGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn revoke(mut self) {
        self.revoke_inner();
    }

    fn revoke_inner(&mut self) {
        if self.revoked {
            return;
        }
        self.revoked = true;
        self.token.cancel();
        self.inner.release(&self.session_id, self.generation);
    }
}

impl Drop for RevokeGuard {
    fn drop(&mut self) {
        self.revoke_inner();
    }
}

// ============================================================================
// TESTS
// ============================================================================
