//! Session storage: per-session per-model histories and the bounded,
//! TTL-scavenged registry.
//!
//! Locking discipline: the registry lock and the per-session lock are
//! separate, and registry operations never take a session lock. The
//! fields the registry needs for eviction decisions (last access, busy)
//! are atomics on the session itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::history::{truncate_history, Turn};
use crate::orchestrator::GenerationHandle;

/// Hard cap on concurrently held sessions.
pub const MAX_SESSIONS: usize = 50;

/// Idle time after which a session is eligible for reaping.
pub const SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// How often the background reaper scans for expired sessions.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// A single comparison session: one independent history per configured
/// model, plus at most one active generation.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.inner.id).finish()
    }
}

struct SessionInner {
    id: String,
    epoch: Instant,
    created_at: Instant,
    /// Milliseconds since `epoch`; read lock-free by the registry.
    last_access_ms: AtomicU64,
    /// Whether a generation is active; read lock-free by the registry.
    busy: AtomicBool,
    state: Mutex<SessionState>,
}

struct SessionState {
    histories: HashMap<String, Vec<Turn>>,
    active: Option<GenerationHandle>,
}

impl Session {
    fn new(id: String, model_ids: &[String], epoch: Instant) -> Self {
        let histories = model_ids
            .iter()
            .map(|m| (m.clone(), Vec::new()))
            .collect();
        Self {
            inner: Arc::new(SessionInner {
                id,
                epoch,
                created_at: Instant::now(),
                last_access_ms: AtomicU64::new(epoch.elapsed().as_millis() as u64),
                busy: AtomicBool::new(false),
                state: Mutex::new(SessionState {
                    histories,
                    active: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// How long this session has existed.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Update the last access timestamp.
    pub fn touch(&self) {
        self.inner
            .last_access_ms
            .store(self.inner.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn last_access_ms(&self) -> u64 {
        self.inner.last_access_ms.load(Ordering::Relaxed)
    }

    /// Whether the session has been idle longer than `ttl`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        now_ms.saturating_sub(self.last_access_ms()) > ttl.as_millis() as u64
    }

    /// Whether a generation is currently active.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Append a user turn to every model's history, truncating each to the
    /// retention policy.
    pub fn append_user(&self, message: &str) {
        let mut state = self.inner.state.lock().expect("session lock poisoned");
        for history in state.histories.values_mut() {
            history.push(Turn::user(message));
            truncate_history(history);
        }
        drop(state);
        self.touch();
    }

    /// Append an assistant turn to one model's history.
    pub fn commit_assistant(&self, model_id: &str, turn: Turn) {
        let mut state = self.inner.state.lock().expect("session lock poisoned");
        if let Some(history) = state.histories.get_mut(model_id) {
            history.push(turn);
        }
        drop(state);
        self.touch();
    }

    /// Clone one model's history.
    #[must_use]
    pub fn history(&self, model_id: &str) -> Vec<Turn> {
        let state = self.inner.state.lock().expect("session lock poisoned");
        state.histories.get(model_id).cloned().unwrap_or_default()
    }

    /// The configured model ids this session tracks.
    #[must_use]
    pub fn model_ids(&self) -> Vec<String> {
        let state = self.inner.state.lock().expect("session lock poisoned");
        let mut ids: Vec<String> = state.histories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Install a generation handle, failing if one is already active.
    pub fn begin_generation(&self, handle: GenerationHandle) -> Result<(), ApiError> {
        let mut state = self.inner.state.lock().expect("session lock poisoned");
        if state.active.as_ref().is_some_and(|h| !h.is_done()) {
            return Err(ApiError::BusySession);
        }
        state.active = Some(handle);
        drop(state);
        self.inner.busy.store(true, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    /// Mark the active generation finished and free the session.
    pub fn finish_generation(&self) {
        let mut state = self.inner.state.lock().expect("session lock poisoned");
        state.active = None;
        drop(state);
        self.inner.busy.store(false, Ordering::Relaxed);
        self.touch();
    }

    /// The active generation handle, if any.
    #[must_use]
    pub fn active_generation(&self) -> Option<GenerationHandle> {
        let state = self.inner.state.lock().expect("session lock poisoned");
        state.active.clone().filter(|h| !h.is_done())
    }
}

/// Bounded, thread-safe registry of sessions.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    sessions: Mutex<HashMap<String, Session>>,
    model_ids: Vec<String>,
    capacity: usize,
    ttl: Duration,
    epoch: Instant,
}

impl SessionStore {
    #[must_use]
    pub fn new(model_ids: Vec<String>) -> Self {
        Self::with_limits(model_ids, MAX_SESSIONS, SESSION_TTL)
    }

    /// Construct with explicit capacity and TTL (used by tests).
    #[must_use]
    pub fn with_limits(model_ids: Vec<String>, capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: Mutex::new(HashMap::new()),
                model_ids,
                capacity,
                ttl,
                epoch: Instant::now(),
            }),
        }
    }

    /// Create a new session, evicting the least-recently-accessed idle
    /// session when at capacity. Fails with `Overloaded` when every
    /// session is busy.
    pub fn create(&self) -> Result<Session, ApiError> {
        let mut sessions = self.inner.sessions.lock().expect("registry lock poisoned");

        if sessions.len() >= self.inner.capacity {
            let victim = sessions
                .values()
                .filter(|s| !s.is_busy())
                .min_by_key(|s| s.last_access_ms())
                .map(|s| s.id().to_string());

            match victim {
                Some(id) => {
                    debug!(session_id = %id, "evicting idle session at capacity");
                    sessions.remove(&id);
                }
                None => return Err(ApiError::Overloaded),
            }
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::new(id.clone(), &self.inner.model_ids, self.inner.epoch);
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Fetch a session, updating its access time. Expired idle sessions
    /// are removed on access.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut sessions = self.inner.sessions.lock().expect("registry lock poisoned");
        let session = sessions.get(id)?.clone();
        if session.is_expired(self.inner.ttl) && !session.is_busy() {
            sessions.remove(id);
            return None;
        }
        drop(sessions);
        session.touch();
        Some(session)
    }

    pub fn remove(&self, id: &str) -> Option<Session> {
        self.inner
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .remove(id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.sessions.lock().expect("registry lock poisoned").len()
    }

    /// Remove expired idle sessions; busy sessions are skipped and picked
    /// up after their generation completes. Returns how many were removed.
    pub fn reap_expired(&self) -> usize {
        let mut sessions = self.inner.sessions.lock().expect("registry lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, s| s.is_busy() || !s.is_expired(self.inner.ttl));
        let reaped = before - sessions.len();
        if reaped > 0 {
            info!(reaped, remaining = sessions.len(), "reaped expired sessions");
        }
        reaped
    }

    /// Every live session, for shutdown cancellation.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Session> {
        self.inner
            .sessions
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Spawn the background reaper task.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAPER_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                store.reap_expired();
            }
        })
    }
}
