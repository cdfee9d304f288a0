//! Session store: per-session state handles plus optional SQLite persistence.
//!
//! Each session lives behind its own `tokio::sync::Mutex`, so one turn per
//! session runs at a time while different sessions proceed in parallel.
//! Workflow steps hand their deltas to [`SessionStore::commit`], which
//! applies them in memory and writes them through to the database before
//! returning. A turn abandoned mid-way therefore leaves every committed step
//! in place and nothing else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::database::AgentDatabase;
use super::errors::AgentError;
use super::types::{AppliedDelta, SessionDelta, SessionState, SessionSummary};
use crate::inference::types::Role;

pub type SessionHandle = Arc<tokio::sync::Mutex<SessionState>>;

pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    db: Option<Mutex<AgentDatabase>>,
}

/// The map holds one reference; any other means a caller is using it.
fn ensure_idle(
    sessions: &HashMap<String, SessionHandle>,
    session_id: &str,
) -> Result<(), AgentError> {
    match sessions.get(session_id) {
        Some(handle) if Arc::strong_count(handle) > 1 || handle.try_lock().is_err() => {
            Err(AgentError::SessionBusy {
                session_id: session_id.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> AgentError {
    AgentError::LockError {
        reason: e.to_string(),
    }
}

impl SessionStore {
    /// A store that keeps sessions only in memory.
    pub fn in_memory() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            db: None,
        }
    }

    /// A store that persists to the SQLite database at `path`.
    pub fn open(path: &str) -> Result<Self, AgentError> {
        let db = AgentDatabase::open(path)?;
        tracing::info!(path = %path, "session database opened");
        Ok(Self {
            sessions: Mutex::new(HashMap::new()),
            db: Some(Mutex::new(db)),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    fn db(&self) -> Result<Option<MutexGuard<'_, AgentDatabase>>, AgentError> {
        self.db
            .as_ref()
            .map(|m| m.lock().map_err(lock_err))
            .transpose()
    }

    // ─── Handles ────────────────────────────────────────────────────────

    /// The handle for `session_id`, loading persisted state on first access
    /// and creating an empty session when there is none.
    pub fn handle(&self, session_id: &str) -> Result<SessionHandle, AgentError> {
        let mut sessions = self.sessions.lock().map_err(lock_err)?;
        if let Some(handle) = sessions.get(session_id) {
            return Ok(handle.clone());
        }

        let loaded = match self.db()? {
            Some(db) => db.load_session(session_id)?,
            None => None,
        };
        let state = match loaded {
            Some(state) => {
                tracing::info!(
                    session = %session_id,
                    turns = state.turns.len(),
                    records = state.cache.len(),
                    "session restored from database"
                );
                state
            }
            None => {
                tracing::info!(session = %session_id, "new session");
                SessionState::new(session_id)
            }
        };

        let handle = Arc::new(tokio::sync::Mutex::new(state));
        sessions.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// A snapshot of an existing session. Does not create one.
    pub async fn load(&self, session_id: &str) -> Result<SessionState, AgentError> {
        let cached = self
            .sessions
            .lock()
            .map_err(lock_err)?
            .get(session_id)
            .cloned();
        if let Some(handle) = cached {
            return Ok(handle.lock().await.clone());
        }

        let loaded = match self.db()? {
            Some(db) => db.load_session(session_id)?,
            None => None,
        };
        loaded.ok_or_else(|| AgentError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }

    // ─── Commits ────────────────────────────────────────────────────────

    /// Apply a step delta to `state` and persist what it added.
    ///
    /// Synchronous: once the call starts, it finishes, so cancellation can
    /// only land between commits.
    pub fn commit(
        &self,
        state: &mut SessionState,
        delta: SessionDelta,
    ) -> Result<AppliedDelta, AgentError> {
        if delta.is_empty() {
            return Ok(AppliedDelta::default());
        }
        let applied = state.apply(delta);
        if let Some(db) = self.db()? {
            db.persist(state, &applied)?;
        }
        tracing::debug!(
            session = %state.session_id,
            turns = applied.turns.len(),
            records = applied.records.len(),
            facts = applied.facts.len(),
            "delta committed"
        );
        Ok(applied)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Drop the in-memory copy. Persisted state is kept and reloaded on the
    /// next access. Returns whether the session was resident.
    ///
    /// Fails with `SessionBusy` while anyone else holds the handle, so two
    /// copies of one session never exist at once.
    pub fn evict(&self, session_id: &str) -> Result<bool, AgentError> {
        let mut sessions = self.sessions.lock().map_err(lock_err)?;
        ensure_idle(&sessions, session_id)?;
        let removed = sessions.remove(session_id).is_some();
        if removed {
            tracing::info!(session = %session_id, "session evicted from memory");
        }
        Ok(removed)
    }

    /// Remove a session from memory and from the database. Fails with
    /// `SessionBusy` while a turn is running on it.
    pub fn delete(&self, session_id: &str) -> Result<(), AgentError> {
        let mut sessions = self.sessions.lock().map_err(lock_err)?;
        ensure_idle(&sessions, session_id)?;
        sessions.remove(session_id);
        drop(sessions);
        if let Some(db) = self.db()? {
            db.delete_session(session_id)?;
        }
        tracing::info!(session = %session_id, "session deleted");
        Ok(())
    }

    /// Summaries of known sessions, most recent first.
    ///
    /// With a database this lists persisted sessions; otherwise the resident
    /// ones (sessions busy with a turn are skipped).
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, AgentError> {
        if let Some(db) = self.db()? {
            return db.list_sessions();
        }

        let sessions = self.sessions.lock().map_err(lock_err)?;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter_map(|handle| handle.try_lock().ok().map(|s| summarize(&s)))
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }
}

fn summarize(state: &SessionState) -> SessionSummary {
    SessionSummary {
        session_id: state.session_id.clone(),
        created_at: state.created_at.clone(),
        last_activity: state
            .turns
            .last()
            .map(|t| t.timestamp.clone())
            .unwrap_or_else(|| state.created_at.clone()),
        turn_count: state.turns.len(),
        query_count: state.cache.len(),
        preview: state
            .turns
            .iter()
            .find(|t| t.role == Role::User)
            .map(|t| super::tokens::preview(&t.content, 80)),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
