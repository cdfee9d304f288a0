//! Session management commands: list, load, delete, and evict sessions.

use serde::Serialize;

use crate::agent_core::{ConversationTurn, ExtractedFact, QueryRecord, SessionSummary};
use crate::AppState;

// ─── Response Types ─────────────────────────────────────────────────────────

/// Everything a front end needs to redraw a session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub created_at: String,
    pub turns: Vec<ConversationTurn>,
    pub records: Vec<QueryRecord>,
    pub facts: Vec<ExtractedFact>,
    pub executed_queries: u32,
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Sessions sorted by most recent activity first.
pub fn list_sessions(state: &AppState) -> Result<Vec<SessionSummary>, String> {
    state.store().list_sessions().map_err(|e| format!("{e}"))
}

/// A snapshot of one session. Fails if the session does not exist.
pub async fn load_session(state: &AppState, session_id: &str) -> Result<SessionView, String> {
    let session = state
        .store()
        .load(session_id)
        .await
        .map_err(|e| format!("{e}"))?;

    Ok(SessionView {
        session_id: session.session_id,
        created_at: session.created_at,
        turns: session.turns,
        records: session.cache.records().to_vec(),
        facts: session.facts,
        executed_queries: session.executed_queries,
    })
}

/// Delete a session and all its data.
pub fn delete_session(state: &AppState, session_id: &str) -> Result<(), String> {
    state.store().delete(session_id).map_err(|e| format!("{e}"))
}

/// Drop an idle session from memory. Persisted state stays on disk.
/// Refused while a turn is running on the session.
pub fn evict_session(state: &AppState, session_id: &str) -> Result<bool, String> {
    state.store().evict(session_id).map_err(|e| format!("{e}"))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::test_support::{PairOracle, ScriptedModel};
    use crate::agent_core::{SessionStore, WorkflowEngine};
    use crate::commands::chat::{send_message, start_session};
    use crate::graph::ToolRegistry;
    use crate::inference::ModelReply;
    use std::sync::Arc;

    fn app(store: SessionStore) -> AppState {
        AppState::new(WorkflowEngine::new(
            Arc::new(ScriptedModel::repeating(ModelReply::text("1. What do you enjoy?"))),
            Arc::new(ToolRegistry::new()),
            Arc::new(PairOracle::new(&[])),
            Arc::new(store),
        ))
    }

    #[tokio::test]
    async fn test_list_load_delete() {
        let state = app(SessionStore::in_memory());
        let info = start_session(&state).unwrap();
        send_message(&state, &info.session_id, "Help me choose a career")
            .await
            .unwrap();

        let listed = list_sessions(&state).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].turn_count, 2);
        assert_eq!(listed[0].preview.as_deref(), Some("Help me choose a career"));

        let view = load_session(&state, &info.session_id).await.unwrap();
        assert_eq!(view.turns.len(), 2);
        assert!(view.records.is_empty());
        assert_eq!(view.executed_queries, 0);

        delete_session(&state, &info.session_id).unwrap();
        assert!(load_session(&state, &info.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_evict_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let state = app(SessionStore::open(path.to_str().unwrap()).unwrap());

        let info = start_session(&state).unwrap();
        send_message(&state, &info.session_id, "hi").await.unwrap();

        assert!(evict_session(&state, &info.session_id).unwrap());
        assert!(!evict_session(&state, &info.session_id).unwrap());

        let view = load_session(&state, &info.session_id).await.unwrap();
        assert_eq!(view.turns.len(), 2);
        assert_eq!(view.turns[1].content, "1. What do you enjoy?");
    }

    #[tokio::test]
    async fn test_evict_refused_during_turn() {
        let state = app(SessionStore::in_memory());
        let info = start_session(&state).unwrap();
        let handle = state.store().handle(&info.session_id).unwrap();
        let guard = handle.lock().await;

        let err = evict_session(&state, &info.session_id).unwrap_err();
        assert!(err.contains("busy"));

        drop(guard);
        drop(handle);
        assert!(evict_session(&state, &info.session_id).unwrap());
    }

    #[tokio::test]
    async fn test_load_unknown_session_fails() {
        let state = app(SessionStore::in_memory());
        let err = load_session(&state, "nope").await.unwrap_err();
        assert!(err.contains("session not found"));
    }
}
