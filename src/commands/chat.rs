//! Chat commands: start a session and send it messages.
//!
//! These are the front-end entry points. They never surface a model outage
//! as an error: when no model can be reached the caller gets a degraded
//! static reply and can simply send the message again.

use serde::Serialize;

use crate::agent_core::{
    AgentError, AssistantReply, ExtractedFact, QueryRecord, TurnStatus, UniquenessVerdict,
};
use crate::inference::static_fallback_response;
use crate::AppState;

// ─── Response Types ─────────────────────────────────────────────────────────

/// A freshly created session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: String,
}

/// The reply to one user message plus its side-channel data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub session_id: String,
    pub text: String,
    pub status: TurnStatus,
    pub facts: Vec<ExtractedFact>,
    pub records: Vec<QueryRecord>,
    pub verdict: Option<UniquenessVerdict>,
    pub tool_executions: u32,
}

impl ChatResponse {
    fn from_reply(session_id: &str, reply: AssistantReply) -> Self {
        Self {
            session_id: session_id.to_string(),
            text: reply.text,
            status: reply.status,
            facts: reply.facts,
            records: reply.records,
            verdict: reply.verdict,
            tool_executions: reply.tool_executions,
        }
    }
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Create a new, empty session.
pub fn start_session(state: &AppState) -> Result<SessionInfo, String> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let handle = state
        .store()
        .handle(&session_id)
        .map_err(|e| format!("{e}"))?;
    let created_at = handle
        .try_lock()
        .map(|s| s.created_at.clone())
        .unwrap_or_else(|_| chrono::Utc::now().to_rfc3339());

    tracing::info!(session = %session_id, "session started");
    Ok(SessionInfo {
        session_id,
        created_at,
    })
}

/// Send one user message to a session and wait for the reply.
///
/// Messages to the same session are processed one at a time; a second call
/// waits for the first to finish.
pub async fn send_message(
    state: &AppState,
    session_id: &str,
    text: &str,
) -> Result<ChatResponse, String> {
    if text.trim().is_empty() {
        return Err("message is empty".to_string());
    }

    let handle = state
        .store()
        .handle(session_id)
        .map_err(|e| format!("{e}"))?;
    let mut session = handle.lock().await;

    match state.engine.advance(&mut session, text).await {
        Ok(reply) => Ok(ChatResponse::from_reply(session_id, reply)),
        Err(AgentError::ModelUnavailable { source }) => {
            tracing::error!(session = %session_id, error = %source, "returning degraded reply");
            let fallback = static_fallback_response();
            Ok(ChatResponse::from_reply(
                session_id,
                AssistantReply::plain(fallback.text_or_empty(), TurnStatus::Degraded),
            ))
        }
        Err(e) => {
            tracing::error!(session = %session_id, error = %e, "turn failed");
            Err(format!("{e}"))
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
