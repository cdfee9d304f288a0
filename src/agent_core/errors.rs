//! Agent Core error types.

use thiserror::Error;

use super::types::WorkflowState;
use crate::inference::errors::InferenceError;

/// Errors that can occur during agent core operations.
///
/// Tool failures, malformed tool calls, and safety rejections never surface
/// here: the workflow recovers from them inside the turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Every model in the chain failed after retries.
    #[error("model unavailable: {source}")]
    ModelUnavailable { source: InferenceError },

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// A turn is running on the session, or a caller still holds its handle.
    #[error("session busy: '{session_id}'")]
    SessionBusy { session_id: String },

    /// A cache index that does not refer to a stored record.
    #[error("query record index {index} out of range (cache holds {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// The workflow tried to move along an edge that does not exist.
    #[error("illegal workflow transition: {from:?} -> {to:?}")]
    IllegalTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },

    /// A shared lock was poisoned by a panicking holder.
    #[error("lock error: {reason}")]
    LockError { reason: String },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::ModelUnavailable { source: e }
    }
}
