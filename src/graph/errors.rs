//! Graph tool error types.

use thiserror::Error;

/// Errors that can occur while resolving or running a graph tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Tool not found in the registry.
    #[error("unknown tool: '{name}'")]
    ToolNotFound { name: String },

    /// Tool call arguments failed validation (schema or read-only guard).
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The graph database rejected or failed to run the query.
    #[error("execution of '{tool}' failed: {reason}")]
    ExecutionError { tool: String, reason: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The graph database endpoint could not be reached.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },
}

impl ToolError {
    /// Whether the failure is attributable to the query itself, so the model
    /// can fix it by rewriting the query.
    pub fn is_query_fault(&self) -> bool {
        matches!(
            self,
            ToolError::InvalidArguments { .. } | ToolError::ExecutionError { .. }
        )
    }
}
