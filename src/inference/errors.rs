//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// HTTP 429 from the provider.
    #[error("rate limited by {endpoint} (retry after {retry_after_secs:?}s)")]
    RateLimited {
        endpoint: String,
        retry_after_secs: Option<u64>,
    },

    /// HTTP 5xx from the provider.
    #[error("server error {status} from {endpoint}: {body}")]
    ServerError {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Any other non-2xx HTTP response.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The model tried to call a tool but produced an unusable payload.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError { raw_response: String, reason: String },

    /// The response body could not be decoded.
    #[error("response error: {reason}")]
    ResponseError { reason: String },

    /// Every model in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable { attempted: Vec<String> },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether the provider rejected the response because the model generated
    /// a tool call it could not parse.
    ///
    /// Groq answers HTTP 400 with `tool_use_failed`; Ollama answers HTTP 500
    /// with `"error parsing tool call"`. Both mean "the model tried and got the
    /// arguments wrong", which the workflow recovers from with a corrective
    /// prompt instead of failing the turn.
    pub fn is_tool_call_parse_error(&self) -> bool {
        match self {
            InferenceError::ToolCallParseError { .. } => true,
            InferenceError::HttpError { status: 400, body } => body.contains("tool_use_failed"),
            InferenceError::ServerError {
                status: 500, body, ..
            } => body.contains("error parsing tool call"),
            _ => false,
        }
    }

    /// Whether the same request may succeed if sent again after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. }
            | InferenceError::Timeout { .. }
            | InferenceError::RateLimited { .. } => true,
            InferenceError::ServerError { .. } => !self.is_tool_call_parse_error(),
            _ => false,
        }
    }

    /// Extract the error body text, if this is an HTTP error.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } | InferenceError::ServerError { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }
}
