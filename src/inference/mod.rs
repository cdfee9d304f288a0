//! Inference Client: OpenAI-compatible API client for hosted LLM inference.
//!
//! This module handles all communication with the model endpoint:
//! - Non-streaming chat completions with tool definitions
//! - Tool call parsing and JSON repair
//! - Retry with backoff, then the fallback chain
//! - The `models` section of `careergraph.yaml`
//!
//! Everything above this layer talks to [`ModelBackend`], so the model is
//! interchangeable via config and replaceable by a stub in tests.

pub mod client;
pub mod config;
pub mod errors;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::{static_fallback_response, InferenceClient, ModelBackend};
pub use config::{ModelConfig, ModelsConfig, RetryPolicy};
pub use errors::InferenceError;
pub use types::{ChatMessage, MalformedToolCall, ModelReply, Role, ToolCall, ToolDefinition};
