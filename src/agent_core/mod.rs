//! Agent Core: the conversation workflow and the state it keeps.
//!
//! Submodules:
//! - `workflow`: The per-turn state machine driving model, tools, and extraction
//! - `query_cache`: Append-only record of executed queries and their outcomes
//! - `equivalence`: Pluggable judgment of whether two queries ask the same thing
//! - `safety`: Inbound/outbound content scanners
//! - `extraction`: Fact extraction context and triple parsing
//! - `session_store`: Per-session handles with write-through persistence
//! - `database`: SQLite persistence for sessions, turns, records, facts
//! - `prompts`: Prompt and corrective message text
//! - `tokens`: Token estimation and result truncation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod database;
pub mod equivalence;
pub mod errors;
pub mod extraction;
pub mod prompts;
pub mod query_cache;
pub mod safety;
pub mod session_store;
pub mod tokens;
pub mod types;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use database::AgentDatabase;
pub use equivalence::{check_uniqueness, EquivalenceOracle, ExactMatchOracle, ModelEquivalenceOracle};
pub use errors::AgentError;
pub use query_cache::QueryCache;
pub use safety::{SafetyConfig, SafetyLayer};
pub use session_store::{SessionHandle, SessionStore};
pub use types::{
    AssistantReply, ConversationTurn, ExtractedFact, QueryRecord, QueryStatus, SessionState,
    SessionSummary, TurnStatus, UniquenessVerdict, WorkflowState,
};
pub use workflow::{EquivalenceStrategy, WorkflowConfig, WorkflowEngine};
