//! Shared types for the agent core.
//!
//! Conversation turns, query records, uniqueness verdicts, extracted facts,
//! the workflow state graph, and the per-session state with the deltas that
//! mutate it.

use serde::{Deserialize, Serialize};

use super::errors::AgentError;
use super::query_cache::QueryCache;
use crate::inference::types::Role;

// ─── Conversation ───────────────────────────────────────────────────────────

/// One message of the user-visible conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// 0-based position in the session.
    pub position: usize,
    pub role: Role,
    pub content: String,
    /// ISO 8601 timestamp.
    pub timestamp: String,
}

// ─── Query Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Not yet resolved. The cache only appends records once the graph has
    /// answered, so this never reaches storage from a live turn.
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Succeeded => "succeeded",
            QueryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueryStatus::Pending),
            "succeeded" => Some(QueryStatus::Succeeded),
            "failed" => Some(QueryStatus::Failed),
            _ => None,
        }
    }
}

/// A query the session has executed, with its outcome.
///
/// `result` is present iff `status` is `Succeeded`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Insertion index within the session's cache.
    pub seq: usize,
    pub tool: String,
    /// The dedup key, e.g. the Cypher text.
    pub query: String,
    pub status: QueryStatus,
    pub result: Option<serde_json::Value>,
    /// Why the query failed, when it did.
    pub error: Option<String>,
    /// The user turn (1-based) that produced this record.
    pub turn: usize,
    pub recorded_at: String,
}

/// Outcome of one tool execution, before it becomes a record.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
}

/// A query to append to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct NewQuery {
    pub tool: String,
    pub query: String,
    pub outcome: QueryOutcome,
}

// ─── Uniqueness ─────────────────────────────────────────────────────────────

/// Whether a requested query matches something already in the cache.
///
/// `is_duplicate` is only set for matches against succeeded records; a match
/// against a failed record sets `previously_failed` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UniquenessVerdict {
    pub is_duplicate: bool,
    pub matched_index: Option<usize>,
    pub previously_failed: bool,
}

impl UniquenessVerdict {
    pub fn unique() -> Self {
        Self::default()
    }

    pub fn duplicate_of(index: usize) -> Self {
        Self {
            is_duplicate: true,
            matched_index: Some(index),
            previously_failed: false,
        }
    }

    pub fn failed_before(index: usize) -> Self {
        Self {
            is_duplicate: false,
            matched_index: Some(index),
            previously_failed: true,
        }
    }
}

// ─── Extracted Facts ────────────────────────────────────────────────────────

/// A `(subject, relation, object)` triple derived from query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFact {
    pub subject: String,
    pub relation: String,
    pub object: String,
    /// The user turn (1-based) that produced this fact.
    pub turn: usize,
}

// ─── Workflow States ────────────────────────────────────────────────────────

/// States of the per-turn workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Responding,
    CheckingToolCall,
    ValidatingQuery,
    ExecutingOrReusing,
    ExtractingData,
    Recommending,
    Terminal,
}

impl WorkflowState {
    /// The states reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [WorkflowState] {
        use WorkflowState::*;
        match self {
            Responding => &[CheckingToolCall, Terminal],
            CheckingToolCall => &[ValidatingQuery, ExtractingData],
            // A call that fails validation skips straight to the next one.
            ValidatingQuery => &[ExecutingOrReusing, ValidatingQuery, ExtractingData],
            ExecutingOrReusing => &[ValidatingQuery, ExtractingData],
            ExtractingData => &[Recommending],
            Recommending => &[CheckingToolCall, Terminal],
            Terminal => &[],
        }
    }

    /// Move to `to`, or fail if the edge does not exist.
    pub fn transition(self, to: WorkflowState) -> Result<WorkflowState, AgentError> {
        if self.allowed_transitions().contains(&to) {
            Ok(to)
        } else {
            Err(AgentError::IllegalTransition { from: self, to })
        }
    }
}

// ─── Session State ──────────────────────────────────────────────────────────

/// Everything one conversation owns.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub created_at: String,
    /// Append-only conversation history.
    pub turns: Vec<ConversationTurn>,
    /// Append-only query records.
    pub cache: QueryCache,
    /// Append-only facts, ordered by turn.
    pub facts: Vec<ExtractedFact>,
    /// Running count of tool executions.
    pub executed_queries: u32,
    /// The most recent uniqueness verdict.
    pub last_verdict: Option<UniquenessVerdict>,
}

/// Changes produced by one workflow step, merged by [`SessionState::apply`].
#[derive(Debug, Clone, Default)]
pub struct SessionDelta {
    pub turns: Vec<(Role, String)>,
    pub queries: Vec<NewQuery>,
    /// Triples for the current user turn.
    pub facts: Vec<(String, String, String)>,
    pub executed: u32,
    pub verdict: Option<UniquenessVerdict>,
}

impl SessionDelta {
    pub fn turn(role: Role, content: impl Into<String>) -> Self {
        Self {
            turns: vec![(role, content.into())],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
            && self.queries.is_empty()
            && self.facts.is_empty()
            && self.executed == 0
            && self.verdict.is_none()
    }
}

/// What [`SessionState::apply`] actually added.
#[derive(Debug, Clone, Default)]
pub struct AppliedDelta {
    pub turns: Vec<ConversationTurn>,
    pub records: Vec<QueryRecord>,
    pub facts: Vec<ExtractedFact>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            turns: Vec::new(),
            cache: QueryCache::new(),
            facts: Vec::new(),
            executed_queries: 0,
            last_verdict: None,
        }
    }

    /// Number of user messages so far; the current user turn number.
    pub fn user_turn_count(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    /// Merge a step delta. Records that repeat an existing succeeded query
    /// verbatim are not appended twice.
    pub fn apply(&mut self, delta: SessionDelta) -> AppliedDelta {
        let now = chrono::Utc::now().to_rfc3339();
        let mut applied = AppliedDelta::default();

        for (role, content) in delta.turns {
            let turn = ConversationTurn {
                position: self.turns.len(),
                role,
                content,
                timestamp: now.clone(),
            };
            self.turns.push(turn.clone());
            applied.turns.push(turn);
        }

        let turn_no = self.user_turn_count();
        for q in delta.queries {
            let before = self.cache.len();
            let index = match q.outcome {
                QueryOutcome::Succeeded(result) => {
                    self.cache.record_success(&q.tool, &q.query, result, turn_no)
                }
                QueryOutcome::Failed(reason) => {
                    self.cache.record_failure(&q.tool, &q.query, &reason, turn_no)
                }
            };
            if self.cache.len() > before {
                if let Some(record) = self.cache.get(index) {
                    applied.records.push(record.clone());
                }
            }
        }

        for (subject, relation, object) in delta.facts {
            let fact = ExtractedFact {
                subject,
                relation,
                object,
                turn: turn_no,
            };
            self.facts.push(fact.clone());
            applied.facts.push(fact);
        }

        self.executed_queries += delta.executed;
        if delta.verdict.is_some() {
            self.last_verdict = delta.verdict;
        }

        applied
    }
}

// ─── Replies ────────────────────────────────────────────────────────────────

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    SafetyRejected,
    /// No model could be reached; the reply is a static fallback.
    Degraded,
}

/// The assistant's answer to one user message, with side-channel data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantReply {
    pub text: String,
    pub status: TurnStatus,
    /// Facts extracted this turn.
    pub facts: Vec<ExtractedFact>,
    /// Records created or reused this turn, in the order they were touched.
    pub records: Vec<QueryRecord>,
    pub verdict: Option<UniquenessVerdict>,
    /// Tool executions (not reuses) this turn.
    pub tool_executions: u32,
}

impl AssistantReply {
    pub fn plain(text: impl Into<String>, status: TurnStatus) -> Self {
        Self {
            text: text.into(),
            status,
            facts: Vec::new(),
            records: Vec::new(),
            verdict: None,
            tool_executions: 0,
        }
    }
}

// ─── Session Summaries ──────────────────────────────────────────────────────

/// One row of the session list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: String,
    pub last_activity: String,
    pub turn_count: usize,
    pub query_count: usize,
    /// Start of the first user message.
    pub preview: Option<String>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
