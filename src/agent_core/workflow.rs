//! Workflow engine: runs one user message through the conversation graph.
//!
//! ```text
//! Responding ──► CheckingToolCall ──► ValidatingQuery ──► ExecutingOrReusing
//!     │                 │                  ▲    │                 │
//!     │                 │                  └────┴─────────────────┘
//!     │                 ▼                       ▼
//!     │           ExtractingData ◄──────────────┘
//!     │                 ▼
//!     │           Recommending ──► CheckingToolCall (next round)
//!     ▼                 ▼
//!  Terminal ◄───────────┘
//! ```
//!
//! Every step that changes the session commits its own delta through the
//! [`SessionStore`] before the next await point, so dropping the future
//! between steps leaves a consistent session behind.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::equivalence::{check_uniqueness, EquivalenceOracle};
use super::errors::AgentError;
use super::extraction::{conversation_context, facts_context, parse_triples, queried_data_context};
use super::prompts;
use super::query_cache::is_empty_result;
use super::safety::SafetyLayer;
use super::session_store::SessionStore;
use super::tokens::{estimate_transcript_tokens, tool_result_for_model};
use super::types::{
    AssistantReply, ExtractedFact, NewQuery, QueryOutcome, QueryRecord, QueryStatus,
    SessionDelta, SessionState, TurnStatus, UniquenessVerdict, WorkflowState,
};
use crate::graph::{GraphBackend, ToolError, ToolRegistry};
use crate::inference::client::ModelBackend;
use crate::inference::types::{ChatMessage, ModelReply, Role, ToolCall};

// ─── Settings ───────────────────────────────────────────────────────────────

fn default_max_tool_rounds() -> u32 {
    3
}
fn default_max_tool_result_chars() -> usize {
    4000
}
fn default_max_context_bytes() -> usize {
    6000
}
fn default_oracle_max_attempts() -> u32 {
    3
}
fn default_oracle_base_delay_ms() -> u64 {
    250
}

/// How query equivalence is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquivalenceStrategy {
    /// Ask the model.
    #[default]
    Model,
    /// Whitespace- and case-insensitive text match only.
    Exact,
}

/// Limits and strategy knobs for the workflow (`workflow:` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Tool rounds allowed per user message.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Bytes of a tool result shown to the model.
    #[serde(default = "default_max_tool_result_chars")]
    pub max_tool_result_chars: usize,

    /// Bytes of conversation handed to the extractor.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,

    #[serde(default)]
    pub equivalence_strategy: EquivalenceStrategy,

    #[serde(default = "default_oracle_max_attempts")]
    pub oracle_max_attempts: u32,

    #[serde(default = "default_oracle_base_delay_ms")]
    pub oracle_base_delay_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_tool_result_chars: default_max_tool_result_chars(),
            max_context_bytes: default_max_context_bytes(),
            equivalence_strategy: EquivalenceStrategy::default(),
            oracle_max_attempts: default_oracle_max_attempts(),
            oracle_base_delay_ms: default_oracle_base_delay_ms(),
        }
    }
}

// ─── Turn Context ───────────────────────────────────────────────────────────

/// Working state of one user message. Dropped when the turn ends.
struct TurnContext {
    state: WorkflowState,
    /// System prompt, history, then this turn's tool traffic.
    transcript: Vec<ChatMessage>,
    /// Records created or reused this turn.
    touched: Vec<QueryRecord>,
    facts: Vec<ExtractedFact>,
    verdict: Option<UniquenessVerdict>,
    executions: u32,
    rounds: u32,
}

impl TurnContext {
    fn go(&mut self, to: WorkflowState) -> Result<(), AgentError> {
        let next = self.state.transition(to)?;
        tracing::debug!(from = ?self.state, to = ?next, "workflow transition");
        self.state = next;
        Ok(())
    }
}

// ─── Engine ─────────────────────────────────────────────────────────────────

pub struct WorkflowEngine {
    model: Arc<dyn ModelBackend>,
    registry: Arc<ToolRegistry>,
    oracle: Arc<dyn EquivalenceOracle>,
    safety: Arc<SafetyLayer>,
    store: Arc<SessionStore>,
    config: WorkflowConfig,
    /// Graph schema text used in the system prompt and equivalence checks.
    schema: RwLock<String>,
    /// Where to fetch the schema again if it was unavailable at startup.
    schema_source: Option<Arc<dyn GraphBackend>>,
}

impl WorkflowEngine {
    pub fn new(
        model: Arc<dyn ModelBackend>,
        registry: Arc<ToolRegistry>,
        oracle: Arc<dyn EquivalenceOracle>,
        store: Arc<SessionStore>,
    ) -> Self {
        Self {
            model,
            registry,
            oracle,
            safety: Arc::new(SafetyLayer::disabled()),
            store,
            config: WorkflowConfig::default(),
            schema: RwLock::new(String::new()),
            schema_source: None,
        }
    }

    pub fn with_safety(mut self, safety: Arc<SafetyLayer>) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = RwLock::new(schema.into());
        self
    }

    /// Refetch the schema from `source` after the first successful query
    /// while the current one is empty.
    pub fn with_schema_source(mut self, source: Arc<dyn GraphBackend>) -> Self {
        self.schema_source = Some(source);
        self
    }

    pub fn schema(&self) -> String {
        self.schema
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    async fn refresh_schema(&self) {
        let Some(source) = &self.schema_source else {
            return;
        };
        if !self.schema().is_empty() {
            return;
        }
        match source.schema().await {
            Ok(schema) if !schema.is_empty() => {
                tracing::info!(bytes = schema.len(), "graph schema loaded after startup");
                if let Ok(mut current) = self.schema.write() {
                    *current = schema;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "graph schema still unavailable"),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    // ─── Turn ───────────────────────────────────────────────────────────

    /// Process one user message and return the assistant's reply.
    ///
    /// Fails with `ModelUnavailable` when the model cannot be reached for
    /// the response or recommendation step. Steps committed before the
    /// failure stay committed.
    pub async fn advance(
        &self,
        session: &mut SessionState,
        user_message: &str,
    ) -> Result<AssistantReply, AgentError> {
        let started = Instant::now();

        let inbound = self.safety.inbound.scan(user_message);
        if !inbound.acceptable {
            tracing::warn!(
                session = %session.session_id,
                reason = inbound.reason.as_deref().unwrap_or(""),
                "user message rejected"
            );
            return Ok(AssistantReply::plain(
                prompts::INBOUND_REFUSAL,
                TurnStatus::SafetyRejected,
            ));
        }
        self.store
            .commit(session, SessionDelta::turn(Role::User, inbound.sanitized))?;

        let mut turn = TurnContext {
            state: WorkflowState::Responding,
            transcript: self.build_transcript(session),
            touched: Vec::new(),
            facts: Vec::new(),
            verdict: None,
            executions: 0,
            rounds: 0,
        };
        let tools_available = !self.registry.is_empty();
        let max_rounds = self.config.max_tool_rounds.max(1);

        let mut reply = self.call_model(&mut turn.transcript, tools_available).await?;

        let final_text = loop {
            if !reply.requests_tools() || turn.rounds >= max_rounds {
                if reply.requests_tools() {
                    tracing::warn!(
                        session = %session.session_id,
                        rounds = turn.rounds,
                        "tool calls requested past the round limit, ignoring"
                    );
                }
                turn.go(WorkflowState::Terminal)?;
                break reply.text.unwrap_or_default();
            }

            turn.go(WorkflowState::CheckingToolCall)?;
            turn.rounds += 1;
            let round_start = turn.touched.len();

            let queued = self.check_tool_calls(&mut turn, &reply);
            for call in &queued {
                self.run_tool_call(session, &mut turn, call).await?;
            }

            turn.go(WorkflowState::ExtractingData)?;
            let round_facts = self.extract(session, &mut turn, round_start).await?;

            turn.go(WorkflowState::Recommending)?;
            let instruction = if round_facts.is_empty() {
                prompts::RECOMMEND_WITHOUT_DATA.to_string()
            } else {
                prompts::recommend_with_data(&facts_context(&round_facts))
            };
            turn.transcript.push(ChatMessage::system(instruction));

            let allow_tools = tools_available && turn.rounds < max_rounds;
            if !allow_tools {
                turn.transcript.push(ChatMessage::system(prompts::NO_MORE_TOOLS));
            }
            reply = self.call_model(&mut turn.transcript, allow_tools).await?;
        };

        let final_text = if final_text.trim().is_empty() {
            self.answer_in_text(session, &mut turn).await
        } else {
            final_text
        };

        // ─── Outbound ───────────────────────────────────────────────────
        let outbound = self.safety.outbound.scan(&final_text);
        let (text, status) = if outbound.acceptable {
            (outbound.sanitized, TurnStatus::Completed)
        } else {
            tracing::warn!(
                session = %session.session_id,
                reason = outbound.reason.as_deref().unwrap_or(""),
                "assistant reply rejected"
            );
            (prompts::OUTBOUND_REFUSAL.to_string(), TurnStatus::SafetyRejected)
        };
        self.store
            .commit(session, SessionDelta::turn(Role::Assistant, text.clone()))?;

        tracing::info!(
            session = %session.session_id,
            rounds = turn.rounds,
            executions = turn.executions,
            records = turn.touched.len(),
            facts = turn.facts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn complete"
        );

        Ok(AssistantReply {
            text,
            status,
            facts: turn.facts,
            records: turn.touched,
            verdict: turn.verdict,
            tool_executions: turn.executions,
        })
    }

    // ─── Steps ──────────────────────────────────────────────────────────

    fn build_transcript(&self, session: &SessionState) -> Vec<ChatMessage> {
        let mut transcript = vec![ChatMessage::system(prompts::system_prompt(&self.schema()))];
        transcript.extend(session.turns.iter().filter_map(|t| match t.role {
            Role::User => Some(ChatMessage::user(t.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(t.content.clone())),
            _ => None,
        }));
        transcript
    }

    /// Ask once more, without tools, when the turn ended with no text.
    /// Falls back to a fixed reply if that also yields nothing.
    async fn answer_in_text(&self, session: &SessionState, turn: &mut TurnContext) -> String {
        tracing::warn!(
            session = %session.session_id,
            rounds = turn.rounds,
            "model ended the turn without text, asking again"
        );
        turn.transcript.push(ChatMessage::system(prompts::ANSWER_IN_TEXT));
        match self.call_model(&mut turn.transcript, false).await {
            Ok(reply) if !reply.text_or_empty().trim().is_empty() => {
                reply.text_or_empty().to_string()
            }
            Ok(_) => prompts::EMPTY_REPLY_FALLBACK.to_string(),
            Err(e) => {
                tracing::warn!(session = %session.session_id, error = %e, "second ask failed");
                prompts::EMPTY_REPLY_FALLBACK.to_string()
            }
        }
    }

    /// Call the model, answering one provider-side tool call rejection with
    /// a corrective prompt before giving up.
    async fn call_model(
        &self,
        transcript: &mut Vec<ChatMessage>,
        with_tools: bool,
    ) -> Result<ModelReply, AgentError> {
        let definitions = self.registry.definitions();
        let tools = (with_tools && !definitions.is_empty()).then_some(definitions.as_slice());
        let mut corrected = false;

        loop {
            tracing::debug!(
                messages = transcript.len(),
                est_tokens = estimate_transcript_tokens(transcript),
                tools = tools.is_some(),
                "model call"
            );
            let result = self.model.invoke(transcript, tools).await;
            match result {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_tool_call_parse_error() && !corrected => {
                    tracing::warn!(error = %e, "provider rejected tool call, sending correction");
                    transcript.push(ChatMessage::system(prompts::TOOL_CALL_REJECTED));
                    corrected = true;
                }
                Err(e) => return Err(AgentError::ModelUnavailable { source: e }),
            }
        }
    }

    /// Echo the model's calls into the transcript, answer the ones that
    /// cannot run, and return the rest in order.
    fn check_tool_calls(&self, turn: &mut TurnContext, reply: &ModelReply) -> Vec<ToolCall> {
        turn.transcript.push(ChatMessage::assistant_tool_calls(
            reply.text.clone(),
            &reply.tool_calls,
            &reply.malformed_calls,
        ));

        for bad in &reply.malformed_calls {
            tracing::warn!(tool = %bad.name, reason = %bad.reason, "malformed tool call");
            turn.transcript.push(ChatMessage::tool_result(
                bad.id.clone(),
                prompts::malformed_call_message(&bad.name, &bad.reason),
            ));
        }

        let mut queued = Vec::new();
        for call in &reply.tool_calls {
            if self.registry.contains(&call.name) {
                queued.push(call.clone());
            } else {
                let suggestions = self.registry.find_similar(&call.name, 3);
                tracing::warn!(tool = %call.name, ?suggestions, "unknown tool requested");
                turn.transcript.push(ChatMessage::tool_result(
                    call.id.clone(),
                    prompts::unknown_tool_message(&call.name, &suggestions),
                ));
            }
        }
        queued
    }

    /// Validate one call, then reuse an equivalent result or execute it.
    async fn run_tool_call(
        &self,
        session: &mut SessionState,
        turn: &mut TurnContext,
        call: &ToolCall,
    ) -> Result<(), AgentError> {
        turn.go(WorkflowState::ValidatingQuery)?;

        if let Err(e) = self.registry.validate(&call.name, &call.arguments) {
            tracing::warn!(tool = %call.name, error = %e, "tool call failed validation");
            turn.transcript.push(ChatMessage::tool_result(
                call.id.clone(),
                prompts::invalid_arguments_message(&e.to_string()),
            ));
            return Ok(());
        }
        let query = match self.registry.query_expression(&call.name, &call.arguments) {
            Ok(q) => q,
            Err(e) => {
                turn.transcript.push(ChatMessage::tool_result(
                    call.id.clone(),
                    prompts::invalid_arguments_message(&e.to_string()),
                ));
                return Ok(());
            }
        };

        let verdict = check_uniqueness(&*self.oracle, &session.cache, &query, &self.schema()).await;
        turn.verdict = Some(verdict);
        turn.go(WorkflowState::ExecutingOrReusing)?;

        match verdict.matched_index {
            Some(index) if verdict.is_duplicate => {
                let result = session.cache.lookup_succeeded(index)?.clone();
                if let Some(record) = session.cache.get(index) {
                    turn.touched.push(record.clone());
                }
                tracing::info!(
                    session = %session.session_id,
                    matched = index,
                    "equivalent query found, reusing result"
                );
                turn.transcript.push(ChatMessage::tool_result(
                    call.id.clone(),
                    prompts::reused_result_message(&tool_result_for_model(
                        &result,
                        self.config.max_tool_result_chars,
                    )),
                ));
                self.store.commit(
                    session,
                    SessionDelta {
                        verdict: Some(verdict),
                        ..SessionDelta::default()
                    },
                )?;
            }
            Some(index) if verdict.previously_failed => {
                let previous = session
                    .cache
                    .get(index)
                    .map(|r| {
                        format!(
                            "{}\nError: {}",
                            r.query,
                            r.error.as_deref().unwrap_or("unknown")
                        )
                    })
                    .unwrap_or_default();
                tracing::info!(
                    session = %session.session_id,
                    matched = index,
                    "equivalent query failed before, not executing"
                );
                turn.transcript.push(ChatMessage::tool_result(
                    call.id.clone(),
                    prompts::failed_before_message(&previous),
                ));
                self.store.commit(
                    session,
                    SessionDelta {
                        verdict: Some(verdict),
                        ..SessionDelta::default()
                    },
                )?;
            }
            _ => self.execute(session, turn, call, query, verdict).await?,
        }
        Ok(())
    }

    async fn execute(
        &self,
        session: &mut SessionState,
        turn: &mut TurnContext,
        call: &ToolCall,
        query: String,
        verdict: UniquenessVerdict,
    ) -> Result<(), AgentError> {
        let result = self.registry.invoke(&call.name, &call.arguments).await;
        turn.executions += 1;

        let (outcome, message) = match result {
            Ok(value) if is_empty_result(&value) => (
                QueryOutcome::Failed("query returned no results".into()),
                prompts::EMPTY_RESULT_MESSAGE.to_string(),
            ),
            Ok(value) => {
                let message = tool_result_for_model(&value, self.config.max_tool_result_chars);
                (QueryOutcome::Succeeded(value), message)
            }
            Err(e @ ToolError::ToolNotFound { .. }) => {
                turn.transcript.push(ChatMessage::tool_result(
                    call.id.clone(),
                    prompts::unknown_tool_message(&call.name, &[]),
                ));
                tracing::warn!(error = %e, "tool disappeared before execution");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "graph query failed");
                let reason = e.to_string();
                let message = prompts::execution_failed_message(&reason);
                (QueryOutcome::Failed(reason), message)
            }
        };

        turn.transcript
            .push(ChatMessage::tool_result(call.id.clone(), message));
        let succeeded = matches!(outcome, QueryOutcome::Succeeded(_));
        let applied = self.store.commit(
            session,
            SessionDelta {
                queries: vec![NewQuery {
                    tool: call.name.clone(),
                    query,
                    outcome,
                }],
                executed: 1,
                verdict: Some(verdict),
                ..SessionDelta::default()
            },
        )?;
        turn.touched.extend(applied.records);
        if succeeded {
            self.refresh_schema().await;
        }
        Ok(())
    }

    /// Turn this round's successful results into facts. Model failures here
    /// degrade to no facts rather than failing the turn.
    async fn extract(
        &self,
        session: &mut SessionState,
        turn: &mut TurnContext,
        round_start: usize,
    ) -> Result<Vec<ExtractedFact>, AgentError> {
        let round = &turn.touched[round_start..];
        if !round.iter().any(|r| r.status == QueryStatus::Succeeded) {
            return Ok(Vec::new());
        }

        let prompt = prompts::extraction_prompt(
            &queried_data_context(round, self.config.max_tool_result_chars),
            &conversation_context(&session.turns, self.config.max_context_bytes),
        );
        let text = match self.model.invoke(&[ChatMessage::user(prompt)], None).await {
            Ok(reply) => reply.text.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "extraction failed, continuing without facts");
                return Ok(Vec::new());
            }
        };

        let triples = parse_triples(&text);
        if triples.is_empty() {
            tracing::info!(
                reply = super::extraction::log_excerpt(&text),
                "extractor returned no facts"
            );
            return Ok(Vec::new());
        }

        let applied = self.store.commit(
            session,
            SessionDelta {
                facts: triples,
                ..SessionDelta::default()
            },
        )?;
        turn.facts.extend(applied.facts.iter().cloned());
        Ok(applied.facts)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::equivalence::ModelEquivalenceOracle;
    use crate::agent_core::query_cache::QueryCache;
    use crate::agent_core::safety::ScannerChain;
    use crate::agent_core::test_support::{
        graph_calls, NeedleScanner, PairOracle, ScriptedModel, StubGraph,
    };
    use crate::graph::QUERY_GRAPH_TOOL;
    use crate::inference::errors::InferenceError;
    use crate::inference::types::MalformedToolCall;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const A: &str = "MATCH (p:Personality)-[:SUITS]->(o:Occupation) RETURN p, o";
    const A2: &str = "MATCH (x:Personality)-[:SUITS]->(y:Occupation) RETURN x, y";
    const B: &str = "MATCH (o:Occupation)-[:NEEDS]->(s:Skill) RETURN o, s";

    struct Harness {
        engine: WorkflowEngine,
        model: Arc<ScriptedModel>,
        graph: Arc<StubGraph>,
    }

    fn harness(
        model: ScriptedModel,
        graph: StubGraph,
        oracle: Arc<dyn EquivalenceOracle>,
        config: WorkflowConfig,
    ) -> Harness {
        let model = Arc::new(model);
        let graph = Arc::new(graph);
        let mut registry = ToolRegistry::new();
        registry.register(graph.clone());
        let engine = WorkflowEngine::new(
            model.clone(),
            Arc::new(registry),
            oracle,
            Arc::new(SessionStore::in_memory()),
        )
        .with_config(config)
        .with_schema("Node labels: Personality, Occupation, Skill");
        Harness {
            engine,
            model,
            graph,
        }
    }

    fn text(t: &str) -> Result<ModelReply, InferenceError> {
        Ok(ModelReply::text(t))
    }

    fn calls(queries: &[&str]) -> Result<ModelReply, InferenceError> {
        Ok(graph_calls(queries))
    }

    fn tool_messages(transcript: &[ChatMessage]) -> Vec<String> {
        transcript
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.content.clone())
            .collect()
    }

    fn contains_text(transcript: &[ChatMessage], needle: &str) -> bool {
        transcript
            .iter()
            .any(|m| m.content.as_deref().is_some_and(|c| c.contains(needle)))
    }

    /// No two succeeded records in the cache are judged equivalent.
    async fn assert_dedup_sound(cache: &QueryCache, oracle: &dyn EquivalenceOracle) {
        let ok: Vec<&QueryRecord> = cache.succeeded().collect();
        for (i, a) in ok.iter().enumerate() {
            for b in &ok[i + 1..] {
                assert!(
                    !oracle.equivalent(&a.query, &b.query, "").await,
                    "{} and {} both cached",
                    a.query,
                    b.query
                );
            }
        }
    }

    #[tokio::test]
    async fn test_plain_reply_without_tools() {
        let h = harness(
            ScriptedModel::new(vec![text("1. Do you enjoy working with data?")]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");

        let reply = h.engine.advance(&mut session, "Hi, help me pick a career").await.unwrap();

        assert_eq!(reply.text, "1. Do you enjoy working with data?");
        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(reply.tool_executions, 0);
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.turns[1].role, Role::Assistant);
        assert_eq!(h.model.call_count(), 1);
        assert_eq!(h.model.tool_flags(), vec![true]);
        assert!(contains_text(&h.model.calls()[0], "Node labels: Personality"));
    }

    #[tokio::test]
    async fn test_three_turn_scenario_reuses_equivalent_query() {
        let oracle = Arc::new(PairOracle::new(&[(A, A2)]));
        let h = harness(
            ScriptedModel::new(vec![
                // turn 1
                text("1. Do you like analysing data?"),
                // turn 2
                calls(&[A]),
                text("[['Investigative','SUITS','Data Scientist']]"),
                text("You could become a data scientist."),
                // turn 3
                calls(&[A2]),
                text("[['Investigative','SUITS','Data Scientist']]"),
                text("Data science still fits you best."),
            ]),
            StubGraph::new().answer(A, json!([{"p": "Investigative", "o": "Data Scientist"}])),
            oracle.clone(),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");

        let first = h.engine.advance(&mut session, "Hi").await.unwrap();
        assert!(first.records.is_empty());

        let second = h.engine.advance(&mut session, "Yes, I love data").await.unwrap();
        assert_eq!(second.text, "You could become a data scientist.");
        assert_eq!(second.tool_executions, 1);
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].status, QueryStatus::Succeeded);
        assert_eq!(second.facts.len(), 1);
        assert_eq!(second.facts[0].object, "Data Scientist");
        assert_eq!(second.facts[0].turn, 2);

        let third = h.engine.advance(&mut session, "Anything else?").await.unwrap();
        assert_eq!(third.text, "Data science still fits you best.");
        assert_eq!(third.tool_executions, 0);
        assert_eq!(third.verdict, Some(UniquenessVerdict::duplicate_of(0)));
        assert_eq!(third.records.len(), 1);
        assert_eq!(third.records[0].query, A);

        assert_eq!(h.graph.executions(), 1);
        assert_eq!(session.cache.len(), 1);
        assert_eq!(session.executed_queries, 1);
        assert_eq!(session.turns.len(), 6);
        assert_eq!(session.facts.len(), 2);
        assert_dedup_sound(&session.cache, &*oracle).await;
    }

    #[tokio::test]
    async fn test_reuse_feeds_cached_result_to_extraction() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                text("[['a','r','b']]"),
                text("first"),
                calls(&[A2]),
                text("[['a','r','b']]"),
                text("second"),
            ]),
            StubGraph::new().answer(A, json!(["cached-row"])),
            Arc::new(PairOracle::new(&[(A, A2)])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        h.engine.advance(&mut session, "one").await.unwrap();
        h.engine.advance(&mut session, "two").await.unwrap();

        assert_eq!(h.graph.executions(), 1);
        let all = h.model.calls();
        // Calls: respond, extract, recommend, respond, extract, recommend.
        let extraction = &all[4];
        assert!(contains_text(extraction, "Cypher code: MATCH (p:Personality)"));
        assert!(contains_text(extraction, "Returned data: [\"cached-row\"]"));
        assert!(tool_messages(&all[5])
            .iter()
            .any(|m| m.contains("reusing its result") && m.contains("cached-row")));
    }

    #[tokio::test]
    async fn test_ambiguous_oracle_fails_open() {
        // Every equivalence answer is unparseable, so A2 counts as new.
        let judge: Arc<dyn ModelBackend> =
            Arc::new(ScriptedModel::repeating(ModelReply::text("perhaps")));
        let oracle = Arc::new(ModelEquivalenceOracle::new(judge, 2, Duration::from_millis(1)));
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                text("[['a','r','b']]"),
                text("first"),
                calls(&[A2]),
                text("[['a','r','c']]"),
                text("second"),
            ]),
            StubGraph::new()
                .answer(A, json!(["one"]))
                .answer(A2, json!(["two"])),
            oracle,
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        h.engine.advance(&mut session, "one").await.unwrap();
        let reply = h.engine.advance(&mut session, "two").await.unwrap();

        assert_eq!(reply.tool_executions, 1);
        assert_eq!(reply.verdict, Some(UniquenessVerdict::unique()));
        assert_eq!(h.graph.executed_queries(), vec![A.to_string(), A2.to_string()]);
        assert_eq!(session.cache.succeeded().count(), 2);
    }

    #[tokio::test]
    async fn test_empty_result_is_recorded_as_failed() {
        let h = harness(
            ScriptedModel::new(vec![calls(&[B]), text("Tell me more about yourself.")]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.records.len(), 1);
        assert_eq!(reply.records[0].status, QueryStatus::Failed);
        assert!(reply.facts.is_empty());
        assert_eq!(session.cache.succeeded().count(), 0);
        // No extraction call: respond, then recommend.
        assert_eq!(h.model.call_count(), 2);
        let last = h.model.calls().pop().unwrap();
        assert!(contains_text(&last, prompts::RECOMMEND_WITHOUT_DATA));
        assert!(tool_messages(&last)
            .iter()
            .any(|m| m == prompts::EMPTY_RESULT_MESSAGE));
    }

    #[tokio::test]
    async fn test_failed_query_is_not_rerun() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&["MATCH (n:Nope RETURN n"]),
                text("Sorry, let me ask differently."),
                calls(&["MATCH (n:Nope RETURN n"]),
                text("Let's continue."),
            ]),
            StubGraph::new().fail("MATCH (n:Nope RETURN n", "Invalid input ')'"),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");

        let first = h.engine.advance(&mut session, "one").await.unwrap();
        assert_eq!(first.records[0].status, QueryStatus::Failed);
        assert!(first.records[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Invalid input")));

        // Matched against the failed record, never sent to the graph.
        let second = h.engine.advance(&mut session, "two").await.unwrap();
        assert_eq!(second.tool_executions, 0);
        assert_eq!(second.verdict, Some(UniquenessVerdict::failed_before(0)));
        assert_eq!(h.graph.executions(), 1);
        let last = h.model.calls().pop().unwrap();
        assert!(tool_messages(&last)
            .iter()
            .any(|m| m.contains("already tried") && m.contains("Invalid input")));
    }

    #[tokio::test]
    async fn test_abandoned_turn_keeps_completed_steps() {
        const HANG: &str = "MATCH (s:Skill) RETURN s";
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A, B, HANG]),
                // next turn
                text("Welcome back."),
            ]),
            StubGraph::new()
                .answer(A, json!(["a"]))
                .answer(B, json!(["b"]))
                .hang_on(HANG),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");

        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            h.engine.advance(&mut session, "find me jobs"),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(session.cache.len(), 2);
        assert_eq!(session.executed_queries, 2);
        assert_eq!(session.turns.len(), 1);
        assert!(session.facts.is_empty());

        let reply = h.engine.advance(&mut session, "hello again").await.unwrap();
        assert_eq!(reply.text, "Welcome back.");
        assert_eq!(session.turns.len(), 3);
        assert_eq!(session.cache.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_calls_recover() {
        let broken = ModelReply {
            text: None,
            tool_calls: vec![ToolCall {
                id: "call_x".into(),
                name: "qery_graph".into(),
                arguments: json!({"query": A}),
            }],
            malformed_calls: vec![MalformedToolCall {
                id: "call_y".into(),
                name: QUERY_GRAPH_TOOL.into(),
                raw_arguments: "{\"query\": MATCH".into(),
                reason: "expected value".into(),
            }],
            finish_reason: Some("tool_calls".into()),
        };
        let h = harness(
            ScriptedModel::new(vec![
                Ok(broken),
                calls(&[A]),
                text("[['a','r','b']]"),
                text("Here are your careers."),
            ]),
            StubGraph::new().answer(A, json!(["row"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.text, "Here are your careers.");
        assert_eq!(reply.tool_executions, 1);
        let second_call = &h.model.calls()[1];
        let tools = tool_messages(second_call);
        assert!(tools.iter().any(|m| m.contains("could not be parsed")));
        assert!(tools
            .iter()
            .any(|m| m.contains("not found in the list of tools") && m.contains(QUERY_GRAPH_TOOL)));
    }

    #[tokio::test]
    async fn test_invalid_arguments_are_not_executed() {
        let bad = ModelReply {
            text: None,
            tool_calls: vec![ToolCall {
                id: "call_0".into(),
                name: QUERY_GRAPH_TOOL.into(),
                arguments: json!({"cypher": A}),
            }],
            malformed_calls: Vec::new(),
            finish_reason: Some("tool_calls".into()),
        };
        let h = harness(
            ScriptedModel::new(vec![Ok(bad), text("Let me ask another question.")]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.tool_executions, 0);
        assert!(session.cache.is_empty());
        assert_eq!(h.graph.executions(), 0);
        let last = h.model.calls().pop().unwrap();
        assert!(tool_messages(&last)
            .iter()
            .any(|m| m.contains("missing required field")));
    }

    #[tokio::test]
    async fn test_tool_rounds_are_capped() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                text("[['a','r','b']]"),
                calls(&[B]),
                text("Final answer."),
            ]),
            StubGraph::new().answer(A, json!(["a"])).answer(B, json!(["b"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig {
                max_tool_rounds: 1,
                ..WorkflowConfig::default()
            },
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        // The second request for tools arrives after the budget is spent and
        // carries no text, so the model is asked once more for prose.
        assert_eq!(reply.text, "Final answer.");
        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(h.graph.executions(), 1);
        assert_eq!(h.model.tool_flags(), vec![true, false, false, false]);
        assert!(contains_text(&h.model.calls()[2], prompts::NO_MORE_TOOLS));
        assert!(contains_text(&h.model.calls()[3], prompts::ANSWER_IN_TEXT));
        assert_eq!(session.turns.last().unwrap().content, "Final answer.");
    }

    struct LateSchema {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl GraphBackend for LateSchema {
        async fn execute(&self, _query: &str) -> Result<serde_json::Value, ToolError> {
            Ok(json!([]))
        }
        async fn schema(&self) -> Result<String, ToolError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok("Node labels: Occupation".to_string())
        }
    }

    #[tokio::test]
    async fn test_schema_fetched_after_first_successful_query() {
        let source = Arc::new(LateSchema {
            fetches: AtomicUsize::new(0),
        });
        let mut h = harness(
            ScriptedModel::new(vec![
                calls(&[B]),
                text("Nothing there."),
                calls(&[A]),
                text("[['a','r','b']]"),
                text("Done."),
                text("Hello again."),
            ]),
            StubGraph::new().answer(A, json!(["a"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        h.engine = h.engine.with_schema("").with_schema_source(source.clone());
        let mut session = SessionState::new("s1");

        // B comes back empty, so no fetch yet.
        h.engine.advance(&mut session, "first").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert!(h.engine.schema().is_empty());

        h.engine.advance(&mut session, "second").await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.schema(), "Node labels: Occupation");

        h.engine.advance(&mut session, "third").await.unwrap();
        let last_call = h.model.calls().pop().unwrap();
        assert!(contains_text(&last_call, "Node labels: Occupation"));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_final_reply_uses_fallback_text() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                text("[['a','r','b']]"),
                calls(&[B]),
                text("   "),
            ]),
            StubGraph::new().answer(A, json!(["a"])).answer(B, json!(["b"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig {
                max_tool_rounds: 1,
                ..WorkflowConfig::default()
            },
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.text, prompts::EMPTY_REPLY_FALLBACK);
        assert_eq!(reply.status, TurnStatus::Completed);
        assert_eq!(reply.records.len(), 1);
        let last = session.turns.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, prompts::EMPTY_REPLY_FALLBACK);
    }

    #[tokio::test]
    async fn test_second_round_runs_within_budget() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                text("[['a','r','b']]"),
                calls(&[B]),
                text("[['c','r','d']]"),
                text("Final answer."),
            ]),
            StubGraph::new().answer(A, json!(["a"])).answer(B, json!(["b"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig {
                max_tool_rounds: 2,
                ..WorkflowConfig::default()
            },
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.text, "Final answer.");
        assert_eq!(reply.tool_executions, 2);
        assert_eq!(reply.facts.len(), 2);
        assert_eq!(h.model.tool_flags(), vec![true, false, true, false, false]);
    }

    #[tokio::test]
    async fn test_inbound_rejection_skips_everything() {
        let h = harness(
            ScriptedModel::new(vec![]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let safety = SafetyLayer {
            inbound: ScannerChain::new().with(NeedleScanner("forbidden")),
            outbound: ScannerChain::new(),
        };
        let engine = h.engine.with_safety(Arc::new(safety));
        let mut session = SessionState::new("s1");

        let reply = engine.advance(&mut session, "something forbidden").await.unwrap();
        assert_eq!(reply.status, TurnStatus::SafetyRejected);
        assert_eq!(reply.text, prompts::INBOUND_REFUSAL);
        assert!(session.turns.is_empty());
        assert_eq!(h.model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_outbound_rejection_replaces_reply() {
        let h = harness(
            ScriptedModel::new(vec![text("a forbidden answer")]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let safety = SafetyLayer {
            inbound: ScannerChain::new(),
            outbound: ScannerChain::new().with(NeedleScanner("forbidden")),
        };
        let engine = h.engine.with_safety(Arc::new(safety));
        let mut session = SessionState::new("s1");

        let reply = engine.advance(&mut session, "hi").await.unwrap();
        assert_eq!(reply.status, TurnStatus::SafetyRejected);
        assert_eq!(reply.text, prompts::OUTBOUND_REFUSAL);
        assert_eq!(session.turns[1].content, prompts::OUTBOUND_REFUSAL);
    }

    #[tokio::test]
    async fn test_model_unavailable_keeps_user_turn() {
        let h = harness(
            ScriptedModel::new(vec![Err(InferenceError::AllModelsUnavailable {
                attempted: vec!["m".into()],
            })]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let err = h.engine.advance(&mut session, "hello").await.unwrap_err();

        assert!(matches!(err, AgentError::ModelUnavailable { .. }));
        assert_eq!(session.turns.len(), 1);
        assert_eq!(session.turns[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_provider_tool_call_rejection_is_corrected() {
        let h = harness(
            ScriptedModel::new(vec![
                Err(InferenceError::HttpError {
                    status: 400,
                    body: "{\"error\":{\"code\":\"tool_use_failed\"}}".into(),
                }),
                text("2. Do you prefer people or things?"),
            ]),
            StubGraph::new(),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "hi").await.unwrap();

        assert_eq!(reply.text, "2. Do you prefer people or things?");
        assert!(contains_text(&h.model.calls()[1], prompts::TOOL_CALL_REJECTED));
    }

    #[tokio::test]
    async fn test_extraction_failure_degrades_to_no_facts() {
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A]),
                Err(InferenceError::Timeout { duration_secs: 60 }),
                text("Recommendations anyway."),
            ]),
            StubGraph::new().answer(A, json!(["row"])),
            Arc::new(PairOracle::new(&[])),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(reply.text, "Recommendations anyway.");
        assert!(reply.facts.is_empty());
        assert_eq!(session.cache.succeeded().count(), 1);
        let last = h.model.calls().pop().unwrap();
        assert!(contains_text(&last, prompts::RECOMMEND_WITHOUT_DATA));
    }

    #[tokio::test]
    async fn test_same_query_twice_in_one_reply_runs_once() {
        let oracle = Arc::new(PairOracle::new(&[]));
        let h = harness(
            ScriptedModel::new(vec![
                calls(&[A, A, B]),
                text("[['a','r','b']]"),
                text("done"),
            ]),
            StubGraph::new().answer(A, json!(["a"])).answer(B, json!(["b"])),
            oracle.clone(),
            WorkflowConfig::default(),
        );
        let mut session = SessionState::new("s1");
        let reply = h.engine.advance(&mut session, "go").await.unwrap();

        assert_eq!(h.graph.executed_queries(), vec![A.to_string(), B.to_string()]);
        assert_eq!(reply.tool_executions, 2);
        assert_eq!(reply.records.len(), 3);
        assert_eq!(session.cache.len(), 2);
        assert_dedup_sound(&session.cache, &*oracle).await;
    }

    #[test]
    fn test_workflow_config_defaults_from_yaml() {
        let cfg: WorkflowConfig =
            serde_yaml::from_str("max_tool_rounds: 5\nequivalence_strategy: exact\n").unwrap();
        assert_eq!(cfg.max_tool_rounds, 5);
        assert_eq!(cfg.equivalence_strategy, EquivalenceStrategy::Exact);
        assert_eq!(cfg.max_tool_result_chars, 4000);
        assert_eq!(cfg.oracle_max_attempts, 3);
    }
}
