//! Deterministic stand-ins for the model, the graph, the oracle, and the
//! safety scanners.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::equivalence::EquivalenceOracle;
use super::safety::{ContentScanner, ScanOutcome};
use crate::graph::{GraphTool, ToolError, QUERY_GRAPH_TOOL};
use crate::inference::client::ModelBackend;
use crate::inference::errors::InferenceError;
use crate::inference::types::{ChatMessage, ModelReply, ToolCall, ToolDefinition};

// ─── Model ──────────────────────────────────────────────────────────────────

/// Replays a fixed queue of replies, then either repeats a fallback reply or
/// fails with `ResponseError`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelReply, InferenceError>>>,
    fallback: Option<ModelReply>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    tool_flags: Mutex<Vec<bool>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ModelReply, InferenceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            tool_flags: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `reply`.
    pub fn repeating(reply: ModelReply) -> Self {
        Self {
            fallback: Some(reply),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every transcript the model was sent, in order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether tools were offered on each call.
    pub fn tool_flags(&self) -> Vec<bool> {
        self.tool_flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedModel {
    async fn invoke(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ModelReply, InferenceError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.tool_flags
            .lock()
            .unwrap()
            .push(tools.map(|t| !t.is_empty()).unwrap_or(false));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(reply) => reply,
            None => self.fallback.clone().ok_or(InferenceError::ResponseError {
                reason: "script exhausted".into(),
            }),
        }
    }
}

/// A reply that calls `query_graph` once per query, with ids `call_0..`.
pub fn graph_calls(queries: &[&str]) -> ModelReply {
    ModelReply {
        text: None,
        tool_calls: queries
            .iter()
            .enumerate()
            .map(|(i, q)| ToolCall {
                id: format!("call_{i}"),
                name: QUERY_GRAPH_TOOL.to_string(),
                arguments: json!({ "query": q }),
            })
            .collect(),
        malformed_calls: Vec::new(),
        finish_reason: Some("tool_calls".into()),
    }
}

// ─── Graph ──────────────────────────────────────────────────────────────────

/// A `query_graph` tool with canned answers.
///
/// Unknown queries return `[]`. Queries in `hang` never complete.
pub struct StubGraph {
    answers: HashMap<String, Result<Value, String>>,
    hang: HashSet<String>,
    executed: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl StubGraph {
    pub fn new() -> Self {
        Self {
            answers: HashMap::new(),
            hang: HashSet::new(),
            executed: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn answer(mut self, query: &str, result: Value) -> Self {
        self.answers.insert(query.to_string(), Ok(result));
        self
    }

    pub fn fail(mut self, query: &str, reason: &str) -> Self {
        self.answers.insert(query.to_string(), Err(reason.to_string()));
        self
    }

    pub fn hang_on(mut self, query: &str) -> Self {
        self.hang.insert(query.to_string());
        self
    }

    /// Number of invocations that reached the graph.
    pub fn executions(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn executed_queries(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl GraphTool for StubGraph {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            QUERY_GRAPH_TOOL,
            "stub graph",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        )
    }

    fn query_expression(&self, arguments: &Value) -> String {
        arguments["query"].as_str().unwrap_or_default().to_string()
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = self.query_expression(arguments);
        self.count.fetch_add(1, Ordering::SeqCst);
        self.executed.lock().unwrap().push(query.clone());
        if self.hang.contains(&query) {
            std::future::pending::<()>().await;
        }
        match self.answers.get(&query) {
            Some(Ok(v)) => Ok(v.clone()),
            Some(Err(reason)) => Err(ToolError::ExecutionError {
                tool: QUERY_GRAPH_TOOL.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(json!([])),
        }
    }
}

// ─── Oracle ─────────────────────────────────────────────────────────────────

/// Equivalent iff the (unordered) pair was declared, or the strings match.
pub struct PairOracle {
    pairs: HashSet<(String, String)>,
    calls: AtomicUsize,
}

impl PairOracle {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut set = HashSet::new();
        for (a, b) in pairs {
            set.insert((a.to_string(), b.to_string()));
            set.insert((b.to_string(), a.to_string()));
        }
        Self {
            pairs: set,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EquivalenceOracle for PairOracle {
    async fn equivalent(&self, a: &str, b: &str, _schema: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        a == b || self.pairs.contains(&(a.to_string(), b.to_string()))
    }

    fn name(&self) -> &'static str {
        "pairs"
    }
}

// ─── Safety ─────────────────────────────────────────────────────────────────

/// Rejects any text containing `needle`.
pub struct NeedleScanner(pub &'static str);

impl ContentScanner for NeedleScanner {
    fn name(&self) -> &'static str {
        "needle"
    }

    fn scan(&self, text: &str) -> ScanOutcome {
        if text.contains(self.0) {
            ScanOutcome::reject(text, format!("contains '{}'", self.0))
        } else {
            ScanOutcome::accept(text)
        }
    }
}
