//! Tool registry: maps tool names to graph tool implementations.
//!
//! Provides:
//! - Registration of [`GraphTool`] implementations at startup
//! - Validation that a tool call matches the registered schema
//! - The dedup key ("query expression") for each call
//! - Serialization of tools into OpenAI tool definitions
//! - Near-miss suggestions for unknown tool names

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::errors::ToolError;
use crate::inference::types::ToolDefinition;

/// Default timeout for a single tool invocation.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── GraphTool ───────────────────────────────────────────────────────────────

/// A callable external query exposed to the model as a tool.
#[async_trait]
pub trait GraphTool: Send + Sync {
    /// Name, description, and JSON-schema parameters sent to the model.
    fn definition(&self) -> ToolDefinition;

    /// The string used to decide whether two calls ask the same thing.
    ///
    /// Defaults to the arguments as canonical JSON (serde_json maps are
    /// key-sorted, so argument order does not matter).
    fn query_expression(&self, arguments: &serde_json::Value) -> String {
        arguments.to_string()
    }

    /// Run the query and return its result payload.
    async fn invoke(&self, arguments: &serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Registry of graph tools, keyed by tool name.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn GraphTool>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Register a tool under the name in its definition, replacing any
    /// previous tool with that name.
    pub fn register(&mut self, tool: Arc<dyn GraphTool>) {
        let name = tool.definition().function.name;
        tracing::debug!(tool = %name, "registered graph tool");
        self.tools.insert(name, tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions for the model request, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    fn get(&self, name: &str) -> Result<&Arc<dyn GraphTool>, ToolError> {
        self.tools.get(name).ok_or_else(|| ToolError::ToolNotFound {
            name: name.to_string(),
        })
    }

    /// Validate a tool call: tool exists and arguments match schema.
    ///
    /// This is a basic structural check; arguments are an object and the
    /// required fields are present. Query semantics are the tool's concern.
    pub fn validate(&self, name: &str, arguments: &serde_json::Value) -> Result<(), ToolError> {
        let def = self.get(name)?.definition();

        let args_obj = arguments
            .as_object()
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: name.to_string(),
                reason: "arguments must be a JSON object".to_string(),
            })?;

        if let Some(required) = def.function.parameters.get("required").and_then(|r| r.as_array()) {
            for field_name in required.iter().filter_map(|f| f.as_str()) {
                if !args_obj.contains_key(field_name) {
                    return Err(ToolError::InvalidArguments {
                        tool: name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(())
    }

    /// The dedup key for a call to `name`.
    pub fn query_expression(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<String, ToolError> {
        Ok(self.get(name)?.query_expression(arguments))
    }

    /// Validate and run a tool call, bounded by the call timeout.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        self.validate(name, arguments)?;
        let tool = self.get(name)?;

        let start = std::time::Instant::now();
        let result = tokio::time::timeout(self.call_timeout, tool.invoke(arguments))
            .await
            .map_err(|_| ToolError::Timeout {
                tool: name.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            })?;

        tracing::info!(
            tool = %name,
            ok = result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "graph tool invoked"
        );
        result
    }

    /// Find up to `max_results` registered names most similar to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .tools
            .keys()
            .map(|candidate| (candidate.clone(), similarity(name, candidate)))
            .filter(|(_, score)| *score > 0.3) // Floor; don't suggest wildly different tools
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    let n = b_bytes.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for (i, &ca) in a_bytes.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=n {
            let cost = usize::from(ca != b_bytes[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
