//! Neo4j graph-query service and the `query_graph` tool.
//!
//! Cypher runs through Neo4j's HTTP transactional endpoint
//! (`POST {uri}/db/{database}/tx/commit`). Rows come back as JSON objects
//! keyed by column name; the engine treats the payload as opaque beyond
//! "empty or not".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::errors::ToolError;
use super::registry::GraphTool;
use super::types::GraphConfig;
use crate::inference::types::ToolDefinition;

/// Name the model uses to call the graph.
pub const QUERY_GRAPH_TOOL: &str = "query_graph";

/// Clauses refused when the backend is read-only. Multi-word entries match
/// consecutive keywords.
const WRITE_CLAUSES: &[&[&str]] = &[
    &["CREATE"],
    &["MERGE"],
    &["DELETE"],
    &["DETACH"],
    &["SET"],
    &["REMOVE"],
    &["DROP"],
    &["LOAD", "CSV"],
    &["CALL", "DBMS"],
];

// ─── GraphBackend ────────────────────────────────────────────────────────────

/// A service that executes graph queries.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Run one query and return its rows.
    async fn execute(&self, query: &str) -> Result<Value, ToolError>;

    /// Human-readable schema context: labels, relationship types, patterns.
    async fn schema(&self) -> Result<String, ToolError>;
}

// ─── Neo4jHttpBackend ────────────────────────────────────────────────────────

pub struct Neo4jHttpBackend {
    http: HttpClient,
    endpoint: String,
    username: String,
    password: String,
    read_only: bool,
}

impl Neo4jHttpBackend {
    pub fn from_config(config: &GraphConfig) -> Result<Self, ToolError> {
        let endpoint = format!(
            "{}/db/{}/tx/commit",
            config.uri.trim_end_matches('/'),
            config.database
        );
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ToolError::ConnectionFailed {
                endpoint: endpoint.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
            read_only: config.read_only,
        })
    }

    /// Send statements in one transaction and return the raw response body.
    async fn run_statements(&self, statements: &[&str]) -> Result<Value, ToolError> {
        let body = json!({
            "statements": statements
                .iter()
                .map(|s| json!({"statement": s, "resultDataContents": ["row"]}))
                .collect::<Vec<_>>()
        });

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: format!("failed to read response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(ToolError::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                reason: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }

        serde_json::from_str(&text).map_err(|e| ToolError::ExecutionError {
            tool: QUERY_GRAPH_TOOL.to_string(),
            reason: format!("unreadable response: {e}"),
        })
    }
}

#[async_trait]
impl GraphBackend for Neo4jHttpBackend {
    async fn execute(&self, query: &str) -> Result<Value, ToolError> {
        if self.read_only {
            check_read_only(query)?;
        }
        tracing::info!(query = %query, "executing cypher");
        let body = self.run_statements(&[query]).await?;
        let mut results = rows_from_response(&body)?;
        Ok(results.pop().unwrap_or_else(|| Value::Array(Vec::new())))
    }

    async fn schema(&self) -> Result<String, ToolError> {
        let body = self
            .run_statements(&[
                "CALL db.labels() YIELD label RETURN label",
                "CALL db.relationshipTypes() YIELD relationshipType RETURN relationshipType",
                "MATCH (a)-[r]->(b) \
                 RETURN DISTINCT head(labels(a)) AS from, type(r) AS rel, head(labels(b)) AS to",
            ])
            .await?;
        let results = rows_from_response(&body)?;
        Ok(format_schema(&results))
    }
}

// ─── Response Mapping ────────────────────────────────────────────────────────

/// Convert a transactional endpoint response into one array of row objects
/// per statement. Any entry in `errors` fails the whole call.
fn rows_from_response(body: &Value) -> Result<Vec<Value>, ToolError> {
    if let Some(first) = body
        .get("errors")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
    {
        let code = first.get("code").and_then(|c| c.as_str()).unwrap_or("unknown");
        let message = first.get("message").and_then(|m| m.as_str()).unwrap_or("");
        return Err(ToolError::ExecutionError {
            tool: QUERY_GRAPH_TOOL.to_string(),
            reason: format!("{code}: {message}"),
        });
    }

    let results = body
        .get("results")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(results
        .iter()
        .map(|result| {
            let columns: Vec<&str> = result
                .get("columns")
                .and_then(|c| c.as_array())
                .map(|c| c.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            let rows: Vec<Value> = result
                .get("data")
                .and_then(|d| d.as_array())
                .map(|data| {
                    data.iter()
                        .filter_map(|entry| entry.get("row").and_then(|r| r.as_array()))
                        .map(|row| {
                            let obj: serde_json::Map<String, Value> = columns
                                .iter()
                                .zip(row.iter())
                                .map(|(c, v)| (c.to_string(), v.clone()))
                                .collect();
                            Value::Object(obj)
                        })
                        .collect()
                })
                .unwrap_or_default();
            Value::Array(rows)
        })
        .collect())
}

/// Render the three schema statements' rows as prompt text.
fn format_schema(results: &[Value]) -> String {
    let column = |idx: usize, key: &str| -> Vec<String> {
        results
            .get(idx)
            .and_then(|r| r.as_array())
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get(key).and_then(|v| v.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };

    let labels = column(0, "label");
    let rel_types = column(1, "relationshipType");
    let patterns: Vec<String> = results
        .get(2)
        .and_then(|r| r.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    Some(format!(
                        "(:{})-[:{}]->(:{})",
                        row.get("from")?.as_str()?,
                        row.get("rel")?.as_str()?,
                        row.get("to")?.as_str()?
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut out = String::new();
    out.push_str("Node labels: ");
    out.push_str(&labels.join(", "));
    out.push_str("\nRelationship types: ");
    out.push_str(&rel_types.join(", "));
    out.push_str("\nPatterns:");
    for p in &patterns {
        out.push_str("\n  ");
        out.push_str(p);
    }
    out
}

// ─── Read-only Guard ─────────────────────────────────────────────────────────

/// Reject queries that would write to or administer the database.
///
/// Keywords inside string literals and backtick identifiers are ignored, so
/// `WHERE o.title = 'Set Designer'` passes.
pub fn check_read_only(query: &str) -> Result<(), ToolError> {
    let keywords: Vec<String> = strip_literals(query)
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_uppercase())
        .collect();

    for clause in WRITE_CLAUSES {
        let hit = keywords
            .windows(clause.len())
            .any(|window| window.iter().zip(clause.iter()).all(|(a, b)| a == b));
        if hit {
            tracing::warn!(clause = %clause.join(" "), "rejected write query");
            return Err(ToolError::InvalidArguments {
                tool: QUERY_GRAPH_TOOL.to_string(),
                reason: format!(
                    "the graph is read-only; '{}' is not allowed",
                    clause.join(" ")
                ),
            });
        }
    }
    Ok(())
}

/// Blank out the contents of quoted strings and backtick identifiers.
fn strip_literals(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut escape_next = false;

    for ch in query.chars() {
        match quote {
            Some(q) => {
                if escape_next {
                    escape_next = false;
                } else if ch == '\\' {
                    escape_next = true;
                } else if ch == q {
                    quote = None;
                    out.push(ch);
                    continue;
                }
                out.push(' ');
            }
            None => {
                if ch == '\'' || ch == '"' || ch == '`' {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

// ─── QueryGraphTool ──────────────────────────────────────────────────────────

/// The `query_graph` tool: `{ "query": "<cypher>" }`.
pub struct QueryGraphTool {
    backend: Arc<dyn GraphBackend>,
}

impl QueryGraphTool {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl GraphTool for QueryGraphTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            QUERY_GRAPH_TOOL,
            "Run a read-only Cypher query against the career knowledge graph \
             and return the matching rows as JSON.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A Cypher query. Do not use LIMIT or DELETE."
                    }
                },
                "required": ["query"]
            }),
        )
    }

    fn query_expression(&self, arguments: &Value) -> String {
        match arguments.get("query").and_then(|q| q.as_str()) {
            Some(q) => q.trim().to_string(),
            None => arguments.to_string(),
        }
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, ToolError> {
        let query = arguments
            .get("query")
            .and_then(|q| q.as_str())
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments {
                tool: QUERY_GRAPH_TOOL.to_string(),
                reason: "'query' must be a non-empty string".to_string(),
            })?;
        self.backend.execute(query).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
