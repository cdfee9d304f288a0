//! Per-session store of executed queries and their outcomes.
//!
//! Records are append-only and addressed by insertion index. Semantic
//! deduplication is the caller's job (see `equivalence`); the cache only
//! refuses to store the exact same succeeded query twice.

use sha2::{Digest, Sha256};

use super::errors::AgentError;
use super::types::{QueryRecord, QueryStatus};

#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    records: Vec<QueryRecord>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from persisted records, ordered by `seq`.
    ///
    /// A pending record read back can only come from an interrupted writer;
    /// it is treated as failed so it is never reused or silently retried.
    pub fn from_records(mut records: Vec<QueryRecord>) -> Self {
        records.sort_by_key(|r| r.seq);
        for record in records.iter_mut().filter(|r| r.status == QueryStatus::Pending) {
            tracing::warn!(seq = record.seq, "pending query record loaded, marking failed");
            record.status = QueryStatus::Failed;
            record.result = None;
            record.error = Some("interrupted before completion".to_string());
        }
        Self { records }
    }

    // ─── Appends ─────────────────────────────────────────────────────────

    /// Append a succeeded record and return its index.
    ///
    /// An exact-string repeat of an existing succeeded query returns the
    /// existing index instead. An empty result is stored as a failure.
    pub fn record_success(
        &mut self,
        tool: &str,
        query: &str,
        result: serde_json::Value,
        turn: usize,
    ) -> usize {
        if is_empty_result(&result) {
            return self.record_failure(tool, query, "query returned no results", turn);
        }
        if let Some(existing) = self.find_exact_succeeded(query) {
            tracing::debug!(index = existing, "exact duplicate success not re-recorded");
            return existing;
        }
        self.push(tool, query, QueryStatus::Succeeded, Some(result), None, turn)
    }

    /// Append a failed record and return its index.
    pub fn record_failure(&mut self, tool: &str, query: &str, reason: &str, turn: usize) -> usize {
        self.push(
            tool,
            query,
            QueryStatus::Failed,
            None,
            Some(reason.to_string()),
            turn,
        )
    }

    fn push(
        &mut self,
        tool: &str,
        query: &str,
        status: QueryStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        turn: usize,
    ) -> usize {
        let seq = self.records.len();
        self.records.push(QueryRecord {
            seq,
            tool: tool.to_string(),
            query: query.to_string(),
            status,
            result,
            error,
            turn,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        });
        seq
    }

    // ─── Lookups ─────────────────────────────────────────────────────────

    /// The stored result of the succeeded record at `index`.
    ///
    /// Fails with `IndexOutOfRange` when `index` does not point at a
    /// succeeded record.
    pub fn lookup_succeeded(&self, index: usize) -> Result<&serde_json::Value, AgentError> {
        self.records
            .get(index)
            .filter(|r| r.status == QueryStatus::Succeeded)
            .and_then(|r| r.result.as_ref())
            .ok_or(AgentError::IndexOutOfRange {
                index,
                len: self.records.len(),
            })
    }

    pub fn get(&self, index: usize) -> Option<&QueryRecord> {
        self.records.get(index)
    }

    /// Index of a succeeded record with exactly this query text.
    pub fn find_exact_succeeded(&self, query: &str) -> Option<usize> {
        self.succeeded().find(|r| r.query == query).map(|r| r.seq)
    }

    /// Index of a failed record with exactly this query text.
    pub fn find_exact_failed(&self, query: &str) -> Option<usize> {
        self.failed().find(|r| r.query == query).map(|r| r.seq)
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[QueryRecord] {
        &self.records
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &QueryRecord> {
        self.records
            .iter()
            .filter(|r| r.status == QueryStatus::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &QueryRecord> {
        self.records
            .iter()
            .filter(|r| r.status == QueryStatus::Failed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

/// Whether a result carries nothing reusable: null, `[]`, `{}`, a blank
/// string, or a string that is itself `"[]"`.
pub fn is_empty_result(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.is_empty() || s == "[]"
        }
        _ => false,
    }
}

/// SHA-256 over the whitespace-collapsed, lower-cased expression.
pub fn fingerprint(expr: &str) -> String {
    let normalized = expr
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─── Tests ──────────────────────────────────────────────────────────────────
