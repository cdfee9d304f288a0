//! Query equivalence: deciding whether a new query asks what an earlier one
//! already asked.
//!
//! The judgment itself is pluggable ([`EquivalenceOracle`]). The default
//! strategy asks the model; this module owns the comparison protocol, the
//! answer normalization, and the retry budget. Ambiguity always resolves to
//! "not equivalent": re-running a query is cheaper than reusing the wrong one.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::prompts;
use super::query_cache::{fingerprint, QueryCache};
use super::types::UniquenessVerdict;
use crate::inference::client::ModelBackend;
use crate::inference::types::ChatMessage;

// ─── Strategy Interface ─────────────────────────────────────────────────────

#[async_trait]
pub trait EquivalenceOracle: Send + Sync {
    /// Whether `a` and `b` would return the same answer. Never fails:
    /// strategies resolve their own errors to `false`.
    async fn equivalent(&self, a: &str, b: &str, schema: &str) -> bool;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ─── Answer Normalization ───────────────────────────────────────────────────

/// Map a free-text answer to a boolean.
///
/// Markdown, quotes, and punctuation are ignored; the first word decides and
/// must be one of `true`, `false`, `yes`, `no` (any case).
pub fn parse_verdict(text: &str) -> Option<bool> {
    let first = text
        .split(|c: char| c.is_whitespace())
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .find(|w| !w.is_empty())?;
    match first.to_ascii_lowercase().as_str() {
        "true" | "yes" => Some(true),
        "false" | "no" => Some(false),
        _ => None,
    }
}

// ─── Model Strategy ─────────────────────────────────────────────────────────

/// Asks the model whether two queries are equivalent.
pub struct ModelEquivalenceOracle {
    model: Arc<dyn ModelBackend>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ModelEquivalenceOracle {
    pub fn new(model: Arc<dyn ModelBackend>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            model,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(16),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
            .min(self.max_delay)
    }
}

#[async_trait]
impl EquivalenceOracle for ModelEquivalenceOracle {
    async fn equivalent(&self, a: &str, b: &str, schema: &str) -> bool {
        let mut messages = vec![ChatMessage::user(prompts::equivalence_prompt(schema, a, b))];

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt - 1)).await;
            }
            match self.model.invoke(&messages, None).await {
                Ok(reply) => {
                    let text = reply.text_or_empty().to_string();
                    if let Some(verdict) = parse_verdict(&text) {
                        tracing::debug!(attempt, verdict, "equivalence answer");
                        return verdict;
                    }
                    tracing::warn!(
                        attempt,
                        answer = %crate::agent_core::tokens::preview(&text, 80),
                        "unparseable equivalence answer"
                    );
                    messages.push(ChatMessage::assistant(text));
                    messages.push(ChatMessage::user(prompts::EQUIVALENCE_REMINDER));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "equivalence check failed");
                }
            }
        }

        tracing::warn!(
            attempts = self.max_attempts,
            "equivalence ambiguous, treating queries as different"
        );
        false
    }

    fn name(&self) -> &'static str {
        "model"
    }
}

// ─── Exact Strategy ─────────────────────────────────────────────────────────

/// Equivalent iff the normalized fingerprints match.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatchOracle;

#[async_trait]
impl EquivalenceOracle for ExactMatchOracle {
    async fn equivalent(&self, a: &str, b: &str, _schema: &str) -> bool {
        fingerprint(a) == fingerprint(b)
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}

// ─── Uniqueness Check ───────────────────────────────────────────────────────

/// Compare `query` against the cache: succeeded records first, then failed
/// ones, each in insertion order. The first match wins.
///
/// An exact string match is accepted without consulting the oracle.
pub async fn check_uniqueness(
    oracle: &dyn EquivalenceOracle,
    cache: &QueryCache,
    query: &str,
    schema: &str,
) -> UniquenessVerdict {
    if let Some(index) = cache.find_exact_succeeded(query) {
        return UniquenessVerdict::duplicate_of(index);
    }
    for record in cache.succeeded() {
        if oracle.equivalent(query, &record.query, schema).await {
            tracing::info!(oracle = oracle.name(), index = record.seq, "query matches succeeded record");
            return UniquenessVerdict::duplicate_of(record.seq);
        }
    }

    if let Some(index) = cache.find_exact_failed(query) {
        return UniquenessVerdict::failed_before(index);
    }
    let mut seen = HashSet::new();
    for record in cache.failed() {
        // The same failing text may be stored more than once.
        if !seen.insert(record.query.as_str()) {
            continue;
        }
        if oracle.equivalent(query, &record.query, schema).await {
            tracing::info!(oracle = oracle.name(), index = record.seq, "query matches failed record");
            return UniquenessVerdict::failed_before(record.seq);
        }
    }

    UniquenessVerdict::unique()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
