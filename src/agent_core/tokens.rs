//! Size heuristics and truncation for text that goes into prompts and logs.
//!
//! Token counts use a character heuristic (~3.2 chars/token for prose,
//! ~2.8 for JSON). They only feed log lines, so overestimating is harmless.

use crate::inference::types::ChatMessage;

const CHARS_PER_TOKEN: f64 = 3.2;
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate for display, appending `…` when anything was cut.
pub fn preview(text: &str, max_bytes: usize) -> String {
    let cut = truncate_utf8(text, max_bytes);
    if cut.len() < text.len() {
        format!("{cut}…")
    } else {
        cut.to_string()
    }
}

// ─── Estimation ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    (json_text.len() as f64 / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a whole request transcript.
pub fn estimate_transcript_tokens(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| {
            let content = m.content.as_deref().unwrap_or("");
            let body = if m.tool_call_id.is_some() {
                estimate_json_tokens(content)
            } else {
                estimate_tokens(content)
            };
            let calls: u32 = m
                .tool_calls
                .iter()
                .flatten()
                .map(|c| estimate_json_tokens(&c.function.arguments))
                .sum();
            MESSAGE_OVERHEAD_TOKENS + body + calls
        })
        .sum()
}

// ─── Tool Results ───────────────────────────────────────────────────────────

/// Render a tool result for the model, truncated to `max_chars` bytes.
pub fn tool_result_for_model(result: &serde_json::Value, max_chars: usize) -> String {
    let text = serde_json::to_string(result).unwrap_or_default();
    if text.len() <= max_chars {
        return text;
    }
    let cut = truncate_utf8(&text, max_chars);
    format!(
        "{cut}... [truncated: {} of {} bytes shown]",
        cut.len(),
        text.len()
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────
