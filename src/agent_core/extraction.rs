//! Fact extraction helpers: prompt context assembly and a tolerant parser for
//! the `[['subject','relation','object'], ...]` format the extractor returns.

use std::collections::HashSet;

use super::tokens::{tool_result_for_model, truncate_utf8};
use super::types::{ConversationTurn, ExtractedFact, QueryRecord, QueryStatus};
use crate::inference::types::Role;

pub type Triple = (String, String, String);

// ─── Context ────────────────────────────────────────────────────────────────

/// The queries used this turn and what they returned.
pub fn queried_data_context(records: &[QueryRecord], max_result_chars: usize) -> String {
    records
        .iter()
        .filter(|r| r.status == QueryStatus::Succeeded)
        .filter_map(|r| {
            r.result.as_ref().map(|res| {
                format!(
                    "Cypher code: {}\nReturned data: {}",
                    r.query,
                    tool_result_for_model(res, max_result_chars)
                )
            })
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// The conversation as `Role: text` lines, newest last, bounded in bytes
/// from the end.
pub fn conversation_context(turns: &[ConversationTurn], max_bytes: usize) -> String {
    let full = turns
        .iter()
        .filter(|t| t.role != Role::System)
        .map(|t| {
            let who = match t.role {
                Role::User => "User",
                _ => "Assistant",
            };
            format!("{who}: {}", t.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    if full.len() <= max_bytes {
        return full;
    }
    // Keep the tail: the latest answers matter most.
    let mut start = full.len() - max_bytes;
    while !full.is_char_boundary(start) {
        start += 1;
    }
    full[start..].to_string()
}

/// Facts rendered back into the triple list format.
pub fn facts_context(facts: &[ExtractedFact]) -> String {
    let items: Vec<String> = facts
        .iter()
        .map(|f| format!("['{}','{}','{}']", f.subject, f.relation, f.object))
        .collect();
    format!("[{}]", items.join(", "))
}

// ─── Parsing ────────────────────────────────────────────────────────────────

/// Parse triples from extractor output, tolerating prose around the list,
/// single quotes, and apostrophes inside values.
///
/// Inner lists that do not hold exactly three non-empty strings are
/// skipped. Duplicates are dropped, first occurrence kept.
pub fn parse_triples(text: &str) -> Vec<Triple> {
    let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) else {
        return Vec::new();
    };
    if end < start {
        return Vec::new();
    }
    let body = &text[start..=end];

    let raw = match serde_json::from_str::<Vec<Vec<serde_json::Value>>>(body) {
        Ok(lists) => lists
            .into_iter()
            .map(|l| {
                l.into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .collect(),
        Err(_) => scan_string_lists(body),
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter_map(|items| match items.as_slice() {
            [s, r, o] => {
                let triple = (
                    s.trim().to_string(),
                    r.trim().to_string(),
                    o.trim().to_string(),
                );
                let complete =
                    !triple.0.is_empty() && !triple.1.is_empty() && !triple.2.is_empty();
                (complete && seen.insert(triple.clone())).then_some(triple)
            }
            _ => None,
        })
        .collect()
}

/// Collect the quoted strings of each innermost `[...]` list.
///
/// A quote only closes a string when the next non-space character is `,`
/// or `]`, so `'Director's Assistant'` survives.
fn scan_string_lists(body: &str) -> Vec<Vec<String>> {
    let chars: Vec<char> = body.chars().collect();
    let mut lists = Vec::new();
    let mut current: Option<Vec<String>> = None;
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '[' => current = Some(Vec::new()),
            ']' => {
                if let Some(items) = current.take() {
                    lists.push(items);
                }
            }
            q @ ('\'' | '"') if current.is_some() => {
                let mut value = String::new();
                let mut j = i + 1;
                while j < chars.len() {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        value.push(chars[j + 1]);
                        j += 2;
                        continue;
                    }
                    if chars[j] == q && closes_string(&chars, j + 1) {
                        break;
                    }
                    value.push(chars[j]);
                    j += 1;
                }
                if let Some(items) = current.as_mut() {
                    items.push(value);
                }
                i = j;
            }
            _ => {}
        }
        i += 1;
    }
    lists
}

fn closes_string(chars: &[char], from: usize) -> bool {
    chars[from..]
        .iter()
        .find(|c| !c.is_whitespace())
        .map_or(true, |c| *c == ',' || *c == ']')
}

/// Bound a model answer before it goes into a log line.
pub(crate) fn log_excerpt(text: &str) -> &str {
    truncate_utf8(text, 200)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
