//! Tool call parsing: normalizes model output to `ToolCall` structs.
//!
//! Providers return tool calls in the OpenAI shape: a function name plus a
//! JSON-encoded argument string. Models regularly get that string wrong, so
//! parsing is tolerant: obviously broken JSON is repaired, and calls that are
//! still unusable come back as [`MalformedToolCall`] instead of failing the
//! whole response. The workflow turns those into corrective tool messages.

use serde::Deserialize;
use uuid::Uuid;

use super::errors::InferenceError;
use super::types::{MalformedToolCall, ModelReply, ToolCall};

// ─── Single Call ─────────────────────────────────────────────────────────────

/// Parse one tool call from its name and raw argument string.
///
/// Empty argument strings are accepted as `{}`; whether that satisfies the
/// tool's schema is the registry's concern.
pub fn parse_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, MalformedToolCall> {
    let call_id = id
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    let malformed = |reason: String| MalformedToolCall {
        id: call_id.clone(),
        name: name.to_string(),
        raw_arguments: arguments_json.to_string(),
        reason,
    };

    if name.trim().is_empty() {
        return Err(malformed("empty tool name".into()));
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        match serde_json::from_str::<serde_json::Value>(arguments_json) {
            Ok(v) => v,
            Err(e) => match repair_malformed_tool_call_json(arguments_json) {
                Some(v) => {
                    tracing::info!(tool = %name, "repaired malformed JSON tool call arguments");
                    v
                }
                None => return Err(malformed(format!("invalid JSON arguments: {e}"))),
            },
        }
    };

    if !arguments.is_object() {
        return Err(malformed(format!(
            "arguments must be a JSON object, got {}",
            json_kind(&arguments)
        )));
    }

    Ok(ToolCall {
        id: call_id,
        name: name.to_string(),
        arguments,
    })
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ─── Full Response ───────────────────────────────────────────────────────────

/// Parse a non-streaming `/chat/completions` response body.
pub fn parse_completion_response(body: &str) -> Result<ModelReply, InferenceError> {
    #[derive(Deserialize)]
    struct CompletionResponse {
        choices: Vec<CompletionChoice>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        content: Option<String>,
        tool_calls: Option<Vec<CompletionToolCall>>,
    }

    #[derive(Deserialize)]
    struct CompletionToolCall {
        id: Option<String>,
        function: CompletionFunction,
    }

    #[derive(Deserialize)]
    struct CompletionFunction {
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: Option<serde_json::Value>,
    }

    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::ResponseError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::ResponseError {
            reason: "empty choices array".into(),
        })?;

    let text = choice.message.content.filter(|c| !c.trim().is_empty());

    let mut tool_calls = Vec::new();
    let mut malformed_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        // Some providers send `arguments` as an object instead of a string.
        let raw = match tc.function.arguments {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        match parse_tool_call(tc.id.as_deref(), &tc.function.name, &raw) {
            Ok(call) => tool_calls.push(call),
            Err(bad) => {
                tracing::warn!(
                    tool = %bad.name,
                    reason = %bad.reason,
                    "model emitted a malformed tool call"
                );
                malformed_calls.push(bad);
            }
        }
    }

    let finish_reason = if !tool_calls.is_empty() || !malformed_calls.is_empty() {
        Some("tool_calls".into())
    } else {
        choice.finish_reason
    };

    Ok(ModelReply {
        text,
        tool_calls,
        malformed_calls,
        finish_reason,
    })
}

// ─── JSON Repair ─────────────────────────────────────────────────────────────

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Common malformations:
/// 1. Double quotes: `"key":""value"` (extra quote before value)
/// 2. Trailing commas: `{"a":1,}`
/// 3. Missing closing brace (unbalanced)
/// 4. Unescaped control characters in string values
///
/// Returns `Some(value)` if repair succeeds, `None` if irreparable.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) {
        return Some(v);
    }

    let mut repaired = repair_double_quotes(raw);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    repaired = repair_trailing_commas(&repaired);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    repaired = repair_unbalanced_braces(&repaired);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Some(v);
    }

    repaired = repair_control_characters(&repaired);
    serde_json::from_str::<serde_json::Value>(&repaired).ok()
}

/// Collapse `:""value` into `:"value"`, leaving legitimate empty strings alone.
fn repair_double_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if i + 2 < bytes.len() && bytes[i] == b':' && bytes[i + 1] == b'"' && bytes[i + 2] == b'"'
        {
            // `:""` followed by `,` or `}` is an empty string
            if i + 3 < bytes.len() && bytes[i + 3] != b',' && bytes[i + 3] != b'}' {
                result.push(b':');
                result.push(b'"');
                i += 3;
                continue;
            }
        }
        result.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Remove trailing commas before `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        result.push(chars[i]);
        i += 1;
    }

    result
}

/// Append closing braces to balance unmatched opening braces.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == '{' {
                brace_depth += 1;
            } else if ch == '}' {
                brace_depth -= 1;
            }
        }
    }

    let mut result = input.to_string();
    for _ in 0..brace_depth.max(0) {
        result.push('}');
    }
    result
}

/// Remove control characters other than `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
