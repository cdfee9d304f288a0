//! Prompt text for the interviewer, the extractor, the recommender, and the
//! equivalence check, plus the corrective messages fed back as tool results.

use crate::graph::QUERY_GRAPH_TOOL;

// ─── Fixed Messages ─────────────────────────────────────────────────────────

/// Reply when inbound user text is rejected by the safety layer.
pub const INBOUND_REFUSAL: &str =
    "I'm sorry, but I can't process that input due to security concerns.";

/// Reply when the model's outbound text is rejected by the safety layer.
pub const OUTBOUND_REFUSAL: &str =
    "I apologize, but I can't provide that response due to security concerns.";

// ─── Interviewer ────────────────────────────────────────────────────────────

/// System prompt for every model call that can request tools.
pub fn system_prompt(schema: &str) -> String {
    format!(
        "You are a career guide. Ask me up to 2 numbered questions, one at a time, \
         to work out my personality type using the RIASEC model. \
         If I ask you something along the way, answer it, then continue the test.\n\n\
         Once you understand my personality, stop asking and call the `{tool}` tool \
         with a Cypher query to find occupations that suit me.\n\n\
         Graph schema:\n{schema}\n\n\
         Query rules:\n\
         - Never use LIMIT.\n\
         - Never use DELETE or any other clause that changes the graph.\n\
         - Property values are unknown, so write general pattern queries without WHERE, \
           e.g. MATCH (n:Label1)-[]->(m:Label2) RETURN n, m\n\n\
         Final answer: interpret the queried data and recommend up to 6 careers as bullet \
         points, each with a short note on how it fits my personality. \
         Keep the tone friendly and the answer concise.",
        tool = QUERY_GRAPH_TOOL,
    )
}

// ─── Extraction ─────────────────────────────────────────────────────────────

/// Ask for `[['subject','relation','object'], ...]` triples from query output.
pub fn extraction_prompt(queried_data: &str, conversation: &str) -> String {
    format!(
        "You have queried the graph. These are the queries you ran and the data they \
         returned:\n{queried_data}\n\n\
         This is our conversation so far:\n{conversation}\n\n\
         From the returned data, pick out what fits my personality and will help you \
         recommend careers. Reply ONLY with a list of related nodes in the format \
         [['Node1','relation_name','Node2'], ...]. \
         No explanation, no description, no recommendations."
    )
}

// ─── Recommendation ─────────────────────────────────────────────────────────

/// Recommendation instruction when facts were extracted.
pub fn recommend_with_data(facts: &str) -> String {
    format!(
        "You queried the graph and extracted this data:\n{facts}\n\n\
         Use it together with our conversation to suggest suitable career tracks. \
         Do not mention the Cypher query in your answer."
    )
}

/// Recommendation instruction when nothing usable came back.
pub const RECOMMEND_WITHOUT_DATA: &str =
    "The graph returned nothing usable for this turn. Continue from our conversation \
     and your own knowledge: recommend career tracks if the timing is right, \
     otherwise carry on with the conversation. You may attempt another query if needed.";

/// Appended when the tool budget for the turn is spent.
pub const NO_MORE_TOOLS: &str =
    "You have used all the graph queries available for this message. \
     Answer now without calling any tools.";

/// Sent once when the model ends a turn without any text.
pub const ANSWER_IN_TEXT: &str =
    "Your last message contained no text for the user. Reply to the user now in plain \
     prose, using what you have learned so far. Do not call any tools.";

/// Used when the model still has nothing to say.
pub const EMPTY_REPLY_FALLBACK: &str =
    "I couldn't put together an answer this time. Could you tell me a bit more about \
     what you enjoy doing, or ask your question another way?";

// ─── Equivalence ────────────────────────────────────────────────────────────

/// The fixed true/false comparison protocol.
pub fn equivalence_prompt(schema: &str, query_a: &str, query_b: &str) -> String {
    format!(
        "You are a Cypher code analyst. Compare two Cypher queries without running them.\n\n\
         Graph schema:\n{schema}\n\n\
         Cypher code 1:\n{query_a}\n\n\
         Cypher code 2:\n{query_b}\n\n\
         If both would return the same output, answer True. Otherwise answer False. \
         Answer with the single word True or False and nothing else."
    )
}

/// Sent when an equivalence answer could not be parsed.
pub const EQUIVALENCE_REMINDER: &str = "Answer with exactly one word: True or False.";

// ─── Corrective Tool Messages ───────────────────────────────────────────────

pub fn unknown_tool_message(name: &str, suggestions: &[String]) -> String {
    let mut msg = format!("Tool '{name}' was not found in the list of tools, retry.");
    if !suggestions.is_empty() {
        msg.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
    }
    msg
}

pub fn malformed_call_message(name: &str, reason: &str) -> String {
    format!(
        "Your call to '{name}' could not be parsed ({reason}). \
         Send the call again with valid JSON arguments, e.g. {{\"query\": \"MATCH ...\"}}."
    )
}

/// Sent when the provider itself rejected the model's tool call.
pub const TOOL_CALL_REJECTED: &str =
    "Your last tool call could not be parsed by the server. Call the tool again \
     with a single JSON object as arguments, e.g. {\"query\": \"MATCH ...\"}.";

pub fn invalid_arguments_message(reason: &str) -> String {
    format!("The tool call was rejected: {reason}. Fix the arguments and try again.")
}

pub fn execution_failed_message(reason: &str) -> String {
    format!(
        "The query failed: {reason}. Correct the Cypher code and try again, \
         following the schema."
    )
}

pub const EMPTY_RESULT_MESSAGE: &str =
    "The query ran but returned no data. Try a more general query.";

pub fn failed_before_message(previous: &str) -> String {
    format!(
        "An equivalent query was already tried this session and failed:\n{previous}\n\
         Do not repeat it; write a different query or answer without it."
    )
}

pub fn reused_result_message(result: &str) -> String {
    format!("An equivalent query was already answered; reusing its result:\n{result}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_includes_schema_and_rules() {
        let p = system_prompt("Node labels: Occupation");
        assert!(p.contains("Node labels: Occupation"));
        assert!(p.contains("Never use LIMIT"));
        assert!(p.contains(QUERY_GRAPH_TOOL));
    }

    #[test]
    fn test_unknown_tool_message_suggestions() {
        let plain = unknown_tool_message("qery_graph", &[]);
        assert!(plain.contains("not found in the list of tools, retry"));
        assert!(!plain.contains("Did you mean"));

        let hinted = unknown_tool_message("qery_graph", &["query_graph".to_string()]);
        assert!(hinted.ends_with("Did you mean: query_graph?"));
    }

    #[test]
    fn test_equivalence_prompt_contains_both_queries() {
        let p = equivalence_prompt("S", "MATCH (a) RETURN a", "MATCH (b) RETURN b");
        assert!(p.contains("Cypher code 1:\nMATCH (a) RETURN a"));
        assert!(p.contains("Cypher code 2:\nMATCH (b) RETURN b"));
    }
}
