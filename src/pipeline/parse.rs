//! Response normalisation: vision model text → JSON content object.
//!
//! Models return one of three shapes: a bare JSON object, a JSON object
//! wrapped in a markdown code fence (often with chatter around it), or free
//! text. Parsing tries them in that order and never fails: unparsable text
//! becomes `{"error": …, "raw_content": …}`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

/// Error text stored when no JSON object could be recovered.
pub const PARSE_ERROR: &str = "Failed to parse JSON";

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").unwrap());

static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*\s*(.*?)\s*```").unwrap());

/// Parse a raw model response into a content object.
///
/// `raw_limit` bounds the characters of `raw_content` kept on failure.
pub fn parse_response(raw: &str, raw_limit: usize) -> Value {
    let trimmed = raw.trim();

    if let Some(obj) = parse_object(trimmed) {
        return obj;
    }

    for fence in [&*JSON_FENCE, &*ANY_FENCE] {
        if let Some(obj) = fence
            .captures_iter(trimmed)
            .filter_map(|c| c.get(1))
            .find_map(|m| parse_object(m.as_str()))
        {
            debug!("Recovered JSON from fenced block");
            return obj;
        }
    }

    json!({
        "error": PARSE_ERROR,
        "raw_content": truncate_chars(trimmed, raw_limit),
    })
}

/// Only objects count; a bare array or string is not document-shaped.
fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(v @ Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Truncate on a char boundary.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_json() {
        let v = parse_response(r#"  {"form_title": "Intake", "questions": []} "#, 100);
        assert_eq!(v["form_title"], "Intake");
    }

    #[test]
    fn json_fence_with_chatter() {
        let raw = "Here is the result:\n```json\n{\"questions\":[{\"question\":\"Name\",\"answer\":\"Ann\"}]}\n```\nLet me know!";
        let v = parse_response(raw, 100);
        assert_eq!(v["questions"][0]["answer"], "Ann");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn generic_fence() {
        let raw = "```\n{\"form_title\": \"X\"}\n```";
        assert_eq!(parse_response(raw, 100)["form_title"], "X");
    }

    #[test]
    fn json_fence_preferred_over_other_fences() {
        let raw = "```text\nnot json\n```\n```json\n{\"a\": 1}\n```";
        assert_eq!(parse_response(raw, 100)["a"], 1);
    }

    #[test]
    fn unparsable_text_becomes_error_object() {
        let v = parse_response("I cannot read this form.", 100);
        assert_eq!(v["error"], PARSE_ERROR);
        assert_eq!(v["raw_content"], "I cannot read this form.");
    }

    #[test]
    fn non_object_json_is_an_error() {
        let v = parse_response("[1, 2, 3]", 100);
        assert_eq!(v["error"], PARSE_ERROR);
    }

    #[test]
    fn raw_content_is_truncated_on_char_boundary() {
        let v = parse_response("ééééé", 3);
        assert_eq!(v["raw_content"], "ééé");
    }
}
