//! Tolerant JSON extraction and small wire-text helpers.
//!
//! LLMs frequently wrap JSON in markdown fences or prose. [`parse_tolerant_json`]
//! accepts a raw JSON string or the content of a ```` ```json ```` fence.
//! Also home to the context formatter used when building prompts and the
//! error-body extractor applied to failed provider responses.

use std::collections::BTreeMap;

use serde_json::Value;

/// Extract a JSON value from raw text or a fenced code block.
///
/// Strategies, in order: direct parse of the trimmed input; content of the
/// first ```` ```json ```` fence; content of the first bare fence.
///
/// # Examples
///
/// ```
/// use renderify::http::tolerant::parse_tolerant_json;
///
/// let fenced = "Here you go:\n```json\n{\"id\": \"p1\"}\n```";
/// assert_eq!(parse_tolerant_json(fenced).unwrap()["id"], "p1");
/// ```
pub fn parse_tolerant_json(input: &str) -> Result<Value, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty response".to_string());
    }

    let direct_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e.to_string(),
    };

    if let Some(content) = extract_fence(trimmed, Some("json")) {
        if let Ok(value) = serde_json::from_str::<Value>(content) {
            return Ok(value);
        }
    }
    if let Some(content) = extract_fence(trimmed, None) {
        if let Ok(value) = serde_json::from_str::<Value>(content) {
            return Ok(value);
        }
    }

    Err(direct_err)
}

/// Extract the content of the first fenced code block.
///
/// With `lang = Some("json")`, only ```` ```json ```` fences match; with
/// `None`, any fence matches.
fn extract_fence<'a>(text: &'a str, lang: Option<&str>) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(fence_start) = text[search_from..].find("```") {
        let abs_fence = search_from + fence_start;
        let after_backticks = abs_fence + 3;

        let line_end = text[after_backticks..].find('\n')?;
        let hint = text[after_backticks..after_backticks + line_end].trim();

        let matches = match lang {
            Some(wanted) => hint.eq_ignore_ascii_case(wanted),
            None => true,
        };

        let content_start = after_backticks + line_end + 1;
        if let Some(close_offset) = text[content_start..].find("```") {
            if matches {
                return Some(text[content_start..content_start + close_offset].trim());
            }
            search_from = content_start + close_offset + 3;
        } else {
            return None;
        }
    }
    None
}

/// Serialize a context map to compact JSON for prompt injection.
///
/// Empty input produces an empty string; serialization failures are swallowed
/// the same way. Keys are emitted in sorted order for determinism.
pub fn format_context(context: &BTreeMap<String, Value>) -> String {
    if context.is_empty() {
        return String::new();
    }
    serde_json::to_string(context).unwrap_or_default()
}

/// Extract a human-readable message from a failed provider response body.
///
/// Tries `json().error.message`, then the full JSON body text, then the raw
/// text, and finally `"unknown error"`.
pub fn extract_error_message(body: &str) -> String {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            if !message.is_empty() {
                return message.to_string();
            }
        }
        return trimmed.to_string();
    }
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    "unknown error".to_string()
}
