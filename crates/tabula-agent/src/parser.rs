//! Pulls a JSON object out of free-form model output

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").unwrap();
}

/// Try, in order: the whole text, each fenced code block, the outermost brace span.
/// Only JSON objects are returned.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Some(value) = parse_object(trimmed) {
        return Some(value);
    }

    for capture in FENCED_BLOCK.captures_iter(trimmed) {
        if let Some(value) = capture.get(1).and_then(|m| parse_object(m.as_str().trim())) {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start < end {
        parse_object(&trimmed[start..=end])
    } else {
        None
    }
}

fn parse_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Strip a surrounding code fence from a plain-text answer
pub fn strip_code_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("```") && trimmed.ends_with("```") && trimmed.len() >= 6 {
        let inner = &trimmed[3..trimmed.len() - 3];
        let inner = match inner.find('\n') {
            Some(newline) if !inner[..newline].contains(' ') => &inner[newline + 1..],
            _ => inner,
        };
        return inner.trim().to_string();
    }
    trimmed.to_string()
}
