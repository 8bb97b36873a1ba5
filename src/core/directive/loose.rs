//! Heuristic field extraction for directive text that is not valid JSON.
//!
//! Values may be double-quoted, single-quoted, or bare scalars. Quoted values
//! are JSON-unescaped.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use super::strict::arguments_from_value;
use super::{PlannedCall, ARGUMENT_KEYS, SERVER_ID_KEYS, TOOL_NAME_KEYS};

static TOOL_NAME_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| scalar_patterns(TOOL_NAME_KEYS));
static SERVER_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| scalar_patterns(SERVER_ID_KEYS));
static ARGUMENT_KEY_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let alternation = ARGUMENT_KEYS
        .iter()
        .map(|key| regex::escape(key))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&(String::from(r#"(?i)["']?\b(?:"#) + &alternation + r#")\b["']?\s*[:=]\s*"#)).ok()
});

fn scalar_patterns(keys: &[&str]) -> Vec<Regex> {
    keys.iter()
        .filter_map(|key| {
            let pattern = String::from(r#"(?i)["']?\b(?:"#)
                + &regex::escape(key)
                + r#")\b["']?\s*[:=]\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|([^\s,}\]"']+))"#;
            Regex::new(&pattern).ok()
        })
        .collect()
}

pub fn parse_call(raw: &str) -> Option<PlannedCall> {
    let header = without_arguments(raw);
    let tool_name = first_scalar(&TOOL_NAME_PATTERNS, &header)?;
    let server_id = first_scalar(&SERVER_ID_PATTERNS, &header).unwrap_or_default();
    let arguments = extract_arguments(raw);
    Some(PlannedCall::new(server_id, tool_name, arguments))
}

/// `raw` with every argument key and its value cut out, so keys nested in the
/// arguments never name the tool or server. An unclosed value runs to the end.
fn without_arguments(raw: &str) -> String {
    let Some(pattern) = ARGUMENT_KEY_PATTERN.as_ref() else {
        return raw.to_string();
    };
    let mut kept = String::with_capacity(raw.len());
    let mut cursor = 0;
    for found in pattern.find_iter(raw) {
        if found.start() < cursor {
            continue;
        }
        let rest = &raw[found.end()..];
        let value_len = if rest.starts_with('{') {
            balanced_object(rest).map(str::len)
        } else if let Some(inner) = rest.strip_prefix('"') {
            closing_quote(inner).map(|end| end + 2)
        } else {
            continue;
        };
        kept.push_str(&raw[cursor..found.start()]);
        match value_len {
            Some(len) => cursor = found.end() + len,
            None => {
                cursor = raw.len();
                break;
            }
        }
    }
    kept.push_str(&raw[cursor..]);
    kept
}

fn first_scalar(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|pattern| {
        pattern.captures_iter(text).find_map(|captures| {
            let value = if let Some(double) = captures.get(1) {
                decode_double_quoted(double.as_str())
            } else if let Some(single) = captures.get(2) {
                decode_single_quoted(single.as_str())
            } else {
                captures.get(3)?.as_str().to_string()
            };
            let value = value.trim().to_string();
            (!value.is_empty()).then_some(value)
        })
    })
}

pub fn decode_double_quoted(inner: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{inner}\"")).unwrap_or_else(|_| inner.to_string())
}

pub fn decode_single_quoted(inner: &str) -> String {
    let mut escaped = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&'\'') => {
                chars.next();
                escaped.push('\'');
            }
            '\\' => {
                escaped.push('\\');
                if let Some(next) = chars.next() {
                    escaped.push(next);
                }
            }
            '"' => escaped.push_str("\\\""),
            other => escaped.push(other),
        }
    }
    decode_double_quoted(&escaped)
}

fn extract_arguments(raw: &str) -> Map<String, Value> {
    let Some(pattern) = ARGUMENT_KEY_PATTERN.as_ref() else {
        return Map::new();
    };
    for found in pattern.find_iter(raw) {
        let rest = &raw[found.end()..];
        if rest.starts_with('{') {
            if let Some(object) = balanced_object(rest) {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(object) {
                    return map;
                }
            }
        } else if let Some(inner) = rest.strip_prefix('"') {
            if let Some(end) = closing_quote(inner) {
                let decoded = decode_double_quoted(&inner[..end]);
                let map = arguments_from_value(&Value::String(decoded));
                if !map.is_empty() {
                    return map;
                }
            }
        }
    }
    Map::new()
}

/// The `{...}` prefix of `text` with nesting and string literals respected.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=index]);
                }
            }
            _ => {}
        }
    }
    None
}

fn closing_quote(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (index, ch) in text.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(index),
            _ => {}
        }
    }
    None
}
