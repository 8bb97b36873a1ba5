use serde_json::{Map, Value};

use super::{
    PlannedCall, ARGUMENT_KEYS, BATCH_CALL_KEY, SERVER_ID_KEYS, SINGLE_CALL_KEYS, TOOL_NAME_KEYS,
};

/// Strict path: strip fences, isolate the outermost JSON value and parse it.
/// Returns an empty list when the block is not valid JSON or holds no call
/// with a tool name.
pub fn parse_calls(raw: &str) -> Vec<PlannedCall> {
    let cleaned = strip_code_fences(raw);
    let Some(candidate) = locate_json_value(cleaned) else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => calls_from_value(&value),
        Err(_) => Vec::new(),
    }
}

pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (e.g. ```json) along with the fence.
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|ch: char| ch.is_ascii_alphanumeric()),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Slice from the first `{` or `[` to the last matching closer.
pub fn locate_json_value(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

pub fn calls_from_value(value: &Value) -> Vec<PlannedCall> {
    call_entries(value)
        .into_iter()
        .filter_map(call_from_entry)
        .collect()
}

fn call_entries(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(object) => {
            if let Some(Value::Array(items)) = get_ignore_case(object, BATCH_CALL_KEY) {
                return items.iter().filter_map(Value::as_object).collect();
            }
            for key in SINGLE_CALL_KEYS {
                match get_ignore_case(object, key) {
                    Some(Value::Object(inner)) => return vec![inner],
                    Some(Value::Array(items)) => {
                        return items.iter().filter_map(Value::as_object).collect()
                    }
                    _ => {}
                }
            }
            vec![object]
        }
        _ => Vec::new(),
    }
}

fn call_from_entry(entry: &Map<String, Value>) -> Option<PlannedCall> {
    let tool_name = first_string(entry, TOOL_NAME_KEYS)?;
    let server_id = first_string(entry, SERVER_ID_KEYS).unwrap_or_default();
    let arguments = ARGUMENT_KEYS
        .iter()
        .find_map(|key| get_ignore_case(entry, key))
        .map(arguments_from_value)
        .unwrap_or_default();
    Some(PlannedCall::new(server_id, tool_name, arguments))
}

/// Accepts a nested object or a string that itself parses to an object.
pub fn arguments_from_value(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(object) => object.clone(),
        Value::String(text) => serde_json::from_str::<Value>(text.trim())
            .ok()
            .and_then(|parsed| parsed.as_object().cloned())
            .unwrap_or_default(),
        _ => Map::new(),
    }
}

fn first_string(entry: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match get_ignore_case(entry, key)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

pub(crate) fn get_ignore_case<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| {
        object
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    })
}
