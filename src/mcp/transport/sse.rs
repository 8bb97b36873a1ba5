//! Incremental `text/event-stream` decoding.

use memchr::memchr;
use serde_json::Value;

use super::{ServerEnvelope, TransportError};

/// One dispatched event. `data` lines are joined with `\n`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Accumulates `id:`/`event:`/`data:` fields across arbitrary byte chunks and
/// dispatches an event on each blank line.
#[derive(Debug, Default)]
pub struct SseEventParser {
    buffer: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseEventParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(relative) = memchr(b'\n', &self.buffer[start..]) {
            let newline = start + relative;
            let mut end = newline;
            if end > start && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
            start = newline + 1;
        }

        if start > 0 {
            self.buffer.drain(..start);
        }
        events
    }

    /// Treats end of body as a final blank line.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        if let Some(event) = self.dispatch() {
            events.push(event);
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.id.is_none() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

pub fn is_event_stream_content_type(content_type: &str) -> bool {
    media_type_is(content_type, super::MCP_EVENT_STREAM_CONTENT_TYPE)
}

pub fn is_json_content_type(content_type: &str) -> bool {
    media_type_is(content_type, super::MCP_JSON_CONTENT_TYPE)
}

fn media_type_is(content_type: &str, expected: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case(expected))
}

/// Decodes a JSON-RPC payload, which may be a single message or a batch.
pub fn decode_messages(payload: &str) -> Result<Vec<ServerEnvelope>, TransportError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(items)) => Ok(items
            .into_iter()
            .filter(Value::is_object)
            .map(ServerEnvelope::new)
            .collect()),
        Ok(value @ Value::Object(_)) => Ok(vec![ServerEnvelope::new(value)]),
        Ok(other) => Err(TransportError::Decode(format!(
            "expected a JSON-RPC object, got {other}"
        ))),
        Err(err) => Err(TransportError::Decode(err.to_string())),
    }
}
