//! Turns raw tool-call blocks into structured [`PlannedCall`]s.
//!
//! Strict JSON parsing is always attempted first; the regex-driven loose
//! extractor in [`loose`] only runs when strict parsing yields nothing usable.
//! A block with no recoverable tool name produces no call rather than an error.

use serde_json::{Map, Value};

pub mod loose;
pub mod strict;

/// Keys accepted (case-insensitively) for the tool name, in priority order.
pub const TOOL_NAME_KEYS: &[&str] = &["toolName", "tool_name", "tool", "name"];
/// Keys accepted (case-insensitively) for the server id, in priority order.
pub const SERVER_ID_KEYS: &[&str] = &["serverId", "server_id", "server", "mcpId", "mcp_id", "id"];
/// Keys accepted (case-insensitively) for the argument object.
pub const ARGUMENT_KEYS: &[&str] = &["arguments", "args", "input", "params", "parameters"];
/// Wrapper keys that hold a single call object.
pub const SINGLE_CALL_KEYS: &[&str] = &["mcp_call", "tool_call", "call", "toolCall", "mcpCall"];
/// Wrapper key that holds a batch of calls.
pub const BATCH_CALL_KEY: &str = "calls";

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCall {
    /// May be empty; the orchestrator resolves it by tool name.
    pub server_id: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

impl PlannedCall {
    pub fn new(
        server_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }

    /// `serverId|toolName|k1,k2,...` with argument keys sorted.
    pub fn signature(&self) -> String {
        call_signature(&self.server_id, &self.tool_name, &self.arguments)
    }
}

pub fn call_signature(server_id: &str, tool_name: &str, arguments: &Map<String, Value>) -> String {
    let mut keys: Vec<&str> = arguments.keys().map(String::as_str).collect();
    keys.sort_unstable();
    format!("{}|{}|{}", server_id.trim(), tool_name.trim(), keys.join(","))
}

/// Parses a single raw block into zero or one call (the first one found).
pub fn parse_call(raw: &str) -> Option<PlannedCall> {
    parse_calls(raw).into_iter().next()
}

/// Batch variant: a `{"calls":[...]}` block yields every usable entry.
pub fn parse_calls(raw: &str) -> Vec<PlannedCall> {
    let calls = strict::parse_calls(raw);
    if !calls.is_empty() {
        return calls;
    }
    loose::parse_call(raw).into_iter().collect()
}

/// Keeps the first call of each signature, preserving order.
pub fn dedup_calls(calls: Vec<PlannedCall>) -> Vec<PlannedCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(call.signature()))
        .collect()
}
