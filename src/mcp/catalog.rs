//! Tool server catalog and the tool-usage prompt rendered from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire protocol a tool server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// One POST per message; the reply is JSON or an inline event stream.
    #[default]
    Buffered,
    /// Buffered sends plus a long-lived GET event stream.
    Stream,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::Buffered => "buffered",
            ProtocolKind::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_param_type() -> String {
    "string".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParamSpec>,
}

impl ToolDescriptor {
    /// Builds a descriptor from an MCP `inputSchema` object.
    pub fn from_input_schema(
        name: impl Into<String>,
        description: Option<String>,
        schema: &serde_json::Value,
    ) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|value| value.as_array())
            .map(|items| items.iter().filter_map(|item| item.as_str()).collect())
            .unwrap_or_default();
        let parameters = schema
            .get("properties")
            .and_then(|value| value.as_object())
            .map(|properties| {
                properties
                    .iter()
                    .map(|(param_name, spec)| ParamSpec {
                        name: param_name.clone(),
                        kind: spec
                            .get("type")
                            .and_then(|value| value.as_str())
                            .unwrap_or("string")
                            .to_string(),
                        required: required.contains(&param_name.as_str()),
                        description: spec
                            .get("description")
                            .and_then(|value| value.as_str())
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: name.into(),
            description,
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolServer {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub protocol: ProtocolKind,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderEntry>,
    /// Requested MCP protocol version; the latest known one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl ToolServer {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, protocol: ProtocolKind) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            protocol,
            base_url: base_url.into(),
            enabled: true,
            headers: Vec::new(),
            protocol_version: None,
            tools: Vec::new(),
            last_sync_at: None,
        }
    }

    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools
            .iter()
            .any(|tool| tool.name.eq_ignore_ascii_case(tool_name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerResolution {
    Resolved(String),
    Unknown,
    Ambiguous(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    servers: Vec<ToolServer>,
}

impl ToolCatalog {
    pub fn new(servers: Vec<ToolServer>) -> Self {
        Self { servers }
    }

    pub fn servers(&self) -> &[ToolServer] {
        &self.servers
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ToolServer> {
        self.servers.iter().filter(|server| server.enabled)
    }

    pub fn get(&self, id: &str) -> Option<&ToolServer> {
        let id = id.trim();
        self.servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    /// Replaces a server's tool list after a successful capability refresh.
    pub fn update_tools(
        &mut self,
        id: &str,
        tools: Vec<ToolDescriptor>,
        synced_at: DateTime<Utc>,
    ) -> bool {
        let id = id.trim();
        match self
            .servers
            .iter_mut()
            .find(|server| server.id.eq_ignore_ascii_case(id))
        {
            Some(server) => {
                server.tools = tools;
                server.last_sync_at = Some(synced_at);
                true
            }
            None => false,
        }
    }

    /// Maps a directive's (possibly blank or sloppy) server id onto an
    /// enabled catalog entry.
    ///
    /// A non-blank id is matched against ids and then display names. When
    /// that fails, or the id is blank, the tool name is looked up across every
    /// enabled server.
    pub fn resolve(&self, server_id: &str, tool_name: &str) -> ServerResolution {
        let server_id = server_id.trim();
        if !server_id.is_empty() {
            if let Some(server) = self.enabled().find(|server| {
                server.id.eq_ignore_ascii_case(server_id)
                    || server.display_name.eq_ignore_ascii_case(server_id)
            }) {
                return ServerResolution::Resolved(server.id.clone());
            }
        }

        let matches: Vec<String> = self
            .enabled()
            .filter(|server| server.has_tool(tool_name))
            .map(|server| server.id.clone())
            .collect();
        match matches.len() {
            0 => {
                // A lone enabled server with no synced tool list is the only
                // plausible target.
                let mut enabled = self.enabled();
                match (enabled.next(), enabled.next()) {
                    (Some(only), None) if server_id.is_empty() && only.tools.is_empty() => {
                        ServerResolution::Resolved(only.id.clone())
                    }
                    _ => ServerResolution::Unknown,
                }
            }
            1 => ServerResolution::Resolved(matches.into_iter().next().unwrap_or_default()),
            _ => ServerResolution::Ambiguous(matches),
        }
    }
}

/// Renders the system prompt section that teaches the model the directive
/// syntax and lists every enabled server's tools. Returns `None` when no
/// server is enabled.
pub fn render_tool_instructions(catalog: &ToolCatalog) -> Option<String> {
    let servers: Vec<&ToolServer> = catalog.enabled().collect();
    if servers.is_empty() {
        return None;
    }

    let mut output = String::from(
        "You can call external tools. To call one, emit a block exactly like:\n\
         <tool_call>{\"serverId\":\"<server id>\",\"toolName\":\"<tool name>\",\"arguments\":{...}}</tool_call>\n\
         Several calls may be batched in one block:\n\
         <tool_call>{\"calls\":[{\"serverId\":\"...\",\"toolName\":\"...\",\"arguments\":{}}]}</tool_call>\n\
         Tool results arrive in the next message. Do not invent results.\n\nAvailable tools:\n",
    );

    for server in servers {
        output.push_str(&format!("\n[{}] {}\n", server.id, server.label()));
        if server.tools.is_empty() {
            output.push_str("  (tool list not synced)\n");
            continue;
        }
        for tool in &server.tools {
            output.push_str(&format!("- {}", tool.name));
            if let Some(description) = tool.description.as_deref().filter(|d| !d.trim().is_empty()) {
                output.push_str(&format!(": {}", description.trim()));
            }
            output.push('\n');
            for param in &tool.parameters {
                let required = if param.required { "required" } else { "optional" };
                output.push_str(&format!("    {} ({}, {})", param.name, param.kind, required));
                if let Some(description) = param.description.as_deref() {
                    output.push_str(&format!(" {}", description.trim()));
                }
                output.push('\n');
            }
        }
    }

    Some(output)
}
