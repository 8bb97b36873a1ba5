//! Tool execution against MCP servers.
//!
//! [`ToolExecutor`] keeps one transport per server id, performs the
//! `initialize` handshake on first use, and normalises every outcome into a
//! [`CallResult`]. Transport and protocol failures never escape
//! [`ToolInvoker::invoke`]; they become failed results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::directive::PlannedCall;
use crate::mcp::catalog::{ToolDescriptor, ToolServer};
use crate::mcp::transport::{
    create_transport, McpTransport, SendOptions, ServerEnvelope, TransportError, TransportOptions,
};

mod protocol;


const MCP_MAX_TOOL_LIST: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

impl CallResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolExecutionError {
    #[error("Unknown tool server: {0}")]
    UnknownServer(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Rpc(String),
    #[error("Unexpected MCP reply: {0}")]
    Protocol(String),
}

/// Executes one resolved call. Implementations report failures through
/// [`CallResult`] rather than `Err`.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, server: &ToolServer, call: &PlannedCall) -> CallResult;
}

#[derive(Clone)]
pub struct ExecutorOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub server_messages: Option<mpsc::UnboundedSender<ServerEnvelope>>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            server_messages: None,
        }
    }
}

struct ServerConnection {
    transport: Box<dyn McpTransport>,
    next_request_id: i64,
    initialized: bool,
}

impl ServerConnection {
    fn next_request_id(&mut self) -> i64 {
        self.next_request_id += 1;
        self.next_request_id
    }
}

/// Refreshed capability data for the caller to persist into the catalog.
#[derive(Debug, Clone)]
pub struct ToolSync {
    pub tools: Vec<ToolDescriptor>,
    pub last_sync_at: DateTime<Utc>,
}

pub struct ToolExecutor {
    options: ExecutorOptions,
    connections: Mutex<HashMap<String, Arc<Mutex<ServerConnection>>>>,
    cancel: CancellationToken,
}

impl ToolExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            connections: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Sessions are keyed by server id and never shared across servers.
    async fn connection(&self, server: &ToolServer) -> Arc<Mutex<ServerConnection>> {
        let mut connections = self.connections.lock().await;
        Arc::clone(connections.entry(server.id.clone()).or_insert_with(|| {
            let transport = create_transport(
                server,
                TransportOptions {
                    request_timeout: self.options.request_timeout,
                    connect_timeout: self.options.connect_timeout,
                    server_messages: self.options.server_messages.clone(),
                    on_resumption_token: None,
                },
            );
            Arc::new(Mutex::new(ServerConnection {
                transport,
                next_request_id: 0,
                initialized: false,
            }))
        }))
    }

    async fn ensure_initialized(
        connection: &mut ServerConnection,
        server: &ToolServer,
    ) -> Result<(), ToolExecutionError> {
        if connection.initialized {
            return Ok(());
        }
        connection.transport.start().await?;

        let id = connection.next_request_id();
        let message = protocol::request_message(
            rust_mcp_schema::schema_utils::RequestFromClient::InitializeRequest(
                protocol::client_details_for(server),
            ),
            id,
        )?;
        let response = connection
            .transport
            .send(message, SendOptions::default())
            .await?
            .ok_or(TransportError::NoResponse)?;
        let initialize = protocol::parse_initialize_result(response)?;
        connection
            .transport
            .set_protocol_version(initialize.protocol_version.clone());

        connection
            .transport
            .send(protocol::initialized_notification()?, SendOptions::default())
            .await?;
        connection.initialized = true;
        info!(
            server_id = %server.id,
            protocol = server.protocol.as_str(),
            protocol_version = %initialize.protocol_version,
            session = connection.transport.session().session_id.is_some(),
            "MCP session initialized"
        );
        Ok(())
    }

    /// Holds the server's connection for the whole exchange, so requests to
    /// one server run one at a time. Different servers proceed in parallel.
    async fn request(
        &self,
        server: &ToolServer,
        request: rust_mcp_schema::schema_utils::RequestFromClient,
    ) -> Result<Value, ToolExecutionError> {
        let connection = self.connection(server).await;
        let mut connection = connection.lock().await;
        let exchange = async {
            Self::ensure_initialized(&mut connection, server).await?;
            let id = connection.next_request_id();
            let message = protocol::request_message(request, id)?;
            let response = connection
                .transport
                .send(message, SendOptions::default())
                .await?
                .ok_or(TransportError::NoResponse)?;
            protocol::response_result(response)
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled.into()),
            result = exchange => result,
        }
    }

    /// Issues `tools/call` and returns the raw MCP result object.
    pub async fn call_tool(
        &self,
        server: &ToolServer,
        call: &PlannedCall,
    ) -> Result<Value, ToolExecutionError> {
        self.request(
            server,
            protocol::call_tool_request(&call.tool_name, &call.arguments),
        )
        .await
    }

    /// Fetches the server's tool list, following pagination up to a cap.
    pub async fn sync_tools(&self, server: &ToolServer) -> Result<ToolSync, ToolExecutionError> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let result = self
                .request(server, protocol::list_tools_request(cursor.take()))
                .await?;
            let (page, next_cursor) = protocol::parse_tools_page(&result);
            tools.extend(page);
            if tools.len() >= MCP_MAX_TOOL_LIST {
                tools.truncate(MCP_MAX_TOOL_LIST);
                break;
            }
            match next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        info!(server_id = %server.id, tools = tools.len(), "Synced MCP tool list");
        Ok(ToolSync {
            tools,
            last_sync_at: Utc::now(),
        })
    }

    /// Cancels in-flight requests, then terminates and closes every session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let connections: Vec<(String, Arc<Mutex<ServerConnection>>)> =
            self.connections.lock().await.drain().collect();
        for (server_id, connection) in connections {
            let mut connection = connection.lock().await;
            if connection.initialized {
                if let Err(err) = connection.transport.terminate_session().await {
                    warn!(server_id = %server_id, error = %err, "Failed to terminate MCP session");
                }
            }
            connection.transport.close().await;
            debug!(server_id = %server_id, "Closed MCP transport");
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    async fn invoke(&self, server: &ToolServer, call: &PlannedCall) -> CallResult {
        let started = Instant::now();
        let result = match self.call_tool(server, call).await {
            Ok(value) => normalize_call_result(&value),
            Err(err) => CallResult::failure(err.to_string()),
        };
        debug!(
            server_id = %server.id,
            tool = %call.tool_name,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "MCP tool call finished"
        );
        result
    }
}

/// Flattens an MCP tool result into a [`CallResult`].
///
/// An explicit boolean `success` wins, then `isError`. Without either flag
/// the call succeeded unless it carries an `error` and no content.
pub fn normalize_call_result(result: &Value) -> CallResult {
    let content = result_text(result);
    let success = result
        .get("success")
        .and_then(Value::as_bool)
        .or_else(|| result.get("isError").and_then(Value::as_bool).map(|is_error| !is_error))
        .unwrap_or_else(|| {
            result.get("error").is_none_or(Value::is_null) || !content.trim().is_empty()
        });
    if success {
        return CallResult::ok(content);
    }

    let error = result
        .get("error")
        .and_then(|error| match error {
            Value::String(text) => Some(text.clone()),
            Value::Null => None,
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| Some(other.to_string())),
        })
        .or_else(|| (!content.trim().is_empty()).then(|| content.clone()))
        .unwrap_or_else(|| "Tool reported an error".to_string());
    CallResult {
        success: false,
        content,
        error: Some(error),
    }
}

fn result_text(result: &Value) -> String {
    let mut parts = Vec::new();
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
                Some("resource") => {
                    let resource = item.get("resource");
                    match resource.and_then(|r| r.get("text")).and_then(Value::as_str) {
                        Some(text) => parts.push(text.to_string()),
                        None => parts.push(item.to_string()),
                    }
                }
                Some("image") | Some("audio") => {
                    let mime = item
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .unwrap_or("binary");
                    parts.push(format!("[{mime} content omitted]"));
                }
                _ => parts.push(item.to_string()),
            }
        }
    } else if let Some(text) = result.get("content").and_then(Value::as_str) {
        parts.push(text.to_string());
    }

    if parts.is_empty() {
        if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
            parts.push(structured.to_string());
        }
    }
    parts.join("\n")
}
