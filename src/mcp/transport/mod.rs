//! Shared MCP HTTP transport abstractions.
//!
//! Both wire modes sit behind [`McpTransport`]: [`http::BufferedHttpTransport`]
//! posts one message per request, while
//! [`streamable_http::StreamableHttpTransport`] additionally keeps a GET event
//! stream open for server-initiated traffic and stream resumption. Session ids
//! and the negotiated protocol version are captured from responses and echoed
//! on every later request to the same server.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::RpcError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::mcp::catalog::{HeaderEntry, ProtocolKind, ToolServer};

pub mod http;
pub mod sse;
pub mod streamable_http;

#[cfg(test)]
mod tests;

pub const MCP_JSON_CONTENT_TYPE: &str = "application/json";
pub const MCP_EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";
pub const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
pub const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
pub const MCP_LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Headers owned by the protocol; configured server headers never replace them.
const PROTECTED_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    MCP_SESSION_ID_HEADER,
    "mcp-protocol-version",
    "last-event-id",
];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {status}")]
    Status { status: u16, body: String },
    #[error("Unexpected content type: {0}")]
    ContentType(String),
    #[error("Invalid server message: {0}")]
    Decode(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("MCP HTTP client not connected.")]
    NotStarted,
    #[error("Server sent no response")]
    NoResponse,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Session state for one tool server; never shared across servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSession {
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
    pub last_event_id: Option<String>,
}

/// Invoked with every event id seen, so callers can persist resumption tokens.
pub type ResumptionCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SendOptions {
    /// Resume an interrupted response stream instead of posting again.
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<ResumptionCallback>,
}

impl fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendOptions")
            .field("resumption_token", &self.resumption_token)
            .field("on_resumption_token", &self.on_resumption_token.is_some())
            .finish()
    }
}

/// Construction-time settings shared by both transports.
#[derive(Clone)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Receives server-initiated requests and notifications.
    pub server_messages: Option<mpsc::UnboundedSender<ServerEnvelope>>,
    /// Called for event ids seen on the persistent stream.
    pub on_resumption_token: Option<ResumptionCallback>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            server_messages: None,
            on_resumption_token: None,
        }
    }
}

/// Where and how to reach one tool server.
#[derive(Debug, Clone)]
pub struct TransportEndpoint {
    pub server_id: String,
    pub url: String,
    pub headers: Vec<HeaderEntry>,
}

impl TransportEndpoint {
    pub fn from_server(server: &ToolServer) -> Self {
        Self {
            server_id: server.id.clone(),
            url: server.base_url.trim().to_string(),
            headers: server.headers.clone(),
        }
    }
}

/// A JSON-RPC message received from a server.
///
/// Kept as a raw JSON tree so ids can be rewritten on replay and partially
/// conforming servers still decode.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEnvelope(Value);

impl ServerEnvelope {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn id(&self) -> Option<&Value> {
        self.0.get("id").filter(|id| !id.is_null())
    }

    pub fn method(&self) -> Option<&str> {
        self.0.get("method").and_then(Value::as_str)
    }

    pub fn is_response(&self) -> bool {
        self.method().is_none()
            && self.id().is_some()
            && (self.0.get("result").is_some() || self.0.get("error").is_some())
    }

    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    pub fn error(&self) -> Option<RpcError> {
        let error = self.0.get("error")?;
        Some(
            serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| RpcError {
                code: -32603,
                message: error.to_string(),
                data: None,
            }),
        )
    }

    pub fn with_request_id(mut self, id: Value) -> Self {
        if let Value::Object(object) = &mut self.0 {
            object.insert("id".to_string(), id);
        }
        self
    }
}

/// Normalised key for correlating JSON-RPC ids (`1` and `"1"` are distinct).
pub fn request_id_key(id: &Value) -> String {
    id.to_string()
}

#[async_trait]
pub trait McpTransport: Send {
    fn protocol(&self) -> ProtocolKind;

    async fn start(&mut self) -> Result<(), TransportError>;

    /// Sends one client message. Requests resolve to their response; messages
    /// the server merely accepts (notifications) resolve to `None`.
    async fn send(
        &mut self,
        message: Value,
        options: SendOptions,
    ) -> Result<Option<ServerEnvelope>, TransportError>;

    /// Ends the server-side session with a DELETE. Servers answering 405 do
    /// not support explicit termination, which is not an error.
    async fn terminate_session(&mut self) -> Result<(), TransportError>;

    /// Cancels in-flight work and background tasks, then clears the session.
    async fn close(&mut self);

    fn session(&self) -> TransportSession;

    fn set_protocol_version(&mut self, protocol_version: String);
}

pub fn create_transport(server: &ToolServer, options: TransportOptions) -> Box<dyn McpTransport> {
    let endpoint = TransportEndpoint::from_server(server);
    match server.protocol {
        ProtocolKind::Buffered => Box::new(http::BufferedHttpTransport::new(endpoint, options)),
        ProtocolKind::Stream => {
            Box::new(streamable_http::StreamableHttpTransport::new(endpoint, options))
        }
    }
}

pub(crate) fn build_http_client(options: &TransportOptions) -> Result<reqwest::Client, TransportError> {
    // Per-request timeouts are set on POSTs only; the persistent GET must outlive them.
    reqwest::Client::builder()
        .connect_timeout(options.connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .build()
        .map_err(|err| TransportError::Request(err.to_string()))
}

pub(crate) fn apply_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

pub(crate) fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

pub(crate) fn apply_session_header(
    request: reqwest::RequestBuilder,
    session_id: Option<&str>,
) -> reqwest::RequestBuilder {
    match session_id {
        Some(session_id) => request.header(MCP_SESSION_ID_HEADER, session_id),
        None => request,
    }
}

pub(crate) fn apply_custom_headers(
    mut request: reqwest::RequestBuilder,
    headers: &[HeaderEntry],
) -> reqwest::RequestBuilder {
    for header in headers {
        let name = header.name.trim();
        if name.is_empty() || is_protected_header(name) {
            continue;
        }
        request = request.header(name, header.value.as_str());
    }
    request
}

pub fn is_protected_header(name: &str) -> bool {
    PROTECTED_HEADERS
        .iter()
        .any(|protected| protected.eq_ignore_ascii_case(name.trim()))
}

pub(crate) fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn content_type(response: &reqwest::Response) -> String {
    header_value(response, reqwest::header::CONTENT_TYPE.as_str()).unwrap_or_default()
}

pub(crate) async fn status_error(response: reqwest::Response) -> TransportError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    TransportError::Status { status, body }
}
