//! Buffered request/response transport, plus the POST exchange shared with
//! the persistent-stream transport.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::sse::{decode_messages, is_event_stream_content_type, is_json_content_type, SseEventParser};
use super::{
    apply_custom_headers, apply_post_headers, apply_protocol_version_header, apply_session_header,
    build_http_client, content_type, header_value, status_error, McpTransport, ResumptionCallback,
    SendOptions, ServerEnvelope, TransportEndpoint, TransportError, TransportOptions,
    TransportSession, MCP_PROTOCOL_VERSION_HEADER, MCP_SESSION_ID_HEADER,
};
use crate::mcp::catalog::ProtocolKind;

/// Where decoded events and their ids are delivered while a body is read.
pub(crate) struct EventSinks<'a> {
    pub on_resumption_token: &'a [&'a ResumptionCallback],
    pub server_messages: Option<&'a mpsc::UnboundedSender<ServerEnvelope>>,
}

impl EventSinks<'_> {
    fn event_id(&self, id: &str) {
        for callback in self.on_resumption_token {
            callback(id);
        }
    }

    fn forward(&self, server_id: &str, message: ServerEnvelope) {
        match self.server_messages {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                debug!(server_id = %server_id, method = ?message.method(), "Dropping server-initiated MCP message");
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamRead {
    pub message: Option<ServerEnvelope>,
    pub last_event_id: Option<String>,
}

/// Reads an event-stream body until a response arrives.
///
/// With `expected_id` set only a response carrying that id ends the read;
/// without it the first response does. Other messages go to the sinks.
pub(crate) async fn read_event_stream(
    response: reqwest::Response,
    server_id: &str,
    expected_id: Option<&Value>,
    cancel: &CancellationToken,
    sinks: &EventSinks<'_>,
) -> Result<StreamRead, TransportError> {
    let mut stream = response.bytes_stream();
    let mut parser = SseEventParser::default();
    let mut read = StreamRead::default();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let (events, ended) = match chunk {
            Some(chunk) => (parser.push(&chunk?), false),
            None => (parser.finish(), true),
        };

        for event in events {
            if let Some(id) = event.id.as_deref() {
                read.last_event_id = Some(id.to_string());
                sinks.event_id(id);
            }
            for message in decode_messages(&event.data)? {
                let matches = message.is_response()
                    && expected_id.is_none_or(|expected| message.id() == Some(expected));
                if matches {
                    read.message = Some(message);
                    return Ok(read);
                }
                if message.is_response() {
                    debug!(server_id = %server_id, id = ?message.id(), "Ignoring uncorrelated MCP response");
                } else {
                    sinks.forward(server_id, message);
                }
            }
        }

        if ended {
            return Ok(read);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PostReply {
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
    pub last_event_id: Option<String>,
    pub message: Option<ServerEnvelope>,
}

pub(crate) struct PostExchange<'a> {
    pub client: &'a reqwest::Client,
    pub endpoint: &'a TransportEndpoint,
    pub session: &'a TransportSession,
    pub timeout: std::time::Duration,
    pub cancel: &'a CancellationToken,
}

/// POSTs one JSON-RPC message and decodes whatever the server answers with:
/// a JSON body, an inline event stream, or nothing (202 Accepted).
pub(crate) async fn post_message(
    exchange: &PostExchange<'_>,
    message: &Value,
    sinks: &EventSinks<'_>,
) -> Result<PostReply, TransportError> {
    let endpoint = exchange.endpoint;
    let payload =
        serde_json::to_string(message).map_err(|err| TransportError::Decode(err.to_string()))?;
    debug!(
        server_id = %endpoint.server_id,
        url = %endpoint.url,
        method = ?message.get("method").and_then(serde_json::Value::as_str),
        "Sending MCP HTTP request"
    );

    let request = apply_custom_headers(exchange.client.post(&endpoint.url), &endpoint.headers);
    let request = apply_session_header(
        apply_protocol_version_header(
            apply_post_headers(request),
            exchange.session.protocol_version.as_deref(),
        ),
        exchange.session.session_id.as_deref(),
    )
    .timeout(exchange.timeout)
    .body(payload);

    let response = tokio::select! {
        _ = exchange.cancel.cancelled() => return Err(TransportError::Cancelled),
        response = request.send() => response?,
    };
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }

    let mut reply = PostReply {
        session_id: header_value(&response, MCP_SESSION_ID_HEADER),
        protocol_version: header_value(&response, MCP_PROTOCOL_VERSION_HEADER),
        ..PostReply::default()
    };
    if reply.session_id.is_some() && exchange.session.session_id.is_none() {
        debug!(server_id = %endpoint.server_id, "MCP session established");
    }

    if response.status() == reqwest::StatusCode::ACCEPTED
        || response.status() == reqwest::StatusCode::NO_CONTENT
    {
        return Ok(reply);
    }

    let content_type = content_type(&response);
    if is_event_stream_content_type(&content_type) {
        let read = read_event_stream(
            response,
            &endpoint.server_id,
            message.get("id"),
            exchange.cancel,
            sinks,
        )
        .await?;
        reply.last_event_id = read.last_event_id;
        reply.message = read.message;
        return Ok(reply);
    }

    let body = tokio::select! {
        _ = exchange.cancel.cancelled() => return Err(TransportError::Cancelled),
        body = response.bytes() => body?,
    };
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(reply);
    }
    if !content_type.is_empty() && !is_json_content_type(&content_type) {
        return Err(TransportError::ContentType(content_type));
    }
    let text = String::from_utf8_lossy(&body);
    for decoded in decode_messages(&text)? {
        if decoded.is_response() && reply.message.is_none() {
            reply.message = Some(decoded);
        } else {
            sinks.forward(&endpoint.server_id, decoded);
        }
    }
    Ok(reply)
}

pub(crate) async fn delete_session(
    client: &reqwest::Client,
    endpoint: &TransportEndpoint,
    session: &TransportSession,
    timeout: std::time::Duration,
) -> Result<(), TransportError> {
    let Some(session_id) = session.session_id.as_deref() else {
        return Ok(());
    };
    let request = apply_custom_headers(client.delete(&endpoint.url), &endpoint.headers);
    let response = apply_protocol_version_header(
        apply_session_header(request, Some(session_id)),
        session.protocol_version.as_deref(),
    )
    .timeout(timeout)
    .send()
    .await?;

    if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
        debug!(server_id = %endpoint.server_id, "Server does not support session termination");
        return Ok(());
    }
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    debug!(server_id = %endpoint.server_id, "MCP session terminated");
    Ok(())
}

pub(crate) fn apply_reply(session: &mut TransportSession, reply: &PostReply) {
    if let Some(session_id) = reply.session_id.as_ref() {
        session.session_id = Some(session_id.clone());
    }
    if let Some(protocol_version) = reply.protocol_version.as_ref() {
        session.protocol_version = Some(protocol_version.clone());
    }
    if let Some(last_event_id) = reply.last_event_id.as_ref() {
        session.last_event_id = Some(last_event_id.clone());
    }
}

/// One POST per message; no background connection.
pub struct BufferedHttpTransport {
    endpoint: TransportEndpoint,
    options: TransportOptions,
    client: Option<reqwest::Client>,
    session: TransportSession,
    cancel: CancellationToken,
}

impl BufferedHttpTransport {
    pub fn new(endpoint: TransportEndpoint, options: TransportOptions) -> Self {
        Self {
            endpoint,
            options,
            client: None,
            session: TransportSession::default(),
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl McpTransport for BufferedHttpTransport {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Buffered
    }

    async fn start(&mut self) -> Result<(), TransportError> {
        if self.client.is_none() {
            self.client = Some(build_http_client(&self.options)?);
            self.cancel = CancellationToken::new();
        }
        Ok(())
    }

    async fn send(
        &mut self,
        message: Value,
        options: SendOptions,
    ) -> Result<Option<ServerEnvelope>, TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotStarted)?;
        let callbacks: Vec<&ResumptionCallback> = options
            .on_resumption_token
            .iter()
            .chain(self.options.on_resumption_token.iter())
            .collect();
        let sinks = EventSinks {
            on_resumption_token: &callbacks,
            server_messages: self.options.server_messages.as_ref(),
        };
        let exchange = PostExchange {
            client,
            endpoint: &self.endpoint,
            session: &self.session,
            timeout: self.options.request_timeout,
            cancel: &self.cancel,
        };
        let reply = post_message(&exchange, &message, &sinks).await?;
        apply_reply(&mut self.session, &reply);
        Ok(reply.message)
    }

    async fn terminate_session(&mut self) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotStarted)?;
        delete_session(client, &self.endpoint, &self.session, self.options.request_timeout).await?;
        self.session = TransportSession::default();
        Ok(())
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.client = None;
        self.session = TransportSession::default();
    }

    fn session(&self) -> TransportSession {
        self.session.clone()
    }

    fn set_protocol_version(&mut self, protocol_version: String) {
        self.session.protocol_version = Some(protocol_version);
    }
}
