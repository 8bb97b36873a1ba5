//! Persistent-stream transport: buffered POSTs plus a long-lived GET event
//! stream for server-to-client traffic.
//!
//! The GET stream is opened once the server accepts `notifications/initialized`.
//! A 405 or a JSON reply to that GET marks persistent mode unsupported for the
//! server and the transport carries on with POSTs alone. Dropped streams are
//! reopened with `Last-Event-ID` so the server can replay missed events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::http::{delete_session, post_message, read_event_stream, EventSinks, PostExchange};
use super::sse::is_event_stream_content_type;
use super::{
    apply_custom_headers, apply_protocol_version_header, apply_session_header, build_http_client,
    content_type, request_id_key, status_error, McpTransport, ResumptionCallback, SendOptions,
    ServerEnvelope, TransportEndpoint, TransportError, TransportOptions, TransportSession,
    MCP_EVENT_STREAM_CONTENT_TYPE, MCP_LAST_EVENT_ID_HEADER,
};
use crate::mcp::catalog::ProtocolKind;

/// Reconnect attempts after the persistent stream drops.
pub const MAX_STREAM_RECONNECTS: usize = 2;
const STREAM_RECONNECT_DELAY: Duration = Duration::from_millis(250);
const INITIALIZED_METHOD: &str = "notifications/initialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSupport {
    /// No GET attempted yet.
    Unknown,
    Active,
    Unsupported,
}

type PendingMap = HashMap<String, oneshot::Sender<ServerEnvelope>>;

/// State shared with the background listener.
struct ListenerShared {
    last_event_id: Mutex<Option<String>>,
    pending: Mutex<PendingMap>,
    support: Mutex<StreamSupport>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ListenerShared {
    fn new() -> Self {
        Self {
            last_event_id: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            support: Mutex::new(StreamSupport::Unknown),
        }
    }

    fn support(&self) -> StreamSupport {
        *lock(&self.support)
    }

    fn set_support(&self, support: StreamSupport) {
        *lock(&self.support) = support;
    }

    fn last_event_id(&self) -> Option<String> {
        lock(&self.last_event_id).clone()
    }

    fn set_last_event_id(&self, id: Option<String>) {
        *lock(&self.last_event_id) = id;
    }

    fn register(&self, key: String) -> oneshot::Receiver<ServerEnvelope> {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(key, tx);
        rx
    }

    fn forget(&self, key: &str) {
        lock(&self.pending).remove(key);
    }

    /// Hands a response to its waiting caller; returns it back if nobody waits.
    fn complete(&self, message: ServerEnvelope) -> Option<ServerEnvelope> {
        let Some(key) = message.id().map(request_id_key) else {
            return Some(message);
        };
        let sender = lock(&self.pending).remove(&key);
        match sender {
            Some(sender) => sender.send(message).err(),
            None => Some(message),
        }
    }
}

struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct StreamableHttpTransport {
    endpoint: TransportEndpoint,
    options: TransportOptions,
    client: Option<reqwest::Client>,
    session_id: Option<String>,
    protocol_version: Option<String>,
    shared: Arc<ListenerShared>,
    listener: Option<Listener>,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(endpoint: TransportEndpoint, options: TransportOptions) -> Self {
        Self {
            endpoint,
            options,
            client: None,
            session_id: None,
            protocol_version: None,
            shared: Arc::new(ListenerShared::new()),
            listener: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn stream_support(&self) -> StreamSupport {
        self.shared.support()
    }

    fn callbacks<'a>(&'a self, options: &'a SendOptions) -> Vec<&'a ResumptionCallback> {
        options
            .on_resumption_token
            .iter()
            .chain(self.options.on_resumption_token.iter())
            .collect()
    }

    fn record_event_id(&self, id: Option<String>) {
        if id.is_some() {
            self.shared.set_last_event_id(id);
        }
    }

    fn listener_context(&self, client: reqwest::Client) -> ListenerContext {
        ListenerContext {
            client,
            endpoint: self.endpoint.clone(),
            session_id: self.session_id.clone(),
            protocol_version: self.protocol_version.clone(),
            open_timeout: self.options.request_timeout,
            shared: Arc::clone(&self.shared),
            server_messages: self.options.server_messages.clone(),
            on_resumption_token: self.options.on_resumption_token.clone(),
        }
    }

    /// Opens the persistent GET stream if it is not already open or known to
    /// be unsupported. Failures downgrade to POST-only operation.
    pub async fn open_event_stream(&mut self) -> Result<StreamSupport, TransportError> {
        let client = self.client.clone().ok_or(TransportError::NotStarted)?;
        match self.shared.support() {
            StreamSupport::Unsupported => return Ok(StreamSupport::Unsupported),
            StreamSupport::Active if self.listener.is_some() => return Ok(StreamSupport::Active),
            _ => {}
        }

        let context = self.listener_context(client);
        let cancel = self.cancel.child_token();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            opened = context.open(self.shared.last_event_id()) => opened,
        };
        let response = match response {
            Ok(Some(response)) => response,
            Ok(None) => {
                self.shared.set_support(StreamSupport::Unsupported);
                return Ok(StreamSupport::Unsupported);
            }
            Err(err) => {
                warn!(server_id = %self.endpoint.server_id, error = %err, "MCP event stream unavailable; continuing without it");
                self.shared.set_support(StreamSupport::Unsupported);
                return Ok(StreamSupport::Unsupported);
            }
        };

        self.shared.set_support(StreamSupport::Active);
        info!(server_id = %self.endpoint.server_id, "MCP event stream opened");
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { context.run(response, task_cancel).await });
        self.listener = Some(Listener { cancel, task });
        Ok(StreamSupport::Active)
    }

    async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
            if let Err(err) = listener.task.await {
                debug!(server_id = %self.endpoint.server_id, error = %err, "MCP event stream task ended abnormally");
            }
            if self.shared.support() == StreamSupport::Active {
                self.shared.set_support(StreamSupport::Unknown);
            }
        }
    }

    fn session_snapshot(&self) -> TransportSession {
        TransportSession {
            session_id: self.session_id.clone(),
            protocol_version: self.protocol_version.clone(),
            last_event_id: self.shared.last_event_id(),
        }
    }

    /// Re-reads an interrupted response from the event stream. The replayed
    /// response takes the id of `message` so the caller can correlate it.
    async fn resume(
        &mut self,
        message: &Value,
        token: String,
        options: &SendOptions,
    ) -> Result<Option<ServerEnvelope>, TransportError> {
        let client = self.client.clone().ok_or(TransportError::NotStarted)?;
        info!(server_id = %self.endpoint.server_id, "Resuming MCP response stream");
        let context = self.listener_context(client);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            opened = context.open(Some(token)) => opened?,
        };
        let Some(response) = response else {
            return Err(TransportError::ContentType(
                "event stream resumption not supported".to_string(),
            ));
        };

        let callbacks = self.callbacks(options);
        let sinks = EventSinks {
            on_resumption_token: &callbacks,
            server_messages: self.options.server_messages.as_ref(),
        };
        let read = read_event_stream(response, &self.endpoint.server_id, None, &self.cancel, &sinks).await?;
        self.record_event_id(read.last_event_id);
        let replay_id = message.get("id").cloned().unwrap_or(Value::Null);
        Ok(read.message.map(|reply| reply.with_request_id(replay_id)))
    }

    async fn await_stream_response(
        &self,
        key: &str,
        receiver: oneshot::Receiver<ServerEnvelope>,
    ) -> Result<Option<ServerEnvelope>, TransportError> {
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(self.options.request_timeout) => Err(TransportError::Timeout),
            received = receiver => received.map(Some).map_err(|_| TransportError::NoResponse),
        };
        self.shared.forget(key);
        outcome
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Stream
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
        if let Some(token) = options.resumption_token.clone() {
            return self.resume(&message, token, &options).await;
        }

        let client = self.client.clone().ok_or(TransportError::NotStarted)?;
        let pending_key = message.get("id").filter(|id| !id.is_null()).map(request_id_key);
        let receiver = pending_key.clone().map(|key| self.shared.register(key));

        let session = self.session_snapshot();
        let callbacks = self.callbacks(&options);
        let sinks = EventSinks {
            on_resumption_token: &callbacks,
            server_messages: self.options.server_messages.as_ref(),
        };
        let exchange = PostExchange {
            client: &client,
            endpoint: &self.endpoint,
            session: &session,
            timeout: self.options.request_timeout,
            cancel: &self.cancel,
        };
        let posted = post_message(&exchange, &message, &sinks).await;

        let reply = match posted {
            Ok(reply) => reply,
            Err(err) => {
                if let Some(key) = pending_key.as_deref() {
                    self.shared.forget(key);
                }
                return Err(err);
            }
        };
        if let Some(session_id) = reply.session_id.clone() {
            self.session_id = Some(session_id);
        }
        if let Some(protocol_version) = reply.protocol_version.clone() {
            self.protocol_version = Some(protocol_version);
        }
        self.record_event_id(reply.last_event_id.clone());

        let response = match (reply.message, pending_key, receiver) {
            (Some(response), key, _) => {
                if let Some(key) = key.as_deref() {
                    self.shared.forget(key);
                }
                Some(response)
            }
            // Accepted without a body: the response arrives on the GET stream.
            (None, Some(key), Some(receiver)) if self.shared.support() == StreamSupport::Active => {
                self.await_stream_response(&key, receiver).await?
            }
            (None, Some(key), _) => {
                self.shared.forget(&key);
                None
            }
            (None, None, _) => None,
        };

        if message.get("method").and_then(Value::as_str) == Some(INITIALIZED_METHOD) {
            self.open_event_stream().await?;
        }
        Ok(response)
    }

    async fn terminate_session(&mut self) -> Result<(), TransportError> {
        let client = self.client.clone().ok_or(TransportError::NotStarted)?;
        self.stop_listener().await;
        let session = self.session_snapshot();
        delete_session(&client, &self.endpoint, &session, self.options.request_timeout).await?;
        self.session_id = None;
        self.shared.set_last_event_id(None);
        Ok(())
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.stop_listener().await;
        lock(&self.shared.pending).clear();
        self.client = None;
        self.session_id = None;
        self.protocol_version = None;
        self.shared.set_last_event_id(None);
        self.shared.set_support(StreamSupport::Unknown);
    }

    fn session(&self) -> TransportSession {
        self.session_snapshot()
    }

    fn set_protocol_version(&mut self, protocol_version: String) {
        self.protocol_version = Some(protocol_version);
    }
}

/// Everything the background listener needs, detached from the transport.
struct ListenerContext {
    client: reqwest::Client,
    endpoint: TransportEndpoint,
    session_id: Option<String>,
    protocol_version: Option<String>,
    /// Bounds the wait for response headers, not the body.
    open_timeout: Duration,
    shared: Arc<ListenerShared>,
    server_messages: Option<tokio::sync::mpsc::UnboundedSender<ServerEnvelope>>,
    on_resumption_token: Option<ResumptionCallback>,
}

impl ListenerContext {
    /// Issues the GET. `Ok(None)` means the server does not offer a stream.
    async fn open(
        &self,
        last_event_id: Option<String>,
    ) -> Result<Option<reqwest::Response>, TransportError> {
        let request = apply_custom_headers(self.client.get(&self.endpoint.url), &self.endpoint.headers)
            .header("Accept", MCP_EVENT_STREAM_CONTENT_TYPE);
        let mut request = apply_session_header(
            apply_protocol_version_header(request, self.protocol_version.as_deref()),
            self.session_id.as_deref(),
        );
        if let Some(last_event_id) = last_event_id.as_deref() {
            request = request.header(MCP_LAST_EVENT_ID_HEADER, last_event_id);
        }

        let response = tokio::time::timeout(self.open_timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout)??;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            info!(server_id = %self.endpoint.server_id, "Server does not offer an MCP event stream (405)");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let content_type = content_type(&response);
        if !is_event_stream_content_type(&content_type) {
            info!(server_id = %self.endpoint.server_id, content_type = %content_type, "Server answered event stream request without a stream");
            return Ok(None);
        }
        Ok(Some(response))
    }

    async fn run(self, first: reqwest::Response, cancel: CancellationToken) {
        let mut response = Some(first);
        let mut reconnects = 0;

        loop {
            if let Some(current) = response.take() {
                let outcome = self.pump(current, &cancel).await;
                match outcome {
                    Err(TransportError::Cancelled) => return,
                    Err(err) => {
                        debug!(server_id = %self.endpoint.server_id, error = %err, "MCP event stream dropped");
                    }
                    Ok(()) => {
                        debug!(server_id = %self.endpoint.server_id, "MCP event stream ended");
                    }
                }
            }

            let Some(last_event_id) = self.shared.last_event_id() else {
                break;
            };
            if reconnects >= MAX_STREAM_RECONNECTS {
                warn!(server_id = %self.endpoint.server_id, "MCP event stream reconnect limit reached");
                break;
            }
            reconnects += 1;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(STREAM_RECONNECT_DELAY) => {}
            }
            info!(server_id = %self.endpoint.server_id, attempt = reconnects, "Reconnecting MCP event stream");
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.open(Some(last_event_id)) => opened,
            };
            match opened {
                Ok(Some(next)) => response = Some(next),
                Ok(None) => break,
                Err(err) => {
                    debug!(server_id = %self.endpoint.server_id, error = %err, "MCP event stream reconnect failed");
                }
            }
        }

        self.shared.set_support(StreamSupport::Unknown);
    }

    /// Routes every message of one GET body until it ends.
    async fn pump(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        use futures_util::StreamExt;

        let mut stream = response.bytes_stream();
        let mut parser = super::sse::SseEventParser::default();
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
                    self.shared.set_last_event_id(Some(id.to_string()));
                    if let Some(callback) = self.on_resumption_token.as_ref() {
                        callback(id);
                    }
                }
                let messages = match super::sse::decode_messages(&event.data) {
                    Ok(messages) => messages,
                    Err(err) => {
                        debug!(server_id = %self.endpoint.server_id, error = %err, "Skipping undecodable MCP event");
                        continue;
                    }
                };
                for message in messages {
                    self.route(message);
                }
            }
            if ended {
                return Ok(());
            }
        }
    }

    fn route(&self, message: ServerEnvelope) {
        if message.is_response() {
            if let Some(unclaimed) = self.shared.complete(message) {
                debug!(server_id = %self.endpoint.server_id, id = ?unclaimed.id(), "Ignoring uncorrelated MCP response");
            }
            return;
        }
        match self.server_messages.as_ref() {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                debug!(server_id = %self.endpoint.server_id, method = ?message.method(), "Dropping server-initiated MCP message");
            }
        }
    }
}
