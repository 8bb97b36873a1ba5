use std::time::Duration;

use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest, ChatResponse};
use crate::utils::auth::add_auth_headers;
use crate::utils::text::truncate_chars;
use crate::utils::url::construct_api_url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamMessage {
    Content(String),
    Reasoning(String),
    Error(String),
    End,
}

/// One provider call. The credential has already been validated.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub provider_id: String,
    pub base_url: String,
    pub api_key: String,
    /// Header carrying the raw key instead of `Authorization: Bearer`.
    pub api_key_header: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub extra_headers: Vec<(String, String)>,
    pub cancel: CancellationToken,
}

/// A model endpoint that streams content and reasoning deltas.
///
/// The receiver always ends with [`StreamMessage::End`] unless the request is
/// cancelled, in which case the channel simply closes.
pub trait ChatProvider: Send + Sync {
    fn stream_chat(&self, request: StreamRequest) -> mpsc::UnboundedReceiver<StreamMessage>;
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn handle_data_payload(payload: &str, tx: &mpsc::UnboundedSender<StreamMessage>) -> bool {
    if payload == "[DONE]" {
        let _ = tx.send(StreamMessage::End);
        return true;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => {
            if let Some(choice) = response.choices.first() {
                if let Some(reasoning) = choice.delta.reasoning_text() {
                    let _ = tx.send(StreamMessage::Reasoning(reasoning.to_string()));
                }
                if let Some(content) = choice.delta.content.as_ref().filter(|c| !c.is_empty()) {
                    let _ = tx.send(StreamMessage::Content(content.clone()));
                }
            }
            false
        }
        Err(_) => {
            if payload.trim().is_empty() {
                return false;
            }

            let formatted_error = format_api_error(payload);
            let _ = tx.send(StreamMessage::Error(formatted_error));
            let _ = tx.send(StreamMessage::End);
            true
        }
    }
}

fn process_sse_line(line: &str, tx: &mpsc::UnboundedSender<StreamMessage>) -> bool {
    extract_data_payload(line)
        .map(|payload| handle_data_payload(payload, tx))
        .unwrap_or(false)
}

const ERROR_DETAIL_LIMIT: usize = 600;

/// `error.message`, a bare string `error`, or a top-level `message`.
fn error_summary(value: &serde_json::Value) -> Option<String> {
    let text = value
        .pointer("/error/message")
        .or_else(|| value.get("error").filter(|error| error.is_string()))
        .or_else(|| value.get("message"))
        .and_then(serde_json::Value::as_str)?;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Condenses a provider error body into a single line.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API Error: <empty response>".to_string();
    }
    let detail = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|value| error_summary(&value))
        .unwrap_or_else(|| trimmed.split_whitespace().collect::<Vec<_>>().join(" "));
    format!("API Error: {}", truncate_chars(&detail, ERROR_DETAIL_LIMIT))
}

/// `POST {base_url}/chat/completions` with `stream: true`.
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    stream_timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn new(connect_timeout: Duration, stream_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            stream_timeout,
        })
    }
}

impl ChatProvider for OpenAiCompatibleProvider {
    fn stream_chat(&self, request: StreamRequest) -> mpsc::UnboundedReceiver<StreamMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let stream_timeout = self.stream_timeout;

        tokio::spawn(async move {
            let StreamRequest {
                provider_id,
                base_url,
                api_key,
                api_key_header,
                model,
                messages,
                extra_headers,
                cancel,
            } = request;

            let body = ChatRequest {
                model,
                messages,
                stream: true,
            };

            tokio::select! {
                _ = async {
                    let chat_url = construct_api_url(&base_url, "chat/completions");
                    debug!(provider = %provider_id, url = %chat_url, "Starting provider stream");
                    let mut http_request = client
                        .post(chat_url)
                        .header("Content-Type", "application/json")
                        .timeout(stream_timeout);
                    for (name, value) in &extra_headers {
                        http_request = http_request.header(name.as_str(), value.as_str());
                    }
                    let http_request =
                        add_auth_headers(http_request, api_key_header.as_deref(), &api_key);

                    match http_request.json(&body).send().await {
                        Ok(response) => {
                            if !response.status().is_success() {
                                let status = response.status();
                                let error_text = response
                                    .text()
                                    .await
                                    .unwrap_or_else(|_| "<no body>".to_string());
                                warn!(provider = %provider_id, status = %status, "Provider rejected stream request");
                                let _ = tx.send(StreamMessage::Error(format_api_error(&error_text)));
                                let _ = tx.send(StreamMessage::End);
                                return;
                            }

                            let mut stream = response.bytes_stream();
                            let mut buffer: Vec<u8> = Vec::new();

                            while let Some(chunk) = stream.next().await {
                                let chunk_bytes = match chunk {
                                    Ok(bytes) => bytes,
                                    Err(err) => {
                                        let _ = tx.send(StreamMessage::Error(format_api_error(&err.to_string())));
                                        let _ = tx.send(StreamMessage::End);
                                        return;
                                    }
                                };
                                buffer.extend_from_slice(&chunk_bytes);

                                while let Some(newline_pos) = memchr(b'\n', &buffer) {
                                    let should_end = match std::str::from_utf8(&buffer[..newline_pos]) {
                                        Ok(line) => process_sse_line(line.trim(), &tx),
                                        Err(err) => {
                                            debug!(provider = %provider_id, error = %err, "Skipping invalid UTF-8 stream line");
                                            false
                                        }
                                    };
                                    buffer.drain(..=newline_pos);
                                    if should_end {
                                        debug!(provider = %provider_id, "Provider stream finished");
                                        return;
                                    }
                                }
                            }

                            if let Ok(rest) = std::str::from_utf8(&buffer) {
                                if process_sse_line(rest.trim(), &tx) {
                                    return;
                                }
                            }
                            let _ = tx.send(StreamMessage::End);
                        }
                        Err(e) => {
                            let _ = tx.send(StreamMessage::Error(format_api_error(&e.to_string())));
                            let _ = tx.send(StreamMessage::End);
                        }
                    }
                } => {}
                _ = cancel.cancelled() => {
                    debug!(provider = %provider_id, "Provider stream cancelled");
                }
            }
        });

        rx
    }
}
