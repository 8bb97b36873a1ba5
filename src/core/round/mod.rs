//! The turn loop: stream a model pass, segment it live, plan and execute the
//! tool calls it proposes, feed the results back, and repeat until the model
//! stops calling tools, the round limit is hit, or the caller stops the turn.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::chat_stream::{ChatProvider, StreamMessage, StreamRequest};
use crate::core::config::{ConfigError, EngineConfig};
use crate::core::credentials::{CredentialError, CredentialManager};
use crate::core::message::{Message, Tag, TagPayload, TagStatus, TAG_KIND_TOOL_CALL};
use crate::core::segmenter::StreamSegmenter;
use crate::core::store::{ConversationStore, StoreError};
use crate::mcp::catalog::{render_tool_instructions, ToolCatalog};
use crate::mcp::client::{CallResult, ToolInvoker};
use crate::utils::text::truncate_chars;

pub mod context;
pub mod planning;

#[cfg(test)]
mod tests;

use context::{provider_messages, tool_results_message, ToolOutcome};
use planning::{plan_round, CallGroup, RoundPlan};

const SKIPPED_AFTER_STOP: &str = "Stopped before the call was sent";
const ABANDONED_CALL: &str = "Turn ended before the call finished";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub provider_id: Option<String>,
    /// Overrides the provider's configured model.
    pub model: Option<String>,
    /// Appended as a user message before the first round.
    pub user_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    RoundStarted { round: usize, message_id: String },
    Visible(String),
    Thinking(String),
    TagUpdated { message_id: String, tag: Tag },
    /// The provider failed after some content was already shown.
    StreamError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Done,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub state: TurnState,
    pub rounds: usize,
    pub tool_calls: usize,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("A turn is already running for conversation {0}")]
    Busy(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Removes the conversation from the busy set when the turn ends.
struct BusyGuard<'a> {
    busy: &'a StdMutex<HashSet<String>>,
    conversation_id: String,
}

impl<'a> BusyGuard<'a> {
    fn acquire(busy: &'a StdMutex<HashSet<String>>, conversation_id: &str) -> Option<Self> {
        let mut ids = busy.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !ids.insert(conversation_id.to_string()) {
            return None;
        }
        Some(Self {
            busy,
            conversation_id: conversation_id.to_string(),
        })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut ids = self
            .busy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.remove(&self.conversation_id);
    }
}

/// What one streamed model pass produced.
#[derive(Default)]
struct StreamedPass {
    segmenter: StreamSegmenter,
    reasoning: String,
    produced: bool,
    error: Option<String>,
    stopped: bool,
}

pub struct RoundOrchestrator {
    provider: Arc<dyn ChatProvider>,
    invoker: Arc<dyn ToolInvoker>,
    catalog: Arc<ToolCatalog>,
    credentials: Arc<CredentialManager>,
    store: Arc<dyn ConversationStore>,
    config: Arc<EngineConfig>,
    busy: StdMutex<HashSet<String>>,
}

impl RoundOrchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        invoker: Arc<dyn ToolInvoker>,
        catalog: Arc<ToolCatalog>,
        credentials: Arc<CredentialManager>,
        store: Arc<dyn ConversationStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            provider,
            invoker,
            catalog,
            credentials,
            store,
            config,
            busy: StdMutex::new(HashSet::new()),
        }
    }

    /// Runs one conversational turn to completion.
    ///
    /// Only one turn per conversation may run at a time; a second request
    /// fails with [`TurnError::Busy`]. Cancelling `cancel` stops the active
    /// stream; calls already sent finish and their tags resolve, but no
    /// further round starts.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: mpsc::UnboundedSender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let conversation_id = request.conversation_id.as_str();
        let _busy = BusyGuard::acquire(&self.busy, conversation_id)
            .ok_or_else(|| TurnError::Busy(conversation_id.to_string()))?;

        self.store.load(conversation_id).await?;
        if let Some(text) = request.user_message.as_deref().filter(|t| !t.trim().is_empty()) {
            self.store
                .append_message(conversation_id, Message::user(text))
                .await?;
        }

        let provider = self.config.select_provider(request.provider_id.as_deref())?;
        let model = request.model.clone().unwrap_or_else(|| provider.model.clone());
        let settings = &self.config.engine;
        let system_prompt = render_tool_instructions(&self.catalog);
        let mut outcome = TurnOutcome {
            state: TurnState::Done,
            rounds: 0,
            tool_calls: 0,
            error: None,
        };

        for round in 1..=settings.max_rounds {
            if cancel.is_cancelled() {
                outcome.state = TurnState::Stopped;
                break;
            }
            let credential = self.credentials.ensure_valid(&provider.id, false).await?;
            let conversation = self.store.load(conversation_id).await?;
            let messages = provider_messages(&conversation, system_prompt.as_deref());

            let reply = Message::assistant("");
            let message_id = reply.id.clone();
            self.store.append_message(conversation_id, reply).await?;
            outcome.rounds = round;
            info!(conversation = %conversation_id, round, provider = %provider.id, "Round started");
            let _ = events.send(TurnEvent::RoundStarted {
                round,
                message_id: message_id.clone(),
            });

            let receiver = self.provider.stream_chat(StreamRequest {
                provider_id: provider.id.clone(),
                base_url: provider.base_url.clone(),
                api_key: credential.access_token.clone(),
                api_key_header: provider.api_key_header.clone(),
                model: model.clone(),
                messages,
                extra_headers: provider
                    .extra_headers
                    .iter()
                    .map(|header| (header.name.clone(), header.value.clone()))
                    .collect(),
                cancel: cancel.child_token(),
            });
            let pass = stream_pass(receiver, &events, &cancel).await;

            self.store
                .replace_message_content(conversation_id, &message_id, pass.segmenter.visible())
                .await?;
            let mut reasoning = pass.reasoning.clone();
            reasoning.push_str(pass.segmenter.thinking());
            self.store
                .set_message_reasoning(conversation_id, &message_id, Some(reasoning))
                .await?;

            if let Some(error) = pass.error {
                warn!(
                    conversation = %conversation_id,
                    round,
                    error = %error,
                    "Provider stream failed"
                );
                if pass.produced {
                    let _ = events.send(TurnEvent::StreamError(error.clone()));
                    outcome.state = TurnState::Done;
                } else {
                    outcome.state = TurnState::Failed;
                }
                outcome.error = Some(error);
                break;
            }
            if pass.stopped {
                info!(conversation = %conversation_id, round, "Turn stopped during streaming");
                outcome.state = TurnState::Stopped;
                break;
            }

            let plan = plan_round(
                pass.segmenter.blocks(),
                pass.segmenter.unterminated_block(),
                &self.catalog,
                settings.max_calls_per_round,
            );
            if plan.is_empty() {
                debug!(conversation = %conversation_id, round, "No tool calls proposed");
                break;
            }
            if plan.dropped > 0 {
                info!(
                    conversation = %conversation_id,
                    round,
                    dropped = plan.dropped,
                    "Calls over the round budget were dropped"
                );
            }

            let executed = plan.groups.len();
            let outcomes = match self
                .execute_plan(conversation_id, &message_id, &plan, &events, &cancel)
                .await
            {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    self.resolve_dangling_tags(conversation_id, &message_id, &events)
                        .await;
                    return Err(err);
                }
            };
            outcome.tool_calls += executed;

            let context = tool_results_message(
                &outcomes,
                settings.result_truncation_chars,
                settings.context_truncation_chars,
            );
            self.store.append_message(conversation_id, context).await?;

            if cancel.is_cancelled() {
                outcome.state = TurnState::Stopped;
                break;
            }
            if executed == 0 {
                break;
            }
            if round == settings.max_rounds {
                info!(conversation = %conversation_id, round, "Round limit reached");
            }
        }

        info!(
            conversation = %conversation_id,
            state = ?outcome.state,
            rounds = outcome.rounds,
            tool_calls = outcome.tool_calls,
            "Turn finished"
        );
        Ok(outcome)
    }

    /// Tags every proposal, runs each distinct call once, and fans the result
    /// out to all tags of its group as calls complete.
    async fn execute_plan(
        &self,
        conversation_id: &str,
        message_id: &str,
        plan: &RoundPlan,
        events: &mpsc::UnboundedSender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolOutcome>, TurnError> {
        let settings = &self.config.engine;
        let mut outcomes = Vec::with_capacity(plan.groups.len() + plan.rejected.len());

        for rejected in &plan.rejected {
            let call = &rejected.call;
            let mut payload = self.call_payload(
                &call.server_id,
                &call.tool_name,
                &call.arguments,
                TagStatus::Error,
            );
            payload.error = Some(rejected.reason.clone());
            let tag = Tag::new(
                TAG_KIND_TOOL_CALL,
                &call.tool_name,
                payload.encode(),
                TagStatus::Error,
            );
            self.publish_tag(conversation_id, message_id, tag, events).await?;
            outcomes.push(ToolOutcome {
                server_id: call.server_id.clone(),
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
                result: CallResult::failure(rejected.reason.clone()),
            });
        }

        let mut group_tags: Vec<Vec<Tag>> = Vec::with_capacity(plan.groups.len());
        for group in &plan.groups {
            let call = &group.call;
            let payload = self.call_payload(
                &call.server_id,
                &call.tool_name,
                &call.arguments,
                TagStatus::Running,
            );
            let mut tags = Vec::with_capacity(group.proposals);
            for _ in 0..group.proposals {
                let tag = Tag::new(
                    TAG_KIND_TOOL_CALL,
                    &call.tool_name,
                    payload.encode(),
                    TagStatus::Running,
                );
                self.publish_tag(conversation_id, message_id, tag.clone(), events)
                    .await?;
                tags.push(tag);
            }
            if group.proposals > 1 {
                info!(
                    signature = %group.signature,
                    proposals = group.proposals,
                    "Coalesced duplicate tool calls"
                );
            }
            group_tags.push(tags);
        }

        let pending: Vec<_> = plan
            .groups
            .iter()
            .enumerate()
            .map(|(index, group)| self.execute_group(index, group, cancel))
            .collect();
        let mut executions =
            stream::iter(pending).buffer_unordered(settings.parallel_calls.max(1));

        let mut results: Vec<Option<CallResult>> = vec![None; plan.groups.len()];
        while let Some((index, result, elapsed)) = executions.next().await {
            let group = &plan.groups[index];
            let status = if result.success {
                TagStatus::Success
            } else {
                TagStatus::Error
            };
            let call = &group.call;
            let mut payload =
                self.call_payload(&call.server_id, &call.tool_name, &call.arguments, status);
            payload.elapsed_ms = Some(elapsed.as_millis() as u64);
            if !result.content.is_empty() {
                payload.result = Some(truncate_chars(
                    &result.content,
                    settings.result_truncation_chars,
                ));
            }
            payload.error = result.error.clone();
            let content = payload.encode();

            for tag in &mut group_tags[index] {
                tag.status = status;
                tag.content = content.clone();
                self.publish_tag(conversation_id, message_id, tag.clone(), events)
                    .await?;
            }
            results[index] = Some(result);
        }

        for (group, result) in plan.groups.iter().zip(results) {
            outcomes.push(ToolOutcome {
                server_id: group.call.server_id.clone(),
                tool_name: group.call.tool_name.clone(),
                arguments: group.call.arguments.clone(),
                result: result.unwrap_or_else(|| CallResult::failure(ABANDONED_CALL)),
            });
        }
        Ok(outcomes)
    }

    async fn execute_group(
        &self,
        index: usize,
        group: &CallGroup,
        cancel: &CancellationToken,
    ) -> (usize, CallResult, Duration) {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return (index, CallResult::failure(SKIPPED_AFTER_STOP), started.elapsed());
        }
        let result = match self.catalog.get(&group.call.server_id) {
            Some(server) => self.invoker.invoke(server, &group.call).await,
            None => CallResult::failure(format!("Unknown tool server: {}", group.call.server_id)),
        };
        debug!(
            server_id = %group.call.server_id,
            tool = %group.call.tool_name,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tool call resolved"
        );
        (index, result, started.elapsed())
    }

    fn call_payload(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: &serde_json::Map<String, Value>,
        status: TagStatus,
    ) -> TagPayload {
        let subtitle = self
            .catalog
            .get(server_id)
            .map(|server| server.label().to_string())
            .unwrap_or_else(|| server_id.to_string());
        let mut payload = TagPayload::new(tool_name, subtitle, status);
        payload.server_id = Some(server_id.to_string()).filter(|id| !id.is_empty());
        payload.tool_name = Some(tool_name.to_string());
        payload.arguments = Some(Value::Object(arguments.clone()));
        payload
    }

    async fn publish_tag(
        &self,
        conversation_id: &str,
        message_id: &str,
        tag: Tag,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<(), TurnError> {
        self.store
            .upsert_tag(conversation_id, message_id, tag.clone())
            .await?;
        let _ = events.send(TurnEvent::TagUpdated {
            message_id: message_id.to_string(),
            tag,
        });
        Ok(())
    }

    /// Best effort: a tag must never stay `running` once its turn is over.
    async fn resolve_dangling_tags(
        &self,
        conversation_id: &str,
        message_id: &str,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) {
        let Ok(conversation) = self.store.load(conversation_id).await else {
            return;
        };
        let Some(message) = conversation.message(message_id) else {
            return;
        };
        for tag in message.tags.iter().filter(|tag| tag.status == TagStatus::Running) {
            let mut tag = tag.clone();
            let mut payload = tag.payload().unwrap_or_else(|| {
                TagPayload::new(tag.title.clone(), String::new(), TagStatus::Error)
            });
            payload.status = TagStatus::Error;
            payload.progress = 100;
            payload.error = Some(ABANDONED_CALL.to_string());
            tag.status = TagStatus::Error;
            tag.content = payload.encode();
            if let Err(err) = self
                .publish_tag(conversation_id, message_id, tag, events)
                .await
            {
                warn!(
                    conversation = %conversation_id,
                    error = %err,
                    "Failed to resolve dangling tag"
                );
            }
        }
    }
}

/// Drains one provider stream through a fresh segmenter, forwarding deltas
/// as they become safe to show.
async fn stream_pass(
    mut receiver: mpsc::UnboundedReceiver<StreamMessage>,
    events: &mpsc::UnboundedSender<TurnEvent>,
    cancel: &CancellationToken,
) -> StreamedPass {
    let mut pass = StreamedPass::default();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                pass.stopped = true;
                break;
            }
            message = receiver.recv() => message,
        };
        match message {
            Some(StreamMessage::Content(text)) => {
                pass.produced |= !text.is_empty();
                let delta = pass.segmenter.push(&text);
                forward_delta(events, delta.visible, delta.thinking);
            }
            Some(StreamMessage::Reasoning(text)) => {
                pass.produced |= !text.is_empty();
                pass.reasoning.push_str(&text);
                forward_delta(events, String::new(), text);
            }
            Some(StreamMessage::Error(error)) => pass.error = Some(error),
            Some(StreamMessage::End) | None => break,
        }
    }
    let delta = pass.segmenter.flush();
    forward_delta(events, delta.visible, delta.thinking);
    pass
}

fn forward_delta(events: &mpsc::UnboundedSender<TurnEvent>, visible: String, thinking: String) {
    if !thinking.is_empty() {
        let _ = events.send(TurnEvent::Thinking(thinking));
    }
    if !visible.is_empty() {
        let _ = events.send(TurnEvent::Visible(visible));
    }
}
