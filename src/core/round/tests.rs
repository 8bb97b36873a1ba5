use super::*;
use crate::api::ChatMessage;
use crate::core::config::{EngineSettings, ProviderConfig};
use crate::core::credentials::{MemoryCredentialStore, ProviderCredential};
use crate::core::directive::PlannedCall;
use crate::core::message::{Conversation, Role};
use crate::core::oauth::HttpOAuthRefresher;
use crate::core::round::context::TOOL_RESULTS_ROLE;
use crate::core::store::MemoryConversationStore;
use crate::mcp::catalog::{ProtocolKind, ToolDescriptor, ToolServer};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Replays one scripted message list per provider call.
struct ScriptedProvider {
    scripts: StdMutex<VecDeque<Vec<StreamMessage>>>,
    requests: StdMutex<Vec<Vec<ChatMessage>>>,
    hang_after_script: bool,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<StreamMessage>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into()),
            requests: StdMutex::new(Vec::new()),
            hang_after_script: false,
        })
    }

    /// Sends its script, then keeps the stream open until cancelled.
    fn hanging(script: Vec<StreamMessage>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(vec![script].into()),
            requests: StdMutex::new(Vec::new()),
            hang_after_script: true,
        })
    }

    fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatProvider for ScriptedProvider {
    fn stream_chat(&self, request: StreamRequest) -> mpsc::UnboundedReceiver<StreamMessage> {
        self.requests.lock().unwrap().push(request.messages.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StreamMessage::Content("Done.".to_string()), StreamMessage::End]);
        let (tx, rx) = mpsc::unbounded_channel();
        let hang = self.hang_after_script;
        tokio::spawn(async move {
            for message in script {
                let _ = tx.send(message);
            }
            if hang {
                request.cancel.cancelled().await;
            }
        });
        rx
    }
}

#[derive(Default)]
struct RecordingInvoker {
    calls: StdMutex<Vec<PlannedCall>>,
    results: HashMap<String, CallResult>,
}

impl RecordingInvoker {
    fn with_result(tool: &str, result: CallResult) -> Self {
        let mut invoker = Self::default();
        invoker.results.insert(tool.to_string(), result);
        invoker
    }

    fn calls(&self) -> Vec<PlannedCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolInvoker for RecordingInvoker {
    async fn invoke(&self, _server: &ToolServer, call: &PlannedCall) -> CallResult {
        self.calls.lock().unwrap().push(call.clone());
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.results
            .get(&call.tool_name)
            .cloned()
            .unwrap_or_else(|| CallResult::ok(format!("{} ok", call.tool_name)))
    }
}

/// Blocks every call until released, reporting each start.
struct BlockingInvoker {
    started: mpsc::UnboundedSender<String>,
    release: Notify,
    calls: StdMutex<Vec<String>>,
}

impl BlockingInvoker {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (started, rx) = mpsc::unbounded_channel();
        let invoker = Arc::new(Self {
            started,
            release: Notify::new(),
            calls: StdMutex::new(Vec::new()),
        });
        (invoker, rx)
    }
}

#[async_trait]
impl ToolInvoker for BlockingInvoker {
    async fn invoke(&self, _server: &ToolServer, call: &PlannedCall) -> CallResult {
        self.calls.lock().unwrap().push(call.tool_name.clone());
        let _ = self.started.send(call.tool_name.clone());
        self.release.notified().await;
        CallResult::ok(format!("{} ok", call.tool_name))
    }
}

/// Fails the first terminal tag update, then behaves normally.
struct FlakyTagStore {
    inner: MemoryConversationStore,
    failed: AtomicBool,
}

#[async_trait]
impl ConversationStore for FlakyTagStore {
    async fn load(&self, conversation_id: &str) -> Result<Conversation, StoreError> {
        self.inner.load(conversation_id).await
    }

    async fn save(&self, conversation: Conversation) {
        self.inner.save(conversation).await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> Result<(), StoreError> {
        self.inner.append_message(conversation_id, message).await
    }

    async fn replace_message_content(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .replace_message_content(conversation_id, message_id, content)
            .await
    }

    async fn set_message_reasoning(
        &self,
        conversation_id: &str,
        message_id: &str,
        reasoning: Option<String>,
    ) -> Result<(), StoreError> {
        self.inner
            .set_message_reasoning(conversation_id, message_id, reasoning)
            .await
    }

    async fn upsert_tag(
        &self,
        conversation_id: &str,
        message_id: &str,
        tag: Tag,
    ) -> Result<(), StoreError> {
        if tag.status == TagStatus::Success && !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::UnknownMessage {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        self.inner.upsert_tag(conversation_id, message_id, tag).await
    }
}

struct Harness {
    orchestrator: Arc<RoundOrchestrator>,
    store: Arc<dyn ConversationStore>,
    conversation_id: String,
}

fn catalog() -> ToolCatalog {
    let server = |id: &str, tools: &[&str]| {
        let mut server = ToolServer::new(id, format!("https://{id}.test/mcp"), ProtocolKind::Buffered);
        server.tools = tools
            .iter()
            .map(|name| ToolDescriptor {
                name: name.to_string(),
                ..ToolDescriptor::default()
            })
            .collect();
        server
    };
    ToolCatalog::new(vec![server("s1", &["t", "search"]), server("s2", &["other"])])
}

async fn harness(
    provider: Arc<dyn ChatProvider>,
    invoker: Arc<dyn ToolInvoker>,
    engine: EngineSettings,
) -> Harness {
    harness_with_store(provider, invoker, engine, Arc::new(MemoryConversationStore::new())).await
}

async fn harness_with_store(
    provider: Arc<dyn ChatProvider>,
    invoker: Arc<dyn ToolInvoker>,
    engine: EngineSettings,
    store: Arc<dyn ConversationStore>,
) -> Harness {
    let config = EngineConfig {
        engine,
        providers: vec![ProviderConfig {
            id: "local".to_string(),
            base_url: "http://127.0.0.1:9/v1".to_string(),
            model: "test-model".to_string(),
            api_key_header: None,
            extra_headers: Vec::new(),
            oauth: None,
        }],
        tool_servers: Vec::new(),
    };
    let credentials = CredentialManager::new(
        Arc::new(MemoryCredentialStore::with("local", ProviderCredential::api_key("sk-test"))),
        Arc::new(HttpOAuthRefresher::new(Duration::from_secs(1)).expect("client")),
    );
    let conversation = Conversation::new("test");
    let conversation_id = conversation.id.clone();
    store.save(conversation).await;

    let orchestrator = Arc::new(RoundOrchestrator::new(
        provider,
        invoker,
        Arc::new(catalog()),
        Arc::new(credentials),
        store.clone(),
        Arc::new(config),
    ));
    Harness {
        orchestrator,
        store,
        conversation_id,
    }
}

fn request(conversation_id: &str, prompt: &str) -> TurnRequest {
    TurnRequest {
        conversation_id: conversation_id.to_string(),
        provider_id: None,
        model: None,
        user_message: Some(prompt.to_string()),
    }
}

fn content(text: &str) -> StreamMessage {
    StreamMessage::Content(text.to_string())
}

fn drain(mut events: mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    collected
}

fn visible_text(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::Visible(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn duplicate_calls_execute_once_and_both_tags_resolve() {
    let call = r#"<tool_call>{"serverId":"s1","toolName":"t","arguments":{}}</tool_call>"#;
    let provider = ScriptedProvider::new(vec![
        vec![content("Checking."), content(call), content(call), StreamMessage::End],
        vec![content("All done."), StreamMessage::End],
    ]);
    let invoker = Arc::new(RecordingInvoker::default());
    let h = harness(provider.clone(), invoker.clone(), EngineSettings::default()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "go"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(
        outcome,
        TurnOutcome {
            state: TurnState::Done,
            rounds: 2,
            tool_calls: 1,
            error: None,
        }
    );
    assert_eq!(invoker.calls().len(), 1);

    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let roles: Vec<&str> = conversation.messages.iter().map(|m| m.role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", TOOL_RESULTS_ROLE, "assistant"]);

    let first_reply = &conversation.messages[1];
    assert_eq!(first_reply.content, "Checking.");
    assert_eq!(first_reply.tags.len(), 2);
    for tag in &first_reply.tags {
        assert_eq!(tag.status, TagStatus::Success);
        let payload = tag.payload().expect("payload");
        assert_eq!(payload.result.as_deref(), Some("t ok"));
        assert_eq!(payload.progress, 100);
    }
    assert_eq!(conversation.messages[3].content, "All done.");

    let second_request = &provider.requests()[1];
    let last = second_request.last().expect("context message");
    assert_eq!(last.role, "user");
    assert!(last.content.contains("[s1/t] {}"));
    assert_eq!(second_request[0].role, "system");

    let events = drain(rx);
    assert_eq!(visible_text(&events), "Checking.All done.");
}

#[tokio::test]
async fn calls_over_the_budget_are_dropped() {
    let provider = ScriptedProvider::new(vec![vec![
        content(r#"<tool_call>{"calls":[{"toolName":"t","arguments":{"a":1}},{"toolName":"search"},{"toolName":"other"}]}</tool_call>"#),
        StreamMessage::End,
    ]]);
    let invoker = Arc::new(RecordingInvoker::default());
    let engine = EngineSettings {
        max_calls_per_round: 2,
        ..EngineSettings::default()
    };
    let h = harness(provider, invoker.clone(), engine).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "go"), tx, CancellationToken::new())
        .await
        .expect("turn");

    let tools: Vec<String> = invoker.calls().into_iter().map(|c| c.tool_name).collect();
    assert_eq!(tools.len(), 2);
    assert!(!tools.contains(&"other".to_string()));
    assert_eq!(outcome.tool_calls, 2);
    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.messages[1].tags.len(), 2);
}

#[tokio::test]
async fn reply_without_calls_finishes_in_one_round() {
    let provider = ScriptedProvider::new(vec![vec![
        content("Hello <thin"),
        content("king>reasoning here</thinking> world"),
        StreamMessage::End,
    ]]);
    let invoker = Arc::new(RecordingInvoker::default());
    let h = harness(provider, invoker.clone(), EngineSettings::default()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "hi"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(outcome.rounds, 1);
    assert!(invoker.calls().is_empty());
    let events = drain(rx);
    assert_eq!(visible_text(&events), "Hello  world");

    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let reply = &conversation.messages[1];
    assert_eq!(reply.content, "Hello  world");
    assert_eq!(reply.reasoning.as_deref(), Some("reasoning here"));
}

#[tokio::test]
async fn stream_failure_without_content_fails_the_turn() {
    let provider = ScriptedProvider::new(vec![vec![
        StreamMessage::Error("API Error: 401".to_string()),
        StreamMessage::End,
    ]]);
    let h = harness(provider, Arc::new(RecordingInvoker::default()), EngineSettings::default()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "hi"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(outcome.state, TurnState::Failed);
    assert_eq!(outcome.error.as_deref(), Some("API Error: 401"));
    assert!(!drain(rx)
        .iter()
        .any(|event| matches!(event, TurnEvent::StreamError(_))));
}

#[tokio::test]
async fn stream_failure_after_content_keeps_partial_reply() {
    let provider = ScriptedProvider::new(vec![vec![
        content(r#"Partial answer <tool_call>{"toolName":"t"}</tool_call>"#),
        StreamMessage::Error("connection reset".to_string()),
        StreamMessage::End,
    ]]);
    let invoker = Arc::new(RecordingInvoker::default());
    let h = harness(provider, invoker.clone(), EngineSettings::default()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "hi"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(outcome.error.as_deref(), Some("connection reset"));
    assert!(invoker.calls().is_empty());
    assert!(drain(rx).contains(&TurnEvent::StreamError("connection reset".to_string())));
    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.messages[1].content, "Partial answer ");
}

#[tokio::test]
async fn stop_during_stream_ends_the_turn() {
    let provider = ScriptedProvider::hanging(vec![content(
        r#"Working <tool_call>{"toolName":"t"}</tool_call>"#,
    )]);
    let invoker = Arc::new(RecordingInvoker::default());
    let h = harness(provider, invoker.clone(), EngineSettings::default()).await;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::clone(&h.orchestrator);
    let turn = tokio::spawn({
        let cancel = cancel.clone();
        let request = request(&h.conversation_id, "hi");
        async move { orchestrator.run_turn(request, tx, cancel).await }
    });

    while let Some(event) = rx.recv().await {
        if matches!(event, TurnEvent::Visible(_)) {
            break;
        }
    }
    cancel.cancel();
    let outcome = turn.await.expect("join").expect("turn");

    assert_eq!(outcome.state, TurnState::Stopped);
    assert!(invoker.calls().is_empty());
    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    assert_eq!(conversation.messages[1].content, "Working ");
}

#[tokio::test]
async fn second_turn_on_a_busy_conversation_is_rejected() {
    let provider = ScriptedProvider::hanging(vec![content("thinking about it")]);
    let h = harness(provider, Arc::new(RecordingInvoker::default()), EngineSettings::default()).await;

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::clone(&h.orchestrator);
    let turn = tokio::spawn({
        let cancel = cancel.clone();
        let request = request(&h.conversation_id, "hi");
        async move { orchestrator.run_turn(request, tx, cancel).await }
    });
    while let Some(event) = rx.recv().await {
        if matches!(event, TurnEvent::RoundStarted { .. }) {
            break;
        }
    }

    let (tx2, _rx2) = mpsc::unbounded_channel();
    let second = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "again"), tx2, CancellationToken::new())
        .await;
    assert!(matches!(second, Err(TurnError::Busy(id)) if id == h.conversation_id));

    cancel.cancel();
    turn.await.expect("join").expect("turn");

    let (tx3, _rx3) = mpsc::unbounded_channel();
    let stopped = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "after"), tx3, CancellationToken::new())
        .await
        .expect("turn after release");
    assert_eq!(stopped.state, TurnState::Done);
}

#[tokio::test]
async fn unknown_tool_gets_an_error_tag_and_context_entry() {
    let provider = ScriptedProvider::new(vec![vec![
        content(r#"<tool_call>{"toolName":"ghost"}</tool_call>"#),
        StreamMessage::End,
    ]]);
    let invoker = Arc::new(RecordingInvoker::default());
    let h = harness(provider, invoker.clone(), EngineSettings::default()).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "hi"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(outcome.rounds, 1);
    assert_eq!(outcome.tool_calls, 0);
    assert!(invoker.calls().is_empty());
    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let tag = &conversation.messages[1].tags[0];
    assert_eq!(tag.status, TagStatus::Error);
    assert!(tag.payload().unwrap().error.unwrap().contains("ghost"));
    let context = conversation.messages.last().unwrap();
    assert_eq!(context.role, Role::Other(TOOL_RESULTS_ROLE.to_string()));
    assert!(context.content.contains("status: error"));
}

#[tokio::test]
async fn failed_calls_resolve_tags_to_error() {
    let provider = ScriptedProvider::new(vec![
        vec![content(r#"<tool_call>{"toolName":"search","arguments":{"q":"x"}}</tool_call>"#), StreamMessage::End],
        vec![content("Sorry."), StreamMessage::End],
    ]);
    let invoker = Arc::new(RecordingInvoker::with_result(
        "search",
        CallResult::failure("HTTP error: 503"),
    ));
    let h = harness(provider, invoker, EngineSettings::default()).await;

    let (tx, rx) = mpsc::unbounded_channel();
    h.orchestrator
        .run_turn(request(&h.conversation_id, "hi"), tx, CancellationToken::new())
        .await
        .expect("turn");

    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let tag = &conversation.messages[1].tags[0];
    assert_eq!(tag.status, TagStatus::Error);
    let payload = tag.payload().unwrap();
    assert_eq!(payload.error.as_deref(), Some("HTTP error: 503"));
    assert_eq!(payload.server_id.as_deref(), Some("s1"));
    assert!(payload.elapsed_ms.is_some());

    let statuses: Vec<TagStatus> = drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            TurnEvent::TagUpdated { tag, .. } => Some(tag.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![TagStatus::Running, TagStatus::Error]);
}

#[tokio::test]
async fn round_limit_bounds_the_turn() {
    let call = || {
        vec![
            content(r#"<tool_call>{"toolName":"t"}</tool_call>"#),
            StreamMessage::End,
        ]
    };
    let provider = ScriptedProvider::new(vec![call(), call(), call()]);
    let invoker = Arc::new(RecordingInvoker::default());
    let engine = EngineSettings {
        max_rounds: 2,
        ..EngineSettings::default()
    };
    let h = harness(provider.clone(), invoker.clone(), engine).await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "loop"), tx, CancellationToken::new())
        .await
        .expect("turn");

    assert_eq!(outcome.rounds, 2);
    assert_eq!(outcome.state, TurnState::Done);
    assert_eq!(invoker.calls().len(), 2);
    assert_eq!(provider.requests().len(), 2);
}

#[tokio::test]
async fn unknown_conversation_is_an_error() {
    let provider = ScriptedProvider::new(Vec::new());
    let h = harness(provider, Arc::new(RecordingInvoker::default()), EngineSettings::default()).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = h
        .orchestrator
        .run_turn(request("missing", "hi"), tx, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TurnError::Store(StoreError::UnknownConversation(_)))));
}

#[tokio::test]
async fn stop_during_tool_execution_resolves_every_tag() {
    let provider = ScriptedProvider::new(vec![
        vec![
            content(r#"<tool_call>{"calls":[{"toolName":"t"},{"toolName":"search"}]}</tool_call>"#),
            StreamMessage::End,
        ],
        vec![content("never requested"), StreamMessage::End],
    ]);
    let (invoker, mut started) = BlockingInvoker::new();
    let engine = EngineSettings {
        parallel_calls: 1,
        ..EngineSettings::default()
    };
    let h = harness(provider.clone(), invoker.clone(), engine).await;

    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let orchestrator = Arc::clone(&h.orchestrator);
    let turn = tokio::spawn({
        let cancel = cancel.clone();
        let request = request(&h.conversation_id, "go");
        async move { orchestrator.run_turn(request, tx, cancel).await }
    });

    assert_eq!(started.recv().await.as_deref(), Some("t"));
    cancel.cancel();
    invoker.release.notify_one();
    let outcome = turn.await.expect("join").expect("turn");

    assert_eq!(outcome.state, TurnState::Stopped);
    assert_eq!(outcome.rounds, 1);
    assert_eq!(provider.requests().len(), 1);
    assert_eq!(*invoker.calls.lock().unwrap(), vec!["t".to_string()]);

    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let tags = &conversation.messages[1].tags;
    assert_eq!(tags.len(), 2);
    let by_tool = |name: &str| {
        tags.iter()
            .find(|tag| tag.title == name)
            .unwrap_or_else(|| panic!("tag for {name}"))
    };
    assert_eq!(by_tool("t").status, TagStatus::Success);
    let skipped = by_tool("search");
    assert_eq!(skipped.status, TagStatus::Error);
    assert_eq!(
        skipped.payload().unwrap().error.as_deref(),
        Some(SKIPPED_AFTER_STOP)
    );
    assert!(tags.iter().all(|tag| tag.status != TagStatus::Running));
    let context = conversation.messages.last().unwrap();
    assert_eq!(context.role, Role::Other(TOOL_RESULTS_ROLE.to_string()));
}

#[tokio::test]
async fn store_failure_mid_round_leaves_no_running_tags() {
    let provider = ScriptedProvider::new(vec![vec![
        content(r#"<tool_call>{"toolName":"t"}</tool_call>"#),
        StreamMessage::End,
    ]]);
    let store = Arc::new(FlakyTagStore {
        inner: MemoryConversationStore::new(),
        failed: AtomicBool::new(false),
    });
    let h = harness_with_store(
        provider,
        Arc::new(RecordingInvoker::default()),
        EngineSettings::default(),
        store,
    )
    .await;

    let (tx, rx) = mpsc::unbounded_channel();
    let result = h
        .orchestrator
        .run_turn(request(&h.conversation_id, "go"), tx, CancellationToken::new())
        .await;
    assert!(matches!(result, Err(TurnError::Store(StoreError::UnknownMessage { .. }))));

    let conversation = h.store.load(&h.conversation_id).await.unwrap();
    let tag = &conversation.messages[1].tags[0];
    assert_eq!(tag.status, TagStatus::Error);
    assert_eq!(tag.payload().unwrap().error.as_deref(), Some(ABANDONED_CALL));

    let statuses: Vec<TagStatus> = drain(rx)
        .into_iter()
        .filter_map(|event| match event {
            TurnEvent::TagUpdated { tag, .. } => Some(tag.status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![TagStatus::Running, TagStatus::Error]);
}
