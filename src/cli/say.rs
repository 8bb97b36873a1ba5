//! Non-interactive `say` command: one turn, printed as it streams.

use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::chat_stream::OpenAiCompatibleProvider;
use crate::core::config::EngineConfig;
use crate::core::credentials::{
    CredentialManager, CredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    ProviderCredential,
};
use crate::core::message::{Conversation, Tag, TagStatus};
use crate::core::oauth::HttpOAuthRefresher;
use crate::core::round::{RoundOrchestrator, TurnEvent, TurnRequest, TurnState};
use crate::core::store::{ConversationStore, MemoryConversationStore};
use crate::mcp::catalog::ToolCatalog;
use crate::mcp::client::{ExecutorOptions, ToolExecutor};

pub const API_KEY_ENV: &str = "TOOLSTREAM_API_KEY";

pub async fn run_say(
    config: EngineConfig,
    prompt: Vec<String>,
    provider: Option<String>,
    model: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.trim().is_empty() {
        return Err("Usage: toolstream say <prompt>".into());
    }

    let provider_id = config.select_provider(provider.as_deref())?.id.clone();
    let settings = config.engine.clone();
    let credentials = CredentialManager::new(
        credential_store(&provider_id)?,
        Arc::new(HttpOAuthRefresher::new(settings.connect_timeout() * 3)?),
    )
    .with_oauth_clients(config.oauth_clients().collect::<Vec<_>>());

    let executor = Arc::new(ToolExecutor::new(ExecutorOptions {
        request_timeout: settings.tool_timeout(),
        connect_timeout: settings.connect_timeout(),
        server_messages: None,
    }));
    let store = Arc::new(MemoryConversationStore::new());
    let conversation = Conversation::new(prompt.chars().take(60).collect::<String>());
    let conversation_id = conversation.id.clone();
    store.save(conversation).await;

    let orchestrator = RoundOrchestrator::new(
        Arc::new(OpenAiCompatibleProvider::new(
            settings.connect_timeout(),
            settings.provider_timeout(),
        )?),
        executor.clone(),
        Arc::new(ToolCatalog::new(config.tool_servers.clone())),
        Arc::new(credentials),
        store,
        Arc::new(config),
    );

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(rx));
    let result = orchestrator
        .run_turn(
            TurnRequest {
                conversation_id,
                provider_id: Some(provider_id),
                model,
                user_message: Some(prompt),
            },
            tx,
            cancel,
        )
        .await;

    ctrl_c.abort();
    executor.shutdown().await;
    let _ = printer.await;
    println!();

    let outcome = result?;
    match outcome.state {
        TurnState::Failed => Err(outcome
            .error
            .unwrap_or_else(|| "The turn failed".to_string())
            .into()),
        TurnState::Stopped => {
            eprintln!("⏹️  Stopped");
            Ok(())
        }
        TurnState::Done => Ok(()),
    }
}

/// Keyring first; the environment variable covers machines without one.
fn credential_store(provider_id: &str) -> Result<Arc<dyn CredentialStore>, Box<dyn Error>> {
    let keyring = KeyringCredentialStore::default();
    match keyring.load(provider_id) {
        Ok(Some(_)) => return Ok(Arc::new(keyring)),
        Ok(None) => {}
        Err(err) => tracing::debug!(error = %err, "Keyring unavailable"),
    }
    match std::env::var(API_KEY_ENV) {
        Ok(key) if !key.trim().is_empty() => Ok(Arc::new(MemoryCredentialStore::with(
            provider_id,
            ProviderCredential::api_key(key.trim()),
        ))),
        _ => Err(format!(
            "No credential for provider '{provider_id}'. Store one in the keyring or set {API_KEY_ENV}."
        )
        .into()),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<TurnEvent>) {
    let mut stdout = io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::RoundStarted { round, .. } if round > 1 => {
                let _ = writeln!(stdout);
            }
            TurnEvent::RoundStarted { .. } => {}
            TurnEvent::Visible(text) => {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            }
            TurnEvent::Thinking(text) => eprint!("\x1b[2m{text}\x1b[0m"),
            TurnEvent::TagUpdated { tag, .. } => {
                if let Some(line) = tag_status_line(&tag) {
                    eprintln!("{line}");
                }
            }
            TurnEvent::StreamError(error) => eprintln!("\n❌ {error}"),
        }
    }
}

/// One status line per tag update; `None` for tags without a readable payload.
pub fn tag_status_line(tag: &Tag) -> Option<String> {
    let payload = tag.payload()?;
    let target = match payload.subtitle.trim() {
        "" => payload.name.clone(),
        server => format!("{} ({server})", payload.name),
    };
    let line = match tag.status {
        TagStatus::Running => format!("🔧 {target}…"),
        TagStatus::Success => match payload.elapsed_ms {
            Some(ms) => format!("✅ {target} in {ms} ms"),
            None => format!("✅ {target}"),
        },
        TagStatus::Error => format!(
            "❌ {target}: {}",
            payload.error.as_deref().unwrap_or("failed")
        ),
        TagStatus::Info => format!("ℹ️  {target}"),
    };
    Some(line)
}
