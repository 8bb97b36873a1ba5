//! Engine configuration loaded from `config.toml`.
//!
//! The loaded [`EngineConfig`] is immutable; components receive the pieces
//! they need (usually behind an `Arc`) at construction time.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp::catalog::{HeaderEntry, ToolServer};

mod io;


pub use io::{default_config_path, path_display, ConfigError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Calls accepted per round; the rest are dropped.
    pub max_calls_per_round: usize,
    /// Model passes per turn, including the first.
    pub max_rounds: usize,
    pub parallel_calls: usize,
    pub tool_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Per-call cap on result text stored in tags and fed back to the model.
    pub result_truncation_chars: usize,
    /// Cap on the whole tool-results context message.
    pub context_truncation_chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_calls_per_round: 4,
            max_rounds: 6,
            parallel_calls: 3,
            tool_timeout_secs: 30,
            provider_timeout_secs: 300,
            connect_timeout_secs: 10,
            result_truncation_chars: 4000,
            context_truncation_chars: 12000,
            default_provider: None,
        }
    }
}

impl EngineSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Token endpoint used to refresh credentials tagged with `provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSettings {
    pub provider: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    pub model: String,
    /// Sends the key in this header instead of `Authorization: Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_header: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_headers: Vec<HeaderEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_servers: Vec<ToolServer>,
}

impl EngineConfig {
    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|provider| provider.id.eq_ignore_ascii_case(id.trim()))
    }

    /// The explicitly requested provider, else the configured default, else
    /// the only one.
    pub fn select_provider(&self, requested: Option<&str>) -> Result<&ProviderConfig, ConfigError> {
        if let Some(id) = requested.or(self.engine.default_provider.as_deref()) {
            return self
                .provider(id)
                .ok_or_else(|| ConfigError::Invalid(format!("Unknown provider: {id}")));
        }
        match self.providers.as_slice() {
            [only] => Ok(only),
            [] => Err(ConfigError::Invalid("No providers configured".to_string())),
            _ => Err(ConfigError::Invalid(
                "Several providers configured; pick one with --provider or engine.default_provider"
                    .to_string(),
            )),
        }
    }

    pub fn oauth_clients(&self) -> impl Iterator<Item = OAuthSettings> + '_ {
        self.providers
            .iter()
            .filter_map(|provider| provider.oauth.clone())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.max_calls_per_round == 0 || engine.max_rounds == 0 || engine.parallel_calls == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_calls_per_round, max_rounds and parallel_calls must be at least 1"
                    .to_string(),
            ));
        }

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            check_id("provider", &provider.id, &mut provider_ids)?;
            check_http_url(&provider.id, &provider.base_url)?;
            if provider.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Provider {} has no model",
                    provider.id
                )));
            }
        }

        let mut server_ids = HashSet::new();
        for server in &self.tool_servers {
            check_id("tool server", &server.id, &mut server_ids)?;
            check_http_url(&server.id, &server.base_url)?;
        }
        Ok(())
    }
}

fn check_id(kind: &str, id: &str, seen: &mut HashSet<String>) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("A {kind} has an empty id")));
    }
    if !seen.insert(id.trim().to_ascii_lowercase()) {
        return Err(ConfigError::Invalid(format!("Duplicate {kind} id: {id}")));
    }
    Ok(())
}

fn check_http_url(id: &str, url: &str) -> Result<(), ConfigError> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{id}: base_url must start with http:// or https://"
        )))
    }
}
