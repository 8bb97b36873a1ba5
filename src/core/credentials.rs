//! Provider credentials and the refresh-before-use contract.
//!
//! [`CredentialManager::ensure_valid`] is called before every provider
//! request. Static API keys pass straight through; OAuth-backed records get
//! their identity claims patched and are refreshed when close to expiry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::config::OAuthSettings;
use crate::core::oauth::{
    apply_token_response, current_unix_epoch_ms, identity_claims, needs_refresh, OAuthRefresher,
    OAUTH_REFRESH_SKEW_MS,
};

pub const KEYRING_SERVICE: &str = "toolstream";

#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_provider: Option<String>,
}

impl ProviderCredential {
    pub fn api_key(token: impl Into<String>) -> Self {
        Self {
            access_token: token.into(),
            ..Self::default()
        }
    }

    /// Fills a missing account id or email from the identity token.
    /// Returns true when anything changed.
    pub fn patch_identity(&mut self) -> bool {
        if self.account_id.is_some() && self.email.is_some() {
            return false;
        }
        let Some(claims) = self.id_token.as_deref().and_then(identity_claims) else {
            return false;
        };
        let mut changed = false;
        if self.account_id.is_none() && claims.account_id.is_some() {
            self.account_id = claims.account_id;
            changed = true;
        }
        if self.email.is_none() && claims.email.is_some() {
            self.email = claims.email;
            changed = true;
        }
        changed
    }
}

impl fmt::Debug for ProviderCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field("account_id", &self.account_id)
            .field("email", &self.email)
            .field("expires_at_ms", &self.expires_at_ms)
            .field("oauth_provider", &self.oauth_provider)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No credential stored for provider {0}")]
    Missing(String),
    #[error("Credential store error: {0}")]
    Store(String),
    #[error("{0}")]
    Refresh(String),
    #[error("No OAuth token endpoint configured for {0}; re-auth required.")]
    MissingEndpoint(String),
}

impl From<keyring::Error> for CredentialError {
    fn from(err: keyring::Error) -> Self {
        CredentialError::Store(err.to_string())
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self, provider_id: &str) -> Result<Option<ProviderCredential>, CredentialError>;
    fn save(&self, provider_id: &str, credential: &ProviderCredential)
        -> Result<(), CredentialError>;
}

/// One JSON-encoded record per provider in the platform keyring.
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self, provider_id: &str) -> Result<Option<ProviderCredential>, CredentialError> {
        let entry = Entry::new(&self.service, provider_id)?;
        match entry.get_password() {
            // Entries written by hand are usually a bare API key.
            Ok(secret) => Ok(Some(
                serde_json::from_str(&secret)
                    .unwrap_or_else(|_| ProviderCredential::api_key(secret.trim())),
            )),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(
        &self,
        provider_id: &str,
        credential: &ProviderCredential,
    ) -> Result<(), CredentialError> {
        let encoded = serde_json::to_string(credential)
            .map_err(|err| CredentialError::Store(err.to_string()))?;
        let entry = Entry::new(&self.service, provider_id)?;
        entry.set_password(&encoded)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    records: StdMutex<HashMap<String, ProviderCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(provider_id: &str, credential: ProviderCredential) -> Self {
        let store = Self::new();
        store.records_mut().insert(provider_id.to_string(), credential);
        store
    }

    fn records_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProviderCredential>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, provider_id: &str) -> Result<Option<ProviderCredential>, CredentialError> {
        Ok(self.records_mut().get(provider_id).cloned())
    }

    fn save(
        &self,
        provider_id: &str,
        credential: &ProviderCredential,
    ) -> Result<(), CredentialError> {
        self.records_mut()
            .insert(provider_id.to_string(), credential.clone());
        Ok(())
    }
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    refresher: Arc<dyn OAuthRefresher>,
    oauth_clients: HashMap<String, OAuthSettings>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    clock: Clock,
    skew_ms: i64,
}

impl CredentialManager {
    pub fn new(store: Arc<dyn CredentialStore>, refresher: Arc<dyn OAuthRefresher>) -> Self {
        Self {
            store,
            refresher,
            oauth_clients: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
            clock: Arc::new(current_unix_epoch_ms),
            skew_ms: OAUTH_REFRESH_SKEW_MS,
        }
    }

    /// Registers token endpoints keyed by their `provider` tag.
    pub fn with_oauth_clients(mut self, clients: impl IntoIterator<Item = OAuthSettings>) -> Self {
        self.oauth_clients = clients
            .into_iter()
            .map(|settings| (settings.provider.clone(), settings))
            .collect();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    async fn provider_lock(&self, provider_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(provider_id.to_string()).or_default())
    }

    /// Returns a credential that is safe to use right now.
    ///
    /// Callers for the same provider are serialised, and the record is read
    /// again once the lock is held, so a refresh finished by another caller
    /// is reused instead of repeated. A failed refresh leaves the stored
    /// record untouched.
    pub async fn ensure_valid(
        &self,
        provider_id: &str,
        force_refresh: bool,
    ) -> Result<ProviderCredential, CredentialError> {
        let lock = self.provider_lock(provider_id).await;
        let _guard = lock.lock().await;

        let mut credential = self
            .store
            .load(provider_id)?
            .ok_or_else(|| CredentialError::Missing(provider_id.to_string()))?;
        let Some(oauth_provider) = credential.oauth_provider.clone() else {
            return Ok(credential);
        };

        if credential.patch_identity() {
            debug!(provider = %provider_id, "Patched credential identity from id token");
            self.store.save(provider_id, &credential)?;
        }

        let Some(refresh_token) = credential.refresh_token.clone() else {
            return Ok(credential);
        };
        let now_ms = (self.clock)();
        if !force_refresh && !needs_refresh(credential.expires_at_ms, now_ms, self.skew_ms) {
            return Ok(credential);
        }

        let settings = self
            .oauth_clients
            .get(&oauth_provider)
            .ok_or_else(|| CredentialError::MissingEndpoint(oauth_provider.clone()))?;
        let token = match self.refresher.refresh(settings, &refresh_token).await {
            Ok(token) => token,
            Err(err) => {
                warn!(provider = %provider_id, error = %err, "Credential refresh failed");
                return Err(err);
            }
        };
        let updated = apply_token_response(&credential, token, now_ms);
        self.store.save(provider_id, &updated)?;
        info!(
            provider = %provider_id,
            forced = force_refresh,
            expires_at_ms = ?updated.expires_at_ms,
            "Refreshed provider credential"
        );
        Ok(updated)
    }
}
