use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::Value;

use crate::core::config::OAuthSettings;
use crate::core::credentials::{CredentialError, ProviderCredential};

/// Refresh this long before the recorded expiry.
pub const OAUTH_REFRESH_SKEW_MS: i64 = 60_000;

const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

pub fn current_unix_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

/// A credential without a recorded expiry is treated as still valid.
pub fn needs_refresh(expires_at_ms: Option<i64>, now_ms: i64, skew_ms: i64) -> bool {
    match expires_at_ms {
        Some(expires_at) => now_ms.saturating_add(skew_ms) >= expires_at,
        None => false,
    }
}

/// Folds a token endpoint reply into the stored record. The previous refresh
/// and identity tokens survive when the server does not rotate them.
pub fn apply_token_response(
    existing: &ProviderCredential,
    token: OAuthTokenResponse,
    now_ms: i64,
) -> ProviderCredential {
    let expires_at_ms = token
        .expires_in
        .and_then(|seconds| seconds.checked_mul(1000))
        .and_then(|millis| now_ms.checked_add(millis));

    let mut updated = ProviderCredential {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .filter(|value| !value.is_empty())
            .or_else(|| existing.refresh_token.clone()),
        id_token: token
            .id_token
            .filter(|value| !value.is_empty())
            .or_else(|| existing.id_token.clone()),
        account_id: existing.account_id.clone(),
        email: existing.email.clone(),
        expires_at_ms,
        oauth_provider: existing.oauth_provider.clone(),
    };
    updated.patch_identity();
    updated
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub email: Option<String>,
    pub account_id: Option<String>,
}

/// Reads `email` and an account id out of a JWT payload without verifying
/// the signature.
pub fn identity_claims(id_token: &str) -> Option<IdentityClaims> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;

    let string_claim = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    };

    let account_id = string_claim(claims.get("chatgpt_account_id"))
        .or_else(|| {
            string_claim(
                claims
                    .get(OPENAI_AUTH_CLAIM)
                    .and_then(|auth| auth.get("chatgpt_account_id")),
            )
        })
        .or_else(|| string_claim(claims.get("account_id")))
        .or_else(|| string_claim(claims.get("sub")));

    Some(IdentityClaims {
        email: string_claim(claims.get("email")),
        account_id,
    })
}

#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(
        &self,
        settings: &OAuthSettings,
        refresh_token: &str,
    ) -> Result<OAuthTokenResponse, CredentialError>;
}

pub struct HttpOAuthRefresher {
    client: reqwest::Client,
}

impl HttpOAuthRefresher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl OAuthRefresher for HttpOAuthRefresher {
    async fn refresh(
        &self,
        settings: &OAuthSettings,
        refresh_token: &str,
    ) -> Result<OAuthTokenResponse, CredentialError> {
        let mut form_fields = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = settings
            .client_id
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            form_fields.push(("client_id", client_id));
        }

        let response = self
            .client
            .post(&settings.token_endpoint)
            .form(&form_fields)
            .send()
            .await
            .map_err(|err| CredentialError::Refresh(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(CredentialError::Refresh(format!(
                "OAuth refresh failed ({status}): {text}"
            )));
        }

        response
            .json::<OAuthTokenResponse>()
            .await
            .map_err(|err| CredentialError::Refresh(err.to_string()))
    }
}
