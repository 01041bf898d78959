//! Ephemeral credential broker.
//!
//! Exchanges the server-held long-lived API key for a short-lived client
//! secret the browser can use directly against the realtime endpoint. The
//! long-lived key never leaves this process: it appears in no response body
//! and no log line.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::upstream::config::{REALTIME_BETA_HEADER, REALTIME_SESSIONS_URL};
use crate::errors::{BridgeError, BridgeResult};

/// Total attempts for transient failures.
const MAX_ATTEMPTS: u32 = 3;
/// Delay before the first retry; doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(250);
/// Deadline per minting request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Short-lived credential handed to the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralCredential {
    /// The ephemeral secret value.
    pub value: String,
    /// Unix timestamp after which the secret is useless.
    pub expires_at: i64,
    /// Model the minted session is bound to.
    pub model: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    client_secret: ClientSecret,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: i64,
}

/// Mints ephemeral credentials from the long-lived key.
#[derive(Clone)]
pub struct CredentialBroker {
    http: reqwest::Client,
    sessions_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl CredentialBroker {
    pub fn new(api_key: &str, model: &str, voice: &str) -> Self {
        Self::with_url(REALTIME_SESSIONS_URL, api_key, model, voice)
    }

    /// Endpoint override, for tests.
    pub fn with_url(sessions_url: &str, api_key: &str, model: &str, voice: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            sessions_url: sessions_url.to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            voice: voice.to_string(),
        }
    }

    /// Obtain a fresh ephemeral credential.
    ///
    /// Transient failures (timeouts, connection resets, 5xx) are retried
    /// with exponential backoff up to three attempts. Provider 4xx means
    /// our key is bad and is never retried.
    pub async fn obtain(&self) -> BridgeResult<EphemeralCredential> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.mint_once().await {
                Ok(credential) => return Ok(credential),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "credential minting failed, retrying");
                    tokio::time::sleep(delay).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| BridgeError::TransientNetwork("credential minting failed".into())))
    }

    async fn mint_once(&self) -> BridgeResult<EphemeralCredential> {
        let response = self
            .http
            .post(&self.sessions_url)
            .bearer_auth(&self.api_key)
            .header(REALTIME_BETA_HEADER.0, REALTIME_BETA_HEADER.1)
            .json(&serde_json::json!({
                "model": self.model,
                "voice": self.voice,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            // Body may describe the rejection; the key itself must not be
            // echoed anywhere.
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::UpstreamAuth(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(BridgeError::TransientNetwork(format!(
                "credential endpoint returned {status}"
            )));
        }

        let session: SessionResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Serialization(format!("invalid session response: {e}")))?;
        debug!(expires_at = session.client_secret.expires_at, "minted ephemeral credential");
        Ok(EphemeralCredential {
            value: session.client_secret.value,
            expires_at: session.client_secret.expires_at,
            model: session.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}
