//! Ephemeral credentials and SDP signaling.
//!
//! The session never holds a long-lived API key: a [`TokenBroker`] issues a
//! short-lived credential per connection attempt, and [`SdpSignaling`] uses it
//! to trade the local SDP offer for the remote answer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::errors::{ConnectionError, ConnectionResult};

/// Default timeout for credential requests.
pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Credential
// =============================================================================

/// Short-lived credential for one connection attempt. Zeroized on drop.
#[derive(Clone)]
pub struct EphemeralCredential {
    value: String,
    expires_at: Option<OffsetDateTime>,
}

impl EphemeralCredential {
    pub fn new(value: impl Into<String>, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Credential from a unix expiry timestamp (seconds).
    pub fn with_unix_expiry(value: impl Into<String>, expires_at: Option<i64>) -> Self {
        let expires_at = expires_at.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        Self::new(value, expires_at)
    }

    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= OffsetDateTime::now_utc())
    }
}

impl fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("value", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Drop for EphemeralCredential {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

// =============================================================================
// Token Broker
// =============================================================================

/// Issues ephemeral credentials.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential>;
}

/// Broker that always returns the same credential.
#[derive(Debug, Clone)]
pub struct StaticTokenBroker {
    credential: EphemeralCredential,
}

impl StaticTokenBroker {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: EphemeralCredential::new(token, None),
        }
    }
}

#[async_trait]
impl TokenBroker for StaticTokenBroker {
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
        Ok(self.credential.clone())
    }
}

#[derive(Deserialize)]
struct ClientSecret {
    value: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Flat {
        token: String,
        #[serde(default)]
        expires_at: Option<i64>,
    },
    Nested {
        client_secret: ClientSecret,
    },
}

/// Broker backed by an HTTP endpoint.
///
/// POSTs `{"restaurant_id": ...}` and accepts either `{token, expires_at}` or
/// `{client_secret: {value, expires_at}}`.
pub struct HttpTokenBroker {
    client: reqwest::Client,
    url: String,
    restaurant_id: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTokenBroker {
    pub fn new(url: impl Into<String>, restaurant_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            restaurant_id: restaurant_id.into(),
            api_key: None,
            timeout: DEFAULT_CREDENTIAL_TIMEOUT,
        }
    }

    /// Authenticate broker requests with a bearer key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Drop for HttpTokenBroker {
    fn drop(&mut self) {
        if let Some(key) = self.api_key.as_mut() {
            key.zeroize();
        }
    }
}

#[async_trait]
impl TokenBroker for HttpTokenBroker {
    async fn fetch(&self) -> ConnectionResult<EphemeralCredential> {
        debug!(url = %self.url, restaurant_id = %self.restaurant_id, "Requesting ephemeral credential");

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "restaurant_id": self.restaurant_id }));
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectionError::Credential(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                ))
            } else {
                ConnectionError::Credential(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ConnectionError::Credential(format!(
                "HTTP {status} - {error_text}"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::Credential(format!("Failed to parse response: {e}")))?;

        let credential = match body {
            TokenResponse::Flat { token, expires_at } => {
                EphemeralCredential::with_unix_expiry(token, expires_at)
            }
            TokenResponse::Nested { client_secret } => {
                EphemeralCredential::with_unix_expiry(client_secret.value, client_secret.expires_at)
            }
        };

        if credential.is_expired() {
            return Err(ConnectionError::CredentialExpired);
        }
        info!(expires_at = ?credential.expires_at(), "Obtained ephemeral credential");
        Ok(credential)
    }
}

// =============================================================================
// SDP Signaling
// =============================================================================

/// Exchanges an SDP offer for an answer over HTTP.
#[derive(Debug, Clone)]
pub struct SdpSignaling {
    client: reqwest::Client,
    url: String,
    model: Option<String>,
    timeout: Duration,
}

impl SdpSignaling {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            model: None,
            timeout: Duration::from_secs(10),
        }
    }

    /// Send `?model=` with the offer.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// POST the offer; the response body is the answer SDP.
    pub async fn exchange(
        &self,
        offer_sdp: &str,
        credential: &EphemeralCredential,
    ) -> ConnectionResult<String> {
        if credential.is_expired() {
            return Err(ConnectionError::CredentialExpired);
        }

        let mut request = self.client.post(&self.url).timeout(self.timeout);
        if let Some(model) = &self.model {
            request = request.query(&[("model", model.as_str())]);
        }

        let response = request
            .header("Authorization", format!("Bearer {}", credential.secret()))
            .header("Content-Type", "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| ConnectionError::Signaling(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ConnectionError::Signaling(format!(
                "HTTP {status} - {error_text}"
            )));
        }

        let answer = response
            .text()
            .await
            .map_err(|e| ConnectionError::Signaling(format!("Failed to read answer: {e}")))?;
        if answer.trim().is_empty() {
            return Err(ConnectionError::Signaling("empty SDP answer".to_string()));
        }
        debug!(bytes = answer.len(), "Received SDP answer");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_expiry() {
        let past = OffsetDateTime::now_utc().unix_timestamp() - 60;
        let future = OffsetDateTime::now_utc().unix_timestamp() + 60;

        assert!(EphemeralCredential::with_unix_expiry("ek_1", Some(past)).is_expired());
        assert!(!EphemeralCredential::with_unix_expiry("ek_1", Some(future)).is_expired());
        assert!(!EphemeralCredential::new("ek_1", None).is_expired());
    }

    #[test]
    fn test_credential_debug_redacts_secret() {
        let credential = EphemeralCredential::new("ek_secret", None);
        let debug = format!("{credential:?}");
        assert!(!debug.contains("ek_secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_token_response_shapes() {
        let flat: TokenResponse =
            serde_json::from_str(r#"{"token":"ek_1","expires_at":1700000000}"#).unwrap();
        assert!(matches!(flat, TokenResponse::Flat { expires_at: Some(1700000000), .. }));

        let nested: TokenResponse =
            serde_json::from_str(r#"{"client_secret":{"value":"ek_2","expires_at":1700000000}}"#)
                .unwrap();
        assert!(matches!(nested, TokenResponse::Nested { .. }));
    }

    #[tokio::test]
    async fn test_static_broker() {
        let broker = StaticTokenBroker::new("ek_static");
        assert_eq!(broker.fetch().await.unwrap().secret(), "ek_static");
    }
}
