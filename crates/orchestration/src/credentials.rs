//! Short-lived version-control credential, fetched from an upstream token
//! issuer and mirrored into persisted state.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{CredentialError, StoreError};
use crate::state::SharedState;
use crate::types::Credential;

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<Credential, CredentialError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssuedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// POSTs to an issuer endpoint and expects `{ "token", "expiresAt" }`.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    url: String,
    bearer: Option<String>,
    timeout: Duration,
}

impl HttpTokenIssuer {
    pub fn new(client: reqwest::Client, url: impl Into<String>, bearer: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            bearer,
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self) -> Result<Credential, CredentialError> {
        let mut req = self.client.post(&self.url).timeout(self.timeout);
        if let Some(bearer) = &self.bearer {
            req = req.bearer_auth(bearer);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CredentialError::Issuer(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CredentialError::Issuer(format!("issuer answered {status}")));
        }
        let issued: IssuedToken = resp
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        Ok(Credential {
            token: issued.token,
            expires_at: issued.expires_at,
        })
    }
}

/// Issuer used when no upstream is configured; every refresh fails.
pub struct UnconfiguredIssuer;

#[async_trait]
impl TokenIssuer for UnconfiguredIssuer {
    async fn issue(&self) -> Result<Credential, CredentialError> {
        Err(CredentialError::Issuer(
            "no token issuer URL configured".to_string(),
        ))
    }
}

pub struct CredentialRefresher {
    issuer: Arc<dyn TokenIssuer>,
    state: Arc<SharedState>,
    current: RwLock<Option<Credential>>,
}

impl CredentialRefresher {
    /// Starts from whatever credential the persisted state already holds.
    pub async fn from_state(issuer: Arc<dyn TokenIssuer>, state: Arc<SharedState>) -> Self {
        let current = state.read(|s| s.credential.clone()).await;
        Self {
            issuer,
            state,
            current: RwLock::new(current),
        }
    }

    /// Fetch a new credential and replace the old one in memory and on disk.
    /// On failure the last known credential stays in place.
    pub async fn refresh_token(&self) -> Result<Credential, CredentialError> {
        let fresh = match self.issuer.issue().await {
            Ok(credential) => credential,
            Err(err) => {
                warn!("credential refresh failed: {err}");
                return Err(err);
            }
        };
        if fresh.token.is_empty() {
            return Err(CredentialError::InvalidResponse(
                "issuer returned an empty token".to_string(),
            ));
        }

        let persisted = fresh.clone();
        self.state
            .update(|state| {
                state.credential = Some(persisted);
                Ok::<_, StoreError>(())
            })
            .await?;
        if let Ok(mut current) = self.current.write() {
            *current = Some(fresh.clone());
        }

        info!(expires_at = %fresh.expires_at, "credential refreshed");
        Ok(fresh)
    }

    /// Refresh when there is no credential or it expires within `margin`.
    /// Returns whether a refresh happened.
    pub async fn refresh_if_needed(&self, margin: chrono::Duration) -> Result<bool, CredentialError> {
        let due = match self.expires_at() {
            Some(expires_at) => expires_at - margin <= Utc::now(),
            None => true,
        };
        if !due {
            debug!("credential still fresh, skipping refresh");
            return Ok(false);
        }
        self.refresh_token().await.map(|_| true)
    }

    pub fn current(&self) -> Option<Credential> {
        self.current.read().ok().and_then(|c| c.clone())
    }

    pub fn token(&self) -> Option<String> {
        self.current().map(|c| c.token)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.current().map(|c| c.expires_at)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.current().is_some_and(|c| c.is_valid_at(now))
    }
}
