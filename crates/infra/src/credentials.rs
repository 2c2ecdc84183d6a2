//! Access tokens for authenticated targets.
//!
//! Tokens are cached per target until 90% of their advertised lifetime has
//! passed. Concurrent misses may each fetch a token; the last one stored wins
//! and every fetched token is valid, so no lock is held across the fetch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use clinsync_core::TargetSystem;

const DEFAULT_EXPIRES_IN: u64 = 3600;
const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("no credentials configured for {0}")]
    NotConfigured(TargetSystem),
    #[error("token request failed: {0}")]
    Request(String),
    #[error("token request timed out: {0}")]
    Timeout(String),
    #[error("token endpoint rejected credentials ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub expires_in: Duration,
}

/// Source of fresh tokens.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self, target: TargetSystem) -> Result<AccessToken, CredentialError>;
}

/// OAuth2 client-credentials grant settings for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-credentials grant over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTokenFetcher {
    client: reqwest::Client,
    credentials: HashMap<TargetSystem, ClientCredentials>,
    request_timeout: Duration,
}

impl HttpTokenFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            credentials: HashMap::new(),
            request_timeout: DEFAULT_TOKEN_TIMEOUT,
        }
    }

    /// Upper bound for one token request, body included.
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_credentials(mut self, target: TargetSystem, credentials: ClientCredentials) -> Self {
        self.credentials.insert(target, credentials);
        self
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch(&self, target: TargetSystem) -> Result<AccessToken, CredentialError> {
        let creds = self
            .credentials
            .get(&target)
            .ok_or(CredentialError::NotConfigured(target))?;

        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
        ];
        if let Some(scope) = creds.scope.as_deref() {
            form.push(("scope", scope));
        }

        let response = self
            .client
            .post(&creds.token_url)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CredentialError::Timeout(e.to_string())
                } else {
                    CredentialError::MalformedResponse(e.to_string())
                }
            })?;
        if token.access_token.is_empty() {
            return Err(CredentialError::MalformedResponse("empty access_token".into()));
        }

        Ok(AccessToken {
            value: token.access_token,
            expires_in: Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
        })
    }
}

fn request_error(err: reqwest::Error) -> CredentialError {
    if err.is_timeout() {
        CredentialError::Timeout(err.to_string())
    } else {
        CredentialError::Request(err.to_string())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Per-target token cache.
pub struct CredentialCache {
    fetcher: Arc<dyn TokenFetcher>,
    tokens: RwLock<HashMap<TargetSystem, CachedToken>>,
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache").finish_non_exhaustive()
    }
}

impl CredentialCache {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self {
            fetcher,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// A token valid for at least the rest of its cache window.
    pub async fn get_token(&self, target: TargetSystem) -> Result<String, CredentialError> {
        if let Some(cached) = self.tokens.read().await.get(&target) {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        debug!(target_system = %target, "fetching access token");
        let token = self.fetcher.fetch(target).await?;
        let refresh_at = Instant::now() + token.expires_in.mul_f64(0.9);

        self.tokens.write().await.insert(
            target,
            CachedToken {
                value: token.value.clone(),
                refresh_at,
            },
        );
        info!(
            target_system = %target,
            expires_in_secs = token.expires_in.as_secs(),
            "access token refreshed"
        );
        Ok(token.value)
    }

    /// Forget the cached token, e.g. after the target answered 401.
    pub async fn invalidate(&self, target: TargetSystem) {
        self.tokens.write().await.remove(&target);
    }
}
