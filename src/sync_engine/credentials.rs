//! Shared bearer token for download workers.
//!
//! One `CredentialHolder` is shared by every worker of a batch. Refreshes are
//! serialized behind its mutex and tagged with a generation number, so when
//! several workers see the same token expire only the first one goes to the
//! token endpoint and the rest pick up its result.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The token endpoint refused the username/password. Fatal.
    #[error("credentials rejected: {0}")]
    Rejected(String),

    /// The token endpoint could not be reached or answered unexpectedly.
    #[error("token endpoint unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(access_token: String, refresh_token: Option<String>, expires_in: Duration) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at: Instant::now() + expires_in,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN >= self.expires_at
    }
}

/// A token as seen by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub bearer: String,
    /// Bumped every time the holder installs a new token.
    pub generation: u64,
}

/// Talks to the identity provider.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Password grant.
    async fn obtain(&self) -> Result<AccessToken, CredentialError>;

    /// Refresh-token grant.
    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken, CredentialError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// OpenID Connect token endpoint client (Copernicus Data Space identity
/// service by default).
pub struct HttpTokenProvider {
    client: Client,
    token_url: String,
    client_id: String,
    username: String,
    password: String,
}

impl HttpTokenProvider {
    pub fn new(
        token_url: String,
        client_id: String,
        username: String,
        password: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            token_url,
            client_id,
            username,
            password,
        })
    }

    async fn request(&self, form: &[(&str, &str)]) -> Result<AccessToken, CredentialError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| CredentialError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected(format!("{} {}", status, body)));
        }
        if !status.is_success() {
            return Err(CredentialError::Unavailable(format!(
                "token request failed with status {}",
                status
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::Unavailable(format!("bad token response: {}", e)))?;
        Ok(AccessToken::new(
            parsed.access_token,
            parsed.refresh_token,
            Duration::from_secs(parsed.expires_in.unwrap_or(600)),
        ))
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn obtain(&self) -> Result<AccessToken, CredentialError> {
        self.request(&[
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken, CredentialError> {
        self.request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }
}

struct HolderState {
    token: Option<AccessToken>,
    generation: u64,
}

impl HolderState {
    fn snapshot(&self) -> Option<TokenSnapshot> {
        self.token.as_ref().map(|t| TokenSnapshot {
            bearer: t.access_token.clone(),
            generation: self.generation,
        })
    }
}

pub struct CredentialHolder {
    provider: Arc<dyn TokenProvider>,
    state: Mutex<HolderState>,
}

impl CredentialHolder {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(HolderState {
                token: None,
                generation: 0,
            }),
        }
    }

    /// The current token, fetching one first if there is none yet or the one
    /// held has already expired.
    pub async fn current(&self) -> Result<TokenSnapshot, CredentialError> {
        let mut state = self.state.lock().await;
        let usable = state.token.as_ref().map(|t| !t.is_expired()).unwrap_or(false);
        if !usable {
            self.renew(&mut state).await?;
        }
        state
            .snapshot()
            .ok_or_else(|| CredentialError::Unavailable("no token after renewal".to_string()))
    }

    /// Replace the token the caller saw as `observed_generation`. If another
    /// worker already replaced it, the newer token is returned without
    /// contacting the provider.
    pub async fn refresh(&self, observed_generation: u64) -> Result<TokenSnapshot, CredentialError> {
        let mut state = self.state.lock().await;
        if state.generation != observed_generation {
            if let Some(snapshot) = state.snapshot() {
                debug!(
                    "Token already refreshed (generation {} -> {}), reusing it",
                    observed_generation, state.generation
                );
                return Ok(snapshot);
            }
        }
        self.renew(&mut state).await?;
        state
            .snapshot()
            .ok_or_else(|| CredentialError::Unavailable("no token after renewal".to_string()))
    }

    pub async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }

    async fn renew(&self, state: &mut HolderState) -> Result<(), CredentialError> {
        let refresh_token = state.token.as_ref().and_then(|t| t.refresh_token.clone());
        let token = match refresh_token {
            Some(refresh_token) => match self.provider.refresh(&refresh_token).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Token refresh failed ({}), requesting a new one", e);
                    self.provider.obtain().await?
                }
            },
            None => self.provider.obtain().await?,
        };
        state.token = Some(token);
        state.generation += 1;
        info!("Access token renewed (generation {})", state.generation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        obtains: AtomicUsize,
        refreshes: AtomicUsize,
        expires_in: Duration,
        reject_password: bool,
        fail_refresh: bool,
    }

    impl CountingProvider {
        fn new(expires_in: Duration) -> Self {
            Self {
                obtains: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                expires_in,
                reject_password: false,
                fail_refresh: false,
            }
        }
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn obtain(&self) -> Result<AccessToken, CredentialError> {
            if self.reject_password {
                return Err(CredentialError::Rejected("401 invalid_grant".into()));
            }
            let n = self.obtains.fetch_add(1, Ordering::SeqCst) + 1;
            // Give concurrent callers a chance to pile up on the mutex.
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(AccessToken::new(
                format!("password-{}", n),
                Some(format!("refresh-{}", n)),
                self.expires_in,
            ))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<AccessToken, CredentialError> {
            if self.fail_refresh {
                return Err(CredentialError::Rejected("refresh token expired".into()));
            }
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(AccessToken::new(
                format!("refreshed-{}-from-{}", n, refresh_token),
                Some(format!("refresh-r{}", n)),
                self.expires_in,
            ))
        }
    }

    #[tokio::test]
    async fn test_current_obtains_token_once() {
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(600)));
        let holder = CredentialHolder::new(provider.clone());

        assert_eq!(holder.generation().await, 0);
        let first = holder.current().await.unwrap();
        let second = holder.current().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.generation, 1);
        assert_eq!(holder.generation().await, 1);
        assert_eq!(provider.obtains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_of_same_generation_calls_provider_once() {
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(600)));
        let holder = Arc::new(CredentialHolder::new(provider.clone()));
        let observed = holder.current().await.unwrap();

        let tasks = (0..5).map(|_| {
            let holder = holder.clone();
            let generation = observed.generation;
            tokio::spawn(async move { holder.refresh(generation).await.unwrap() })
        });
        let results = futures::future::join_all(tasks).await;

        let snapshots: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert!(snapshots.iter().all(|s| s == &snapshots[0]));
        assert_eq!(snapshots[0].generation, 2);
        assert_eq!(holder.generation().await, 2);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(provider.obtains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_falls_back_to_password_grant() {
        let mut provider = CountingProvider::new(Duration::from_secs(600));
        provider.fail_refresh = true;
        let provider = Arc::new(provider);
        let holder = CredentialHolder::new(provider.clone());

        let first = holder.current().await.unwrap();
        let second = holder.refresh(first.generation).await.unwrap();
        assert_eq!(second.bearer, "password-2");
        assert_eq!(provider.obtains.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_password_is_reported() {
        let mut provider = CountingProvider::new(Duration::from_secs(600));
        provider.reject_password = true;
        let holder = CredentialHolder::new(Arc::new(provider));

        let err = holder.current().await.unwrap_err();
        assert!(matches!(err, CredentialError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_before_use() {
        // Shorter than the expiry margin, so every token is already stale.
        let provider = Arc::new(CountingProvider::new(Duration::from_secs(1)));
        let holder = CredentialHolder::new(provider.clone());

        let first = holder.current().await.unwrap();
        let second = holder.current().await.unwrap();
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
    }
}
