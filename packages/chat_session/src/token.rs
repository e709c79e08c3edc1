//! Bearer token consumption and renewal.
//!
//! Issuance is external: a [`TokenSource`] hands out tokens, the
//! [`TokenCache`] decides when to ask again.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::TokenConfig;
use crate::error::TokenError;

/// Where bearer tokens come from. `Ok(None)` means "no token obtainable"
/// (signed out), as opposed to a failed fetch.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Option<String>, TokenError>;
}

/// Always returns the same token (or none).
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch_token(&self) -> Result<Option<String>, TokenError> {
        Ok(self.token.clone())
    }
}

/// Fetches `{"token": "..."}` from an HTTP endpoint.
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self) -> Result<Option<String>, TokenError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| TokenError::Fetch(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TokenError::Fetch(format!("token endpoint returned {status}")));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TokenError::Fetch(e.to_string()))?;
        Ok(body.token.filter(|t| !t.is_empty()))
    }
}

struct Cached {
    token: String,
    fetched_at: Instant,
}

/// TTL cache in front of a [`TokenSource`].
///
/// Concurrent callers are serialized, so a burst of reconnects triggers one
/// fetch rather than one per caller.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
    cached: Mutex<Option<Cached>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, clock: Arc<dyn Clock>, config: TokenConfig) -> Self {
        Self {
            source,
            clock,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Current token, fetching a fresh one if the cached value is older than
    /// the TTL or `force` is set.
    pub async fn get(&self, force: bool) -> Result<Option<String>, TokenError> {
        let mut cached = self.cached.lock().await;

        if !force {
            if let Some(c) = cached.as_ref() {
                if self.clock.now().duration_since(c.fetched_at) < self.config.ttl {
                    return Ok(Some(c.token.clone()));
                }
                debug!("cached token expired");
            }
        }

        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_token())
            .await
            .map_err(|_| TokenError::Timeout(self.config.fetch_timeout))?;

        match fetched {
            Ok(Some(token)) => {
                *cached = Some(Cached {
                    token: token.clone(),
                    fetched_at: self.clock.now(),
                });
                Ok(Some(token))
            }
            Ok(None) => {
                *cached = None;
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, force, "token fetch failed");
                *cached = None;
                Err(e)
            }
        }
    }

    /// Drop the cached token so the next `get` fetches.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
