//! REST collaborator for conversation CRUD.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RestConfig;
use crate::error::RestError;
use crate::model::{Conversation, ConversationId};
use crate::session::ConversationPatch;
use crate::token::TokenCache;

#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RestError>;
    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), RestError>;
    async fn delete_all_conversations(&self) -> Result<(), RestError>;
    async fn update_conversation(&self, patch: &ConversationPatch) -> Result<(), RestError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListBody {
    Bare(Vec<Conversation>),
    Wrapped { conversations: Vec<Conversation> },
}

/// Bearer-authenticated client for `{base}/api/conversations`.
pub struct HttpConversationApi {
    client: reqwest::Client,
    config: RestConfig,
    tokens: Arc<TokenCache>,
}

impl HttpConversationApi {
    pub fn new(config: RestConfig, tokens: Arc<TokenCache>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            tokens,
        }
    }

    fn url(&self, id: Option<&ConversationId>) -> String {
        match id {
            Some(id) => format!("{}/api/conversations/{}", self.config.base_url, id),
            None => format!("{}/api/conversations", self.config.base_url),
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&ConversationPatch>,
    ) -> Result<reqwest::Response, RestError> {
        let token = self.tokens.get(false).await?.ok_or(RestError::NoToken)?;
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .timeout(self.config.request_timeout);
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| RestError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RestError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Run `op`, retrying 5xx and network failures with exponential backoff
    /// and jitter.
    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, RestError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RestError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = retry_delay(self.config.retry_base, attempt);
                    warn!(what, error = %e, attempt, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// `base * 2^attempt`, plus up to half of that again at random.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let jitter = rand::rng().random_range(0.0..=0.5);
    exp + exp.mul_f64(jitter)
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>, RestError> {
        let url = self.url(None);
        self.with_retry("list conversations", || async {
            let resp = self.send_once(Method::GET, &url, None).await?;
            let body: ListBody = resp
                .json()
                .await
                .map_err(|e| RestError::Decode(e.to_string()))?;
            Ok(match body {
                ListBody::Bare(list) | ListBody::Wrapped {
                    conversations: list,
                } => list,
            })
        })
        .await
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), RestError> {
        let url = self.url(Some(id));
        self.with_retry("delete conversation", || async {
            self.send_once(Method::DELETE, &url, None).await.map(drop)
        })
        .await?;
        debug!(%id, "conversation deleted");
        Ok(())
    }

    async fn delete_all_conversations(&self) -> Result<(), RestError> {
        let url = self.url(None);
        self.with_retry("delete all conversations", || async {
            self.send_once(Method::DELETE, &url, None).await.map(drop)
        })
        .await
    }

    async fn update_conversation(&self, patch: &ConversationPatch) -> Result<(), RestError> {
        let url = self.url(Some(&patch.id));
        self.with_retry("update conversation", || async {
            self.send_once(Method::PATCH, &url, Some(patch)).await.map(drop)
        })
        .await
    }
}
