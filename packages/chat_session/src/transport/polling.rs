//! HTTP long-polling transport.
//!
//! Handshake: `GET {base}/realtime/poll?token=..` answers `{"sid": ".."}`.
//! After that, `GET ?sid=` blocks until the server has frames (a JSON array)
//! and `POST ?sid=` delivers one outbound frame.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    ConnectRequest, Connector, DisconnectReason, Link, LinkEvent, TransportKind, endpoint_url,
};
use crate::error::TransportError;

const POLL_PATH: &str = "/realtime/poll";
/// Extra time a long-poll request may hang before we give up on it.
const LONG_POLL_GRACE: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct Handshake {
    sid: String,
}

pub struct PollingConnector {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl PollingConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        let url = endpoint_url(&self.base_url, POLL_PATH, request, false)?;
        let resp = self
            .client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(e, self.timeout))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = resp.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                "invalid token".to_string()
            } else {
                body
            };
            return Err(TransportError::Rejected { message });
        }
        if !status.is_success() {
            return Err(TransportError::Negotiation(format!(
                "polling handshake failed with {status}"
            )));
        }
        let handshake: Handshake = resp
            .json()
            .await
            .map_err(|e| TransportError::Negotiation(format!("bad polling handshake: {e}")))?;

        let mut session_url = url;
        session_url.set_query(None);
        session_url.query_pairs_mut().append_pair("sid", &handshake.sid);
        debug!(sid = %handshake.sid, "polling session open");

        let (link, peer) = Link::pair(TransportKind::Polling, Some(handshake.sid));

        let writer_client = self.client.clone();
        let writer_url = session_url.clone();
        let writer_events = peer.inbound.clone();
        let writer_cancel = peer.cancel.clone();
        let mut outbound = peer.outbound;
        let timeout = self.timeout;
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = outbound.recv() => frame,
                };
                let Some(text) = frame else { break };
                let sent = writer_client
                    .post(writer_url.clone())
                    .timeout(timeout)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(text)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = sent {
                    warn!(error = %e, "polling send failed");
                    let _ = writer_events
                        .send(LinkEvent::Closed(DisconnectReason::TransportError(
                            e.to_string(),
                        )))
                        .await;
                    break;
                }
            }
        });

        let reader_client = self.client.clone();
        let events = peer.inbound;
        let reader_cancel = peer.cancel;
        let poll_timeout = self.timeout + LONG_POLL_GRACE;
        tokio::spawn(async move {
            loop {
                let polled = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    polled = poll_once(&reader_client, &session_url, poll_timeout) => polled,
                };
                match polled {
                    Ok(frames) => {
                        for frame in frames {
                            if events.send(LinkEvent::Frame(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(reason) => {
                        let _ = events.send(LinkEvent::Closed(reason)).await;
                        break;
                    }
                }
            }
        });

        Ok(link)
    }
}

/// One long-poll round trip. An expired poll yields no frames.
async fn poll_once(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
) -> Result<Vec<String>, DisconnectReason> {
    let resp = match client.get(url.clone()).timeout(timeout).send().await {
        Ok(resp) => resp,
        Err(e) if e.is_timeout() => return Ok(Vec::new()),
        Err(e) => return Err(DisconnectReason::TransportError(e.to_string())),
    };

    let status = resp.status();
    if status == StatusCode::GONE || status == StatusCode::NOT_FOUND {
        return Err(DisconnectReason::ServerInitiated);
    }
    if status == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }
    if !status.is_success() {
        return Err(DisconnectReason::TransportError(format!(
            "poll failed with {status}"
        )));
    }

    let frames: Vec<serde_json::Value> = resp
        .json()
        .await
        .map_err(|e| DisconnectReason::TransportError(e.to_string()))?;
    Ok(frames.into_iter().map(frame_text).collect())
}

/// Frames may arrive as embedded JSON or as pre-encoded strings.
fn frame_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}
