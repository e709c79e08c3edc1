//! WebSocket transport.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use super::{
    ConnectRequest, Connector, DisconnectReason, Link, LinkEvent, TransportKind, endpoint_url,
};
use crate::error::TransportError;

const WS_PATH: &str = "/realtime/ws";
/// Response header carrying the server-assigned session id.
const SESSION_HEADER: &str = "x-session-id";

pub struct WebSocketConnector {
    base_url: String,
    timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        let url = endpoint_url(&self.base_url, WS_PATH, request, true)?;
        debug!(host = ?url.host_str(), "opening websocket");

        let (ws_stream, response) = tokio::time::timeout(self.timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .map_err(TransportError::from_tungstenite)?;

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (link, peer) = Link::pair(TransportKind::WebSocket, session_id);
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let mut outbound = peer.outbound;
        let writer_events = peer.inbound.clone();
        let writer_cancel = peer.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    frame = outbound.recv() => {
                        let Some(text) = frame else { break };
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            warn!(error = %e, "websocket write failed");
                            let _ = writer_events
                                .send(LinkEvent::Closed(DisconnectReason::TransportError(e.to_string())))
                                .await;
                            break;
                        }
                    }
                }
            }
        });

        let events = peer.inbound;
        let reader_cancel = peer.cancel;
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = ws_read.next() => next,
                };
                let event = match next {
                    Some(Ok(Message::Text(text))) => LinkEvent::Frame(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => LinkEvent::Frame(text),
                        Err(_) => {
                            debug!(len = data.len(), "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        LinkEvent::Closed(close_reason(frame.as_ref()))
                    }
                    // Ping/pong are answered by tungstenite itself.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        LinkEvent::Closed(DisconnectReason::TransportError(e.to_string()))
                    }
                    None => LinkEvent::Closed(DisconnectReason::TransportClose),
                };
                let closing = matches!(event, LinkEvent::Closed(_));
                if events.send(event).await.is_err() || closing {
                    break;
                }
            }
        });

        Ok(link)
    }
}

/// Map a close frame from the server onto a [`DisconnectReason`].
fn close_reason(frame: Option<&CloseFrame>) -> DisconnectReason {
    match frame {
        None => DisconnectReason::ServerInitiated,
        Some(f) if matches!(f.code, CloseCode::Normal | CloseCode::Away) => {
            DisconnectReason::ServerInitiated
        }
        Some(f) => DisconnectReason::TransportError(format!("closed with {}: {}", f.code, f.reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_close_is_server_initiated() {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(
            close_reason(Some(&frame)),
            DisconnectReason::ServerInitiated
        );
        assert_eq!(close_reason(None), DisconnectReason::ServerInitiated);
    }

    #[test]
    fn abnormal_close_is_transport_error() {
        let frame = CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        };
        assert!(matches!(
            close_reason(Some(&frame)),
            DisconnectReason::TransportError(msg) if msg.contains("boom")
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        // Port 9 (discard) is closed on any sane test host.
        let connector = WebSocketConnector::new("http://127.0.0.1:9", Duration::from_secs(2));
        let err = connector.open(&ConnectRequest::default()).await.err().unwrap();
        assert!(
            matches!(err, TransportError::Network(_) | TransportError::Timeout(_)),
            "unexpected error: {err:?}"
        );
    }
}
