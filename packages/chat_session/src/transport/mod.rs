//! Real-time transports.
//!
//! Submodules:
//! - `websocket`: persistent bidirectional channel (tokio-tungstenite)
//! - `polling`: HTTP long-polling fallback (reqwest)
//!
//! A [`Connector`] opens a [`Link`]; the link's reader and writer run as
//! spawned tasks and talk to the owner through channels, so the owner never
//! touches the socket directly.

pub mod polling;
pub mod websocket;

use async_trait::async_trait;
use reqwest::Url;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::ConnectionConfig;
use crate::error::TransportError;

pub use polling::PollingConnector;
pub use websocket::WebSocketConnector;

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Polling,
    /// In-process link, used by embedders and tests.
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => f.write_str("websocket"),
            Self::Polling => f.write_str("polling"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Why a link went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the session on purpose.
    ServerInitiated,
    /// This side closed the link (not necessarily on the caller's request).
    ClientInitiated,
    /// The underlying stream ended without a close handshake.
    TransportClose,
    TransportError(String),
    PingTimeout,
}

impl DisconnectReason {
    /// Drops the transport itself caused, as opposed to a deliberate close by either side.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            Self::TransportClose | Self::TransportError(_) | Self::PingTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerInitiated => f.write_str("server disconnect"),
            Self::ClientInitiated => f.write_str("client disconnect"),
            Self::TransportClose => f.write_str("transport close"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::PingTimeout => f.write_str("ping timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed(DisconnectReason),
}

/// What a connector needs to open a link.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub token: Option<String>,
    /// Session id of the previous link, offered as a resume hint.
    pub resume_session: Option<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, request: &ConnectRequest) -> Result<Link, TransportError>;
}

/// One live connection. Dropping it tears the transport down.
pub struct Link {
    pub kind: TransportKind,
    /// Server-assigned session id, when the transport reports one.
    pub session_id: Option<String>,
    outbound: mpsc::Sender<String>,
    inbound: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
}

/// The far end of a [`Link`], held by whatever moves bytes for it.
pub struct LinkPeer {
    pub outbound: mpsc::Receiver<String>,
    pub inbound: mpsc::Sender<LinkEvent>,
    pub cancel: CancellationToken,
}

impl Link {
    /// Create a link and the peer half its transport tasks will drive.
    pub fn pair(kind: TransportKind, session_id: Option<String>) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();
        (
            Link {
                kind,
                session_id,
                outbound: out_tx,
                inbound: in_rx,
                cancel: cancel.clone(),
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
                cancel,
            },
        )
    }

    /// Queue a text frame for the writer task.
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Network("outbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::Network("link writer is gone".to_string())
            }
        })
    }

    /// Next event from the transport. A vanished transport reads as a close.
    pub async fn recv(&mut self) -> LinkEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(LinkEvent::Closed(DisconnectReason::TransportClose))
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Prefer one connector, fall back to another when negotiation fails.
///
/// Only [`TransportError::Negotiation`] triggers the fallback: a rejected
/// token or a dead network would fail the same way on the second transport.
pub struct FallbackConnector {
    primary: Arc<dyn Connector>,
    fallback: Arc<dyn Connector>,
}

impl FallbackConnector {
    pub fn new(primary: Arc<dyn Connector>, fallback: Arc<dyn Connector>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Connector for FallbackConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        match self.primary.open(request).await {
            Err(TransportError::Negotiation(reason)) => {
                warn!(%reason, "preferred transport unavailable, falling back");
                self.fallback.open(request).await
            }
            other => other,
        }
    }
}

/// The connector stack described by `config`.
pub fn build_connector(config: &ConnectionConfig) -> Arc<dyn Connector> {
    let polling: Arc<dyn Connector> = Arc::new(PollingConnector::new(
        config.base_url.clone(),
        config.connect_timeout,
    ));
    if config.prefer_websocket {
        let websocket: Arc<dyn Connector> = Arc::new(WebSocketConnector::new(
            config.base_url.clone(),
            config.connect_timeout,
        ));
        Arc::new(FallbackConnector::new(websocket, polling))
    } else {
        polling
    }
}

/// `{base}{path}` with the request's token and resume hint as query parameters.
pub(crate) fn endpoint_url(
    base_url: &str,
    path: &str,
    request: &ConnectRequest,
    websocket: bool,
) -> Result<Url, TransportError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| TransportError::Negotiation(format!("bad base url {base_url}: {e}")))?;

    if websocket {
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| {
            TransportError::Negotiation(format!("cannot use {base_url} for websockets"))
        })?;
    }

    let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    {
        let mut query = url.query_pairs_mut();
        if let Some(token) = &request.token {
            query.append_pair("token", token);
        }
        if let Some(sid) = &request.resume_session {
            query.append_pair("sid", sid);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}
