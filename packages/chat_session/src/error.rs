use std::time::Duration;

/// Failure to open or keep a real-time link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server refused the handshake (usually bad credentials).
    #[error("connection rejected: {message}")]
    Rejected { message: String },

    /// The preferred transport could not be negotiated; another may work.
    #[error("transport negotiation failed: {0}")]
    Negotiation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// True if the failure is about the bearer token rather than the network.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Rejected { message } => is_auth_message(message),
            _ => false,
        }
    }

    pub fn from_tungstenite(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status();
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    let message = if body.trim().is_empty() {
                        "invalid token".to_string()
                    } else {
                        body
                    };
                    Self::Rejected { message }
                } else {
                    Self::Negotiation(format!("upgrade refused with {status}"))
                }
            }
            WsError::Io(io_err) => Self::Network(io_err.to_string()),
            WsError::Tls(tls_err) => Self::Network(tls_err.to_string()),
            other => Self::Negotiation(other.to_string()),
        }
    }

    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if let Some(status) = err.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                Self::Rejected {
                    message: "invalid token".to_string(),
                }
            } else {
                Self::Negotiation(format!("polling handshake failed with {status}"))
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Whether a connect error message describes an expired, invalid or missing token.
pub fn is_auth_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    let mentions_credential = ["token", "jwt", "credential", "auth"]
        .iter()
        .any(|w| lower.contains(w));
    let describes_problem = ["expired", "invalid", "missing", "required", "malformed"]
        .iter()
        .any(|w| lower.contains(w));
    (mentions_credential && describes_problem) || lower.contains("unauthorized")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("token endpoint failed: {0}")]
    Fetch(String),
}

/// A frame that could not be turned into an [`InboundEvent`](crate::protocol::InboundEvent).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON envelope: {0}")]
    BadEnvelope(String),

    #[error("malformed `{event}` payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("no bearer token available")]
    NoToken,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl RestError {
    /// 5xx and network failures are retried; 4xx are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500,
            Self::Network(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("not connected")]
    NotConnected,

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("bulk delete was not confirmed")]
    NotConfirmed,

    #[error("session driver is gone")]
    DriverGone,

    #[error(transparent)]
    Rest(#[from] RestError),
}
