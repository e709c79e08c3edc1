//! Fakes shared by the async tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::{ConnectRequest, Connector, Link, LinkEvent, LinkPeer, TransportKind};

pub(crate) const CONNECT_LATENCY: Duration = Duration::from_millis(10);

/// Connector that replays scripted failures, then succeeds with in-memory links.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub script: Mutex<VecDeque<TransportError>>,
    pub peers: Mutex<Vec<LinkPeer>>,
    pub requests: Mutex<Vec<ConnectRequest>>,
}

impl FakeConnector {
    pub(crate) fn failing(errors: impl IntoIterator<Item = TransportError>) -> Arc<Self> {
        let fake = Self::default();
        fake.script.lock().unwrap().extend(errors);
        Arc::new(fake)
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The far end of the oldest link not yet taken.
    pub(crate) fn take_peer(&self) -> LinkPeer {
        self.peers.lock().unwrap().remove(0)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<Link, TransportError> {
        tokio::time::sleep(CONNECT_LATENCY).await;
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };
        if let Some(err) = self.script.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (link, peer) = Link::pair(TransportKind::Memory, Some(format!("sid-{n}")));
        self.peers.lock().unwrap().push(peer);
        Ok(link)
    }
}

/// Push a server frame `{"event": event, "data": data}` into a link.
pub(crate) async fn push_frame(peer: &LinkPeer, event: &str, data: serde_json::Value) {
    let frame = serde_json::json!({ "event": event, "data": data }).to_string();
    peer.inbound.send(LinkEvent::Frame(frame)).await.unwrap();
}

/// Next outbound frame from the client, decoded.
pub(crate) async fn next_outbound(peer: &mut LinkPeer) -> serde_json::Value {
    let frame = peer.outbound.recv().await.expect("link closed");
    serde_json::from_str(&frame).unwrap()
}
