//! `ChatClient`: the connection, session store and reassembler wired
//! together behind one driver task.
//!
//! The driver owns the [`SessionStore`] and [`StreamReassembler`] and is the
//! only place either is touched, so inbound events, connection changes and
//! caller commands are applied strictly one at a time. REST calls run on the
//! caller's task; only their results go through the driver.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ConnectionConfig, SessionConfig};
use crate::connection::{
    ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, Inbound,
};
use crate::error::SessionError;
use crate::model::{Conversation, ConversationId, MessageId};
use crate::persist::KeyValueStore;
use crate::reassembler::StreamReassembler;
use crate::rest::ConversationApi;
use crate::session::{
    ConversationPatch, FetchTicket, OutgoingMessage, SessionSnapshot, SessionStore,
};
use crate::token::TokenCache;
use crate::transport::Connector;

/// Everything [`ChatClient::spawn`] needs.
pub struct ClientDeps {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub connector: Arc<dyn Connector>,
    pub tokens: Arc<TokenCache>,
    pub api: Arc<dyn ConversationApi>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
}

/// Options for [`ChatClient::start_new_conversation`].
#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    /// Triggered by page load rather than the user; creation is deferred to
    /// the first send.
    pub auto: bool,
    pub title: Option<String>,
    pub persona_id: Option<String>,
}

enum DriverCommand {
    SetIdentity {
        identity: Option<String>,
        respond_to: oneshot::Sender<bool>,
    },
    BeginFetch {
        force: bool,
        respond_to: oneshot::Sender<Option<FetchTicket>>,
    },
    ApplyFetch {
        ticket: FetchTicket,
        rows: Vec<Conversation>,
        respond_to: oneshot::Sender<Option<Vec<ConversationPatch>>>,
    },
    FailFetch {
        ticket: FetchTicket,
    },
    SetActive {
        id: ConversationId,
        respond_to: oneshot::Sender<bool>,
    },
    StartNew {
        options: NewConversation,
        respond_to: oneshot::Sender<Result<Option<ConversationId>, SessionError>>,
    },
    Send {
        message: OutgoingMessage,
        respond_to: oneshot::Sender<Result<MessageId, SessionError>>,
    },
    Remove {
        id: ConversationId,
        respond_to: oneshot::Sender<bool>,
    },
    ClearAll {
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::Sender<DriverCommand>,
    snapshot: watch::Receiver<Arc<SessionSnapshot>>,
    connection: ConnectionHandle,
    api: Arc<dyn ConversationApi>,
}

impl ChatClient {
    /// Spawn the connection actor and the session driver. Must be called
    /// inside a tokio runtime.
    pub fn spawn(deps: ClientDeps) -> Self {
        let (connection, events) = ConnectionManager::spawn(
            deps.connection,
            deps.connector,
            deps.tokens,
            deps.store.clone(),
            false,
        );

        let store = SessionStore::new(
            Arc::new(connection.clone()),
            deps.store,
            deps.clock,
            deps.session.clone(),
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(store.snapshot()));
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let driver = Driver {
            store,
            reassembler: StreamReassembler::new(deps.session.max_buffer_chars),
            commands: cmd_rx,
            events,
            status: connection.subscribe(),
            connection: connection.clone(),
            snapshot: snapshot_tx,
            published: 0,
        };
        tokio::spawn(driver.run());

        Self {
            commands: cmd_tx,
            snapshot: snapshot_rx,
            connection,
            api: deps.api,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DriverCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::DriverGone)?;
        rx.await.map_err(|_| SessionError::DriverGone)
    }

    /// Sign in as `identity`, or sign out with `None`. Clears a token-required
    /// lockout and re-evaluates the connection.
    pub async fn set_auth(&self, identity: Option<String>) -> Result<(), SessionError> {
        let authenticated = identity.is_some();
        self.request(|respond_to| DriverCommand::SetIdentity {
            identity,
            respond_to,
        })
        .await?;
        self.connection.auth_changed(authenticated).await;
        Ok(())
    }

    /// Load the conversation list. Skipped when already loaded for the
    /// current identity unless `force` is set.
    pub async fn fetch_conversations(&self, force: bool) -> Result<(), SessionError> {
        let Some(ticket) = self
            .request(|respond_to| DriverCommand::BeginFetch { force, respond_to })
            .await?
        else {
            return Ok(());
        };
        debug!(identity = ticket.identity(), "fetching conversations");

        let rows = match self.api.list_conversations().await {
            Ok(rows) => rows,
            Err(e) => {
                let _ = self.commands.send(DriverCommand::FailFetch { ticket }).await;
                return Err(e.into());
            }
        };

        let patches = self
            .request(|respond_to| DriverCommand::ApplyFetch {
                ticket,
                rows,
                respond_to,
            })
            .await?;
        if let Some(patches) = patches.filter(|p| !p.is_empty()) {
            self.persist_patches(patches);
        }
        Ok(())
    }

    /// Write migrated settings back without holding up the caller.
    fn persist_patches(&self, patches: Vec<ConversationPatch>) {
        let api = self.api.clone();
        tokio::spawn(async move {
            for patch in patches {
                if let Err(e) = api.update_conversation(&patch).await {
                    warn!(id = %patch.id, error = %e, "failed to persist migrated settings");
                }
            }
        });
    }

    pub async fn set_active(&self, id: ConversationId) -> Result<bool, SessionError> {
        self.request(|respond_to| DriverCommand::SetActive { id, respond_to })
            .await
    }

    pub async fn start_new_conversation(
        &self,
        options: NewConversation,
    ) -> Result<Option<ConversationId>, SessionError> {
        self.request(|respond_to| DriverCommand::StartNew {
            options,
            respond_to,
        })
        .await?
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<MessageId, SessionError> {
        self.request(|respond_to| DriverCommand::Send {
            message,
            respond_to,
        })
        .await?
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<(), SessionError> {
        self.api.delete_conversation(&id).await?;
        self.request(|respond_to| DriverCommand::Remove { id, respond_to })
            .await?;
        Ok(())
    }

    /// Delete every conversation. Nothing is sent unless `confirmed` is set.
    pub async fn delete_all_conversations(&self, confirmed: bool) -> Result<(), SessionError> {
        if !confirmed {
            return Err(SessionError::NotConfirmed);
        }
        self.api.delete_all_conversations().await?;
        self.request(|respond_to| DriverCommand::ClearAll { respond_to })
            .await
    }

    pub async fn visibility_changed(&self, visible: bool) {
        self.connection.visibility_changed(visible).await;
    }

    pub async fn connect(&self) {
        self.connection.connect().await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.snapshot.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

struct Driver {
    store: SessionStore,
    reassembler: StreamReassembler,
    commands: mpsc::Receiver<DriverCommand>,
    events: mpsc::Receiver<Inbound>,
    status: watch::Receiver<ConnectionStatus>,
    connection: ConnectionHandle,
    snapshot: watch::Sender<Arc<SessionSnapshot>>,
    published: u64,
}

impl Driver {
    async fn run(mut self) {
        self.connection.connect().await;
        self.observe_status();

        let mut events_open = true;
        let mut status_open = true;
        loop {
            let deadline = self.store.next_deadline().map(Instant::from_std);
            let active_before = self.store.active().cloned();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                inbound = self.events.recv(), if events_open => match inbound {
                    Some(Ok(event)) => self.reassembler.apply(&mut self.store, event),
                    Some(Err(e)) => debug!(error = %e, "skipping malformed event"),
                    None => events_open = false,
                },
                changed = self.status.changed(), if status_open => match changed {
                    Ok(()) => self.observe_status(),
                    Err(_) => status_open = false,
                },
                _ = sleep_opt(deadline) => {
                    self.store.expire_placeholder();
                }
            }

            if self.store.active() != active_before.as_ref() {
                self.reassembler.retain_conversation(self.store.active());
            }
            self.publish();
        }
        debug!("session driver stopped");
    }

    fn observe_status(&mut self) {
        let status = self.status.borrow_and_update().clone();
        if status.state == ConnectionState::Connected {
            self.store.on_connected(status.epoch);
        }
    }

    fn handle(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::SetIdentity {
                identity,
                respond_to,
            } => {
                let changed = self.store.set_identity(identity);
                if changed {
                    info!(signed_in = self.store.identity().is_some(), "identity updated");
                }
                let _ = respond_to.send(changed);
            }
            DriverCommand::BeginFetch { force, respond_to } => {
                let _ = respond_to.send(self.store.begin_fetch(force));
            }
            DriverCommand::ApplyFetch {
                ticket,
                rows,
                respond_to,
            } => {
                let _ = respond_to.send(self.store.apply_fetch(&ticket, rows));
            }
            DriverCommand::FailFetch { ticket } => self.store.fail_fetch(&ticket),
            DriverCommand::SetActive { id, respond_to } => {
                let _ = respond_to.send(self.store.set_active(&id));
            }
            DriverCommand::StartNew {
                options,
                respond_to,
            } => {
                let result = self.store.start_new_conversation(
                    options.auto,
                    options.title,
                    options.persona_id,
                );
                let _ = respond_to.send(result);
            }
            DriverCommand::Send {
                message,
                respond_to,
            } => {
                let _ = respond_to.send(self.store.send_message(message));
            }
            DriverCommand::Remove { id, respond_to } => {
                let _ = respond_to.send(self.store.remove_conversation(&id));
            }
            DriverCommand::ClearAll { respond_to } => {
                self.store.clear_conversations();
                let _ = respond_to.send(());
            }
        }
    }

    fn publish(&mut self) {
        let revision = self.store.revision();
        if revision != self.published {
            self.published = revision;
            self.snapshot.send_replace(Arc::new(self.store.snapshot()));
        }
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::TokenConfig;
    use crate::error::RestError;
    use crate::persist::MemoryStore;
    use crate::testing::{FakeConnector, next_outbound, push_frame};
    use crate::token::StaticTokenSource;
    use crate::transport::{DisconnectReason, LinkEvent, LinkPeer};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeApi {
        rows: Mutex<Vec<Conversation>>,
        lists: AtomicUsize,
        deleted: Mutex<Vec<ConversationId>>,
        delete_alls: AtomicUsize,
        patches: Mutex<Vec<ConversationPatch>>,
        update_attempts: AtomicUsize,
        fail_updates: AtomicBool,
    }

    #[async_trait]
    impl ConversationApi for FakeApi {
        async fn list_conversations(&self) -> Result<Vec<Conversation>, RestError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn delete_conversation(&self, id: &ConversationId) -> Result<(), RestError> {
            self.deleted.lock().unwrap().push(id.clone());
            Ok(())
        }

        async fn delete_all_conversations(&self) -> Result<(), RestError> {
            self.delete_alls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_conversation(&self, patch: &ConversationPatch) -> Result<(), RestError> {
            self.update_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(RestError::Status {
                    status: 500,
                    body: "boom".into(),
                });
            }
            self.patches.lock().unwrap().push(patch.clone());
            Ok(())
        }
    }

    struct Harness {
        client: ChatClient,
        connector: Arc<FakeConnector>,
        api: Arc<FakeApi>,
    }

    fn harness(rows: Vec<Conversation>) -> Harness {
        let connector = FakeConnector::failing([]);
        let api = Arc::new(FakeApi::default());
        *api.rows.lock().unwrap() = rows;
        let tokens = Arc::new(TokenCache::new(
            Arc::new(StaticTokenSource::new(Some("tok".into()))),
            Arc::new(SystemClock),
            TokenConfig::default(),
        ));
        let client = ChatClient::spawn(ClientDeps {
            connection: ConnectionConfig::default(),
            session: SessionConfig::default(),
            connector: connector.clone(),
            tokens,
            api: api.clone(),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(SystemClock),
        });
        Harness {
            client,
            connector,
            api,
        }
    }

    /// Sign in and wait for the link; returns its far end.
    async fn signed_in(h: &Harness) -> LinkPeer {
        h.client.set_auth(Some("alice".into())).await.unwrap();
        h.client
            .subscribe_connection()
            .wait_for(|s| s.state == ConnectionState::Connected)
            .await
            .unwrap();
        h.connector.take_peer()
    }

    async fn wait_snapshot(
        h: &Harness,
        f: impl FnMut(&Arc<SessionSnapshot>) -> bool,
    ) -> Arc<SessionSnapshot> {
        h.client.subscribe().wait_for(f).await.unwrap().clone()
    }

    fn conv(id: &str) -> Conversation {
        Conversation::new(id.into(), id)
    }

    #[tokio::test(start_paused = true)]
    async fn streams_into_active_conversation() {
        let mut legacy = conv("c1");
        legacy.model = Some("gpt-4".into());
        let h = harness(vec![legacy, conv("c2")]);
        let mut peer = signed_in(&h).await;

        h.client.fetch_conversations(false).await.unwrap();
        let snap = h.client.snapshot();
        assert_eq!(snap.conversations.len(), 2);
        assert_eq!(snap.active.as_ref().map(|id| id.as_str()), Some("c1"));
        assert!(snap.history_loading);

        let load = next_outbound(&mut peer).await;
        assert_eq!(load["event"], "load_history");
        assert_eq!(load["data"]["conversation_id"], "c1");

        push_frame(
            &peer,
            "history_loaded",
            json!({"conversationId": "c1", "messages": [
                {"id": "m0", "role": "user", "content": "hola?"}
            ]}),
        )
        .await;
        let snap = wait_snapshot(&h, |s| !s.history_loading).await;
        assert_eq!(snap.messages.len(), 1);

        push_frame(&peer, "chunk", json!({"messageId": "m1", "chunk": "Ho"})).await;
        push_frame(&peer, "chunk", json!({"messageId": "m1", "chunk": "la"})).await;
        let snap = wait_snapshot(&h, |s| s.messages.iter().any(|m| m.content == "Hola")).await;
        assert!(snap.messages[1].streaming);

        push_frame(
            &peer,
            "message_complete",
            json!({"messageId": "m1", "final_text": "Hola mundo"}),
        )
        .await;
        let snap = wait_snapshot(&h, |s| s.messages.iter().any(|m| m.complete && m.content == "Hola mundo")).await;
        assert_eq!(snap.messages.len(), 2);

        // The legacy model was written back in the background.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let patches = h.api.patches.lock().unwrap().clone();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].model.as_deref(), Some("gpt-4o"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_migration_write_back_is_not_fatal() {
        let mut legacy = conv("c1");
        legacy.model = Some("gpt-4".into());
        let h = harness(vec![legacy]);
        h.api.fail_updates.store(true, Ordering::SeqCst);
        let _peer = signed_in(&h).await;

        h.client.fetch_conversations(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.api.update_attempts.load(Ordering::SeqCst), 1);
        assert!(h.api.patches.lock().unwrap().is_empty());
        // The migrated value stays in the local list.
        let snap = h.client.snapshot();
        assert_eq!(snap.conversations[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(snap.active.as_ref().map(|id| id.as_str()), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_is_skipped_unless_forced() {
        let h = harness(vec![conv("c1")]);
        let _peer = signed_in(&h).await;
        h.client.fetch_conversations(false).await.unwrap();
        h.client.fetch_conversations(false).await.unwrap();
        assert_eq!(h.api.lists.load(Ordering::SeqCst), 1);
        h.client.fetch_conversations(true).await.unwrap();
        assert_eq!(h.api.lists.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_send_creates_conversation_then_sends() {
        let h = harness(vec![]);
        let mut peer = signed_in(&h).await;
        h.client.fetch_conversations(false).await.unwrap();

        assert_eq!(
            h.client
                .start_new_conversation(NewConversation {
                    auto: true,
                    ..Default::default()
                })
                .await
                .unwrap(),
            None
        );
        assert!(h.client.snapshot().conversations.is_empty());

        let msg_id = h
            .client
            .send_message(OutgoingMessage {
                content: "hello".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let create = next_outbound(&mut peer).await;
        assert_eq!(create["event"], "create_conversation");
        let temp_id = create["data"]["temp_id"].as_str().unwrap().to_string();
        assert!(h.client.snapshot().creating);

        push_frame(
            &peer,
            "conversation_created",
            json!({"tempId": temp_id, "conversation": {"id": "c-new", "title": "hello"}}),
        )
        .await;
        let send = next_outbound(&mut peer).await;
        assert_eq!(send["event"], "send_message");
        assert_eq!(send["data"]["conversation_id"], "c-new");
        assert_eq!(send["data"]["client_message_id"], msg_id.as_str());

        let snap = wait_snapshot(&h, |s| {
            s.active.as_ref().map(|id| id.as_str()) == Some("c-new")
        })
        .await;
        assert_eq!(snap.conversations.len(), 1);
        assert_eq!(snap.messages.len(), 1);
        assert!(!snap.creating);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_placeholder_stops_loading() {
        let h = harness(vec![]);
        let _peer = signed_in(&h).await;
        h.client
            .start_new_conversation(NewConversation::default())
            .await
            .unwrap()
            .unwrap();
        assert!(h.client.snapshot().creating);

        let snap = wait_snapshot(&h, |s| !s.creating).await;
        assert_eq!(snap.conversations.len(), 1);
        assert!(snap.conversations[0].id.is_temporary());
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_rerequested_after_reconnect() {
        let h = harness(vec![conv("c1")]);
        let mut peer = signed_in(&h).await;
        h.client.fetch_conversations(false).await.unwrap();
        assert_eq!(next_outbound(&mut peer).await["event"], "load_history");

        peer.inbound
            .send(LinkEvent::Closed(DisconnectReason::TransportClose))
            .await
            .unwrap();
        let mut status = h.client.subscribe_connection();
        status
            .wait_for(|s| s.state == ConnectionState::Connected && s.epoch == 2)
            .await
            .unwrap();
        let mut peer = h.connector.take_peer();
        let again = next_outbound(&mut peer).await;
        assert_eq!(again["event"], "load_history");
        assert_eq!(again["data"]["conversation_id"], "c1");
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_go_through_the_api() {
        let h = harness(vec![conv("c1"), conv("c2")]);
        let _peer = signed_in(&h).await;
        h.client.fetch_conversations(false).await.unwrap();

        h.client.delete_conversation("c1".into()).await.unwrap();
        let snap = h.client.snapshot();
        assert_eq!(snap.conversations.len(), 1);
        assert!(snap.active.is_none());
        assert_eq!(h.api.deleted.lock().unwrap().len(), 1);

        assert!(matches!(
            h.client.delete_all_conversations(false).await,
            Err(SessionError::NotConfirmed)
        ));
        assert_eq!(h.api.delete_alls.load(Ordering::SeqCst), 0);

        h.client.delete_all_conversations(true).await.unwrap();
        assert_eq!(h.api.delete_alls.load(Ordering::SeqCst), 1);
        assert!(h.client.snapshot().conversations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_client_stays_offline() {
        let h = harness(vec![conv("c1")]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.connector.calls(), 0);
        assert_eq!(
            h.client.connection_status().state,
            ConnectionState::Disconnected
        );
        assert!(matches!(
            h.client
                .send_message(OutgoingMessage {
                    content: "x".into(),
                    ..Default::default()
                })
                .await,
            Err(SessionError::NotConnected)
        ));
    }
}
