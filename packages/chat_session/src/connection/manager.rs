use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, sleep_until};
use tracing::{debug, info, warn};

use super::{Emitter, ReconnectPolicy};
use crate::config::ConnectionConfig;
use crate::error::{ProtocolError, TransportError};
use crate::persist::{KeyValueStore, TRANSPORT_SESSION_KEY};
use crate::protocol::{ClientMessage, InboundEvent, parse_frame};
use crate::token::TokenCache;
use crate::transport::{ConnectRequest, Connector, DisconnectReason, Link, LinkEvent, TransportKind};

const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

/// What the inbound channel carries: a validated event, or the reason a
/// frame was thrown away.
pub type Inbound = Result<InboundEvent, ProtocolError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect attempts are exhausted.
    Error,
    /// Authentication failed; sticky until the auth state changes.
    TokenRequired,
}

/// Snapshot published on every connection change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Last heartbeat round trip.
    pub latency: Option<Duration>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    pub transport: Option<TransportKind>,
    /// Incremented on every successful connect.
    pub epoch: u64,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            latency: None,
            reconnect_attempts: 0,
            transport: None,
            epoch: 0,
            last_error: None,
        }
    }
}

#[derive(Debug)]
enum ConnectionCommand {
    Connect,
    Disconnect,
    AuthChanged { authenticated: bool },
    Visibility { visible: bool },
    Emit { frame: String },
    Shutdown,
}

/// Handle to the connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionCommand>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    pub async fn connect(&self) {
        let _ = self.sender.send(ConnectionCommand::Connect).await;
    }

    /// Intentional disconnect: no automatic reconnect until [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let _ = self.sender.send(ConnectionCommand::Disconnect).await;
    }

    /// Clears a token-required lockout and re-evaluates whether to connect.
    pub async fn auth_changed(&self, authenticated: bool) {
        let _ = self
            .sender
            .send(ConnectionCommand::AuthChanged { authenticated })
            .await;
    }

    pub async fn visibility_changed(&self, visible: bool) {
        let _ = self
            .sender
            .send(ConnectionCommand::Visibility { visible })
            .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(ConnectionCommand::Shutdown).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

impl Emitter for ConnectionHandle {
    fn emit(&self, msg: &ClientMessage) -> bool {
        if !self.is_connected() {
            debug!(event = msg.name(), "not connected, dropping outbound event");
            return false;
        }
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = msg.name(), error = %e, "failed to encode outbound event");
                return false;
            }
        };
        self.sender
            .try_send(ConnectionCommand::Emit { frame })
            .is_ok()
    }

    fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TokenNeed {
    Required,
    Optional,
    Skip,
}

struct AttemptPlan {
    token: TokenNeed,
    /// Fetch a fresh token before the first try.
    force_refresh: bool,
    /// One forced renewal is allowed if the server rejects the token.
    may_renew: bool,
    resume: Option<String>,
}

enum AttemptOutcome {
    Connected { link: Link, renewed: bool },
    TokenRequired { reason: String },
    Failed { error: TransportError, renewed: bool },
}

/// Owns the single link slot. Runs as a task; talk to it through
/// [`ConnectionHandle`].
pub struct ConnectionManager {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenCache>,
    store: Arc<dyn KeyValueStore>,

    commands: mpsc::Receiver<ConnectionCommand>,
    events: mpsc::Sender<Inbound>,
    status: watch::Sender<ConnectionStatus>,

    link: Option<Link>,
    attempt: Option<JoinHandle<()>>,
    attempt_gen: u64,
    attempt_tx: mpsc::Sender<(u64, AttemptOutcome)>,
    attempt_rx: mpsc::Receiver<(u64, AttemptOutcome)>,

    retry_at: Option<Instant>,
    visibility_at: Option<Instant>,
    heartbeat: Option<Interval>,
    ping_nonce: u64,
    pending_ping: Option<(u64, Instant)>,

    authenticated: bool,
    /// Set by an explicit disconnect; cleared by an explicit connect.
    manual: bool,
    /// Sticky token-required state.
    locked: bool,
    renewal_used: bool,
}

impl ConnectionManager {
    /// Spawn the actor. It stays idle until the first `connect` or
    /// `auth_changed`.
    pub fn spawn(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<TokenCache>,
        store: Arc<dyn KeyValueStore>,
        authenticated: bool,
    ) -> (ConnectionHandle, mpsc::Receiver<Inbound>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (attempt_tx, attempt_rx) = mpsc::channel(4);

        let actor = ConnectionManager {
            policy: ReconnectPolicy::from_config(&config),
            config,
            connector,
            tokens,
            store,
            commands: cmd_rx,
            events: event_tx,
            status: status_tx,
            link: None,
            attempt: None,
            attempt_gen: 0,
            attempt_tx,
            attempt_rx,
            retry_at: None,
            visibility_at: None,
            heartbeat: None,
            ping_nonce: 0,
            pending_ping: None,
            authenticated,
            manual: false,
            locked: false,
            renewal_used: false,
        };
        tokio::spawn(actor.run());

        (
            ConnectionHandle {
                sender: cmd_tx,
                status: status_rx,
            },
            event_rx,
        )
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                Some((generation, outcome)) = self.attempt_rx.recv() => {
                    if generation == self.attempt_gen {
                        self.attempt = None;
                        self.handle_outcome(outcome);
                    }
                }
                event = recv_link(&mut self.link) => self.handle_link_event(event).await,
                _ = tick(&mut self.heartbeat) => self.heartbeat_tick(),
                _ = sleep_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.retry();
                }
                _ = sleep_opt(self.visibility_at) => {
                    self.visibility_at = None;
                    self.recover_after_visible();
                }
            }
        }

        self.teardown();
        debug!("connection manager stopped");
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Connect => {
                self.manual = false;
                self.connect(false);
            }
            ConnectionCommand::Disconnect => {
                info!("disconnecting on request");
                self.manual = true;
                self.teardown();
                self.publish(|s| s.state = ConnectionState::Disconnected);
            }
            ConnectionCommand::AuthChanged { authenticated } => {
                info!(authenticated, "auth state changed");
                self.authenticated = authenticated;
                self.locked = false;
                self.renewal_used = false;
                self.tokens.invalidate().await;
                self.teardown();
                self.publish(|s| {
                    s.state = ConnectionState::Disconnected;
                    s.last_error = None;
                });
                if !self.manual {
                    self.connect(false);
                }
            }
            ConnectionCommand::Visibility { visible } => {
                self.visibility_at = visible.then(|| Instant::now() + self.config.visibility_debounce);
            }
            ConnectionCommand::Emit { frame } => match &self.link {
                Some(link) => {
                    if let Err(e) = link.send(frame) {
                        warn!(error = %e, "failed to queue outbound frame");
                    }
                }
                None => debug!("link gone, dropping outbound frame"),
            },
            ConnectionCommand::Shutdown => {}
        }
    }

    /// Whether a connection should exist at all.
    fn gate_open(&self) -> bool {
        let gate = &self.config.gate;
        (self.authenticated || !gate.auth_required || gate.guest_allowed) && !self.locked
    }

    fn token_need(&self) -> TokenNeed {
        match (self.authenticated, self.config.gate.auth_required) {
            (true, true) => TokenNeed::Required,
            (true, false) => TokenNeed::Optional,
            (false, _) => TokenNeed::Skip,
        }
    }

    fn connect(&mut self, force_refresh: bool) {
        if self.link.is_some() || self.attempt.is_some() {
            debug!("connect: already connected or connecting");
            return;
        }
        if !self.gate_open() {
            if self.locked {
                debug!("connect: token required, waiting for auth change");
            } else {
                debug!("connect: not authenticated");
            }
            return;
        }
        self.publish(|s| s.reconnect_attempts = 0);
        self.start_attempt(force_refresh);
    }

    fn start_attempt(&mut self, force_refresh: bool) {
        self.retry_at = None;
        self.attempt_gen += 1;
        if let Some(task) = self.attempt.take() {
            task.abort();
        }

        let plan = AttemptPlan {
            token: self.token_need(),
            force_refresh: force_refresh && self.authenticated,
            may_renew: self.authenticated && !self.renewal_used,
            resume: self.store.get(TRANSPORT_SESSION_KEY),
        };
        let connector = self.connector.clone();
        let tokens = self.tokens.clone();
        let tx = self.attempt_tx.clone();
        let generation = self.attempt_gen;
        self.attempt = Some(tokio::spawn(async move {
            let outcome = run_attempt(connector, tokens, plan).await;
            let _ = tx.send((generation, outcome)).await;
        }));

        self.publish(|s| s.state = ConnectionState::Connecting);
    }

    fn handle_outcome(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Connected { link, renewed } => {
                if renewed {
                    debug!("connected after token renewal");
                }
                self.renewal_used = false;
                if let Some(sid) = &link.session_id {
                    self.store.set(TRANSPORT_SESSION_KEY, sid);
                }
                info!(transport = %link.kind, session = ?link.session_id, "connected");

                let kind = link.kind;
                self.link = Some(link);
                self.pending_ping = None;
                let every = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);

                self.publish(|s| {
                    s.state = ConnectionState::Connected;
                    s.reconnect_attempts = 0;
                    s.transport = Some(kind);
                    s.epoch += 1;
                    s.last_error = None;
                });
            }
            AttemptOutcome::TokenRequired { reason } => {
                warn!(%reason, "authentication failed, token required");
                self.locked = true;
                self.renewal_used = true;
                self.publish(|s| {
                    s.state = ConnectionState::TokenRequired;
                    s.last_error = Some(reason);
                });
            }
            AttemptOutcome::Failed { error, renewed } => {
                if renewed {
                    self.renewal_used = true;
                }
                let attempts = self.status.borrow().reconnect_attempts;
                if self.policy.allows(attempts) {
                    let delay = self.policy.delay(attempts);
                    warn!(error = %error, attempt = attempts, ?delay, "connect failed, retrying");
                    self.retry_at = Some(Instant::now() + delay);
                    self.publish(|s| s.last_error = Some(error.to_string()));
                } else {
                    warn!(error = %error, attempts, "connect failed, giving up");
                    self.publish(|s| {
                        s.state = ConnectionState::Error;
                        s.last_error = Some(error.to_string());
                    });
                }
            }
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(text) => match parse_frame(&text) {
                Ok(InboundEvent::Pong(pong)) => self.handle_pong(pong.nonce),
                Ok(event) => {
                    debug!(event = event.kind(), "inbound event");
                    let _ = self.events.send(Ok(event)).await;
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                    let _ = self.events.send(Err(e)).await;
                }
            },
            LinkEvent::Closed(reason) => self.link_lost(reason),
        }
    }

    fn link_lost(&mut self, reason: DisconnectReason) {
        info!(%reason, "connection lost");
        self.drop_link();
        self.publish(|s| {
            s.state = ConnectionState::Disconnected;
            s.transport = None;
            s.reconnect_attempts = 0;
            s.last_error = Some(reason.to_string());
        });

        if self.manual || !self.gate_open() {
            return;
        }
        // A deliberate close by either side gets one quick retry; transport
        // failures go through the backoff policy.
        let delay = if reason.is_transport_level() {
            self.policy.delay(0)
        } else {
            self.config.quick_reconnect
        };
        debug!(?delay, "scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
    }

    fn retry(&mut self) {
        if self.manual || !self.gate_open() || self.link.is_some() {
            return;
        }
        self.publish(|s| s.reconnect_attempts += 1);
        self.start_attempt(false);
    }

    fn recover_after_visible(&mut self) {
        let state = self.status.borrow().state;
        if self.manual
            || self.link.is_some()
            || self.attempt.is_some()
            || !matches!(state, ConnectionState::Disconnected | ConnectionState::Error)
        {
            return;
        }
        info!("page visible again, reconnecting");
        self.connect(true);
    }

    fn heartbeat_tick(&mut self) {
        let Some(link) = &self.link else { return };
        if let Some((nonce, _)) = self.pending_ping {
            warn!(nonce, "no pong before next heartbeat");
            self.link_lost(DisconnectReason::PingTimeout);
            return;
        }
        self.ping_nonce += 1;
        let ping = ClientMessage::Ping {
            nonce: self.ping_nonce,
        };
        match ping.to_frame() {
            Ok(frame) => match link.send(frame) {
                Ok(()) => self.pending_ping = Some((self.ping_nonce, Instant::now())),
                Err(e) => warn!(error = %e, "failed to send ping"),
            },
            Err(e) => warn!(error = %e, "failed to encode ping"),
        }
    }

    fn handle_pong(&mut self, nonce: u64) {
        match self.pending_ping {
            Some((expected, sent_at)) if expected == nonce => {
                self.pending_ping = None;
                let latency = sent_at.elapsed();
                debug!(?latency, "pong");
                self.publish(|s| s.latency = Some(latency));
            }
            _ => debug!(nonce, "ignoring unexpected pong"),
        }
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.heartbeat = None;
        self.pending_ping = None;
    }

    /// Stop everything in flight: link, attempt, timers.
    fn teardown(&mut self) {
        self.attempt_gen += 1;
        if let Some(task) = self.attempt.take() {
            task.abort();
        }
        self.retry_at = None;
        self.visibility_at = None;
        self.drop_link();
        self.publish(|s| {
            s.transport = None;
            s.latency = None;
        });
    }

    fn publish(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        self.status.send_if_modified(|s| {
            let before = s.clone();
            f(s);
            *s != before
        });
    }
}

async fn run_attempt(
    connector: Arc<dyn Connector>,
    tokens: Arc<TokenCache>,
    plan: AttemptPlan,
) -> AttemptOutcome {
    let token = match plan.token {
        TokenNeed::Skip => None,
        need => match tokens.get(plan.force_refresh).await {
            Ok(Some(token)) => Some(token),
            Ok(None) if need == TokenNeed::Required => {
                return AttemptOutcome::TokenRequired {
                    reason: "no token available".to_string(),
                };
            }
            Ok(None) => None,
            Err(e) if need == TokenNeed::Required => {
                return AttemptOutcome::Failed {
                    error: TransportError::Network(e.to_string()),
                    renewed: false,
                };
            }
            Err(e) => {
                debug!(error = %e, "connecting without optional token");
                None
            }
        },
    };

    let mut request = ConnectRequest {
        token,
        resume_session: plan.resume,
    };
    let error = match connector.open(&request).await {
        Ok(link) => {
            return AttemptOutcome::Connected {
                link,
                renewed: false,
            };
        }
        Err(e) => e,
    };

    if !error.is_auth_failure() {
        return AttemptOutcome::Failed {
            error,
            renewed: false,
        };
    }
    if !plan.may_renew {
        return AttemptOutcome::TokenRequired {
            reason: error.to_string(),
        };
    }

    info!(error = %error, "token rejected, renewing once");
    match tokens.get(true).await {
        Ok(Some(fresh)) => {
            request.token = Some(fresh);
            match connector.open(&request).await {
                Ok(link) => AttemptOutcome::Connected {
                    link,
                    renewed: true,
                },
                Err(e) if e.is_auth_failure() => AttemptOutcome::TokenRequired {
                    reason: e.to_string(),
                },
                Err(e) => AttemptOutcome::Failed {
                    error: e,
                    renewed: true,
                },
            }
        }
        Ok(None) => AttemptOutcome::TokenRequired {
            reason: "no token after renewal".to_string(),
        },
        Err(e) => AttemptOutcome::TokenRequired {
            reason: e.to_string(),
        },
    }
}

async fn recv_link(link: &mut Option<Link>) -> LinkEvent {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
