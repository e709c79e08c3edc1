use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::migration::{self, ConversationPatch};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::connection::Emitter;
use crate::error::SessionError;
use crate::model::{Conversation, ConversationId, Message, MessageId, Role};
use crate::persist::{ACTIVE_CONVERSATION_KEY, KeyValueStore};
use crate::protocol::ClientMessage;

/// Longest title derived from the first message of a lazily created conversation.
const DERIVED_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryRequest {
    /// Wanted, but not on the wire yet.
    Pending,
    /// Emitted on the connection with this epoch; awaiting the snapshot.
    InFlight { epoch: u64 },
}

struct Placeholder {
    id: ConversationId,
    created_at: Instant,
    loading: bool,
}

/// Proof that a conversation fetch was started. Only the newest ticket
/// can be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    seq: u64,
    identity: String,
}

impl FetchTicket {
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

/// Result of [`SessionStore::upsert_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    /// The message is already complete; nothing changed.
    Frozen,
}

/// A user message about to be sent.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: String,
    pub persona_id: Option<String>,
    pub country: Option<String>,
}

/// Immutable view of the store, published to the UI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub revision: u64,
    pub conversations: Vec<Conversation>,
    pub active: Option<ConversationId>,
    /// Messages of the active conversation, in arrival order.
    pub messages: Vec<Message>,
    pub unread: BTreeMap<ConversationId, u32>,
    /// A new conversation is waiting for server confirmation.
    pub creating: bool,
    /// History for the active conversation has been requested and not yet arrived.
    pub history_loading: bool,
}

/// Conversations, the active pointer, per-conversation messages and unread
/// counts. All message mutation goes through [`upsert_message`] and
/// [`insert_messages`].
///
/// [`upsert_message`]: SessionStore::upsert_message
/// [`insert_messages`]: SessionStore::insert_messages
pub struct SessionStore {
    emitter: Arc<dyn Emitter>,
    kv: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,

    identity: Option<String>,
    conversations: Vec<Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    unread: HashMap<ConversationId, u32>,
    active: Option<ConversationId>,
    history: HashMap<ConversationId, HistoryRequest>,
    placeholder: Option<Placeholder>,
    /// Sends that could not go out yet, keyed by their target conversation.
    queued: HashMap<ConversationId, Vec<ClientMessage>>,

    fetch_seq: u64,
    fetch_in_flight: bool,
    loaded_for: Option<String>,
    epoch: u64,
    revision: u64,
}

impl SessionStore {
    pub fn new(
        emitter: Arc<dyn Emitter>,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        Self {
            emitter,
            kv,
            clock,
            config,
            identity: None,
            conversations: Vec::new(),
            messages: HashMap::new(),
            unread: HashMap::new(),
            active: None,
            history: HashMap::new(),
            placeholder: None,
            queued: HashMap::new(),
            fetch_seq: 0,
            fetch_in_flight: false,
            loaded_for: None,
            epoch: 0,
            revision: 0,
        }
    }

    // ── accessors ───────────────────────────────────────────────────────

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.iter().any(|c| &c.id == id)
    }

    pub fn messages(&self, id: &ConversationId) -> &[Message] {
        self.messages.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn message(&self, conv: &ConversationId, id: &MessageId) -> Option<&Message> {
        self.messages(conv).iter().find(|m| &m.id == id)
    }

    /// The conversation already holding message `id`, if any.
    pub fn conversation_of(&self, id: &MessageId) -> Option<&ConversationId> {
        self.messages
            .iter()
            .find(|(_, msgs)| msgs.iter().any(|m| &m.id == id))
            .map(|(conv, _)| conv)
    }

    pub fn unread(&self, id: &ConversationId) -> u32 {
        self.unread.get(id).copied().unwrap_or(0)
    }

    pub fn history_pending(&self, id: &ConversationId) -> bool {
        self.history.contains_key(id)
    }

    /// Whether the optimistic new conversation is still showing as loading.
    pub fn placeholder_loading(&self) -> bool {
        self.placeholder.as_ref().is_some_and(|p| p.loading)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            revision: self.revision,
            conversations: self.conversations.clone(),
            active: self.active.clone(),
            messages: self
                .active
                .as_ref()
                .map(|id| self.messages(id).to_vec())
                .unwrap_or_default(),
            unread: self
                .unread
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(id, n)| (id.clone(), *n))
                .collect(),
            creating: self.placeholder_loading(),
            history_loading: self
                .active
                .as_ref()
                .is_some_and(|id| self.history_pending(id)),
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    // ── identity & fetch ────────────────────────────────────────────────

    /// Switch to another signed-in identity (or none). Everything cached for
    /// the previous identity is dropped.
    pub fn set_identity(&mut self, identity: Option<String>) -> bool {
        if self.identity == identity {
            return false;
        }
        info!(signed_in = identity.is_some(), "session identity changed");
        self.identity = identity;
        self.conversations.clear();
        self.messages.clear();
        self.unread.clear();
        self.active = None;
        self.history.clear();
        self.placeholder = None;
        self.queued.clear();
        self.loaded_for = None;
        self.fetch_in_flight = false;
        // Invalidate any fetch started for the old identity.
        self.fetch_seq += 1;
        self.touch();
        true
    }

    /// Start a conversation-list fetch for the current identity. `None` if
    /// there is nobody signed in, or the list is already loaded (or loading)
    /// and `force` is not set.
    pub fn begin_fetch(&mut self, force: bool) -> Option<FetchTicket> {
        let identity = self.identity.clone()?;
        if !force && (self.fetch_in_flight || self.loaded_for.as_ref() == Some(&identity)) {
            debug!("conversation list already loaded for this identity");
            return None;
        }
        self.fetch_seq += 1;
        self.fetch_in_flight = true;
        Some(FetchTicket {
            seq: self.fetch_seq,
            identity,
        })
    }

    /// Apply a fetched conversation list. Returns the legacy-field patches
    /// to persist, or `None` if the ticket was superseded.
    pub fn apply_fetch(
        &mut self,
        ticket: &FetchTicket,
        mut rows: Vec<Conversation>,
    ) -> Option<Vec<ConversationPatch>> {
        if !self.is_current(ticket) {
            debug!(seq = ticket.seq, "ignoring superseded conversation fetch");
            return None;
        }
        self.fetch_in_flight = false;
        self.loaded_for = Some(ticket.identity.clone());

        let patches = migration::migrate(&mut rows);
        if !patches.is_empty() {
            info!(count = patches.len(), "migrated legacy conversation settings");
        }

        // An unconfirmed placeholder survives the refresh at the head.
        let placeholder = self
            .placeholder
            .as_ref()
            .and_then(|p| self.conversations.iter().find(|c| c.id == p.id).cloned());
        let mut list = Vec::with_capacity(rows.len() + 1);
        list.extend(placeholder);
        for row in rows {
            if !list.iter().any(|c: &Conversation| c.id == row.id) {
                list.push(row);
            }
        }
        self.conversations = list;

        let known: Vec<ConversationId> = self.conversations.iter().map(|c| c.id.clone()).collect();
        self.messages.retain(|id, _| known.contains(id));
        self.unread.retain(|id, _| known.contains(id));
        self.history.retain(|id, _| known.contains(id));
        self.queued.retain(|id, _| known.contains(id));

        let keep_active = self
            .active
            .as_ref()
            .is_some_and(|id| id.is_temporary() && self.contains(id));
        if !keep_active {
            let remembered = self
                .kv
                .get(ACTIVE_CONVERSATION_KEY)
                .map(ConversationId::new)
                .filter(|id| self.contains(id));
            let resolved = remembered.or_else(|| self.conversations.first().map(|c| c.id.clone()));
            match resolved {
                Some(id) if self.active.as_ref() != Some(&id) => self.activate(id),
                Some(_) => {}
                None => self.active = None,
            }
        }

        self.touch();
        Some(patches)
    }

    /// The fetch behind `ticket` failed; allow another one.
    pub fn fail_fetch(&mut self, ticket: &FetchTicket) {
        if self.is_current(ticket) {
            self.fetch_in_flight = false;
        }
    }

    fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.seq == self.fetch_seq && self.identity.as_deref() == Some(ticket.identity.as_str())
    }

    // ── active conversation & history ───────────────────────────────────

    /// Make `id` active. No-op (returns `false`) if it already is, or if the
    /// conversation is not in the known list.
    pub fn set_active(&mut self, id: &ConversationId) -> bool {
        if self.active.as_ref() == Some(id) {
            return false;
        }
        if !self.contains(id) {
            debug!(%id, "ignoring switch to unknown conversation");
            return false;
        }
        self.activate(id.clone());
        true
    }

    fn activate(&mut self, id: ConversationId) {
        debug!(%id, "activating conversation");
        self.unread.remove(&id);
        if !id.is_temporary() {
            self.kv.set(ACTIVE_CONVERSATION_KEY, id.as_str());
        }
        self.active = Some(id.clone());
        self.request_history(&id);
        self.touch();
    }

    /// Ask for history unless a request for `id` is already outstanding.
    fn request_history(&mut self, id: &ConversationId) {
        if id.is_temporary() {
            // Nothing to load until the server knows the id.
            self.history.insert(id.clone(), HistoryRequest::Pending);
            return;
        }
        if let Some(HistoryRequest::InFlight { .. }) = self.history.get(id) {
            debug!(%id, "history request already outstanding");
            return;
        }
        self.emit_history(id);
    }

    fn emit_history(&mut self, id: &ConversationId) {
        let msg = ClientMessage::LoadHistory {
            conversation_id: id.clone(),
        };
        let state = if self.emitter.emit(&msg) {
            debug!(%id, epoch = self.epoch, "requested history");
            HistoryRequest::InFlight { epoch: self.epoch }
        } else {
            HistoryRequest::Pending
        };
        self.history.insert(id.clone(), state);
    }

    /// A history snapshot for `id` arrived.
    pub fn resolve_history(&mut self, id: &ConversationId) {
        if self.history.remove(id).is_some() {
            self.touch();
        }
    }

    /// The connection (re)entered the connected state. Re-issues the active
    /// conversation's history request if it never made it onto this
    /// connection, and flushes queued sends.
    pub fn on_connected(&mut self, epoch: u64) {
        if epoch <= self.epoch {
            return;
        }
        self.epoch = epoch;

        if let Some(active) = self.active.clone().filter(|id| !id.is_temporary()) {
            let resend = match self.history.get(&active) {
                Some(HistoryRequest::Pending) => true,
                Some(HistoryRequest::InFlight { epoch }) => *epoch < self.epoch,
                None => false,
            };
            if resend {
                self.emit_history(&active);
            }
        }

        let ready: Vec<ConversationId> = self
            .queued
            .keys()
            .filter(|id| !id.is_temporary())
            .cloned()
            .collect();
        for id in ready {
            self.flush_queued(&id);
        }
    }

    fn flush_queued(&mut self, id: &ConversationId) {
        let Some(sends) = self.queued.remove(id) else {
            return;
        };
        let mut unsent = Vec::new();
        for msg in sends {
            if !self.emitter.emit(&msg) {
                unsent.push(msg);
            }
        }
        if !unsent.is_empty() {
            debug!(%id, count = unsent.len(), "sends still waiting for a connection");
            self.queued.insert(id.clone(), unsent);
        }
    }

    // ── creation ────────────────────────────────────────────────────────

    /// Start a new conversation. With `auto` set this defers creation to the
    /// first send and returns `None`. Otherwise a placeholder goes in at the
    /// head of the list and a create request is emitted; if a placeholder is
    /// already waiting for confirmation, its id is returned instead.
    pub fn start_new_conversation(
        &mut self,
        auto: bool,
        title: Option<String>,
        persona_id: Option<String>,
    ) -> Result<Option<ConversationId>, SessionError> {
        if auto {
            debug!("deferring conversation creation until the first send");
            return Ok(None);
        }
        if self.identity.is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        if !self.emitter.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if let Some(p) = &self.placeholder {
            debug!(id = %p.id, "a new conversation is already pending");
            return Ok(Some(p.id.clone()));
        }

        let temp_id = ConversationId::temporary();
        let title = title.unwrap_or_default();
        self.insert_provisional(temp_id.clone(), title.clone(), persona_id.clone());
        let msg = ClientMessage::CreateConversation {
            title,
            persona_id,
            temp_id: temp_id.clone(),
        };
        if !self.emitter.emit(&msg) {
            warn!(%temp_id, "create request could not be sent");
        }
        Ok(Some(temp_id))
    }

    /// Optimistically add a not-yet-confirmed conversation at the head of
    /// the list and make it active.
    pub fn insert_provisional(
        &mut self,
        temp_id: ConversationId,
        title: String,
        persona_id: Option<String>,
    ) {
        let mut conv = Conversation::new(temp_id.clone(), title);
        conv.persona_id = persona_id;
        conv.updated_at = Some(Utc::now());
        self.conversations.insert(0, conv);
        self.placeholder = Some(Placeholder {
            id: temp_id.clone(),
            created_at: self.clock.now(),
            loading: true,
        });
        self.activate(temp_id);
    }

    /// Replace a provisional conversation with its confirmed record, in
    /// place. Messages, unread count and queued sends move to the real id.
    /// A confirmation with no matching placeholder is added at the head.
    pub fn promote(&mut self, temp_id: Option<&ConversationId>, confirmed: Conversation) -> bool {
        let temp_id = temp_id
            .cloned()
            .or_else(|| self.placeholder.as_ref().map(|p| p.id.clone()));
        let real = confirmed.id.clone();
        let position = temp_id
            .as_ref()
            .and_then(|t| self.conversations.iter().position(|c| &c.id == t));

        let (Some(temp_id), Some(mut idx)) = (temp_id, position) else {
            if self.contains(&real) {
                return false;
            }
            debug!(id = %real, "conversation created elsewhere");
            self.conversations.insert(0, confirmed);
            self.touch();
            return true;
        };

        info!(temp = %temp_id, id = %real, "conversation confirmed");
        if let Some(dup) = self.conversations.iter().position(|c| c.id == real) {
            self.conversations.remove(dup);
            if dup < idx {
                idx -= 1;
            }
        }
        let old = std::mem::replace(&mut self.conversations[idx], confirmed);
        let conv = &mut self.conversations[idx];
        if conv.title.is_empty() {
            conv.title = old.title;
        }
        if conv.persona_id.is_none() {
            conv.persona_id = old.persona_id;
        }
        conv.message_count = conv.message_count.max(old.message_count);

        if let Some(moved) = self.messages.remove(&temp_id) {
            let target = self.messages.entry(real.clone()).or_default();
            for msg in moved {
                if !target.iter().any(|m| m.id == msg.id) {
                    target.push(msg);
                }
            }
        }
        if let Some(n) = self.unread.remove(&temp_id) {
            *self.unread.entry(real.clone()).or_default() += n;
        }
        self.history.remove(&temp_id);
        if self.placeholder.as_ref().is_some_and(|p| p.id == temp_id) {
            self.placeholder = None;
        }
        if self.active.as_ref() == Some(&temp_id) {
            self.active = Some(real.clone());
            self.kv.set(ACTIVE_CONVERSATION_KEY, real.as_str());
        }

        if let Some(sends) = self.queued.remove(&temp_id) {
            let rewritten = sends.into_iter().map(|mut msg| {
                if let ClientMessage::SendMessage {
                    conversation_id, ..
                } = &mut msg
                {
                    *conversation_id = real.clone();
                }
                msg
            });
            self.queued.entry(real.clone()).or_default().extend(rewritten);
            self.flush_queued(&real);
        }

        self.touch();
        true
    }

    /// When the placeholder's loading flag should drop, if it is still set.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.placeholder
            .as_ref()
            .filter(|p| p.loading)
            .map(|p| p.created_at + self.config.placeholder_timeout)
    }

    /// Drop the loading flag of a placeholder older than the timeout. The
    /// placeholder itself stays in the list.
    pub fn expire_placeholder(&mut self) -> bool {
        let now = self.clock.now();
        let timeout = self.config.placeholder_timeout;
        let Some(p) = self.placeholder.as_mut() else {
            return false;
        };
        if !p.loading || now.duration_since(p.created_at) < timeout {
            return false;
        }
        debug!(id = %p.id, "new conversation still unconfirmed, clearing loading flag");
        p.loading = false;
        self.touch();
        true
    }

    // ── sending ─────────────────────────────────────────────────────────

    /// Send a user message to the active conversation, creating one first if
    /// there is none. The message is added locally right away.
    pub fn send_message(&mut self, outgoing: OutgoingMessage) -> Result<MessageId, SessionError> {
        if !self.emitter.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let target = match self.active.clone() {
            Some(id) => id,
            None => {
                let title: String = outgoing.content.chars().take(DERIVED_TITLE_CHARS).collect();
                self.start_new_conversation(false, Some(title), outgoing.persona_id.clone())?
                    .ok_or(SessionError::NotConnected)?
            }
        };

        let id = MessageId::generate();
        let now = Utc::now();
        let mut local = Message::complete(id.clone(), Role::User, outgoing.content.clone());
        local.timestamp = now;
        self.messages.entry(target.clone()).or_default().push(local);
        if let Some(conv) = self.conversations.iter_mut().find(|c| c.id == target) {
            conv.message_count += 1;
            conv.updated_at = Some(now);
        }

        let msg = ClientMessage::SendMessage {
            conversation_id: target.clone(),
            content: outgoing.content,
            persona_id: outgoing.persona_id,
            country: outgoing.country,
            client_timestamp: now.timestamp_millis(),
            client_message_id: id.clone(),
        };
        if target.is_temporary() || !self.emitter.emit(&msg) {
            debug!(conversation = %target, "queueing send");
            self.queued.entry(target).or_default().push(msg);
        }

        self.touch();
        Ok(id)
    }

    // ── message mutation ────────────────────────────────────────────────

    /// Insert or update one message. A complete message is frozen; later
    /// updates for its id are ignored.
    pub fn upsert_message(&mut self, conv: &ConversationId, message: Message) -> Upsert {
        let list = self.messages.entry(conv.clone()).or_default();
        let outcome = match list.iter_mut().find(|m| m.id == message.id) {
            Some(existing) if existing.complete => return Upsert::Frozen,
            Some(existing) => {
                existing.role = message.role;
                existing.content = message.content;
                existing.streaming = message.streaming;
                existing.complete = message.complete;
                Upsert::Updated
            }
            None => {
                list.push(message);
                Upsert::Created
            }
        };

        if outcome == Upsert::Created {
            if let Some(c) = self.conversations.iter_mut().find(|c| &c.id == conv) {
                c.message_count += 1;
                c.updated_at = Some(Utc::now());
            }
            if self.active.as_ref() != Some(conv) {
                *self.unread.entry(conv.clone()).or_default() += 1;
            }
        }
        self.touch();
        outcome
    }

    /// Bulk insert (history snapshots). Ids already present are skipped,
    /// except that an unfinished message is replaced by the stored version.
    /// Returns the number of new entries.
    pub fn insert_messages(&mut self, conv: &ConversationId, incoming: Vec<Message>) -> usize {
        let list = self.messages.entry(conv.clone()).or_default();
        let mut inserted = 0;
        let mut changed = false;
        for msg in incoming {
            match list.iter_mut().find(|m| m.id == msg.id) {
                Some(existing) if existing.complete => {}
                Some(existing) => {
                    *existing = msg;
                    changed = true;
                }
                None => {
                    list.push(msg);
                    inserted += 1;
                    changed = true;
                }
            }
        }
        if changed {
            self.touch();
        }
        inserted
    }

    // ── deletion ────────────────────────────────────────────────────────

    /// Evict a deleted conversation. Clears the active pointer if it was active.
    pub fn remove_conversation(&mut self, id: &ConversationId) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| &c.id != id);
        let removed = self.conversations.len() != before;
        self.messages.remove(id);
        self.unread.remove(id);
        self.history.remove(id);
        self.queued.remove(id);
        if self.placeholder.as_ref().is_some_and(|p| &p.id == id) {
            self.placeholder = None;
        }
        if self.active.as_ref() == Some(id) {
            self.active = None;
            self.kv.remove(ACTIVE_CONVERSATION_KEY);
        }
        if removed {
            self.touch();
        }
        removed
    }

    pub fn clear_conversations(&mut self) {
        self.conversations.clear();
        self.messages.clear();
        self.unread.clear();
        self.history.clear();
        self.queued.clear();
        self.placeholder = None;
        self.active = None;
        self.kv.remove(ACTIVE_CONVERSATION_KEY);
        self.touch();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persist::MemoryStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Records emitted events; `connected` decides whether emits succeed.
    pub(crate) struct RecordingEmitter {
        pub connected: AtomicBool,
        pub sent: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingEmitter {
        pub(crate) fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(connected),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        pub(crate) fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn history_requests(&self, id: &str) -> usize {
            self.sent()
                .iter()
                .filter(|m| {
                    matches!(m, ClientMessage::LoadHistory { conversation_id } if conversation_id.as_str() == id)
                })
                .count()
        }
    }

    impl Emitter for RecordingEmitter {
        fn emit(&self, msg: &ClientMessage) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.sent.lock().unwrap().push(msg.clone());
            true
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct Fixture {
        pub store: SessionStore,
        pub emitter: Arc<RecordingEmitter>,
        pub kv: Arc<MemoryStore>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn fixture() -> Fixture {
        let emitter = RecordingEmitter::new(true);
        let kv = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new());
        let mut store = SessionStore::new(
            emitter.clone(),
            kv.clone(),
            clock.clone(),
            SessionConfig::default(),
        );
        store.set_identity(Some("alice".into()));
        store.on_connected(1);
        Fixture {
            store,
            emitter,
            kv,
            clock,
        }
    }

    /// Fixture with conversations `ids` loaded via a fetch.
    pub(crate) fn loaded(ids: &[&str]) -> Fixture {
        let mut f = fixture();
        let ticket = f.store.begin_fetch(false).unwrap();
        assert_eq!(ticket.identity(), "alice");
        let rows = ids.iter().map(|id| Conversation::new((*id).into(), *id)).collect();
        f.store.apply_fetch(&ticket, rows).unwrap();
        f
    }

    fn assistant(id: &str, content: &str) -> Message {
        Message::complete(id.into(), Role::Assistant, content)
    }

    #[test]
    fn fetch_activates_first_and_requests_history() {
        let f = loaded(&["a", "b"]);
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("a"));
        assert_eq!(f.emitter.history_requests("a"), 1);
        assert!(f.store.history_pending(&"a".into()));
        assert_eq!(f.kv.get(ACTIVE_CONVERSATION_KEY).as_deref(), Some("a"));
    }

    #[test]
    fn fetch_prefers_remembered_conversation() {
        let mut f = fixture();
        f.kv.set(ACTIVE_CONVERSATION_KEY, "b");
        let ticket = f.store.begin_fetch(false).unwrap();
        f.store
            .apply_fetch(&ticket, vec![Conversation::new("a".into(), "a"), Conversation::new("b".into(), "b")])
            .unwrap();
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("b"));

        // A remembered id that no longer exists falls back to the first.
        let mut f = fixture();
        f.kv.set(ACTIVE_CONVERSATION_KEY, "gone");
        let ticket = f.store.begin_fetch(false).unwrap();
        f.store
            .apply_fetch(&ticket, vec![Conversation::new("a".into(), "a")])
            .unwrap();
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("a"));
    }

    #[test]
    fn empty_fetch_leaves_no_active() {
        let f = loaded(&[]);
        assert!(f.store.active().is_none());
        assert!(f.emitter.sent().is_empty());
    }

    #[test]
    fn fetch_is_idempotent_per_identity() {
        let mut f = loaded(&["a"]);
        assert!(f.store.begin_fetch(false).is_none());
        assert!(f.store.begin_fetch(true).is_some());

        f.store.set_identity(Some("bob".into()));
        assert!(f.store.conversations().is_empty());
        assert!(f.store.begin_fetch(false).is_some());
    }

    #[test]
    fn superseded_fetch_is_ignored() {
        let mut f = fixture();
        let old = f.store.begin_fetch(false).unwrap();
        let new = f.store.begin_fetch(true).unwrap();

        f.store
            .apply_fetch(&new, vec![Conversation::new("fresh".into(), "fresh")])
            .unwrap();
        assert!(f.store.apply_fetch(&old, vec![Conversation::new("stale".into(), "stale")]).is_none());
        assert_eq!(f.store.conversations().len(), 1);
        assert_eq!(f.store.conversations()[0].id.as_str(), "fresh");
    }

    #[test]
    fn fetch_for_previous_identity_is_ignored() {
        let mut f = fixture();
        let ticket = f.store.begin_fetch(false).unwrap();
        f.store.set_identity(Some("bob".into()));
        assert!(f.store.apply_fetch(&ticket, vec![Conversation::new("a".into(), "a")]).is_none());
        assert!(f.store.conversations().is_empty());
    }

    #[test]
    fn fetch_returns_model_patches() {
        let mut f = fixture();
        let ticket = f.store.begin_fetch(false).unwrap();
        let mut legacy = Conversation::new("a".into(), "a");
        legacy.model = Some("gpt-4".into());
        let patches = f.store.apply_fetch(&ticket, vec![legacy]).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(f.store.conversations()[0].model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn at_most_one_history_request() {
        let mut f = loaded(&["a", "b"]);
        assert!(!f.store.set_active(&"a".into()));
        assert!(f.store.set_active(&"b".into()));
        assert!(f.store.set_active(&"a".into()));
        assert_eq!(f.emitter.history_requests("a"), 1);

        f.store.resolve_history(&"a".into());
        f.store.set_active(&"b".into());
        f.store.set_active(&"a".into());
        assert_eq!(f.emitter.history_requests("a"), 2);
    }

    #[test]
    fn set_active_ignores_unknown_ids() {
        let mut f = loaded(&["a"]);
        assert!(!f.store.set_active(&"nope".into()));
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("a"));
    }

    #[test]
    fn history_waits_for_connection() {
        let mut f = fixture();
        f.emitter.set_connected(false);
        let ticket = f.store.begin_fetch(false).unwrap();
        f.store
            .apply_fetch(&ticket, vec![Conversation::new("a".into(), "a")])
            .unwrap();
        assert_eq!(f.emitter.history_requests("a"), 0);
        assert!(f.store.history_pending(&"a".into()));

        f.emitter.set_connected(true);
        f.store.on_connected(2);
        assert_eq!(f.emitter.history_requests("a"), 1);

        // Same connection again: nothing new.
        f.store.on_connected(2);
        assert_eq!(f.emitter.history_requests("a"), 1);
    }

    #[test]
    fn unanswered_history_is_reissued_on_new_connection() {
        let mut f = loaded(&["a"]);
        assert_eq!(f.emitter.history_requests("a"), 1);
        f.store.on_connected(2);
        assert_eq!(f.emitter.history_requests("a"), 2);

        f.store.resolve_history(&"a".into());
        f.store.on_connected(3);
        assert_eq!(f.emitter.history_requests("a"), 2);
    }

    #[test]
    fn auto_start_is_a_noop() {
        let mut f = loaded(&[]);
        assert_eq!(f.store.start_new_conversation(true, None, None).unwrap(), None);
        assert!(f.store.conversations().is_empty());
        assert!(f.emitter.sent().is_empty());
    }

    #[test]
    fn start_requires_auth_and_connection() {
        let mut f = loaded(&[]);
        f.emitter.set_connected(false);
        assert!(matches!(
            f.store.start_new_conversation(false, None, None),
            Err(SessionError::NotConnected)
        ));

        f.emitter.set_connected(true);
        f.store.set_identity(None);
        assert!(matches!(
            f.store.start_new_conversation(false, None, None),
            Err(SessionError::NotAuthenticated)
        ));
    }

    #[test]
    fn temp_id_is_replaced_in_place() {
        let mut f = loaded(&["a", "b"]);
        let temp = f
            .store
            .start_new_conversation(false, Some("New".into()), Some("p1".into()))
            .unwrap()
            .unwrap();
        assert!(temp.is_temporary());
        assert_eq!(f.store.conversations()[0].id, temp);
        assert_eq!(f.store.active(), Some(&temp));
        assert!(f.store.placeholder_loading());
        // No history request races the temp id.
        assert_eq!(f.emitter.history_requests(temp.as_str()), 0);
        assert!(f.emitter.sent().iter().any(|m| matches!(
            m,
            ClientMessage::CreateConversation { temp_id, .. } if temp_id == &temp
        )));

        // A second explicit start while pending reuses the placeholder.
        let again = f.store.start_new_conversation(false, None, None).unwrap();
        assert_eq!(again, Some(temp.clone()));
        assert_eq!(f.store.conversations().len(), 3);

        assert!(f.store.promote(Some(&temp), Conversation::new("real".into(), "")));
        let ids: Vec<_> = f.store.conversations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["real", "a", "b"]);
        assert_eq!(f.store.conversations()[0].title, "New");
        assert_eq!(f.store.conversations()[0].persona_id.as_deref(), Some("p1"));
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("real"));
        assert!(!f.store.placeholder_loading());
        assert_eq!(f.kv.get(ACTIVE_CONVERSATION_KEY).as_deref(), Some("real"));
    }

    #[test]
    fn promote_without_placeholder_adds_at_head_once() {
        let mut f = loaded(&["a"]);
        assert!(f.store.promote(None, Conversation::new("x".into(), "x")));
        assert!(!f.store.promote(None, Conversation::new("x".into(), "x")));
        assert_eq!(f.store.conversations().len(), 2);
        assert_eq!(f.store.conversations()[0].id.as_str(), "x");
    }

    #[test]
    fn first_send_creates_lazily_and_flushes_on_promote() {
        let mut f = loaded(&[]);
        let msg_id = f
            .store
            .send_message(OutgoingMessage {
                content: "hello there".into(),
                ..Default::default()
            })
            .unwrap();

        let temp = f.store.active().cloned().unwrap();
        assert!(temp.is_temporary());
        assert_eq!(f.store.conversations()[0].title, "hello there");
        assert_eq!(f.store.messages(&temp).len(), 1);
        // Only the create request went out; the send waits for the real id.
        let sent = f.emitter.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], ClientMessage::CreateConversation { .. }));

        f.store.upsert_message(&temp, assistant("m-early", "hi"));
        f.store.promote(Some(&temp), Conversation::new("c-9".into(), "hello there"));

        let real: ConversationId = "c-9".into();
        assert_eq!(f.store.messages(&real).len(), 2);
        assert_eq!(f.store.messages(&temp).len(), 0);
        assert!(f.store.message(&real, &msg_id).is_some());
        match f.emitter.sent().last().unwrap() {
            ClientMessage::SendMessage {
                conversation_id,
                client_message_id,
                ..
            } => {
                assert_eq!(conversation_id, &real);
                assert_eq!(client_message_id, &msg_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn promote_carries_unread_count() {
        let mut f = loaded(&["a"]);
        let temp = f.store.start_new_conversation(false, None, None).unwrap().unwrap();
        f.store.set_active(&"a".into());
        f.store.upsert_message(&temp, assistant("m1", "x"));
        assert_eq!(f.store.unread(&temp), 1);

        f.store.promote(Some(&temp), Conversation::new("real".into(), "t"));
        assert_eq!(f.store.unread(&"real".into()), 1);
        assert_eq!(f.store.active().map(|id| id.as_str()), Some("a"));
    }

    #[test]
    fn placeholder_loading_expires_but_entry_stays() {
        let mut f = loaded(&[]);
        let temp = f.store.start_new_conversation(false, None, None).unwrap().unwrap();
        let deadline = f.store.next_deadline().unwrap();

        f.clock.advance(Duration::from_millis(4999));
        assert!(!f.store.expire_placeholder());
        assert!(f.store.placeholder_loading());

        f.clock.advance(Duration::from_millis(1));
        assert!(f.clock.now() >= deadline);
        assert!(f.store.expire_placeholder());
        assert!(!f.store.placeholder_loading());
        assert!(f.store.next_deadline().is_none());
        assert_eq!(f.store.conversations()[0].id, temp);

        // Still promotable afterwards.
        assert!(f.store.promote(Some(&temp), Conversation::new("late".into(), "")));
    }

    #[test]
    fn send_to_active_emits_and_inserts_locally() {
        let mut f = loaded(&["a"]);
        let id = f
            .store
            .send_message(OutgoingMessage {
                content: "hola".into(),
                persona_id: Some("tutor".into()),
                country: Some("mx".into()),
            })
            .unwrap();
        let local = f.store.message(&"a".into(), &id).unwrap();
        assert_eq!(local.role, Role::User);
        assert!(local.complete);
        assert!(matches!(
            f.emitter.sent().last().unwrap(),
            ClientMessage::SendMessage { country: Some(c), .. } if c == "mx"
        ));
        assert_eq!(f.store.conversations()[0].message_count, 1);
    }

    #[test]
    fn send_requires_connection() {
        let mut f = loaded(&["a"]);
        f.emitter.set_connected(false);
        assert!(matches!(
            f.store.send_message(OutgoingMessage {
                content: "x".into(),
                ..Default::default()
            }),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn duplicate_history_rows_collapse() {
        let mut f = loaded(&["a"]);
        let a: ConversationId = "a".into();
        let rows = vec![assistant("m1", "one"), assistant("m2", "two")];
        assert_eq!(f.store.insert_messages(&a, rows.clone()), 2);
        assert_eq!(f.store.insert_messages(&a, rows), 0);
        assert_eq!(f.store.messages(&a).len(), 2);
    }

    #[test]
    fn complete_messages_are_frozen() {
        let mut f = loaded(&["a"]);
        let a: ConversationId = "a".into();
        assert_eq!(f.store.upsert_message(&a, assistant("m1", "done")), Upsert::Created);
        assert_eq!(f.store.upsert_message(&a, assistant("m1", "changed")), Upsert::Frozen);
        assert_eq!(f.store.messages(&a)[0].content, "done");
    }

    #[test]
    fn streaming_message_is_replaced_by_history() {
        let mut f = loaded(&["a"]);
        let a: ConversationId = "a".into();
        let mut partial = assistant("m1", "Ho");
        partial.streaming = true;
        partial.complete = false;
        f.store.upsert_message(&a, partial);

        f.store.insert_messages(&a, vec![assistant("m1", "Hola")]);
        let msgs = f.store.messages(&a);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "Hola");
        assert!(msgs[0].complete);
    }

    #[test]
    fn unread_counts_non_active_only() {
        let mut f = loaded(&["a", "b"]);
        f.store.upsert_message(&"a".into(), assistant("m1", "x"));
        f.store.upsert_message(&"b".into(), assistant("m2", "y"));
        f.store.upsert_message(&"b".into(), assistant("m3", "z"));
        assert_eq!(f.store.unread(&"a".into()), 0);
        assert_eq!(f.store.unread(&"b".into()), 2);
        assert_eq!(f.store.snapshot().unread.len(), 1);

        f.store.set_active(&"b".into());
        assert_eq!(f.store.unread(&"b".into()), 0);
    }

    #[test]
    fn removing_active_clears_pointer() {
        let mut f = loaded(&["a", "b"]);
        assert!(f.store.remove_conversation(&"a".into()));
        assert!(f.store.active().is_none());
        assert_eq!(f.kv.get(ACTIVE_CONVERSATION_KEY), None);
        assert!(!f.store.remove_conversation(&"a".into()));

        f.store.clear_conversations();
        assert!(f.store.conversations().is_empty());
    }

    #[test]
    fn revision_moves_on_mutation() {
        let mut f = loaded(&["a"]);
        let before = f.store.revision();
        f.store.upsert_message(&"a".into(), assistant("m1", "x"));
        assert!(f.store.revision() > before);

        let snap = f.store.snapshot();
        assert_eq!(snap.revision, f.store.revision());
        assert_eq!(snap.messages.len(), 1);
        assert!(snap.history_loading);
    }
}
