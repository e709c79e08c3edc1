//! Folds inbound protocol events into the session store's message state.
//!
//! Deltas accumulate in a per-message partial buffer bounded by
//! `max_buffer_chars`; a buffer that grows past the cap is force-finalized
//! with its content truncated to the cap. Finals, full messages and history
//! snapshots all land through [`SessionStore::upsert_message`] or
//! [`SessionStore::insert_messages`].

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::model::{ConversationId, Message, MessageId, Role};
use crate::protocol::{ConversationCreated, Delta, Final, History, InboundEvent, MessageRow};
use crate::session::{SessionStore, Upsert};

struct PartialBuffer {
    conversation: ConversationId,
    content: String,
    chars: usize,
    last_index: Option<u32>,
}

pub struct StreamReassembler {
    max_buffer_chars: usize,
    buffers: HashMap<MessageId, PartialBuffer>,
}

impl StreamReassembler {
    pub fn new(max_buffer_chars: usize) -> Self {
        Self {
            max_buffer_chars: max_buffer_chars.max(1),
            buffers: HashMap::new(),
        }
    }

    /// Content accumulated so far for a message that is still streaming.
    pub fn buffered(&self, id: &MessageId) -> Option<&str> {
        self.buffers.get(id).map(|b| b.content.as_str())
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn apply(&mut self, store: &mut SessionStore, event: InboundEvent) {
        match event {
            InboundEvent::Delta(delta) => self.on_delta(store, delta),
            InboundEvent::Final(fin) => self.on_final(store, fin),
            InboundEvent::Message(row) => self.on_message(store, row),
            InboundEvent::History(history) => self.on_history(store, history),
            InboundEvent::ConversationCreated(created) => self.on_created(store, created),
            InboundEvent::Pong(_) => {}
            InboundEvent::Error(err) => warn!(message = %err.message, "server reported an error"),
        }
    }

    /// Forget partial buffers that belong to any conversation other than `active`.
    pub fn retain_conversation(&mut self, active: Option<&ConversationId>) {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, b| Some(&b.conversation) == active);
        let dropped = before - self.buffers.len();
        if dropped > 0 {
            debug!(dropped, "dropped partial buffers on conversation switch");
        }
    }

    fn on_delta(&mut self, store: &mut SessionStore, delta: Delta) {
        let Some(conv) = delta
            .conversation_id
            .clone()
            .or_else(|| self.buffers.get(&delta.message_id).map(|b| b.conversation.clone()))
            .or_else(|| store.conversation_of(&delta.message_id).cloned())
            .or_else(|| store.active().cloned())
        else {
            warn!(message_id = %delta.message_id, "delta with no conversation to file it under");
            return;
        };

        if store
            .message(&conv, &delta.message_id)
            .is_some_and(|m| m.complete)
        {
            debug!(message_id = %delta.message_id, "ignoring delta for completed message");
            self.buffers.remove(&delta.message_id);
            return;
        }

        // A stream whose buffer was dropped resumes from what the store holds.
        let buffer = self
            .buffers
            .entry(delta.message_id.clone())
            .or_insert_with(|| {
                let content = store
                    .message(&conv, &delta.message_id)
                    .map(|m| m.content.clone())
                    .unwrap_or_default();
                PartialBuffer {
                    conversation: conv.clone(),
                    chars: content.chars().count(),
                    content,
                    last_index: None,
                }
            });

        if let (Some(index), Some(last)) = (delta.index, buffer.last_index) {
            if index <= last {
                debug!(message_id = %delta.message_id, index, "dropping repeated chunk");
                return;
            }
        }
        buffer.content.push_str(&delta.content);
        buffer.chars += delta.content.chars().count();
        buffer.last_index = delta.index.or(buffer.last_index);

        if buffer.chars > self.max_buffer_chars {
            let truncated: String = buffer.content.chars().take(self.max_buffer_chars).collect();
            warn!(
                message_id = %delta.message_id,
                cap = self.max_buffer_chars,
                "stream exceeded buffer cap, finalizing truncated message"
            );
            self.buffers.remove(&delta.message_id);
            store.upsert_message(&conv, assistant(delta.message_id, truncated, true));
            return;
        }

        let partial = assistant(delta.message_id.clone(), buffer.content.clone(), false);
        if store.upsert_message(&conv, partial) == Upsert::Frozen {
            self.buffers.remove(&delta.message_id);
        }
    }

    fn on_final(&mut self, store: &mut SessionStore, fin: Final) {
        let buffered = self.buffers.remove(&fin.message_id);
        let Some(conv) = fin
            .conversation_id
            .clone()
            .or_else(|| buffered.as_ref().map(|b| b.conversation.clone()))
            .or_else(|| store.conversation_of(&fin.message_id).cloned())
            .or_else(|| store.active().cloned())
        else {
            warn!(message_id = %fin.message_id, "final with no conversation to file it under");
            return;
        };

        let existing = store.message(&conv, &fin.message_id);
        if existing.is_some_and(|m| m.complete) {
            debug!(message_id = %fin.message_id, "ignoring final for completed message");
            return;
        }

        let raw = match fin.content.filter(|c| !c.trim().is_empty()) {
            Some(content) => content,
            None => match buffered {
                Some(b) => b.content,
                None => match existing {
                    Some(m) => m.content.clone(),
                    None => {
                        debug!(message_id = %fin.message_id, "final with nothing to finalize");
                        return;
                    }
                },
            },
        };

        let content = if json_repair::looks_structured(&raw) {
            match json_repair::display_text(&raw) {
                Some(text) => text,
                None => {
                    warn!(message_id = %fin.message_id, "could not recover structured final, keeping raw text");
                    raw
                }
            }
        } else {
            raw
        };

        store.upsert_message(&conv, assistant(fin.message_id, content, true));
    }

    fn on_message(&mut self, store: &mut SessionStore, row: MessageRow) {
        let Some(conv) = row
            .conversation_id
            .clone()
            .or_else(|| store.conversation_of(&row.id).cloned())
            .or_else(|| store.active().cloned())
        else {
            warn!(message_id = %row.id, "message with no conversation to file it under");
            return;
        };
        self.buffers.remove(&row.id);
        if store.upsert_message(&conv, row.into_message()) == Upsert::Frozen {
            debug!("duplicate message ignored");
        }
    }

    fn on_history(&mut self, store: &mut SessionStore, history: History) {
        let messages: Vec<Message> = history
            .messages
            .into_iter()
            .map(|row| {
                self.buffers.remove(&row.id);
                row.into_message()
            })
            .collect();
        let count = messages.len();
        let inserted = store.insert_messages(&history.conversation_id, messages);
        debug!(conversation = %history.conversation_id, count, inserted, "history loaded");
        store.resolve_history(&history.conversation_id);
    }

    fn on_created(&mut self, store: &mut SessionStore, created: ConversationCreated) {
        let real = created.conversation.id.clone();
        let temp = created.temp_id.clone();
        store.promote(created.temp_id.as_ref(), created.conversation);
        if let Some(temp) = temp {
            for buffer in self.buffers.values_mut() {
                if buffer.conversation == temp {
                    buffer.conversation = real.clone();
                }
            }
        }
    }
}

fn assistant(id: MessageId, content: String, complete: bool) -> Message {
    Message {
        id,
        role: Role::Assistant,
        content,
        timestamp: Utc::now(),
        streaming: !complete,
        complete,
    }
}
