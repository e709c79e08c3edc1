//! Wire protocol for the real-time channel.
//!
//! Every frame is a JSON envelope `{"event": "<name>", "data": {...}}`.
//! The backend uses several names for the same logical event; they are
//! collapsed here into one [`InboundEvent`] per kind, and each payload is
//! validated against its schema before anything downstream sees it.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::model::{Conversation, ConversationId, Message, MessageId, Role};

/// Messages sent FROM the client TO the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for the full message history of a conversation.
    LoadHistory { conversation_id: ConversationId },
    /// Create a conversation; the server answers with `conversation_created`
    /// echoing `temp_id`.
    CreateConversation {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_id: Option<String>,
        temp_id: ConversationId,
    },
    /// A user message.
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        persona_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<String>,
        /// Milliseconds since the Unix epoch.
        client_timestamp: i64,
        client_message_id: MessageId,
    },
    /// Heartbeat; the server echoes the nonce in a `pong`.
    Ping { nonce: u64 },
}

impl ClientMessage {
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadHistory { .. } => "load_history",
            Self::CreateConversation { .. } => "create_conversation",
            Self::SendMessage { .. } => "send_message",
            Self::Ping { .. } => "ping",
        }
    }
}

/// An incremental fragment of a still-generating message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(alias = "messageId", alias = "id")]
    pub message_id: MessageId,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<ConversationId>,
    #[serde(alias = "chunk", alias = "delta", alias = "text")]
    pub content: String,
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub total: Option<u32>,
}

/// The terminating event of a streamed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Final {
    #[serde(alias = "messageId", alias = "id")]
    pub message_id: MessageId,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, alias = "final_text", alias = "finalText", alias = "text")]
    pub content: Option<String>,
}

/// A full message as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRow {
    #[serde(alias = "messageId", alias = "message_id")]
    pub id: MessageId,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<ConversationId>,
    pub role: Role,
    #[serde(default, alias = "text")]
    pub content: String,
    #[serde(default, deserialize_with = "flexible_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            role: self.role,
            content: self.content,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            streaming: false,
            complete: true,
        }
    }
}

/// A history snapshot for one conversation, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(alias = "conversationId")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub messages: Vec<MessageRow>,
}

/// Server confirmation of a `create_conversation` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationCreated {
    #[serde(default, alias = "tempId")]
    pub temp_id: Option<ConversationId>,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default, alias = "error")]
    pub message: String,
}

/// The normalized inbound event union.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Delta(Delta),
    Final(Final),
    Message(MessageRow),
    History(History),
    ConversationCreated(ConversationCreated),
    Pong(Pong),
    Error(ServerError),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delta(_) => "delta",
            Self::Final(_) => "final",
            Self::Message(_) => "message",
            Self::History(_) => "history",
            Self::ConversationCreated(_) => "conversation_created",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(alias = "type")]
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Clone, Copy)]
enum EventKind {
    Delta,
    Final,
    Message,
    History,
    ConversationCreated,
    Pong,
    Error,
}

impl EventKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "delta" | "chunk" | "partial" | "message_delta" | "stream_chunk" => Self::Delta,
            "final" | "complete" | "message_complete" | "stream_end" => Self::Final,
            "message" | "message_received" => Self::Message,
            "history" | "history_loaded" => Self::History,
            "conversation_created" => Self::ConversationCreated,
            "pong" => Self::Pong,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Parse and validate one text frame.
pub fn parse_frame(text: &str) -> Result<InboundEvent, ProtocolError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| ProtocolError::BadEnvelope(e.to_string()))?;
    let kind = EventKind::from_name(&raw.event)
        .ok_or_else(|| ProtocolError::UnknownEvent(raw.event.clone()))?;

    let event = match kind {
        EventKind::Delta => {
            let delta: Delta = decode(&raw)?;
            require(&raw, !delta.message_id.as_str().is_empty(), "empty message_id")?;
            InboundEvent::Delta(delta)
        }
        EventKind::Final => {
            let fin: Final = decode(&raw)?;
            require(&raw, !fin.message_id.as_str().is_empty(), "empty message_id")?;
            InboundEvent::Final(fin)
        }
        EventKind::Message => {
            // Some servers wrap the row as {"message": {...}}.
            let row: MessageRow = match raw.data.get("message") {
                Some(inner) if inner.is_object() => decode_value(&raw.event, inner.clone())?,
                _ => decode(&raw)?,
            };
            require(&raw, !row.id.as_str().is_empty(), "empty message id")?;
            InboundEvent::Message(row)
        }
        EventKind::History => {
            let history: History = decode(&raw)?;
            require(
                &raw,
                !history.conversation_id.as_str().is_empty(),
                "empty conversation_id",
            )?;
            InboundEvent::History(history)
        }
        EventKind::ConversationCreated => {
            let created: ConversationCreated = decode(&raw)?;
            require(
                &raw,
                !created.conversation.id.as_str().is_empty(),
                "empty conversation id",
            )?;
            InboundEvent::ConversationCreated(created)
        }
        EventKind::Pong => InboundEvent::Pong(decode(&raw)?),
        EventKind::Error => InboundEvent::Error(decode(&raw)?),
    };
    Ok(event)
}

fn decode<T: DeserializeOwned>(raw: &RawFrame) -> Result<T, ProtocolError> {
    decode_value(&raw.event, raw.data.clone())
}

fn decode_value<T: DeserializeOwned>(
    event: &str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn require(raw: &RawFrame, ok: bool, reason: &str) -> Result<(), ProtocolError> {
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::Malformed {
            event: raw.event.clone(),
            reason: reason.to_string(),
        })
    }
}

/// Accepts RFC 3339 strings or epoch milliseconds; anything else becomes `None`.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Millis(i64),
        Text(String),
        Other(serde_json::Value),
    }

    Ok(match Option::<Repr>::deserialize(deserializer)? {
        Some(Repr::Millis(ms)) => Utc.timestamp_millis_opt(ms).single(),
        Some(Repr::Text(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Repr::Other(_)) | None => None,
    })
}
