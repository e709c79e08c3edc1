//! # Chat Session
//!
//! Client-side session manager for a streaming chat backend. One real-time
//! connection carries chunked assistant replies; this crate keeps that
//! connection alive, tracks which conversations exist and which one is
//! active, and stitches streamed chunks back into whole messages.
//!
//! The pieces, bottom up:
//!
//! - [`transport`]: WebSocket and long-polling links behind one [`transport::Connector`] seam.
//! - [`connection`]: the connection actor (token injection and renewal,
//!   backoff, heartbeat, visibility recovery).
//! - [`session`]: conversation identity, history loading, optimistic creation
//!   and sends.
//! - [`reassembler`]: applies inbound events to the session, buffering deltas.
//! - [`client`]: all of the above behind a single driver task.

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod persist;
pub mod protocol;
pub mod reassembler;
pub mod rest;
pub mod session;
pub mod token;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ChatClient, ClientDeps, NewConversation};
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{RestError, SessionError, TransportError};
pub use model::{Conversation, ConversationId, Message, MessageId, Role};
pub use session::{OutgoingMessage, SessionSnapshot};
