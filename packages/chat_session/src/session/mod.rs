//! Conversation state: which conversations exist, which is active, and the
//! messages each one holds so far.

pub mod migration;
mod store;

pub use migration::ConversationPatch;
pub use store::{FetchTicket, OutgoingMessage, SessionSnapshot, SessionStore, Upsert};

#[cfg(test)]
pub(crate) use store::tests as fixtures;
