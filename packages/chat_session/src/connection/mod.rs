//! The single real-time connection: token injection and renewal, reconnect
//! backoff, heartbeat and visibility recovery.

mod manager;
mod policy;

pub use manager::{ConnectionHandle, ConnectionManager, ConnectionState, ConnectionStatus, Inbound};
pub use policy::ReconnectPolicy;

use crate::protocol::ClientMessage;

/// Fire-and-forget outbound path, as seen by the session store.
pub trait Emitter: Send + Sync {
    /// Queue `msg` on the live connection. `false` if there is none.
    fn emit(&self, msg: &ClientMessage) -> bool;

    fn is_connected(&self) -> bool;
}
