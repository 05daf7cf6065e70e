//! WhatsApp Web connection manager.
//!
//! One [`WhatsAppSession`] owns the protocol socket for the whole process:
//! pairing, credential persistence, reconnect backoff, liveness checks and
//! the inbound message relay all hang off it.

pub mod backoff;
pub mod bridge;
mod monitor;
pub mod pairing;
mod relay;
pub mod state;
pub mod storage;
mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use bridge::BridgeConnector;
pub use relay::SendError;
pub use state::{ConnectionPhase, ConnectionState, ErrorRecord, PairingCode, StatusSnapshot};
pub use storage::{PostgrestSessionStore, RemoteSessionRecord, RemoteSessionStore, SessionStore};
pub use supervisor::{ConnectOutcome, WhatsAppSession};
