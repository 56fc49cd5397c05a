//! Per-peer replication state and the registry of active peers.

pub mod peer;
pub mod store;

pub use peer::{InboxEntry, OutboxEntry, PeerSession, SentRecord};
pub use store::{MessengerHandle, SessionStore};
