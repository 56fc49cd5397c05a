//! Replication engine: per-peer state machine and retransmission timing.

pub mod messenger;
pub mod timing;

pub use messenger::{EngineConfig, HousekeepingReport, Messenger, ReceiveOutcome};
pub use timing::RetransmitTimer;
