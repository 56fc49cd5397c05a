//! Adaptive retransmission timing.
//!
//! The only adaptive timing the engine performs: a base delay plus an
//! extension proportional to payload size, so a multi-megabyte message that
//! is still crossing the share is not retransmitted prematurely.

use std::time::Duration;

use crate::core::constants::{BASE_RETRANSMIT_TIMEOUT, RETRANSMIT_PER_MIB};

const MIB: usize = 1024 * 1024;

/// Computes per-message retransmission timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitTimer {
    /// Base delay before any unacked message is eligible for resend.
    base: Duration,
    /// Additional delay per mebibyte of payload.
    per_mib: Duration,
}

impl RetransmitTimer {
    /// Timer with the protocol defaults.
    pub fn new() -> Self {
        Self {
            base: BASE_RETRANSMIT_TIMEOUT,
            per_mib: RETRANSMIT_PER_MIB,
        }
    }

    /// Timer with explicit delays.
    pub fn with_delays(base: Duration, per_mib: Duration) -> Self {
        Self { base, per_mib }
    }

    /// Base delay.
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Timeout for a payload of the given size: base plus per-MiB extension,
    /// partial mebibytes rounded up.
    pub fn timeout_for(&self, payload_len: usize) -> Duration {
        let mib = payload_len.div_ceil(MIB) as u32;
        self.base + self.per_mib * mib
    }
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new()
    }
}
