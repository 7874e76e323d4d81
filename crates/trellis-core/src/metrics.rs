//! Lock-free counters for the handshake path

use std::sync::atomic::{AtomicU64, Ordering};

use crate::header::MessageType;

const SUBTYPE_SLOTS: usize = 16;

/// Per-(type, subtype) transmit counters
#[derive(Debug, Default)]
pub struct MessageMetrics {
    tx: [[AtomicU64; SUBTYPE_SLOTS]; 4],
}

impl MessageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `n` transmissions of a message type/subtype pair.
    pub fn tx(&self, message_type: MessageType, subtype: u8, n: u64) {
        let slot = (subtype as usize).min(SUBTYPE_SLOTS - 1);
        self.tx[message_type as usize][slot].fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_count(&self, message_type: MessageType, subtype: u8) -> u64 {
        let slot = (subtype as usize).min(SUBTYPE_SLOTS - 1);
        self.tx[message_type as usize][slot].load(Ordering::Relaxed)
    }
}

/// Handshake manager outcome counters
#[derive(Debug, Default)]
pub struct HandshakeMetrics {
    /// Pending tunnels started
    pub initiated: AtomicU64,
    /// Pending tunnels torn down after exhausting the retry budget
    pub timed_out: AtomicU64,
}

impl HandshakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiated_count(&self) -> u64 {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn timed_out_count(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
}
