//! Handshake configuration

use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Interval between retry ticks
pub const DEFAULT_HANDSHAKE_TRY_INTERVAL: Duration = Duration::from_millis(100);

/// Transmissions before a pending handshake is torn down
pub const DEFAULT_HANDSHAKE_RETRIES: u32 = 10;

/// Capacity of the lighthouse trigger channel
pub const DEFAULT_HANDSHAKE_TRIGGER_BUFFER: usize = 64;

/// Whether to attempt relayed delivery alongside direct sends
pub const DEFAULT_USE_RELAYS: bool = true;

/// Tunables for the handshake manager. Instances are immutable once the
/// manager is constructed; a config reload replaces the manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Base retry interval; attempt n waits n times this long
    pub try_interval: Duration,

    /// Retry budget before timing out a pending tunnel
    pub retries: u32,

    /// Buffered lighthouse trigger events
    pub trigger_buffer: usize,

    /// Fall back to relayed delivery while direct paths are unanswered
    pub use_relays: bool,

    /// Endpoints inside these ranges are tried first
    pub preferred_ranges: Vec<Ipv4Net>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            try_interval: DEFAULT_HANDSHAKE_TRY_INTERVAL,
            retries: DEFAULT_HANDSHAKE_RETRIES,
            trigger_buffer: DEFAULT_HANDSHAKE_TRIGGER_BUFFER,
            use_relays: DEFAULT_USE_RELAYS,
            preferred_ranges: Vec::new(),
        }
    }
}

impl HandshakeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.try_interval.is_zero() {
            return Err("handshake try_interval must be non-zero".into());
        }
        if self.retries == 0 {
            return Err("handshake retries must be at least 1".into());
        }
        if self.trigger_buffer == 0 {
            return Err("handshake trigger_buffer must be at least 1".into());
        }
        Ok(())
    }

    /// Worst-case retry horizon under linear backoff: the sum
    /// `interval * (1 + 2 + ... + retries)`. `retries * (retries + 1)` is
    /// always even, so the division is exact.
    pub fn handshake_horizon(&self) -> Duration {
        self.try_interval * (self.retries * (self.retries + 1) / 2)
    }
}
