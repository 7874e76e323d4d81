//! Handshake and tunnel establishment core for the trellis mesh overlay
//!
//! Peers are identified by an overlay address bound to a long-term key by a
//! certificate (see `trellis-cert`). This crate drives tunnels between peers
//! to establishment:
//! - The dual host-map (pending and main) holding per-peer tunnel state
//! - A hashed timer wheel pacing handshake retries with linear backoff
//! - The handshake manager: retry loop, lighthouse queries, collision-safe
//!   promotion, relay fallback
//! - The packet header and relay control messages
//!
//! TUN and UDP I/O, the Noise implementation, configuration loading and the
//! lighthouse itself are external collaborators reached through the traits
//! in [`lighthouse`].

pub mod config;
pub mod control;
pub mod error;
pub mod header;
pub mod host;
pub mod hostmap;
pub mod lighthouse;
pub mod manager;
pub mod metrics;
pub mod relay;
pub mod timerwheel;

#[cfg(test)]
mod testutil;

pub use config::{
    HandshakeConfig, DEFAULT_HANDSHAKE_RETRIES, DEFAULT_HANDSHAKE_TRIGGER_BUFFER,
    DEFAULT_HANDSHAKE_TRY_INTERVAL, DEFAULT_USE_RELAYS,
};
pub use control::{ControlMessage, ControlMessageType};
pub use error::{CoordinationError, CoreResult, WireError};
pub use header::{Header, MessageType, HEADER_LEN, PROTOCOL_VERSION};
pub use host::{ConnectionState, HostInfo, HostState, PacketStore, RemoteList, VpnIp};
pub use hostmap::HostMap;
pub use lighthouse::{EncWriter, Lighthouse};
pub use manager::{HandshakeManager, HANDSHAKE_STAGE_1};
pub use metrics::{HandshakeMetrics, MessageMetrics};
pub use relay::{Relay, RelayState};
pub use timerwheel::TimerWheel;
