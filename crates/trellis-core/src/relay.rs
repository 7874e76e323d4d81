//! Relay coordination
//!
//! When a direct path to a peer stays unanswered, the handshake manager asks
//! established peers to forward for it. Each (relay peer, target peer) pair
//! walks a two-state machine: `Requested` after a `CreateRelayRequest` goes
//! out, `Established` once the matching `CreateRelayResponse` arrives.
//! Requests are idempotent and retransmitted on every outbound attempt while
//! the state is `Requested`.

use std::collections::HashMap;

use rand::Rng as _;
use tracing::{debug, info, warn};

use crate::host::{HostInfo, VpnIp};

/// Progress of one relay negotiation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    /// Request sent, response outstanding
    Requested,
    /// The relay peer agreed and will forward
    Established,
}

/// One relay entry on the host we relay through
#[derive(Clone, Debug)]
pub struct Relay {
    pub state: RelayState,
    /// Index we chose when requesting the relay
    pub local_index: u32,
    /// Index the relay peer chose, zero until established
    pub remote_index: u32,
    /// The peer this relay forwards to
    pub peer_ip: VpnIp,
}

/// Relay entries of one HostInfo, keyed by the terminal peer
#[derive(Debug, Default)]
pub struct RelayTable {
    by_peer: HashMap<VpnIp, Relay>,
    by_index: HashMap<u32, VpnIp>,
}

impl RelayTable {
    fn insert(&mut self, relay: Relay) {
        self.by_index.insert(relay.local_index, relay.peer_ip);
        self.by_peer.insert(relay.peer_ip, relay);
    }

    fn get(&self, peer_ip: VpnIp) -> Option<&Relay> {
        self.by_peer.get(&peer_ip)
    }

    fn get_by_index_mut(&mut self, local_index: u32) -> Option<&mut Relay> {
        let peer_ip = *self.by_index.get(&local_index)?;
        self.by_peer.get_mut(&peer_ip)
    }

    fn contains_index(&self, local_index: u32) -> bool {
        self.by_index.contains_key(&local_index)
    }
}

impl HostInfo {
    /// The relay entry toward `peer_ip`, if one was requested through this
    /// host.
    pub fn query_relay_for(&self, peer_ip: VpnIp) -> Option<Relay> {
        self.relay_table().lock().get(peer_ip).cloned()
    }

    /// Record a new relay request through this host toward `peer_ip` and
    /// return the index chosen for it. An existing entry is left untouched.
    pub fn add_relay(&self, peer_ip: VpnIp) -> u32 {
        let mut table = self.relay_table().lock();
        if let Some(existing) = table.get(peer_ip) {
            return existing.local_index;
        }

        let mut rng = rand::thread_rng();
        let local_index = loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 && !table.contains_index(candidate) {
                break candidate;
            }
        };

        table.insert(Relay {
            state: RelayState::Requested,
            local_index,
            remote_index: 0,
            peer_ip,
        });
        debug!(
            "requested relay through {} toward {} (index {})",
            self.vpn_ip(),
            peer_ip,
            local_index
        );
        local_index
    }

    /// Promote the relay entry matching `local_index` to `Established`,
    /// recording the index the relay peer chose. Returns the updated entry.
    pub fn establish_relay(&self, local_index: u32, remote_index: u32) -> Option<Relay> {
        let mut table = self.relay_table().lock();
        let relay = table.get_by_index_mut(local_index)?;
        relay.state = RelayState::Established;
        relay.remote_index = remote_index;
        Some(relay.clone())
    }
}

/// Handle a `CreateRelayResponse` received from `relay_host`.
pub fn handle_create_relay_response(
    relay_host: &HostInfo,
    initiator_relay_index: u32,
    responder_relay_index: u32,
    relay_to_ip: VpnIp,
) {
    match relay_host.establish_relay(initiator_relay_index, responder_relay_index) {
        Some(relay) => {
            if relay.peer_ip != relay_to_ip {
                warn!(
                    "relay response from {} names {} but index {} belongs to {}",
                    relay_host.vpn_ip(),
                    relay_to_ip,
                    initiator_relay_index,
                    relay.peer_ip
                );
                return;
            }
            info!(
                "relay through {} toward {} established",
                relay_host.vpn_ip(),
                relay.peer_ip
            );
        }
        None => {
            warn!(
                "relay response from {} for unknown index {}",
                relay_host.vpn_ip(),
                initiator_relay_index
            );
        }
    }
}
