//! Per-peer tunnel state
//!
//! A [`HostInfo`] tracks one tunnel from first outbound attempt to
//! establishment: candidate endpoints, the staged handshake packets, retry
//! counters, buffered application datagrams and relay bookkeeping.
//!
//! Locking is split so the promotion path can run while holding the host-map
//! write locks without ever waiting on the per-host mutex: the retry and
//! promotion decision state lives behind an async [`tokio::sync::Mutex`],
//! while the handshake-packet table, the packet store and the relay table sit
//! behind short synchronous locks, and the index fields are atomics.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use trellis_cert::Certificate;

use crate::relay::RelayTable;

/// Overlay address of a peer, a 32-bit IPv4 address inside the mesh CIDR
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VpnIp(Ipv4Addr);

impl VpnIp {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self(ip)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }

    pub fn as_u32(&self) -> u32 {
        u32::from(self.0)
    }
}

impl From<Ipv4Addr> for VpnIp {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip)
    }
}

impl From<u32> for VpnIp {
    fn from(word: u32) -> Self {
        Self(Ipv4Addr::from(word))
    }
}

impl fmt::Display for VpnIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for VpnIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VpnIp({})", self.0)
    }
}

/// Opaque cryptographic session handle produced by the Noise layer
#[derive(Debug)]
pub struct ConnectionState {
    /// True for the side that sent the first handshake message
    pub initiator: bool,

    /// Outgoing message counter for the established session
    pub message_counter: AtomicU64,

    /// Certificate the remote peer presented during the handshake; the
    /// tunnel's `last_handshake_time` is drawn from it
    pub peer_certificate: Option<Certificate>,
}

impl ConnectionState {
    pub fn new(initiator: bool) -> Self {
        Self {
            initiator,
            message_counter: AtomicU64::new(0),
            peer_certificate: None,
        }
    }

    /// A session handle carrying the verified remote certificate.
    pub fn with_peer_certificate(initiator: bool, certificate: Certificate) -> Self {
        Self {
            initiator,
            message_counter: AtomicU64::new(0),
            peer_certificate: Some(certificate),
        }
    }
}

/// Known endpoints for a peer plus its advertised relay candidates
#[derive(Debug, Clone, Default)]
pub struct RemoteList {
    addrs: Vec<SocketAddr>,
    relays: Vec<VpnIp>,
}

impl RemoteList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an endpoint, keeping the list deduplicated in insertion order.
    pub fn push_addr(&mut self, addr: SocketAddr) {
        if !self.addrs.contains(&addr) {
            self.addrs.push(addr);
        }
    }

    /// Append a relay candidate, deduplicated.
    pub fn push_relay(&mut self, relay: VpnIp) {
        if !self.relays.contains(&relay) {
            self.relays.push(relay);
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn relays(&self) -> &[VpnIp] {
        &self.relays
    }

    /// Endpoints partitioned by the preferred ranges: everything inside one
    /// of the ranges first, original order preserved within each half.
    pub fn addrs_preferred_first(&self, preferred: &[Ipv4Net]) -> Vec<SocketAddr> {
        let (mut inside, outside): (Vec<_>, Vec<_>) = self
            .addrs
            .iter()
            .copied()
            .partition(|a| in_preferred_ranges(a, preferred));
        inside.extend(outside);
        inside
    }
}

fn in_preferred_ranges(addr: &SocketAddr, preferred: &[Ipv4Net]) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => preferred.iter().any(|net| net.contains(&v4)),
        IpAddr::V6(_) => false,
    }
}

/// Buffered application datagrams awaiting handshake completion
#[derive(Debug)]
pub struct PacketStore {
    packets: VecDeque<Vec<u8>>,
    cap: usize,
    dropped: u64,
}

/// Datagrams buffered per pending tunnel before the cap bites
pub const PACKET_STORE_CAP: usize = 100;

impl PacketStore {
    fn new(cap: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            cap,
            dropped: 0,
        }
    }

    /// Queue a datagram. Returns false when the store is full and the packet
    /// was dropped.
    fn push(&mut self, packet: Vec<u8>) -> bool {
        if self.packets.len() >= self.cap {
            self.dropped += 1;
            return false;
        }
        self.packets.push_back(packet);
        true
    }

    fn append(&mut self, packets: impl IntoIterator<Item = Vec<u8>>) {
        for p in packets {
            self.push(p);
        }
    }

    fn take_all(&mut self) -> Vec<Vec<u8>> {
        self.packets.drain(..).collect()
    }
}

/// Mutable handshake progress, guarded by the per-host mutex
#[derive(Debug)]
pub struct HostState {
    /// Transmissions so far; also scales the linear backoff
    pub handshake_counter: u32,

    /// The cryptographic session has produced its first outgoing message
    pub handshake_ready: bool,

    /// Both sides have agreed on session keys
    pub handshake_complete: bool,

    /// When the first attempt was scheduled
    pub handshake_start: Instant,

    /// Candidate endpoints, populated from the lighthouse on first attempt
    pub remotes: Option<RemoteList>,

    /// Session handle once the Noise layer has produced one
    pub connection: Option<ConnectionState>,
}

/// State for one tunnel to one peer
pub struct HostInfo {
    vpn_ip: VpnIp,
    local_index_id: AtomicU32,
    remote_index_id: AtomicU32,
    /// From the remote certificate, UNIX seconds; newer handshakes displace
    /// older tunnels
    last_handshake_time: AtomicU64,

    state: AsyncMutex<HostState>,

    /// Handshake packets by stage
    handshake_packets: Mutex<HashMap<u8, Vec<u8>>>,
    packet_store: Mutex<PacketStore>,
    relays: Mutex<RelayTable>,
}

impl HostInfo {
    pub fn new(vpn_ip: VpnIp) -> Self {
        Self {
            vpn_ip,
            local_index_id: AtomicU32::new(0),
            remote_index_id: AtomicU32::new(0),
            last_handshake_time: AtomicU64::new(0),
            state: AsyncMutex::new(HostState {
                handshake_counter: 0,
                handshake_ready: false,
                handshake_complete: false,
                handshake_start: Instant::now(),
                remotes: None,
                connection: None,
            }),
            handshake_packets: Mutex::new(HashMap::new()),
            packet_store: Mutex::new(PacketStore::new(PACKET_STORE_CAP)),
            relays: Mutex::new(RelayTable::default()),
        }
    }

    pub fn vpn_ip(&self) -> VpnIp {
        self.vpn_ip
    }

    pub fn local_index_id(&self) -> u32 {
        self.local_index_id.load(Ordering::Acquire)
    }

    pub fn set_local_index_id(&self, index: u32) {
        self.local_index_id.store(index, Ordering::Release);
    }

    pub fn remote_index_id(&self) -> u32 {
        self.remote_index_id.load(Ordering::Acquire)
    }

    pub fn set_remote_index_id(&self, index: u32) {
        self.remote_index_id.store(index, Ordering::Release);
    }

    pub fn last_handshake_time(&self) -> u64 {
        self.last_handshake_time.load(Ordering::Acquire)
    }

    pub fn set_last_handshake_time(&self, at: u64) {
        self.last_handshake_time.store(at, Ordering::Release);
    }

    /// The per-host mutex; retry and promotion decisions serialize on it.
    pub fn state(&self) -> &AsyncMutex<HostState> {
        &self.state
    }

    /// Stored handshake packet for a stage, if one was produced.
    pub fn handshake_packet(&self, stage: u8) -> Option<Vec<u8>> {
        self.handshake_packets.lock().get(&stage).cloned()
    }

    pub fn set_handshake_packet(&self, stage: u8, packet: Vec<u8>) {
        self.handshake_packets.lock().insert(stage, packet);
    }

    /// Byte-compare one handshake stage against another host's copy. Locks
    /// are taken one at a time, never nested.
    pub fn handshake_packet_matches(&self, other: &HostInfo, stage: u8) -> bool {
        let Some(mine) = self.handshake_packet(stage) else {
            return false;
        };
        other
            .handshake_packets
            .lock()
            .get(&stage)
            .is_some_and(|theirs| *theirs == mine)
    }

    /// Buffer an application datagram until the tunnel establishes. Returns
    /// false when the store cap dropped it.
    pub fn buffer_packet(&self, packet: Vec<u8>) -> bool {
        self.packet_store.lock().push(packet)
    }

    /// Drain every buffered datagram for flushing.
    pub fn take_buffered_packets(&self) -> Vec<Vec<u8>> {
        self.packet_store.lock().take_all()
    }

    /// Move the buffered datagrams of a losing pending entry onto this one.
    pub fn absorb_buffered_packets(&self, other: &HostInfo) {
        let moved = other.packet_store.lock().take_all();
        if !moved.is_empty() {
            self.packet_store.lock().append(moved);
        }
    }

    pub fn buffered_packet_count(&self) -> usize {
        self.packet_store.lock().packets.len()
    }

    /// Datagrams dropped because the packet store was full.
    pub fn dropped_packet_count(&self) -> u64 {
        self.packet_store.lock().dropped
    }

    pub(crate) fn relay_table(&self) -> &Mutex<RelayTable> {
        &self.relays
    }
}

impl fmt::Debug for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInfo")
            .field("vpn_ip", &self.vpn_ip)
            .field("local_index_id", &self.local_index_id())
            .field("remote_index_id", &self.remote_index_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_remote_list_dedup_and_order() {
        let mut remotes = RemoteList::new();
        remotes.push_addr(addr("203.0.113.5:4242"));
        remotes.push_addr(addr("192.168.1.9:4242"));
        remotes.push_addr(addr("203.0.113.5:4242"));
        assert_eq!(remotes.len(), 2);

        let preferred = vec!["192.168.0.0/16".parse().unwrap()];
        let sorted = remotes.addrs_preferred_first(&preferred);
        assert_eq!(sorted[0], addr("192.168.1.9:4242"));
        assert_eq!(sorted[1], addr("203.0.113.5:4242"));

        // no preferred ranges keeps insertion order
        let sorted = remotes.addrs_preferred_first(&[]);
        assert_eq!(sorted[0], addr("203.0.113.5:4242"));
    }

    #[test]
    fn test_packet_store_cap() {
        let info = HostInfo::new(VpnIp::from(0x0a000001));
        for i in 0..PACKET_STORE_CAP {
            assert!(info.buffer_packet(vec![i as u8]));
        }
        assert!(!info.buffer_packet(vec![0xff]));
        assert_eq!(info.buffered_packet_count(), PACKET_STORE_CAP);
        assert_eq!(info.dropped_packet_count(), 1);

        let drained = info.take_buffered_packets();
        assert_eq!(drained.len(), PACKET_STORE_CAP);
        assert_eq!(drained[0], vec![0]);
        assert_eq!(info.buffered_packet_count(), 0);
    }

    #[test]
    fn test_absorb_buffered_packets() {
        let winner = HostInfo::new(VpnIp::from(0x0a000001));
        let loser = HostInfo::new(VpnIp::from(0x0a000001));

        winner.buffer_packet(vec![1]);
        loser.buffer_packet(vec![2]);
        loser.buffer_packet(vec![3]);

        winner.absorb_buffered_packets(&loser);
        assert_eq!(winner.take_buffered_packets(), vec![vec![1], vec![2], vec![3]]);
        assert_eq!(loser.buffered_packet_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_state_carries_peer_certificate() {
        let (public, _) = trellis_cert::keys::x25519_keypair();
        let details = trellis_cert::CertificateDetails {
            name: "peer".to_string(),
            ips: Vec::new(),
            subnets: Vec::new(),
            groups: Vec::new(),
            not_before: 0,
            not_after: i64::MAX,
            public_key: public,
            is_ca: false,
            issuer: String::new(),
            curve: trellis_cert::Curve::Curve25519,
            inverted_groups: Default::default(),
        };
        let cert = Certificate::unsigned(details);

        let info = HostInfo::new(VpnIp::from(1));
        {
            let mut state = info.state().lock().await;
            state.connection = Some(ConnectionState::with_peer_certificate(false, cert));
        }
        info.set_last_handshake_time(12345);

        let state = info.state().lock().await;
        let peer_cert = state
            .connection
            .as_ref()
            .and_then(|c| c.peer_certificate.as_ref())
            .unwrap();
        assert_eq!(peer_cert.details.name, "peer");
        assert_eq!(info.last_handshake_time(), 12345);
    }

    #[test]
    fn test_handshake_packet_matches() {
        let a = HostInfo::new(VpnIp::from(1));
        let b = HostInfo::new(VpnIp::from(1));

        // nothing stored on either side never matches
        assert!(!a.handshake_packet_matches(&b, 0));

        a.set_handshake_packet(0, vec![1, 2, 3]);
        b.set_handshake_packet(0, vec![1, 2, 3]);
        assert!(a.handshake_packet_matches(&b, 0));

        b.set_handshake_packet(0, vec![9]);
        assert!(!a.handshake_packet_matches(&b, 0));
    }
}
