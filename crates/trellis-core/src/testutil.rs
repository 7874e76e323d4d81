//! Recording test doubles for the manager's seams

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::HandshakeConfig;
use crate::control::{ControlMessage, ControlMessageType};
use crate::header::{Header, MessageType};
use crate::host::{ConnectionState, HostInfo, RemoteList, VpnIp};
use crate::hostmap::HostMap;
use crate::lighthouse::{EncWriter, Lighthouse};
use crate::manager::{HandshakeManager, HANDSHAKE_STAGE_1};
use crate::relay::Relay;

/// Our own overlay address in tests
pub(crate) const TEST_MY_IP: u32 = 0x0a00_0000 + 99;

/// A lighthouse with a static cache
#[derive(Clone)]
pub(crate) struct MockLighthouse {
    my_ip: VpnIp,
    remotes: Arc<Mutex<HashMap<VpnIp, RemoteList>>>,
    server_queries: Arc<AtomicU64>,
}

impl MockLighthouse {
    pub(crate) fn empty(my_ip: VpnIp) -> Self {
        Self {
            my_ip,
            remotes: Arc::new(Mutex::new(HashMap::new())),
            server_queries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A lighthouse knowing one endpoint for `target`.
    pub(crate) fn with_addr(target: VpnIp, addr: SocketAddr) -> Self {
        let lighthouse = Self::empty(VpnIp::from(TEST_MY_IP));
        lighthouse.add_addr(target, addr);
        lighthouse
    }

    pub(crate) fn add_addr(&self, target: VpnIp, addr: SocketAddr) {
        self.remotes.lock().entry(target).or_default().push_addr(addr);
    }

    pub(crate) fn add_relay(&self, target: VpnIp, relay: VpnIp) {
        self.remotes.lock().entry(target).or_default().push_relay(relay);
    }

    pub(crate) fn server_queries(&self) -> u64 {
        self.server_queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Lighthouse for MockLighthouse {
    fn query_cache(&self, vpn_ip: VpnIp) -> RemoteList {
        self.remotes.lock().get(&vpn_ip).cloned().unwrap_or_default()
    }

    async fn query_server(&self, _vpn_ip: VpnIp, _writer: &dyn EncWriter) {
        self.server_queries.fetch_add(1, Ordering::Relaxed);
    }

    fn my_vpn_ip(&self) -> VpnIp {
        self.my_ip
    }
}

/// One recorded UDP send
#[derive(Clone, Debug)]
pub(crate) struct SentPacket {
    pub at: Instant,
    pub addr: SocketAddr,
    pub packet: Vec<u8>,
}

/// A writer that records everything it is asked to send
#[derive(Default)]
pub(crate) struct MockWriter {
    sent: Mutex<Vec<SentPacket>>,
    via: Mutex<Vec<(VpnIp, Vec<u8>)>>,
    messages: Mutex<Vec<(MessageType, VpnIp, Vec<u8>)>>,
    kicks: Mutex<Vec<VpnIp>>,
}

impl MockWriter {
    pub(crate) fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_via(&self) -> Vec<(VpnIp, Vec<u8>)> {
        self.via.lock().clone()
    }

    pub(crate) fn handshake_kicks(&self) -> Vec<VpnIp> {
        self.kicks.lock().clone()
    }

    /// Decoded control messages, with their destination.
    pub(crate) fn control_messages(&self) -> Vec<(VpnIp, ControlMessage)> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _, _)| *t == MessageType::Control)
            .filter_map(|(_, to, payload)| {
                let msg = ControlMessage::decode(payload).ok()?;
                (msg.message_type() != ControlMessageType::None).then_some((*to, msg))
            })
            .collect()
    }

    /// Application payloads sent to one peer.
    pub(crate) fn messages_to(&self, vpn_ip: VpnIp) -> Vec<Vec<u8>> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, to, _)| *t == MessageType::Message && *to == vpn_ip)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl EncWriter for MockWriter {
    async fn write_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.sent.lock().push(SentPacket {
            at: Instant::now(),
            addr,
            packet: packet.to_vec(),
        });
        Ok(())
    }

    async fn send_via(&self, relay_host: &Arc<HostInfo>, _relay: &Relay, data: &[u8]) {
        self.via.lock().push((relay_host.vpn_ip(), data.to_vec()));
    }

    async fn send_message_to_vpn_ip(
        &self,
        message_type: MessageType,
        _subtype: u8,
        vpn_ip: VpnIp,
        payload: &[u8],
    ) {
        self.messages
            .lock()
            .push((message_type, vpn_ip, payload.to_vec()));
    }

    async fn handshake(&self, vpn_ip: VpnIp) {
        self.kicks.lock().push(vpn_ip);
    }
}

pub(crate) struct TestSetup {
    pub manager: Arc<HandshakeManager>,
    pub writer: Arc<MockWriter>,
    pub shutdown: Arc<Notify>,
}

pub(crate) fn test_manager(lighthouse: MockLighthouse) -> TestSetup {
    test_manager_with_config(HandshakeConfig::default(), lighthouse)
}

pub(crate) fn test_manager_with_config(
    config: HandshakeConfig,
    lighthouse: MockLighthouse,
) -> TestSetup {
    let main = Arc::new(HostMap::new("main", config.preferred_ranges.clone()));
    let manager = Arc::new(HandshakeManager::new(config, main, Arc::new(lighthouse)));
    TestSetup {
        manager,
        writer: Arc::new(MockWriter::default()),
        shutdown: Arc::new(Notify::new()),
    }
}

/// Mark a pending host ready to transmit: session handle installed and a
/// stage-1 packet stored.
pub(crate) async fn ready_host(hostinfo: &Arc<HostInfo>) {
    {
        let mut state = hostinfo.state().lock().await;
        state.handshake_ready = true;
        state.connection = Some(ConnectionState::new(true));
    }
    let packet = Header::handshake(hostinfo.local_index_id(), 1).to_bytes();
    hostinfo.set_handshake_packet(HANDSHAKE_STAGE_1, packet);
}
