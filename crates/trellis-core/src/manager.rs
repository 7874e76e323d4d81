//! Handshake manager
//!
//! A single long-running task drives every pending tunnel toward
//! establishment: it selects over a lighthouse trigger channel and a retry
//! tick, fans the stage-1 handshake packet out to every candidate endpoint,
//! enlists relays when direct paths stay quiet, and promotes tunnels from the
//! pending host-map into the main one when a response verifies.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::HandshakeConfig;
use crate::control::ControlMessage;
use crate::error::CoordinationError;
use crate::header::{self, MessageType, SUBTYPE_NONE};
use crate::host::{HostInfo, HostState, VpnIp};
use crate::hostmap::HostMap;
use crate::lighthouse::{EncWriter, Lighthouse};
use crate::metrics::{HandshakeMetrics, MessageMetrics};
use crate::relay::RelayState;
use crate::timerwheel::TimerWheel;

/// Stage index of the first handshake packet
pub const HANDSHAKE_STAGE_1: u8 = 0;

/// Attempts to find an unused random local index before giving up
const INDEX_ATTEMPTS: usize = 32;

/// Drives pending tunnels to completion with retries, lighthouse queries and
/// relay fallback
pub struct HandshakeManager {
    pending: Arc<HostMap>,
    main: Arc<HostMap>,
    lighthouse: Arc<dyn Lighthouse>,
    config: HandshakeConfig,

    wheel: Mutex<TimerWheel>,
    trigger_tx: mpsc::Sender<VpnIp>,
    trigger_rx: Mutex<Option<mpsc::Receiver<VpnIp>>>,

    pub metrics: HandshakeMetrics,
    pub message_metrics: MessageMetrics,
}

impl HandshakeManager {
    /// Build a manager around an existing main host-map. The pending map is
    /// created here and shares the main map's preferred ranges.
    pub fn new(
        config: HandshakeConfig,
        main: Arc<HostMap>,
        lighthouse: Arc<dyn Lighthouse>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(config.trigger_buffer);
        let pending = Arc::new(HostMap::new(
            "pending",
            main.preferred_ranges().to_vec(),
        ));
        let wheel = TimerWheel::new(config.try_interval, config.handshake_horizon());

        Self {
            pending,
            main,
            lighthouse,
            config,
            wheel: Mutex::new(wheel),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
            metrics: HandshakeMetrics::new(),
            message_metrics: MessageMetrics::new(),
        }
    }

    /// Sender half of the trigger channel: a lighthouse reply for a vpn ip
    /// accelerates its first outbound attempt.
    pub fn trigger(&self) -> mpsc::Sender<VpnIp> {
        self.trigger_tx.clone()
    }

    pub fn pending_hostmap(&self) -> &Arc<HostMap> {
        &self.pending
    }

    pub fn main_hostmap(&self) -> &Arc<HostMap> {
        &self.main
    }

    /// The manager loop. Runs until `shutdown` is notified; an in-flight
    /// outbound attempt completes before exit.
    pub async fn run(&self, writer: Arc<dyn EncWriter>, shutdown: Arc<Notify>) {
        let Some(mut trigger_rx) = self.trigger_rx.lock().take() else {
            warn!("handshake manager is already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.config.try_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!("handshake manager started");
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("handshake manager stopped");
                    return;
                }
                Some(vpn_ip) = trigger_rx.recv() => {
                    self.handle_outbound(vpn_ip, writer.as_ref(), true).await;
                }
                _ = ticker.tick() => {
                    self.next_outbound_timer_tick(Instant::now(), writer.as_ref()).await;
                }
            }
        }
    }

    /// Advance the wheel and run an outbound attempt for everything that
    /// came due.
    pub(crate) async fn next_outbound_timer_tick(&self, now: Instant, writer: &dyn EncWriter) {
        let due: Vec<VpnIp> = {
            let mut wheel = self.wheel.lock();
            wheel.advance(now);
            std::iter::from_fn(|| wheel.purge()).collect()
        };

        for vpn_ip in due {
            self.handle_outbound(vpn_ip, writer, false).await;
        }
    }

    /// One outbound attempt for a pending tunnel.
    pub(crate) async fn handle_outbound(
        &self,
        vpn_ip: VpnIp,
        writer: &dyn EncWriter,
        lighthouse_triggered: bool,
    ) {
        let Some(hostinfo) = self.pending.query_vpn_ip(vpn_ip).await else {
            return;
        };
        let mut state = hostinfo.state().lock().await;

        // We may have raced with an inbound response; make sure a completed
        // tunnel does not linger in the pending map.
        if state.handshake_complete {
            drop(state);
            self.pending.delete_host_info(&hostinfo).await;
            return;
        }

        // The wheel can tick before the crypto layer has produced the first
        // packet; push the attempt out and keep waiting.
        if !state.handshake_ready {
            let delay = self.config.try_interval * state.handshake_counter.max(1);
            self.wheel.lock().add(vpn_ip, delay);
            return;
        }

        // Out of retries, clean up.
        if state.handshake_counter >= self.config.retries {
            info!(
                "handshake with {} timed out after {} attempts ({:?} elapsed, local index {})",
                vpn_ip,
                state.handshake_counter,
                state.handshake_start.elapsed(),
                hostinfo.local_index_id()
            );
            self.metrics.timed_out.fetch_add(1, Ordering::Relaxed);
            drop(state);
            self.pending.delete_host_info(&hostinfo).await;
            return;
        }

        // A lighthouse reply only accelerates the first transmission;
        // afterwards it would just make us aggressive.
        if lighthouse_triggered && state.handshake_counter > 0 {
            return;
        }

        if state.remotes.is_none() {
            state.remotes = Some(self.lighthouse.query_cache(vpn_ip));
        }

        let (addrs, relays) = match &state.remotes {
            Some(remotes) => (
                remotes.addrs_preferred_first(self.pending.preferred_ranges()),
                remotes.relays().to_vec(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        // With at most one known endpoint our cache lookup likely raced the
        // peer's own registration; ask the lighthouse directly to shortcut
        // the discovery.
        if addrs.len() <= 1 {
            self.lighthouse.query_server(vpn_ip, writer).await;
        }

        let Some(packet) = hostinfo.handshake_packet(HANDSHAKE_STAGE_1) else {
            // ready flag without a stored packet; treat as not ready
            let delay = self.config.try_interval * state.handshake_counter.max(1);
            self.wheel.lock().add(vpn_ip, delay);
            return;
        };

        // Stage 2 picks the winning endpoint from whoever answers first, so
        // fan out to everything we know. Per-endpoint failures are logged
        // and swallowed; the retry loop covers us.
        let mut sent_to = Vec::with_capacity(addrs.len());
        for addr in addrs {
            self.message_metrics
                .tx(MessageType::Handshake, header::subtype_of(&packet), 1);
            match writer.write_to(&packet, addr).await {
                Ok(()) => sent_to.push(addr),
                Err(e) => {
                    error!(
                        "failed to send handshake to {} at {}: {}",
                        vpn_ip, addr, e
                    );
                }
            }
        }

        if !sent_to.is_empty() {
            info!(
                "handshake sent to {} at {:?} (attempt {}, local index {})",
                vpn_ip,
                sent_to,
                state.handshake_counter + 1,
                hostinfo.local_index_id()
            );
        }

        if self.config.use_relays && !relays.is_empty() {
            self.try_relays(vpn_ip, &relays, &packet, writer).await;
        }

        // Linear backoff: attempt n waits n intervals.
        state.handshake_counter += 1;

        // A lighthouse-triggered attempt is still parked in the wheel from
        // its original schedule; only tick-driven attempts re-arm.
        if !lighthouse_triggered {
            let delay = self.config.try_interval * state.handshake_counter;
            self.wheel.lock().add(vpn_ip, delay);
        }
    }

    /// Attempt relayed delivery of the handshake through every advertised
    /// relay candidate.
    async fn try_relays(
        &self,
        vpn_ip: VpnIp,
        relays: &[VpnIp],
        packet: &[u8],
        writer: &dyn EncWriter,
    ) {
        let my_vpn_ip = self.lighthouse.my_vpn_ip();

        for &relay_ip in relays {
            // Never relay through ourselves or through the peer we are
            // trying to reach.
            if relay_ip == vpn_ip || relay_ip == my_vpn_ip {
                continue;
            }

            let Some(relay_host) = self.main.query_vpn_ip(relay_ip).await else {
                info!(
                    "no direct tunnel to relay {} for {}; starting one",
                    relay_ip, vpn_ip
                );
                writer.handshake(relay_ip).await;
                continue;
            };

            match relay_host.query_relay_for(vpn_ip) {
                Some(relay) if relay.state == RelayState::Established => {
                    info!("sending handshake to {} via relay {}", vpn_ip, relay_ip);
                    writer.send_via(&relay_host, &relay, packet).await;
                }
                Some(relay) if relay.state == RelayState::Requested => {
                    // The previous request may have been lost; requests are
                    // idempotent, so just send it again.
                    info!("re-sending relay request to {} for {}", relay_ip, vpn_ip);
                    self.send_create_relay_request(
                        relay_ip,
                        relay.local_index,
                        my_vpn_ip,
                        vpn_ip,
                        writer,
                    )
                    .await;
                }
                Some(_) => {}
                None => {
                    let index = relay_host.add_relay(vpn_ip);
                    self.send_create_relay_request(relay_ip, index, my_vpn_ip, vpn_ip, writer)
                        .await;
                }
            }
        }
    }

    async fn send_create_relay_request(
        &self,
        relay_ip: VpnIp,
        index: u32,
        from: VpnIp,
        to: VpnIp,
        writer: &dyn EncWriter,
    ) {
        let msg = ControlMessage::create_relay_request(index, from.as_u32(), to.as_u32());
        self.message_metrics.tx(MessageType::Control, SUBTYPE_NONE, 1);
        writer
            .send_message_to_vpn_ip(
                MessageType::Control,
                SUBTYPE_NONE,
                relay_ip,
                &msg.encode_to_vec(),
            )
            .await;
    }

    /// Process a `CreateRelayResponse` from `relay_peer`.
    pub async fn handle_create_relay_response(&self, relay_peer: VpnIp, msg: &ControlMessage) {
        let Some(relay_host) = self.main.query_vpn_ip(relay_peer).await else {
            warn!("relay response from {} without a tunnel", relay_peer);
            return;
        };
        crate::relay::handle_create_relay_response(
            &relay_host,
            msg.initiator_relay_index,
            msg.responder_relay_index,
            VpnIp::from(msg.relay_to_ip),
        );
    }

    /// Start (or join) an outbound handshake toward `vpn_ip`. `init` runs
    /// under the pending-map write lock for newly created entries and is the
    /// hook where the crypto layer installs its first packet.
    pub async fn add_vpn_ip<F>(&self, vpn_ip: VpnIp, init: F) -> Arc<HostInfo>
    where
        F: FnOnce(&HostInfo, &mut HostState),
    {
        let (hostinfo, created) = self.pending.add_vpn_ip(vpn_ip, init).await;

        if created {
            self.wheel.lock().add(vpn_ip, self.config.try_interval);
            self.metrics.initiated.fetch_add(1, Ordering::Relaxed);
        }

        hostinfo
    }

    /// Promote a verified inbound handshake into the main host-map, checking
    /// for every conflict that can arise from races. On success the
    /// displaced main-table entry (if any) is returned for teardown and any
    /// datagrams buffered on the tunnel are flushed through `writer`.
    ///
    /// The decision signals:
    /// - [`CoordinationError::AlreadySeen`]: a delayed duplicate of a
    ///   handshake packet we already accepted
    /// - [`CoordinationError::ExistingHostInfo`]: the main table holds a
    ///   newer tunnel; drop this one
    /// - [`CoordinationError::LocalIndexCollision`]: another entry owns this
    ///   local index; the caller must reroll
    /// - [`CoordinationError::ExistingHandshake`]: our own pending handshake
    ///   wins (only without `overwrite`)
    pub async fn check_and_complete(
        &self,
        hostinfo: Arc<HostInfo>,
        packet_index: u8,
        overwrite: bool,
        writer: &dyn EncWriter,
    ) -> Result<Option<Arc<HostInfo>>, CoordinationError> {
        let displaced = {
            let mut pending = self.pending.inner().write().await;
            let mut main = self.main.inner().write().await;

            let existing = main.hosts.get(&hostinfo.vpn_ip()).cloned();
            if let Some(existing) = &existing {
                // A delayed duplicate of a packet we already processed?
                if hostinfo.handshake_packet_matches(existing, packet_index) {
                    return Err(CoordinationError::AlreadySeen(existing.clone()));
                }

                // Only a strictly newer handshake may displace a tunnel.
                if existing.last_handshake_time() >= hostinfo.last_handshake_time() {
                    return Err(CoordinationError::ExistingHostInfo(existing.clone()));
                }

                info!(
                    "taking newer handshake for {}, replacing the existing tunnel",
                    hostinfo.vpn_ip()
                );
            }

            if let Some(collision) = main.indexes.get(&hostinfo.local_index_id()) {
                return Err(CoordinationError::LocalIndexCollision(collision.clone()));
            }

            if let Some(collision) = pending.indexes.get(&hostinfo.local_index_id()) {
                if !Arc::ptr_eq(collision, &hostinfo) {
                    return Err(CoordinationError::LocalIndexCollision(collision.clone()));
                }
            }

            // Remote indices are peer-controlled; a shadow is possible and
            // only worth a note.
            if let Some(shadow) = main.remote_indexes.get(&hostinfo.remote_index_id()) {
                if shadow.vpn_ip() != hostinfo.vpn_ip() {
                    info!(
                        "new tunnel to {} shadows remote index {} of {}",
                        hostinfo.vpn_ip(),
                        hostinfo.remote_index_id(),
                        shadow.vpn_ip()
                    );
                }
            }

            // Are we also handshaking with this peer right now?
            if let Some(pending_entry) = pending.hosts.get(&hostinfo.vpn_ip()).cloned() {
                if !overwrite {
                    return Err(CoordinationError::ExistingHandshake(pending_entry));
                }

                // We lost the race; keep the datagrams the losing attempt
                // buffered so they go out over the winning tunnel.
                hostinfo.absorb_buffered_packets(&pending_entry);
                pending.remove(&pending_entry);
                info!(
                    "handshake race with {} lost, pending attempt replaced by completed tunnel",
                    hostinfo.vpn_ip()
                );
            }

            if let Some(existing) = &existing {
                main.remove(existing);
            }

            // The promoted entry may still hold a pending index slot.
            pending.remove(&hostinfo);
            main.insert(&hostinfo);
            existing
        };

        self.flush_buffered_packets(&hostinfo, writer).await;
        Ok(displaced)
    }

    /// Responder-path promotion: the entry already sits in the pending map
    /// under its local index, so uniqueness was secured at insertion and no
    /// collision checks are needed.
    pub async fn complete(&self, hostinfo: Arc<HostInfo>, writer: &dyn EncWriter) {
        {
            let mut pending = self.pending.inner().write().await;
            let mut main = self.main.inner().write().await;

            if let Some(existing) = main.hosts.get(&hostinfo.vpn_ip()).cloned() {
                if !Arc::ptr_eq(&existing, &hostinfo) {
                    main.remove(&existing);
                }
            }

            if let Some(shadow) = main.remote_indexes.get(&hostinfo.remote_index_id()) {
                if shadow.vpn_ip() != hostinfo.vpn_ip() {
                    info!(
                        "new tunnel to {} shadows remote index {} of {}",
                        hostinfo.vpn_ip(),
                        hostinfo.remote_index_id(),
                        shadow.vpn_ip()
                    );
                }
            }

            main.insert(&hostinfo);
            pending.remove(&hostinfo);
        }

        self.flush_buffered_packets(&hostinfo, writer).await;
    }

    /// Send everything that was queued while the handshake was in flight.
    /// Runs after the map locks are released.
    async fn flush_buffered_packets(&self, hostinfo: &Arc<HostInfo>, writer: &dyn EncWriter) {
        let packets = hostinfo.take_buffered_packets();
        if packets.is_empty() {
            return;
        }

        debug!(
            "flushing {} buffered packets to {}",
            packets.len(),
            hostinfo.vpn_ip()
        );
        for packet in packets {
            self.message_metrics.tx(MessageType::Message, SUBTYPE_NONE, 1);
            writer
                .send_message_to_vpn_ip(
                    MessageType::Message,
                    SUBTYPE_NONE,
                    hostinfo.vpn_ip(),
                    &packet,
                )
                .await;
        }
    }

    /// Allocate a process-unique non-zero local index for `hostinfo` and
    /// register it in the pending map.
    pub async fn add_index_host_info(
        &self,
        hostinfo: &Arc<HostInfo>,
    ) -> Result<(), CoordinationError> {
        self.add_index_host_info_with_rng(hostinfo, &mut rand::thread_rng())
            .await
    }

    /// Index allocation with a caller-supplied RNG; collisions against both
    /// maps force a reroll, bounded by [`INDEX_ATTEMPTS`].
    pub async fn add_index_host_info_with_rng(
        &self,
        hostinfo: &Arc<HostInfo>,
        rng: &mut dyn RngCore,
    ) -> Result<(), CoordinationError> {
        let mut pending = self.pending.inner().write().await;
        let main = self.main.inner().read().await;

        for _ in 0..INDEX_ATTEMPTS {
            let index = generate_index(rng);

            if !pending.indexes.contains_key(&index) && !main.indexes.contains_key(&index) {
                hostinfo.set_local_index_id(index);
                pending.indexes.insert(index, hostinfo.clone());
                return Ok(());
            }
        }

        Err(CoordinationError::UniqueIndexExhausted)
    }

    /// Register the remote-chosen index for a pending tunnel.
    pub async fn add_remote_index(&self, index: u32, hostinfo: &Arc<HostInfo>) {
        self.pending.add_remote_index(index, hostinfo).await;
    }

    /// Drop a pending tunnel.
    pub async fn delete_host_info(&self, hostinfo: &Arc<HostInfo>) {
        self.pending.delete_host_info(hostinfo).await;
    }

    /// Look up a pending tunnel by local index.
    pub async fn query_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.pending.query_index(index).await
    }
}

/// A random non-zero 32-bit index; zero means "unknown" on the wire.
fn generate_index(rng: &mut dyn RngCore) -> u32 {
    loop {
        let index = rng.next_u32();
        if index != 0 {
            return index;
        }
    }
}
