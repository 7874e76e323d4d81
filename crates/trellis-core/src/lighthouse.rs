//! Seams to the rendezvous service and the send path
//!
//! The handshake manager drives these traits; the implementations (UDP
//! socket, lighthouse client, encrypted interface) live outside this crate.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::header::MessageType;
use crate::host::{HostInfo, RemoteList, VpnIp};
use crate::relay::Relay;

/// Rendezvous lookup service
#[async_trait]
pub trait Lighthouse: Send + Sync {
    /// Endpoints already known for a peer. Non-blocking.
    fn query_cache(&self, vpn_ip: VpnIp) -> RemoteList;

    /// Enqueue an async lookup over the existing tunnel to the lighthouses.
    /// Failure degrades to "no new remotes".
    async fn query_server(&self, vpn_ip: VpnIp, writer: &dyn EncWriter);

    /// Our own overlay address.
    fn my_vpn_ip(&self) -> VpnIp;
}

/// The send surface the manager writes through. Socket writes may block
/// briefly.
#[async_trait]
pub trait EncWriter: Send + Sync {
    /// Raw UDP send of an already-framed packet.
    async fn write_to(&self, packet: &[u8], addr: SocketAddr) -> std::io::Result<()>;

    /// Wrap `data` for relayed delivery (12-byte nonce region prepended by
    /// the implementation) and send it through the established tunnel to the
    /// relay peer.
    async fn send_via(&self, relay_host: &Arc<HostInfo>, relay: &Relay, data: &[u8]);

    /// Send a framed message over the established tunnel to a peer.
    async fn send_message_to_vpn_ip(
        &self,
        message_type: MessageType,
        subtype: u8,
        vpn_ip: VpnIp,
        payload: &[u8],
    );

    /// Kick off a nested handshake toward another peer (used to bring up the
    /// direct tunnel to a relay).
    async fn handshake(&self, vpn_ip: VpnIp);
}
