//! Host-map: the pending and main tunnel tables
//!
//! Each table indexes the same [`HostInfo`] entries three ways: by overlay
//! address, by our local index and by the index the remote chose. A tunnel
//! lives in the pending table while the handshake is in flight and moves to
//! the main table on promotion.

use std::collections::HashMap;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::RwLock;
use tracing::debug;

use crate::host::{HostInfo, HostState, VpnIp};

/// The three indices of one table. For any entry `h` present in the table:
/// `hosts[h.vpn_ip] == h`, `indexes[h.local_index_id] == h`, and when the
/// remote index is non-zero, `remote_indexes[h.remote_index_id] == h`.
#[derive(Default)]
pub(crate) struct HostMapInner {
    pub(crate) hosts: HashMap<VpnIp, Arc<HostInfo>>,
    pub(crate) indexes: HashMap<u32, Arc<HostInfo>>,
    pub(crate) remote_indexes: HashMap<u32, Arc<HostInfo>>,
}

impl HostMapInner {
    /// Install an entry in every index it has a value for.
    pub(crate) fn insert(&mut self, info: &Arc<HostInfo>) {
        self.hosts.insert(info.vpn_ip(), info.clone());
        self.indexes.insert(info.local_index_id(), info.clone());
        let remote_index = info.remote_index_id();
        if remote_index != 0 {
            self.remote_indexes.insert(remote_index, info.clone());
        }
    }

    /// Remove an entry from every index that still points at it. Identity
    /// checked, so removing a displaced entry cannot evict its replacement.
    pub(crate) fn remove(&mut self, info: &Arc<HostInfo>) {
        if self
            .hosts
            .get(&info.vpn_ip())
            .is_some_and(|h| Arc::ptr_eq(h, info))
        {
            self.hosts.remove(&info.vpn_ip());
        }
        if self
            .indexes
            .get(&info.local_index_id())
            .is_some_and(|h| Arc::ptr_eq(h, info))
        {
            self.indexes.remove(&info.local_index_id());
        }
        if self
            .remote_indexes
            .get(&info.remote_index_id())
            .is_some_and(|h| Arc::ptr_eq(h, info))
        {
            self.remote_indexes.remove(&info.remote_index_id());
        }
    }
}

/// One tunnel table, reader-writer locked
pub struct HostMap {
    name: &'static str,
    state: RwLock<HostMapInner>,
    preferred_ranges: Vec<Ipv4Net>,
}

impl HostMap {
    pub fn new(name: &'static str, preferred_ranges: Vec<Ipv4Net>) -> Self {
        Self {
            name,
            state: RwLock::new(HostMapInner::default()),
            preferred_ranges,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ranges whose endpoints are preferred when sorting remote candidates.
    /// Immutable after construction.
    pub fn preferred_ranges(&self) -> &[Ipv4Net] {
        &self.preferred_ranges
    }

    pub(crate) fn inner(&self) -> &RwLock<HostMapInner> {
        &self.state
    }

    /// Insert-if-absent. `init` runs under the write lock, only for entries
    /// created by this call.
    pub async fn add_vpn_ip<F>(&self, vpn_ip: VpnIp, init: F) -> (Arc<HostInfo>, bool)
    where
        F: FnOnce(&HostInfo, &mut HostState),
    {
        let mut inner = self.state.write().await;
        if let Some(existing) = inner.hosts.get(&vpn_ip) {
            return (existing.clone(), false);
        }

        let info = Arc::new(HostInfo::new(vpn_ip));
        // The entry was created under the write lock and has not been shared
        // yet, so its state lock cannot be contended.
        if let Ok(mut state) = info.state().try_lock() {
            init(&info, &mut state);
        }
        inner.hosts.insert(vpn_ip, info.clone());
        let local_index = info.local_index_id();
        if local_index != 0 {
            inner.indexes.insert(local_index, info.clone());
        }

        debug!("{} hostmap: added {}", self.name, vpn_ip);
        (info, true)
    }

    pub async fn query_vpn_ip(&self, vpn_ip: VpnIp) -> Option<Arc<HostInfo>> {
        self.state.read().await.hosts.get(&vpn_ip).cloned()
    }

    pub async fn query_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.state.read().await.indexes.get(&index).cloned()
    }

    pub async fn query_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.state.read().await.remote_indexes.get(&index).cloned()
    }

    /// Register the index the remote chose for this tunnel.
    pub async fn add_remote_index(&self, index: u32, info: &Arc<HostInfo>) {
        info.set_remote_index_id(index);
        self.state
            .write()
            .await
            .remote_indexes
            .insert(index, info.clone());
    }

    /// Install an entry in all three indices.
    pub async fn add_host_info(&self, info: &Arc<HostInfo>) {
        self.state.write().await.insert(info);
        debug!(
            "{} hostmap: installed {} (local index {})",
            self.name,
            info.vpn_ip(),
            info.local_index_id()
        );
    }

    /// Remove an entry from every index. Idempotent.
    pub async fn delete_host_info(&self, info: &Arc<HostInfo>) {
        self.state.write().await.remove(info);
        debug!("{} hostmap: deleted {}", self.name, info.vpn_ip());
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.hosts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.hosts.is_empty()
    }
}
