//! Host-id to endpoint mapping shared by the membership subscriber.

use std::collections::HashMap;
use std::net::IpAddr;

use dashmap::{DashMap, DashSet};

/// Concurrent view of which endpoint owns which host id, plus the set of
/// endpoints currently leaving the ring.
#[derive(Default)]
pub struct TopologyMetaData {
    host_to_endpoint: DashMap<u32, IpAddr>,
    endpoint_to_host: DashMap<IpAddr, u32>,
    leaving: DashSet<IpAddr>,
}

impl TopologyMetaData {
    /// Empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `host_id` to `endpoint`, displacing any stale mapping either
    /// side held.
    pub fn update_host_id(&self, host_id: u32, endpoint: IpAddr) {
        if let Some((_, stale_endpoint)) = self.host_to_endpoint.remove(&host_id) {
            self.endpoint_to_host.remove(&stale_endpoint);
        }
        if let Some((_, stale_id)) = self.endpoint_to_host.remove(&endpoint) {
            self.host_to_endpoint.remove(&stale_id);
        }
        self.host_to_endpoint.insert(host_id, endpoint);
        self.endpoint_to_host.insert(endpoint, host_id);
    }

    /// Host id owned by `endpoint`, if any.
    #[must_use]
    pub fn get_host_id(&self, endpoint: IpAddr) -> Option<u32> {
        self.endpoint_to_host.get(&endpoint).map(|entry| *entry)
    }

    /// Endpoint owning `host_id`, if any.
    #[must_use]
    pub fn get_endpoint_for_host_id(&self, host_id: u32) -> Option<IpAddr> {
        self.host_to_endpoint.get(&host_id).map(|entry| *entry)
    }

    /// Whether `endpoint` currently owns a host id.
    #[must_use]
    pub fn is_member(&self, endpoint: IpAddr) -> bool {
        self.endpoint_to_host.contains_key(&endpoint)
    }

    /// Removes `endpoint` from the ring and the leaving set.
    pub fn remove_endpoint(&self, endpoint: IpAddr) {
        if let Some((_, host_id)) = self.endpoint_to_host.remove(&endpoint) {
            self.host_to_endpoint.remove(&host_id);
        }
        self.leaving.remove(&endpoint);
    }

    /// Marks `endpoint` as preparing to leave.
    pub fn add_leaving_endpoint(&self, endpoint: IpAddr) {
        self.leaving.insert(endpoint);
    }

    /// Endpoints currently leaving.
    #[must_use]
    pub fn leaving_endpoints(&self) -> Vec<IpAddr> {
        self.leaving.iter().map(|entry| *entry).collect()
    }

    /// Snapshot of the endpoint to host-id table for diagnostics.
    #[must_use]
    pub fn endpoint_host_map(&self) -> HashMap<IpAddr, u32> {
        self.endpoint_to_host
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
