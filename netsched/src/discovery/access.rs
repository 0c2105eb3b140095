use std::net::IpAddr;

use async_trait::async_trait;
use inet_util::{InetAddress, Ipv4Range, MacAddress};

use crate::objects::ManagedObject;
use crate::{Error, Result};

/// ARP cache entry reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpAddr,
    pub mac: MacAddress,
    pub if_index: u32,
}

/// Routing table entry reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: InetAddress,
    pub next_hop: IpAddr,
    pub if_index: u32,
}

impl RouteEntry {
    /// Route to a single host (`/32`, non-zero destination).
    pub fn is_host_route(&self) -> bool {
        self.destination.is_ipv4()
            && self.destination.mask_bits() == 32
            && !self.destination.is_unspecified()
    }
}

/// Device-facing operations used by discovery.
#[async_trait]
pub trait DeviceAccess: Send + Sync {
    async fn fetch_arp_cache(&self, node: &ManagedObject) -> Result<Vec<ArpEntry>>;

    async fn fetch_routing_table(&self, node: &ManagedObject) -> Result<Vec<RouteEntry>>;

    /// Ping every address of `range` from `proxy` and return the responders.
    async fn scan_range_via_proxy(
        &self,
        proxy: &ManagedObject,
        range: Ipv4Range,
    ) -> Result<Vec<IpAddr>>;
}

/// Device access for a scheduler without SNMP or agent connectivity.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDeviceAccess;

#[async_trait]
impl DeviceAccess for NoDeviceAccess {
    async fn fetch_arp_cache(&self, _node: &ManagedObject) -> Result<Vec<ArpEntry>> {
        Err(Error::collaborator("device access", "ARP cache not available"))
    }

    async fn fetch_routing_table(&self, _node: &ManagedObject) -> Result<Vec<RouteEntry>> {
        Err(Error::collaborator("device access", "routing table not available"))
    }

    async fn scan_range_via_proxy(
        &self,
        _proxy: &ManagedObject,
        _range: Ipv4Range,
    ) -> Result<Vec<IpAddr>> {
        Err(Error::collaborator("device access", "proxy scanning not available"))
    }
}
