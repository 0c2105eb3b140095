//! Object classes and their class-specific data.

use std::collections::HashSet;
use std::net::IpAddr;

use inet_util::{InetAddress, MacAddress};
use serde::{Deserialize, Serialize};

use crate::poller::PollType;

/// Unique object identifier.
pub type ObjectId = u32;

/// Zone identifier. Addresses are unique only within a zone.
pub type ZoneId = u32;

/// Zone used when zoning is not configured.
pub const DEFAULT_ZONE: ZoneId = 0;

/// Kind of managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    Node,
    Cluster,
    MobileDevice,
    Subnet,
    Condition,
    BusinessService,
}

impl ObjectClass {
    /// Poll types the admission loop schedules for this class.
    pub fn supported_polls(&self) -> &'static [PollType] {
        match self {
            Self::Node => &[
                PollType::Status,
                PollType::Configuration,
                PollType::InstanceDiscovery,
                PollType::RoutingTable,
                PollType::Discovery,
                PollType::Topology,
            ],
            Self::Cluster | Self::MobileDevice => &[
                PollType::Status,
                PollType::Configuration,
                PollType::InstanceDiscovery,
            ],
            Self::Condition => &[PollType::Condition],
            Self::BusinessService => &[PollType::BusinessService],
            Self::Subnet => &[],
        }
    }

    pub fn supports(&self, poll_type: PollType) -> bool {
        self.supported_polls().contains(&poll_type)
    }

    /// Whether objects of this class own data collection items.
    pub fn is_data_collection_target(&self) -> bool {
        matches!(self, Self::Node | Self::Cluster | Self::MobileDevice)
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Cluster => "cluster",
            Self::MobileDevice => "mobile device",
            Self::Subnet => "subnet",
            Self::Condition => "condition",
            Self::BusinessService => "business service",
        };
        f.write_str(name)
    }
}

/// Operational status of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ObjectStatus {
    Normal,
    Warning,
    Minor,
    Major,
    Critical,
    #[default]
    Unknown,
    /// Excluded from polling and data collection.
    Unmanaged,
}

/// Network interface of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub if_index: u32,
    pub name: String,
    pub addresses: Vec<InetAddress>,
    pub mac: Option<MacAddress>,
    pub loopback: bool,
}

impl Interface {
    pub fn new(if_index: u32, name: impl Into<String>) -> Self {
        Self {
            if_index,
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: InetAddress) -> Self {
        self.addresses.push(address);
        self
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    /// Interface address whose subnet contains `ip`.
    pub fn find_same_subnet_address(&self, ip: IpAddr) -> Option<InetAddress> {
        self.addresses.iter().copied().find(|a| a.contains(ip))
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.addresses.iter().any(|a| a.address() == ip)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeData {
    pub zone: ZoneId,
    pub primary_ip: Option<IpAddr>,
    pub interfaces: Vec<Interface>,
    /// Node runs the management server itself.
    pub local_management: bool,
    /// Nodes this node may collect data for when acting as a proxy.
    pub trusted_nodes: HashSet<ObjectId>,
}

impl NodeData {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            ..Default::default()
        }
    }

    pub fn with_primary_ip(mut self, ip: IpAddr) -> Self {
        self.primary_ip = Some(ip);
        self
    }

    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.primary_ip == Some(ip) || self.interfaces.iter().any(|i| i.has_address(ip))
    }

    pub fn interface_by_index(&self, if_index: u32) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.if_index == if_index)
    }

    pub fn is_trusted(&self, node: ObjectId) -> bool {
        self.trusted_nodes.contains(&node)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClusterData {
    pub zone: ZoneId,
    /// Virtual addresses owned by whichever member is active.
    pub resource_addresses: Vec<IpAddr>,
    pub members: Vec<ObjectId>,
}

#[derive(Debug, Clone)]
pub struct SubnetData {
    pub zone: ZoneId,
    pub network: InetAddress,
}

#[derive(Debug, Clone, Default)]
pub struct MobileDeviceData {
    pub device_id: String,
}

/// Class-specific object data.
#[derive(Debug, Clone)]
pub enum ObjectKind {
    Node(NodeData),
    Cluster(ClusterData),
    MobileDevice(MobileDeviceData),
    Subnet(SubnetData),
    Condition,
    BusinessService,
}

impl ObjectKind {
    pub fn class(&self) -> ObjectClass {
        match self {
            Self::Node(_) => ObjectClass::Node,
            Self::Cluster(_) => ObjectClass::Cluster,
            Self::MobileDevice(_) => ObjectClass::MobileDevice,
            Self::Subnet(_) => ObjectClass::Subnet,
            Self::Condition => ObjectClass::Condition,
            Self::BusinessService => ObjectClass::BusinessService,
        }
    }

    pub fn zone(&self) -> ZoneId {
        match self {
            Self::Node(n) => n.zone,
            Self::Cluster(c) => c.zone,
            Self::Subnet(s) => s.zone,
            _ => DEFAULT_ZONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_polls() {
        assert!(ObjectClass::Node.supports(PollType::Discovery));
        assert!(ObjectClass::Node.supports(PollType::Topology));
        assert!(!ObjectClass::Cluster.supports(PollType::Discovery));
        assert_eq!(ObjectClass::Condition.supported_polls(), &[PollType::Condition]);
        assert!(ObjectClass::Subnet.supported_polls().is_empty());
    }

    #[test]
    fn test_interface_same_subnet() {
        let iface = Interface::new(2, "eth0").with_address("10.0.0.1/24".parse().unwrap());
        let found = iface.find_same_subnet_address("10.0.0.5".parse().unwrap());
        assert_eq!(found.map(|a| a.mask_bits()), Some(24));
        assert!(iface.find_same_subnet_address("10.0.1.5".parse().unwrap()).is_none());
    }
}
