use inet_util::{InetAddress, MacAddress};
use serde::Serialize;

use crate::objects::{ObjectId, ZoneId};

/// Where a potential node address was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiscoverySource {
    ArpCache,
    RoutingTable,
    ActiveDiscovery,
    SnmpTrap,
    Syslog,
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ArpCache => "ARP cache",
            Self::RoutingTable => "routing table",
            Self::ActiveDiscovery => "active discovery",
            Self::SnmpTrap => "SNMP trap",
            Self::Syslog => "syslog",
        };
        f.write_str(name)
    }
}

/// Verified address waiting for node creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewNodeCandidate {
    /// Host address with the mask of the subnet it was found in.
    pub address: InetAddress,
    pub zone: ZoneId,
    pub mac: Option<MacAddress>,
    /// Skip the discovery filter when creating the node.
    pub ignore_filter: bool,
    pub source: DiscoverySource,
    pub source_node: Option<ObjectId>,
}

/// Outcome of checking one potential node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateVerdict {
    Queued(InetAddress),
    /// Unspecified, broadcast, multicast or loopback.
    InvalidAddress,
    KnownNode(ObjectId),
    ClusterAddress,
    AlreadyQueued,
    /// No interface of the reporting node is on the address' subnet.
    NoInterface,
    SubnetBase,
    SubnetBroadcast,
    SourceDisabled,
}

impl CandidateVerdict {
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }
}
