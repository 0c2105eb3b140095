//! Passive discovery and candidate verification.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use inet_util::{InetAddress, MacAddress};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::{
    CandidateVerdict, DeviceAccess, DiscoverySettings, DiscoverySource, NewNodeCandidate,
    NewNodeQueue, RouteEntry,
};
use crate::config::DiscoveryConfig;
use crate::objects::{ManagedObject, ObjectClass, ObjectId, ObjectIndex, ZoneId};
use crate::poller::PollerHandle;
use crate::{Error, Result};

/// Stages of a discovery poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStage {
    Start,
    FetchArpCache,
    FetchRoutingTable,
    Finished,
}

impl DiscoveryStage {
    fn status(&self) -> &'static str {
        match self {
            Self::Start => "starting",
            Self::FetchArpCache => "reading ARP cache",
            Self::FetchRoutingTable => "reading routing table",
            Self::Finished => "finished",
        }
    }
}

/// Result of one discovery poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryPollSummary {
    pub arp_entries: usize,
    pub routes: usize,
    pub queued: usize,
}

/// Finds new node addresses and feeds the [`NewNodeQueue`].
pub struct DiscoveryEngine {
    index: Arc<ObjectIndex>,
    access: Arc<dyn DeviceAccess>,
    queue: Arc<NewNodeQueue>,
    settings: Arc<DiscoverySettings>,
}

impl DiscoveryEngine {
    pub fn new(
        index: Arc<ObjectIndex>,
        access: Arc<dyn DeviceAccess>,
        queue: Arc<NewNodeQueue>,
        settings: Arc<DiscoverySettings>,
    ) -> Self {
        Self {
            index,
            access,
            queue,
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<NewNodeQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &Arc<DiscoverySettings> {
        &self.settings
    }

    pub fn passive_enabled(&self) -> bool {
        self.settings.passive_enabled()
    }

    /// Drop pending candidates and reload the discovery switches.
    pub fn reset(&self, config: &DiscoveryConfig) {
        let dropped = self.queue.clear();
        self.settings.apply(config);
        info!(dropped, "Discovery poller reset");
    }

    /// Discovery poll of the node behind `handle`.
    pub async fn discovery_poll(&self, handle: &PollerHandle) -> Result<DiscoveryPollSummary> {
        handle.checkpoint()?;
        let node = handle.object();
        if node.class() != ObjectClass::Node {
            return Err(Error::validation(format!(
                "discovery poll requested for {} {}",
                node.class(),
                node.id()
            )));
        }
        if node.is_deleted() {
            node.set_last_discovery(Utc::now());
            return Ok(DiscoveryPollSummary::default());
        }

        debug!(object_id = node.id(), name = node.name(), zone = node.zone(), "Starting discovery poll");

        let mut summary = DiscoveryPollSummary::default();
        let mut stage = DiscoveryStage::Start;
        loop {
            handle.set_status(stage.status());
            stage = match stage {
                DiscoveryStage::Start => DiscoveryStage::FetchArpCache,
                DiscoveryStage::FetchArpCache => {
                    self.process_arp_cache(node, &mut summary).await;
                    handle.checkpoint()?;
                    DiscoveryStage::FetchRoutingTable
                }
                DiscoveryStage::FetchRoutingTable => {
                    self.process_routing_table(node, &mut summary).await;
                    DiscoveryStage::Finished
                }
                DiscoveryStage::Finished => break,
            };
        }

        node.set_last_discovery(Utc::now());
        debug!(
            object_id = node.id(),
            arp_entries = summary.arp_entries,
            routes = summary.routes,
            queued = summary.queued,
            "Finished discovery poll"
        );
        Ok(summary)
    }

    async fn process_arp_cache(&self, node: &ManagedObject, summary: &mut DiscoveryPollSummary) {
        let entries = match self.access.fetch_arp_cache(node).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(object_id = node.id(), error = %e, "Cannot read ARP cache");
                return;
            }
        };
        summary.arp_entries = entries.len();
        for entry in entries {
            if entry.mac.is_broadcast() {
                continue;
            }
            let verdict = self.check_potential_node_from(
                node,
                entry.ip,
                entry.if_index,
                Some(entry.mac),
                DiscoverySource::ArpCache,
            );
            if verdict.is_queued() {
                summary.queued += 1;
            }
        }
    }

    async fn process_routing_table(
        &self,
        node: &ManagedObject,
        summary: &mut DiscoveryPollSummary,
    ) {
        let routes = match self.access.fetch_routing_table(node).await {
            Ok(routes) => routes,
            Err(e) => {
                warn!(object_id = node.id(), error = %e, "Cannot read routing table");
                return;
            }
        };
        summary.routes = routes.len();
        for route in &routes {
            let verdict = self.check_potential_node_from(
                node,
                route.next_hop,
                route.if_index,
                None,
                DiscoverySource::RoutingTable,
            );
            if verdict.is_queued() {
                summary.queued += 1;
            }
            if route.is_host_route() && self.check_host_route(node, route).is_queued() {
                summary.queued += 1;
            }
        }
    }

    /// Host routes are followed only when the destination is directly
    /// connected through the route's interface.
    fn check_host_route(&self, node: &ManagedObject, route: &RouteEntry) -> CandidateVerdict {
        let dest = route.destination.address();
        let connected = node
            .with_node(|n| {
                n.interface_by_index(route.if_index)
                    .and_then(|i| i.find_same_subnet_address(dest))
                    .is_some_and(|a| a.is_valid_unicast())
            })
            .unwrap_or(false);
        if !connected {
            trace!(object_id = node.id(), %dest, if_index = route.if_index, "Host route not directly connected");
            return CandidateVerdict::NoInterface;
        }
        self.check_potential_node_from(node, dest, route.if_index, None, DiscoverySource::RoutingTable)
    }

    /// Check an address seen in the ARP cache or routing table of `node`.
    pub fn check_potential_node_from(
        &self,
        node: &ManagedObject,
        ip: IpAddr,
        if_index: u32,
        mac: Option<MacAddress>,
        source: DiscoverySource,
    ) -> CandidateVerdict {
        let zone = node.zone();
        let verdict = self.common_checks(ip, zone).unwrap_or_else(|| {
            let iface_addr = node
                .with_node(|n| {
                    n.interface_by_index(if_index)
                        .and_then(|i| i.find_same_subnet_address(ip))
                        .or_else(|| {
                            n.interfaces
                                .iter()
                                .find_map(|i| i.find_same_subnet_address(ip))
                        })
                })
                .flatten()
                .filter(|a| a.is_valid_unicast());

            match iface_addr {
                None => CandidateVerdict::NoInterface,
                Some(iface) if InetAddress::host(ip).is_subnet_broadcast(iface.mask_bits()) => {
                    CandidateVerdict::SubnetBroadcast
                }
                Some(iface) => self.enqueue(NewNodeCandidate {
                    address: InetAddress::host(ip).with_mask_bits(iface.mask_bits()),
                    zone,
                    mac,
                    ignore_filter: false,
                    source,
                    source_node: Some(node.id()),
                }),
            }
        });

        trace!(
            object_id = node.id(),
            %ip,
            if_index,
            source = %source,
            ?verdict,
            "Checked potential node"
        );
        verdict
    }

    /// Check an address reported by syslog, an SNMP trap or a range scan.
    pub fn check_potential_node(
        &self,
        ip: IpAddr,
        zone: ZoneId,
        source: DiscoverySource,
        source_node: Option<ObjectId>,
    ) -> CandidateVerdict {
        let source_enabled = match source {
            DiscoverySource::SnmpTrap => self.settings.snmp_trap_enabled(),
            DiscoverySource::Syslog => self.settings.syslog_enabled(),
            _ => true,
        };
        if !source_enabled {
            return CandidateVerdict::SourceDisabled;
        }

        let verdict = self.common_checks(ip, zone).unwrap_or_else(|| {
            let host = InetAddress::host(ip);
            match self.index.find_subnet(zone, ip) {
                Some(subnet) if subnet.subnet_address() == ip => CandidateVerdict::SubnetBase,
                Some(subnet) if host.is_subnet_broadcast(subnet.mask_bits()) => {
                    CandidateVerdict::SubnetBroadcast
                }
                subnet => self.enqueue(NewNodeCandidate {
                    address: subnet.map_or(host, |s| host.with_mask_bits(s.mask_bits())),
                    zone,
                    mac: None,
                    ignore_filter: false,
                    source,
                    source_node,
                }),
            }
        });

        trace!(%ip, zone, source = %source, ?verdict, "Checked potential node");
        verdict
    }

    /// Checks shared by every source. `None` means the address passed.
    fn common_checks(&self, ip: IpAddr, zone: ZoneId) -> Option<CandidateVerdict> {
        if !InetAddress::host(ip).is_valid_unicast() {
            return Some(CandidateVerdict::InvalidAddress);
        }
        if let Some(owner) = self.index.find_node_by_ip(zone, ip) {
            return Some(CandidateVerdict::KnownNode(owner.id()));
        }
        if self.index.is_cluster_address(zone, ip) {
            return Some(CandidateVerdict::ClusterAddress);
        }
        if self.queue.contains(ip) {
            return Some(CandidateVerdict::AlreadyQueued);
        }
        None
    }

    fn enqueue(&self, candidate: NewNodeCandidate) -> CandidateVerdict {
        let address = candidate.address;
        let source = candidate.source;
        if self.queue.push(candidate) {
            debug!(%address, source = %source, "New node queued");
            CandidateVerdict::Queued(address)
        } else {
            CandidateVerdict::AlreadyQueued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::NoDeviceAccess;
    use crate::objects::{ClusterData, Interface, NodeData, ObjectKind, SubnetData};

    fn engine(index: &Arc<ObjectIndex>) -> DiscoveryEngine {
        DiscoveryEngine::new(
            index.clone(),
            Arc::new(NoDeviceAccess),
            Arc::new(NewNodeQueue::new()),
            Arc::new(DiscoverySettings::default()),
        )
    }

    fn router(index: &ObjectIndex) -> Arc<ManagedObject> {
        let data = NodeData::new(0)
            .with_interface(Interface::new(2, "eth0").with_address("10.0.0.1/24".parse().unwrap()));
        index.create("router", ObjectKind::Node(data))
    }

    #[test]
    fn test_candidate_from_node_gets_interface_mask() {
        let index = Arc::new(ObjectIndex::new());
        let engine = engine(&index);
        let node = router(&index);
        let mac: MacAddress = "00:11:22:33:44:55".parse().unwrap();

        let verdict = engine.check_potential_node_from(
            &node,
            "10.0.0.5".parse().unwrap(),
            2,
            Some(mac),
            DiscoverySource::ArpCache,
        );
        assert_eq!(verdict, CandidateVerdict::Queued("10.0.0.5/24".parse().unwrap()));

        let queued = engine.queue().snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].mac, Some(mac));
        assert_eq!(queued[0].source_node, Some(node.id()));
    }

    #[test]
    fn test_rejections_from_node() {
        let index = Arc::new(ObjectIndex::new());
        let engine = engine(&index);
        let node = router(&index);
        index.create(
            "cluster",
            ObjectKind::Cluster(ClusterData {
                zone: 0,
                resource_addresses: vec!["10.0.0.50".parse().unwrap()],
                members: vec![],
            }),
        );
        let check = |ip: &str| {
            engine.check_potential_node_from(&node, ip.parse().unwrap(), 2, None, DiscoverySource::RoutingTable)
        };

        assert_eq!(check("224.0.0.5"), CandidateVerdict::InvalidAddress);
        assert_eq!(check("0.0.0.0"), CandidateVerdict::InvalidAddress);
        assert_eq!(check("10.0.0.1"), CandidateVerdict::KnownNode(node.id()));
        assert_eq!(check("10.0.0.50"), CandidateVerdict::ClusterAddress);
        assert_eq!(check("10.0.0.255"), CandidateVerdict::SubnetBroadcast);
        assert_eq!(check("172.16.0.1"), CandidateVerdict::NoInterface);
        assert!(check("10.0.0.9").is_queued());
        assert_eq!(check("10.0.0.9"), CandidateVerdict::AlreadyQueued);
    }

    #[test]
    fn test_external_source_uses_subnet() {
        let index = Arc::new(ObjectIndex::new());
        let engine = engine(&index);
        index.create(
            "lan",
            ObjectKind::Subnet(SubnetData {
                zone: 0,
                network: "192.168.10.0/24".parse().unwrap(),
            }),
        );
        let check = |ip: &str| {
            engine.check_potential_node(ip.parse().unwrap(), 0, DiscoverySource::ActiveDiscovery, None)
        };

        assert_eq!(check("192.168.10.0"), CandidateVerdict::SubnetBase);
        assert_eq!(check("192.168.10.255"), CandidateVerdict::SubnetBroadcast);
        assert_eq!(
            check("192.168.10.20"),
            CandidateVerdict::Queued("192.168.10.20/24".parse().unwrap())
        );
        assert_eq!(
            check("172.20.0.4"),
            CandidateVerdict::Queued("172.20.0.4/32".parse().unwrap())
        );
    }

    #[test]
    fn test_trap_and_syslog_gated() {
        let index = Arc::new(ObjectIndex::new());
        let engine = engine(&index);
        let ip: IpAddr = "10.9.9.9".parse().unwrap();
        assert_eq!(
            engine.check_potential_node(ip, 0, DiscoverySource::SnmpTrap, None),
            CandidateVerdict::SourceDisabled
        );

        let config = DiscoveryConfig {
            snmp_trap_enabled: true,
            ..Default::default()
        };
        engine.reset(&config);
        assert!(engine.check_potential_node(ip, 0, DiscoverySource::SnmpTrap, None).is_queued());
        assert_eq!(
            engine.check_potential_node(ip, 0, DiscoverySource::Syslog, None),
            CandidateVerdict::SourceDisabled
        );
    }

    #[test]
    fn test_reset_clears_queue() {
        let index = Arc::new(ObjectIndex::new());
        let engine = engine(&index);
        engine.check_potential_node("10.1.1.1".parse().unwrap(), 0, DiscoverySource::ActiveDiscovery, None);
        assert_eq!(engine.queue().len(), 1);
        engine.reset(&DiscoveryConfig::default());
        assert!(engine.queue().is_empty());
    }
}
