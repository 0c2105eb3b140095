//! Local management node bookkeeping.
//!
//! The server is itself represented by a node flagged as the local
//! management node. The check finds that node by the server's own
//! interface addresses, creates it when missing, and makes sure no other
//! node carries the flag.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use inet_util::InetAddress;
use tracing::{info, warn};

use super::PollType;
use crate::objects::{
    DEFAULT_ZONE, Interface, ManagedObject, NodeData, ObjectId, ObjectIndex, ObjectKind,
    Persistence,
};
use crate::{Error, Result};

/// Interface of the host running the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub if_index: u32,
    pub name: String,
    pub addresses: Vec<InetAddress>,
    pub loopback: bool,
}

/// Access to the host the scheduler runs on.
#[async_trait]
pub trait LocalHost: Send + Sync {
    async fn interfaces(&self) -> Result<Vec<LocalInterface>>;

    fn host_name(&self) -> String;
}

/// [`LocalHost`] backed by the operating system's interface list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLocalHost;

#[async_trait]
impl LocalHost for SystemLocalHost {
    async fn interfaces(&self) -> Result<Vec<LocalInterface>> {
        let addrs = tokio::task::spawn_blocking(if_addrs::get_if_addrs)
            .await
            .map_err(|e| Error::Other(format!("interface enumeration task failed: {e}")))??;

        // group addresses by interface name, keeping first-seen order as index
        let mut by_name: BTreeMap<String, LocalInterface> = BTreeMap::new();
        let mut next_index = 1;
        for if_addr in addrs {
            let (ip, bits) = match &if_addr.addr {
                if_addrs::IfAddr::V4(v4) => (
                    IpAddr::V4(v4.ip),
                    u32::from(v4.netmask).count_ones() as u8,
                ),
                if_addrs::IfAddr::V6(v6) => (
                    IpAddr::V6(v6.ip),
                    u128::from(v6.netmask).count_ones() as u8,
                ),
            };
            let loopback = if_addr.is_loopback();
            let entry = by_name.entry(if_addr.name.clone()).or_insert_with(|| {
                let iface = LocalInterface {
                    if_index: next_index,
                    name: if_addr.name.clone(),
                    addresses: Vec::new(),
                    loopback,
                };
                next_index += 1;
                iface
            });
            entry.addresses.push(InetAddress::new(ip, bits)?);
        }

        let mut interfaces: Vec<_> = by_name.into_values().collect();
        interfaces.sort_by_key(|i| i.if_index);
        Ok(interfaces)
    }

    fn host_name(&self) -> String {
        ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// Result of one management node check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtCheckOutcome {
    /// A node owning one of the local addresses was found.
    Existing(ObjectId),
    /// A node already flagged as management node was kept.
    Adopted(ObjectId),
    /// A new management node was created.
    Created(ObjectId),
}

impl MgmtCheckOutcome {
    pub fn node_id(&self) -> ObjectId {
        match self {
            Self::Existing(id) | Self::Adopted(id) | Self::Created(id) => *id,
        }
    }
}

pub struct ManagementNodeCheck {
    index: Arc<ObjectIndex>,
    local: Arc<dyn LocalHost>,
    persistence: Arc<dyn Persistence>,
    mgmt_node: AtomicU32,
}

impl ManagementNodeCheck {
    pub fn new(
        index: Arc<ObjectIndex>,
        local: Arc<dyn LocalHost>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            index,
            local,
            persistence,
            mgmt_node: AtomicU32::new(0),
        }
    }

    /// Id of the management node found by the last check.
    pub fn management_node(&self) -> Option<ObjectId> {
        match self.mgmt_node.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub async fn run(&self) -> Result<MgmtCheckOutcome> {
        let interfaces = match self.local.interfaces().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Cannot read local interface list");
                Vec::new()
            }
        };
        let candidates: Vec<_> = interfaces.iter().filter(|i| !i.loopback).collect();

        let mut outcome = None;
        'outer: for iface in &candidates {
            for addr in &iface.addresses {
                if let Some(node) = self.index.find_node_by_ip(DEFAULT_ZONE, addr.address()) {
                    let flagged = node
                        .update_node(|n| std::mem::replace(&mut n.local_management, true))
                        .unwrap_or(true);
                    if !flagged {
                        info!(
                            object_id = node.id(),
                            name = node.name(),
                            "Local management node did not carry the management flag"
                        );
                    }
                    outcome = Some(MgmtCheckOutcome::Existing(node.id()));
                    break 'outer;
                }
            }
        }

        if outcome.is_none() {
            let first_unicast = candidates
                .iter()
                .flat_map(|i| i.addresses.iter())
                .find(|a| a.is_valid_unicast())
                .copied();
            if let Some(addr) = first_unicast {
                let node = self.create_management_node(Some(addr), &candidates).await;
                outcome = Some(MgmtCheckOutcome::Created(node.id()));
            }
        }

        let outcome = match outcome {
            Some(found) => found,
            None => {
                let flagged = self
                    .index
                    .nodes()
                    .into_iter()
                    .find(|n| !n.is_deleted() && n.is_local_management_node());
                match flagged {
                    Some(node) => MgmtCheckOutcome::Adopted(node.id()),
                    None => {
                        let node = self.create_management_node(None, &[]).await;
                        MgmtCheckOutcome::Created(node.id())
                    }
                }
            }
        };

        self.clear_flag_on_others(outcome.node_id());
        self.mgmt_node.store(outcome.node_id(), Ordering::Release);
        Ok(outcome)
    }

    async fn create_management_node(
        &self,
        primary: Option<InetAddress>,
        interfaces: &[&LocalInterface],
    ) -> Arc<ManagedObject> {
        let mut data = NodeData::new(DEFAULT_ZONE);
        data.local_management = true;
        data.primary_ip = primary.map(|a| a.address());
        data.interfaces = interfaces
            .iter()
            .map(|i| Interface {
                if_index: i.if_index,
                name: i.name.clone(),
                addresses: i.addresses.clone(),
                mac: None,
                loopback: i.loopback,
            })
            .collect();

        let node = self
            .index
            .create(self.local.host_name(), ObjectKind::Node(data));
        if let Err(e) = self.persistence.create_node(&node).await {
            warn!(object_id = node.id(), error = %e, "Failed to persist management node");
        }
        node.force_poll(PollType::Configuration);

        info!(
            object_id = node.id(),
            name = node.name(),
            address = ?primary.map(|a| a.to_string()),
            "Created local management node"
        );
        node
    }

    fn clear_flag_on_others(&self, mgmt_id: ObjectId) {
        for node in self.index.nodes() {
            if node.id() == mgmt_id {
                continue;
            }
            let cleared = node
                .update_node(|n| std::mem::replace(&mut n.local_management, false))
                .unwrap_or(false);
            if cleared {
                info!(
                    object_id = node.id(),
                    name = node.name(),
                    "Cleared stale local management flag"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::NullPersistence;

    struct FixedHost(Vec<LocalInterface>);

    #[async_trait]
    impl LocalHost for FixedHost {
        async fn interfaces(&self) -> Result<Vec<LocalInterface>> {
            Ok(self.0.clone())
        }

        fn host_name(&self) -> String {
            "mgmt-server".to_string()
        }
    }

    fn iface(index: u32, addr: &str, loopback: bool) -> LocalInterface {
        LocalInterface {
            if_index: index,
            name: format!("if{index}"),
            addresses: vec![addr.parse().unwrap()],
            loopback,
        }
    }

    fn check(index: &Arc<ObjectIndex>, ifaces: Vec<LocalInterface>) -> ManagementNodeCheck {
        ManagementNodeCheck::new(
            index.clone(),
            Arc::new(FixedHost(ifaces)),
            Arc::new(NullPersistence),
        )
    }

    #[tokio::test]
    async fn test_existing_node_gets_flag() {
        let index = Arc::new(ObjectIndex::new());
        let existing = index.create(
            "server",
            ObjectKind::Node(NodeData::new(0).with_primary_ip("10.1.1.5".parse().unwrap())),
        );
        let stale = index.create("old", ObjectKind::Node(NodeData::new(0)));
        stale.update_node(|n| n.local_management = true);

        let outcome = check(
            &index,
            vec![iface(1, "127.0.0.1/8", true), iface(2, "10.1.1.5/24", false)],
        )
        .run()
        .await
        .unwrap();

        assert_eq!(outcome, MgmtCheckOutcome::Existing(existing.id()));
        assert!(existing.is_local_management_node());
        assert!(!stale.is_local_management_node());
    }

    #[tokio::test]
    async fn test_creates_node_from_first_unicast() {
        let index = Arc::new(ObjectIndex::new());
        let check = check(
            &index,
            vec![iface(1, "127.0.0.1/8", true), iface(2, "192.168.5.10/24", false)],
        );
        let outcome = check.run().await.unwrap();

        let MgmtCheckOutcome::Created(id) = outcome else {
            panic!("expected creation, got {outcome:?}");
        };
        let node = index.get(id).unwrap();
        assert_eq!(node.name(), "mgmt-server");
        assert!(node.is_local_management_node());
        assert!(node.poll_state(PollType::Configuration).unwrap().forced);
        assert_eq!(check.management_node(), Some(id));

        // second run finds the node it created
        assert_eq!(check.run().await.unwrap(), MgmtCheckOutcome::Existing(id));
    }

    #[tokio::test]
    async fn test_without_addresses_adopts_or_creates() {
        let index = Arc::new(ObjectIndex::new());
        let outcome = check(&index, vec![iface(1, "127.0.0.1/8", true)])
            .run()
            .await
            .unwrap();
        let MgmtCheckOutcome::Created(id) = outcome else {
            panic!("expected creation, got {outcome:?}");
        };
        assert!(index.get(id).unwrap().with_node(|n| n.primary_ip.is_none()).unwrap());

        let again = check(&index, vec![]).run().await.unwrap();
        assert_eq!(again, MgmtCheckOutcome::Adopted(id));
    }

    #[tokio::test]
    async fn test_adopted_node_keeps_only_flag() {
        let index = Arc::new(ObjectIndex::new());
        let first = index.create("first", ObjectKind::Node(NodeData::new(0)));
        let second = index.create("second", ObjectKind::Node(NodeData::new(0)));
        first.update_node(|n| n.local_management = true);
        second.update_node(|n| n.local_management = true);

        let outcome = check(&index, vec![]).run().await.unwrap();

        let flagged: Vec<_> = index
            .nodes()
            .into_iter()
            .filter(|n| n.is_local_management_node())
            .map(|n| n.id())
            .collect();
        assert_eq!(flagged, vec![outcome.node_id()]);
        assert!(matches!(outcome, MgmtCheckOutcome::Adopted(_)));
    }
}
