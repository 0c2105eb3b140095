//! Shared fakes for the integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use inet_util::Ipv4Range;
use netsched::Result;
use netsched::discovery::{ArpEntry, DeviceAccess, PingOptions, Pinger, RouteEntry};
use netsched::objects::{ManagedObject, NodeData, ObjectIndex, ObjectKind, Persistence};
use netsched::poller::{LocalHost, LocalInterface, PollOperations, PollType, PollerHandle};
use netsched::collection::DataCollectionItem;
use tokio::sync::Semaphore;

/// Device access returning fixed ARP and routing tables.
#[derive(Default)]
pub struct ScriptedAccess {
    pub arp: Vec<ArpEntry>,
    pub routes: Vec<RouteEntry>,
    pub proxy_responders: Vec<IpAddr>,
}

#[async_trait]
impl DeviceAccess for ScriptedAccess {
    async fn fetch_arp_cache(&self, _node: &ManagedObject) -> Result<Vec<ArpEntry>> {
        Ok(self.arp.clone())
    }

    async fn fetch_routing_table(&self, _node: &ManagedObject) -> Result<Vec<RouteEntry>> {
        Ok(self.routes.clone())
    }

    async fn scan_range_via_proxy(
        &self,
        _proxy: &ManagedObject,
        range: Ipv4Range,
    ) -> Result<Vec<IpAddr>> {
        Ok(self
            .proxy_responders
            .iter()
            .copied()
            .filter(|ip| matches!(ip, IpAddr::V4(v4) if range.contains(*v4)))
            .collect())
    }
}

/// Pinger answering for a fixed set of addresses.
#[derive(Default)]
pub struct SetPinger {
    responders: HashSet<IpAddr>,
    pub pinged: AtomicUsize,
}

impl SetPinger {
    pub fn new(responders: &[&str]) -> Self {
        Self {
            responders: responders.iter().map(|s| s.parse().unwrap()).collect(),
            pinged: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Pinger for SetPinger {
    async fn ping(&self, addr: IpAddr, _options: &PingOptions) -> bool {
        self.pinged.fetch_add(1, Ordering::Relaxed);
        self.responders.contains(&addr)
    }
}

/// Poll operations that count calls and hold each poll until a permit is
/// released.
pub struct GatedOperations {
    pub gate: Arc<Semaphore>,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl GatedOperations {
    pub fn open() -> Self {
        Self::with_permits(Semaphore::MAX_PERMITS)
    }

    pub fn closed() -> Self {
        Self::with_permits(0)
    }

    fn with_permits(permits: usize) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(permits)),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollOperations for GatedOperations {
    async fn poll(&self, _poll_type: PollType, handle: &PollerHandle) -> Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        handle.set_status("working");
        tokio::select! {
            permit = self.gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
            _ = handle.cancellation_token().cancelled() => {}
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Local host with a fixed interface list.
pub struct FakeLocalHost {
    pub interfaces: Vec<LocalInterface>,
}

impl FakeLocalHost {
    pub fn none() -> Self {
        Self { interfaces: Vec::new() }
    }
}

#[async_trait]
impl LocalHost for FakeLocalHost {
    async fn interfaces(&self) -> Result<Vec<LocalInterface>> {
        Ok(self.interfaces.clone())
    }

    fn host_name(&self) -> String {
        "netsched-test".to_string()
    }
}

/// Persistence counting calls.
#[derive(Default)]
pub struct CountingPersistence {
    pub nodes: AtomicUsize,
    pub saved_items: AtomicUsize,
    pub deleted_items: AtomicUsize,
}

#[async_trait]
impl Persistence for CountingPersistence {
    async fn create_node(&self, _node: &ManagedObject) -> Result<()> {
        self.nodes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_item(&self, _owner: u32, _item: &DataCollectionItem) -> Result<()> {
        self.saved_items.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_item(&self, _owner: u32, _item_id: u32) -> Result<()> {
        self.deleted_items.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn node(index: &ObjectIndex, name: &str) -> Arc<ManagedObject> {
    index.create(name, ObjectKind::Node(NodeData::new(0)))
}

/// Poll until `cond` holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
