//! Active discovery: periodic ICMP scans of configured address ranges.

use std::net::IpAddr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use inet_util::Ipv4Range;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeviceAccess, DiscoveryEngine, DiscoverySource, PingOptions, Pinger};
use crate::config::{DiscoveryConfig, DiscoveryRange, RangeTarget};
use crate::objects::{ObjectId, ObjectIndex, ZoneId};

/// Supplies the ranges scanned on each active discovery pass.
pub trait RangeSource: Send + Sync {
    fn ranges(&self) -> Vec<DiscoveryRange>;
}

/// Ranges taken from configuration. Replaceable at runtime.
#[derive(Debug, Default)]
pub struct ConfiguredRanges {
    ranges: RwLock<Vec<DiscoveryRange>>,
}

impl ConfiguredRanges {
    pub fn new(ranges: Vec<DiscoveryRange>) -> Self {
        Self {
            ranges: RwLock::new(ranges),
        }
    }

    pub fn replace(&self, ranges: Vec<DiscoveryRange>) {
        *self.ranges.write() = ranges;
    }
}

impl RangeSource for ConfiguredRanges {
    fn ranges(&self) -> Vec<DiscoveryRange> {
        self.ranges.read().clone()
    }
}

/// Scan tuning shared by every range.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub ping: PingOptions,
    pub max_concurrent_pings: usize,
    pub local_chunk_size: u32,
    pub proxy_chunk_size: u32,
}

impl From<&DiscoveryConfig> for ScanOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            ping: PingOptions::from(config),
            max_concurrent_pings: config.max_concurrent_pings.max(1),
            local_chunk_size: config.local_chunk_size.max(1),
            proxy_chunk_size: config.proxy_chunk_size.max(1),
        }
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

/// Outcome of scanning one range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RangeScanSummary {
    pub scanned: u64,
    pub responded: usize,
    pub queued: usize,
}

impl std::ops::AddAssign for RangeScanSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.scanned += rhs.scanned;
        self.responded += rhs.responded;
        self.queued += rhs.queued;
    }
}

pub struct ActiveDiscovery {
    index: Arc<ObjectIndex>,
    engine: Arc<DiscoveryEngine>,
    access: Arc<dyn DeviceAccess>,
    pinger: Arc<dyn Pinger>,
    ranges: Arc<dyn RangeSource>,
    options: ScanOptions,
    cancel: CancellationToken,
}

impl ActiveDiscovery {
    pub fn new(
        index: Arc<ObjectIndex>,
        engine: Arc<DiscoveryEngine>,
        access: Arc<dyn DeviceAccess>,
        pinger: Arc<dyn Pinger>,
        ranges: Arc<dyn RangeSource>,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            engine,
            access,
            pinger,
            ranges,
            options,
            cancel,
        }
    }

    /// Scan every range once the active interval has passed since the last
    /// pass, if active discovery is enabled. Settings changes wake the loop
    /// so a new interval or switch applies at once. Repeats until cancelled.
    pub async fn run(self: Arc<Self>) {
        info!("Active discovery started");
        let settings = self.engine.settings().clone();
        let mut last_run = Instant::now();
        loop {
            let due = last_run + settings.active_interval();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = settings.changed() => continue,
                _ = tokio::time::sleep_until(due) => {}
            }
            last_run = Instant::now();
            if !settings.active_enabled() {
                continue;
            }
            let summary = self.run_once().await;
            info!(
                scanned = summary.scanned,
                responded = summary.responded,
                queued = summary.queued,
                "Active discovery pass finished"
            );
        }
        info!("Active discovery stopped");
    }

    /// Scan every configured range once.
    pub async fn run_once(&self) -> RangeScanSummary {
        let mut total = RangeScanSummary::default();
        for range in self.ranges.ranges() {
            if self.cancel.is_cancelled() {
                break;
            }
            total += self.scan_range(&range).await;
        }
        total
    }

    pub async fn scan_range(&self, range: &DiscoveryRange) -> RangeScanSummary {
        let Some(addresses) = ipv4_range(range) else {
            return RangeScanSummary::default();
        };

        match range.proxy_node {
            Some(proxy) => self.scan_via_proxy(addresses, range.zone, proxy).await,
            None if range.zone != 0 => {
                warn!(range = %addresses, zone = range.zone, "Range in non-default zone has no proxy node, skipped");
                RangeScanSummary::default()
            }
            None => self.scan_locally(addresses, range.zone).await,
        }
    }

    async fn scan_locally(&self, addresses: Ipv4Range, zone: ZoneId) -> RangeScanSummary {
        debug!(range = %addresses, "Scanning range locally");
        let mut summary = RangeScanSummary::default();
        for chunk in addresses.chunks(self.options.local_chunk_size) {
            if self.cancel.is_cancelled() {
                break;
            }
            let options = self.options.ping;
            let responders: Vec<IpAddr> = stream::iter(chunk.iter())
                .map(|addr| {
                    let pinger = self.pinger.clone();
                    async move {
                        let ip = IpAddr::V4(addr);
                        pinger.ping(ip, &options).await.then_some(ip)
                    }
                })
                .buffer_unordered(self.options.max_concurrent_pings)
                .filter_map(|ip| async move { ip })
                .collect()
                .await;

            summary.scanned += chunk.len();
            self.report(&responders, zone, None, &mut summary);
        }
        summary
    }

    async fn scan_via_proxy(
        &self,
        addresses: Ipv4Range,
        zone: ZoneId,
        proxy: ObjectId,
    ) -> RangeScanSummary {
        let mut summary = RangeScanSummary::default();
        let Some(node) = self.index.checkout(proxy) else {
            warn!(range = %addresses, proxy, "Proxy node for range scan not found");
            return summary;
        };
        debug!(range = %addresses, proxy, proxy_name = node.name(), "Scanning range via proxy");

        for chunk in addresses.chunks(self.options.proxy_chunk_size) {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.access.scan_range_via_proxy(&node, chunk).await {
                Ok(responders) => {
                    summary.scanned += chunk.len();
                    self.report(&responders, zone, Some(proxy), &mut summary);
                }
                Err(e) => warn!(range = %chunk, proxy, error = %e, "Proxy range scan failed"),
            }
        }
        summary
    }

    fn report(
        &self,
        responders: &[IpAddr],
        zone: ZoneId,
        proxy: Option<ObjectId>,
        summary: &mut RangeScanSummary,
    ) {
        summary.responded += responders.len();
        for &ip in responders {
            let verdict = self
                .engine
                .check_potential_node(ip, zone, DiscoverySource::ActiveDiscovery, proxy);
            if verdict.is_queued() {
                summary.queued += 1;
            }
        }
    }
}

/// IPv4 addresses covered by `range`, or `None` if it cannot be scanned.
fn ipv4_range(range: &DiscoveryRange) -> Option<Ipv4Range> {
    match range.target {
        RangeTarget::Subnet { network } => {
            let hosts = Ipv4Range::hosts_of(&network);
            if hosts.is_none() {
                debug!(%network, "Subnet has no scannable host addresses");
            }
            hosts
        }
        RangeTarget::Range {
            from: IpAddr::V4(from),
            to: IpAddr::V4(to),
        } => match Ipv4Range::new(from, to) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "Invalid discovery range skipped");
                None
            }
        },
        RangeTarget::Range { from, to } => {
            debug!(%from, %to, "IPv6 range scanning not supported");
            None
        }
    }
}
