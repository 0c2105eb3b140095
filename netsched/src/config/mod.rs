//! Server configuration.
//!
//! Every field has a default so an empty JSON object (or no file at all)
//! yields a runnable configuration. See [`loader`] for how file and
//! environment sources are layered.

pub mod loader;

use std::net::IpAddr;
use std::time::Duration;

use inet_util::InetAddress;
use serde::{Deserialize, Serialize};

use crate::objects::{ObjectId, ZoneId};
use crate::poller::PollType;
use crate::{Error, Result};

/// Default number of always-running poller workers.
pub const DEFAULT_POLLER_BASE_SIZE: usize = 10;

/// Default upper bound on poller workers.
pub const DEFAULT_POLLER_MAX_SIZE: usize = 250;

/// Default number of data collector workers.
pub const DEFAULT_DATA_COLLECTOR_WORKERS: usize = 10;

/// Default active discovery interval (2 hours).
pub const DEFAULT_ACTIVE_DISCOVERY_INTERVAL_SECS: u64 = 7200;

/// Default log directory.
pub const DEFAULT_LOG_DIR: &str = "logs";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub poller: PollerConfig,
    pub data_collection: DataCollectionConfig,
    pub discovery: DiscoveryConfig,
    pub stats: StatsConfig,
    pub logging: LogConfig,
}

impl ServerConfig {
    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.poller;
        if p.pool_base_size == 0 {
            return Err(Error::config("poller.pool_base_size must be at least 1"));
        }
        if p.pool_base_size > p.pool_max_size {
            return Err(Error::config(format!(
                "poller.pool_base_size ({}) exceeds poller.pool_max_size ({})",
                p.pool_base_size, p.pool_max_size
            )));
        }
        if p.admission_interval_secs == 0 {
            return Err(Error::config("poller.admission_interval_secs must be positive"));
        }
        if p.mgmt_check_ticks == 0 {
            return Err(Error::config("poller.mgmt_check_ticks must be positive"));
        }
        for pt in PollType::ALL {
            if p.intervals.interval(pt).is_zero() {
                return Err(Error::config(format!("poll interval for {pt} must be positive")));
            }
        }

        let dc = &self.data_collection;
        if dc.workers == 0 {
            return Err(Error::config("data_collection.workers must be at least 1"));
        }
        if dc.queue_growth_step == 0 {
            return Err(Error::config("data_collection.queue_growth_step must be positive"));
        }

        let d = &self.discovery;
        if d.ping_attempts == 0 {
            return Err(Error::config("discovery.ping_attempts must be at least 1"));
        }
        if d.max_concurrent_pings == 0 {
            return Err(Error::config("discovery.max_concurrent_pings must be at least 1"));
        }
        if d.active_interval_secs == 0 {
            return Err(Error::config("discovery.active_interval_secs must be positive"));
        }
        for range in &d.ranges {
            range.validate()?;
        }

        if self.stats.samples == 0 || self.stats.interval_secs == 0 {
            return Err(Error::config("stats.samples and stats.interval_secs must be positive"));
        }
        Ok(())
    }
}

/// Poll admission and poller pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub pool_base_size: usize,
    pub pool_max_size: usize,
    /// Idle time after which workers above the base size exit.
    pub worker_idle_timeout_secs: u64,
    pub admission_interval_secs: u64,
    /// Management node check runs every this many admission ticks.
    pub mgmt_check_ticks: u64,
    pub intervals: PollIntervals,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            pool_base_size: DEFAULT_POLLER_BASE_SIZE,
            pool_max_size: DEFAULT_POLLER_MAX_SIZE,
            worker_idle_timeout_secs: 60,
            admission_interval_secs: 5,
            mgmt_check_ticks: 120,
            intervals: PollIntervals::default(),
        }
    }
}

impl PollerConfig {
    pub fn admission_interval(&self) -> Duration {
        Duration::from_secs(self.admission_interval_secs)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_secs)
    }
}

/// Per poll type scheduling intervals, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollIntervals {
    pub status_secs: u64,
    pub configuration_secs: u64,
    pub instance_discovery_secs: u64,
    pub routing_table_secs: u64,
    pub discovery_secs: u64,
    pub topology_secs: u64,
    pub condition_secs: u64,
    pub business_service_secs: u64,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            status_secs: 60,
            configuration_secs: 3600,
            instance_discovery_secs: 600,
            routing_table_secs: 300,
            discovery_secs: 900,
            topology_secs: 1800,
            condition_secs: 60,
            business_service_secs: 60,
        }
    }
}

impl PollIntervals {
    pub fn interval(&self, poll_type: PollType) -> Duration {
        let secs = match poll_type {
            PollType::Status => self.status_secs,
            PollType::Configuration => self.configuration_secs,
            PollType::InstanceDiscovery => self.instance_discovery_secs,
            PollType::RoutingTable => self.routing_table_secs,
            PollType::Discovery => self.discovery_secs,
            PollType::Topology => self.topology_secs,
            PollType::Condition => self.condition_secs,
            PollType::BusinessService => self.business_service_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Metric collection pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataCollectionConfig {
    pub workers: usize,
    pub queue_initial_capacity: usize,
    pub queue_growth_step: usize,
    /// Bounded wait used by collector workers between shutdown checks.
    pub dequeue_timeout_ms: u64,
}

impl Default for DataCollectionConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_DATA_COLLECTOR_WORKERS,
            queue_initial_capacity: 4096,
            queue_growth_step: 256,
            dequeue_timeout_ms: 1000,
        }
    }
}

impl DataCollectionConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }
}

/// Passive and active discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery from ARP caches and routing tables of polled nodes.
    pub passive_enabled: bool,
    /// Periodic address range scanning.
    pub active_enabled: bool,
    pub snmp_trap_enabled: bool,
    pub syslog_enabled: bool,
    pub active_interval_secs: u64,
    pub ping_attempts: u32,
    pub ping_timeout_ms: u64,
    pub ping_payload_size: usize,
    pub max_concurrent_pings: usize,
    /// Addresses handed to a proxy node per request.
    pub proxy_chunk_size: u32,
    /// Addresses pinged locally per batch.
    pub local_chunk_size: u32,
    pub ranges: Vec<DiscoveryRange>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            passive_enabled: false,
            active_enabled: false,
            snmp_trap_enabled: false,
            syslog_enabled: false,
            active_interval_secs: DEFAULT_ACTIVE_DISCOVERY_INTERVAL_SECS,
            ping_attempts: 3,
            ping_timeout_ms: 1500,
            ping_payload_size: 46,
            max_concurrent_pings: 64,
            proxy_chunk_size: 256,
            local_chunk_size: 1024,
            ranges: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// One address range scanned by active discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRange {
    #[serde(flatten)]
    pub target: RangeTarget,
    #[serde(default)]
    pub zone: ZoneId,
    /// Node that scans the range on the server's behalf.
    #[serde(default)]
    pub proxy_node: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangeTarget {
    /// Every host address of a subnet.
    Subnet { network: InetAddress },
    /// Explicit inclusive range.
    Range { from: IpAddr, to: IpAddr },
}

impl DiscoveryRange {
    pub fn subnet(network: InetAddress) -> Self {
        Self {
            target: RangeTarget::Subnet { network },
            zone: 0,
            proxy_node: None,
        }
    }

    pub fn range(from: IpAddr, to: IpAddr) -> Self {
        Self {
            target: RangeTarget::Range { from, to },
            zone: 0,
            proxy_node: None,
        }
    }

    pub fn with_proxy(mut self, proxy: ObjectId) -> Self {
        self.proxy_node = Some(proxy);
        self
    }

    pub fn with_zone(mut self, zone: ZoneId) -> Self {
        self.zone = zone;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let RangeTarget::Range { from, to } = &self.target {
            if from.is_ipv4() != to.is_ipv4() {
                return Err(Error::config(format!(
                    "discovery range {from} - {to} mixes address families"
                )));
            }
            if from > to {
                return Err(Error::config(format!(
                    "discovery range {from} - {to} is reversed"
                )));
            }
        }
        Ok(())
    }
}

/// Rolling statistics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
    pub samples: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            samples: 12,
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    /// Filter directive applied after startup, overriding `RUST_LOG`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: DEFAULT_LOG_DIR.to_string(),
            filter: None,
        }
    }
}
