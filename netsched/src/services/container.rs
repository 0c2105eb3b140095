//! Service container.
//!
//! Builds every scheduler component around one object index and one
//! cancellation token, and manages their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collection::{
    CollectionQueue, CollectionStats, DataCollectorPool, ItemPoller, LastValueSink, MetricSources,
    ValueSink,
};
use crate::config::{DiscoveryConfig, ServerConfig};
use crate::discovery::{
    ActiveDiscovery, ConfiguredRanges, DeviceAccess, DiscoveryEngine, DiscoverySettings,
    IcmpPinger, NewNodeQueue, NoDeviceAccess, NoPinger, Pinger, RangeSource, ScanOptions,
};
use crate::objects::{NullPersistence, ObjectId, ObjectIndex, Persistence};
use crate::poller::{
    AdmissionConfig, LocalHost, ManagementNodeCheck, PollAdmissionLoop, PollDispatcher,
    PollOperations, PollType, PollWorkerPool, PollerRegistry, PoolConfig, PoolInfo,
    SystemLocalHost, UnsupportedPollOperations,
};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::Result;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// External services the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub operations: Arc<dyn PollOperations>,
    pub device_access: Arc<dyn DeviceAccess>,
    pub pinger: Arc<dyn Pinger>,
    pub metric_sources: MetricSources,
    pub value_sink: Arc<dyn ValueSink>,
    pub persistence: Arc<dyn Persistence>,
    pub local_host: Arc<dyn LocalHost>,
    /// Active discovery ranges. Taken from configuration when unset.
    pub ranges: Option<Arc<dyn RangeSource>>,
}

impl Collaborators {
    /// Collaborators for a server without device access or storage.
    ///
    /// Uses ICMP for active discovery when the socket can be opened.
    pub fn standalone() -> Self {
        let pinger: Arc<dyn Pinger> = match IcmpPinger::new() {
            Ok(pinger) => Arc::new(pinger),
            Err(e) => {
                warn!(error = %e, "ICMP unavailable, active discovery will find nothing");
                Arc::new(NoPinger)
            }
        };
        Self {
            operations: Arc::new(UnsupportedPollOperations),
            device_access: Arc::new(NoDeviceAccess),
            pinger,
            metric_sources: MetricSources::new(),
            value_sink: Arc::new(LastValueSink),
            persistence: Arc::new(NullPersistence),
            local_host: Arc::new(SystemLocalHost),
            ranges: None,
        }
    }
}

/// Aggregated runtime statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub objects: usize,
    pub pollers: PoolInfo,
    pub in_flight_polls: usize,
    pub new_node_queue: usize,
    pub collection_queue: usize,
    pub collection_queue_growths: u64,
    pub collection: CollectionStats,
    pub queues: StatsSnapshot,
}

/// Service container holding all scheduler components.
pub struct ServiceContainer {
    config: ServerConfig,
    index: Arc<ObjectIndex>,
    registry: Arc<PollerRegistry>,
    pool: Arc<PollWorkerPool>,
    admission: Arc<PollAdmissionLoop>,
    discovery: Arc<DiscoveryEngine>,
    active_discovery: Arc<ActiveDiscovery>,
    ranges: Arc<dyn RangeSource>,
    configured_ranges: Option<Arc<ConfiguredRanges>>,
    collection_queue: Arc<CollectionQueue>,
    item_poller: Arc<ItemPoller>,
    collectors: Arc<DataCollectorPool>,
    stats: Arc<StatsCollector>,
    tasks: Mutex<Option<JoinSet<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_index(
            config.clone(),
            collaborators,
            Arc::new(ObjectIndex::with_intervals(config.poller.intervals.clone())),
        )
    }

    /// Build the container around an existing object index.
    pub fn with_index(
        config: ServerConfig,
        collaborators: Collaborators,
        index: Arc<ObjectIndex>,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();

        let new_nodes = Arc::new(NewNodeQueue::new());
        let settings = Arc::new(DiscoverySettings::from_config(&config.discovery));
        let discovery = Arc::new(DiscoveryEngine::new(
            index.clone(),
            collaborators.device_access.clone(),
            new_nodes.clone(),
            settings,
        ));

        let (ranges, configured_ranges) = match collaborators.ranges {
            Some(ranges) => (ranges, None),
            None => {
                let configured = Arc::new(ConfiguredRanges::new(config.discovery.ranges.clone()));
                (configured.clone() as Arc<dyn RangeSource>, Some(configured))
            }
        };
        let active_discovery = Arc::new(ActiveDiscovery::new(
            index.clone(),
            discovery.clone(),
            collaborators.device_access,
            collaborators.pinger,
            ranges.clone(),
            ScanOptions::from(&config.discovery),
            cancel.child_token(),
        ));

        let registry = Arc::new(PollerRegistry::new());
        let pool = Arc::new(PollWorkerPool::new(PoolConfig::from(&config.poller)));
        let dispatcher = Arc::new(PollDispatcher::new(collaborators.operations, discovery.clone()));
        let mgmt = Arc::new(ManagementNodeCheck::new(
            index.clone(),
            collaborators.local_host,
            collaborators.persistence.clone(),
        ));
        let admission = Arc::new(PollAdmissionLoop::new(
            index.clone(),
            registry.clone(),
            pool.clone(),
            dispatcher,
            mgmt,
            new_nodes,
            AdmissionConfig::from(&config.poller),
            cancel.child_token(),
        ));

        let collection_queue = Arc::new(CollectionQueue::from_config(&config.data_collection));
        let item_poller = Arc::new(ItemPoller::new(index.clone(), collection_queue.clone()));
        let collectors = Arc::new(DataCollectorPool::new(
            &config.data_collection,
            index.clone(),
            collection_queue.clone(),
            collaborators.metric_sources,
            collaborators.value_sink,
            collaborators.persistence,
            cancel.child_token(),
        ));

        let stats = Arc::new(StatsCollector::new(&config.stats));
        {
            let queue = collection_queue.clone();
            stats.register("data_collector", Arc::new(move || queue.len()));
            let pool = pool.clone();
            stats.register("poller", Arc::new(move || pool.queued()));
            let queue = discovery.queue().clone();
            stats.register("new_node", Arc::new(move || queue.len()));
            let poller = item_poller.clone();
            stats.set_queuing_time_source(move || poller.average_queuing_time());
        }

        debug!("Service container built");
        Ok(Self {
            config,
            index,
            registry,
            pool,
            admission,
            discovery,
            active_discovery,
            ranges,
            configured_ranges,
            collection_queue,
            item_poller,
            collectors,
            stats,
            tasks: Mutex::new(Some(JoinSet::new())),
            cancellation_token: cancel,
        })
    }

    /// Start every long-running task.
    pub fn start(&self) {
        info!("Starting services");
        self.pool.start();
        self.collectors.start();

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Services already shut down");
            return;
        };
        join_set.spawn(self.admission.clone().run());
        join_set.spawn(self.active_discovery.clone().run());
        join_set.spawn(self.item_poller.clone().run(self.cancellation_token.child_token()));
        join_set.spawn(self.stats.clone().run(self.cancellation_token.child_token()));
        info!("Services started");
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        let drained = tokio::time::timeout(timeout, async {
            if let Some(mut join_set) = join_set {
                while let Some(result) = join_set.join_next().await {
                    if let Err(e) = result {
                        error!(error = %e, "Service task failed");
                    }
                }
            }
            self.collectors.shutdown().await;
        })
        .await;

        if drained.is_err() {
            warn!(
                in_flight = self.registry.len(),
                "Shutdown timeout reached, forcing shutdown"
            );
        }
        info!("Services shut down");
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<ObjectIndex> {
        &self.index
    }

    pub fn registry(&self) -> &Arc<PollerRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<PollAdmissionLoop> {
        &self.admission
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    pub fn active_discovery(&self) -> &Arc<ActiveDiscovery> {
        &self.active_discovery
    }

    pub fn new_node_queue(&self) -> &Arc<NewNodeQueue> {
        self.discovery.queue()
    }

    pub fn collection_queue(&self) -> &Arc<CollectionQueue> {
        &self.collection_queue
    }

    pub fn force_poll(&self, object_id: ObjectId, poll_type: PollType) -> Result<()> {
        self.admission.force_poll(object_id, poll_type)
    }

    /// Clear the new node queue and apply new discovery settings.
    pub fn reset_discovery(&self, config: &DiscoveryConfig) -> Result<()> {
        for range in &config.ranges {
            range.validate()?;
        }
        self.discovery.reset(config);
        match &self.configured_ranges {
            Some(configured) => configured.replace(config.ranges.clone()),
            None => debug!(
                ranges = self.ranges.ranges().len(),
                "Discovery ranges supplied externally, not replaced"
            ),
        }
        Ok(())
    }

    /// Diagnostic table of in-flight polls.
    pub fn show_pollers(&self) -> String {
        self.registry.show_pollers()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            objects: self.index.len(),
            pollers: self.pool.info(),
            in_flight_polls: self.registry.len(),
            new_node_queue: self.discovery.queue().len(),
            collection_queue: self.collection_queue.len(),
            collection_queue_growths: self.collection_queue.growth_count(),
            collection: self.collectors.stats(),
            queues: self.stats.snapshot(),
        }
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
