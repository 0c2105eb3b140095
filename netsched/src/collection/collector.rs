//! Collector workers: take queued items and fetch their values.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{CollectionJob, CollectionQueue, DataCollectionItem, DataSource, ItemStatus, MetricValue};
use crate::config::DataCollectionConfig;
use crate::objects::{ManagedObject, ObjectClass, ObjectIndex, ObjectPin, Persistence};

/// Classification of an unsuccessful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("collection error")]
    CollectionError,
    #[error("no such instance")]
    NoSuchInstance,
    #[error("communication error")]
    CommError,
    #[error("not supported")]
    NotSupported,
    /// Nothing to collect this time. Item state is left untouched.
    #[error("ignored")]
    Ignore,
}

/// Reads item values from a target.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch(
        &self,
        target: &ManagedObject,
        item: &DataCollectionItem,
    ) -> std::result::Result<MetricValue, FetchError>;
}

/// Metric sources keyed by [`DataSource`].
#[derive(Default, Clone)]
pub struct MetricSources {
    sources: HashMap<DataSource, Arc<dyn MetricSource>>,
}

impl MetricSources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: DataSource, fetcher: Arc<dyn MetricSource>) -> Self {
        self.register(source, fetcher);
        self
    }

    pub fn register(&mut self, source: DataSource, fetcher: Arc<dyn MetricSource>) {
        self.sources.insert(source, fetcher);
    }

    pub fn get(&self, source: DataSource) -> Option<&Arc<dyn MetricSource>> {
        self.sources.get(&source)
    }
}

/// Receives collected values. Returns `false` if the value was rejected.
#[async_trait]
pub trait ValueSink: Send + Sync {
    async fn process_new_value(
        &self,
        owner: &ManagedObject,
        item: &DataCollectionItem,
        timestamp: DateTime<Utc>,
        value: MetricValue,
    ) -> bool;
}

/// Keeps each value as the item's last value.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastValueSink;

#[async_trait]
impl ValueSink for LastValueSink {
    async fn process_new_value(
        &self,
        owner: &ManagedObject,
        item: &DataCollectionItem,
        timestamp: DateTime<Utc>,
        value: MetricValue,
    ) -> bool {
        trace!(object_id = owner.id(), item_id = item.id(), ?value, "New value");
        item.set_last_value(timestamp, value);
        true
    }
}

/// Per-outcome counters.
#[derive(Debug, Default)]
pub struct CollectionCounters {
    success: AtomicU64,
    collection_errors: AtomicU64,
    no_such_instance: AtomicU64,
    comm_errors: AtomicU64,
    not_supported: AtomicU64,
    ignored: AtomicU64,
    rejected_values: AtomicU64,
    deleted: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    pub success: u64,
    pub collection_errors: u64,
    pub no_such_instance: u64,
    pub comm_errors: u64,
    pub not_supported: u64,
    pub ignored: u64,
    pub rejected_values: u64,
    pub deleted: u64,
    pub skipped: u64,
}

impl CollectionCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CollectionStats {
        CollectionStats {
            success: self.success.load(Ordering::Relaxed),
            collection_errors: self.collection_errors.load(Ordering::Relaxed),
            no_such_instance: self.no_such_instance.load(Ordering::Relaxed),
            comm_errors: self.comm_errors.load(Ordering::Relaxed),
            not_supported: self.not_supported.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            rejected_values: self.rejected_values.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Object a value is actually read from.
enum Target<'a> {
    Owner(&'a ManagedObject),
    Proxy(ObjectPin),
}

impl Target<'_> {
    fn object(&self) -> &ManagedObject {
        match self {
            Target::Owner(owner) => owner,
            Target::Proxy(pin) => &**pin,
        }
    }
}

struct Shared {
    index: Arc<ObjectIndex>,
    queue: Arc<CollectionQueue>,
    sources: MetricSources,
    sink: Arc<dyn ValueSink>,
    persistence: Arc<dyn Persistence>,
    counters: CollectionCounters,
    dequeue_timeout: Duration,
    cancel: CancellationToken,
}

/// Fixed set of collector workers draining the [`CollectionQueue`].
pub struct DataCollectorPool {
    shared: Arc<Shared>,
    workers: usize,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl DataCollectorPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &DataCollectionConfig,
        index: Arc<ObjectIndex>,
        queue: Arc<CollectionQueue>,
        sources: MetricSources,
        sink: Arc<dyn ValueSink>,
        persistence: Arc<dyn Persistence>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                index,
                queue,
                sources,
                sink,
                persistence,
                counters: CollectionCounters::default(),
                dequeue_timeout: config.dequeue_timeout(),
                cancel,
            }),
            workers: config.workers.max(1),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn start(&self) {
        info!(workers = self.workers, "Starting data collectors");
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            return;
        };
        for worker_id in 0..self.workers {
            join_set.spawn(collector_loop(self.shared.clone(), worker_id));
        }
    }

    /// Wait for every worker to exit. Workers stop once the queue is closed
    /// or the cancellation token fires; queued items are released unpolled.
    pub async fn shutdown(&self) {
        self.shared.queue.close();
        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Data collector task failed");
                }
            }
        }
        let released = self.shared.queue.drain().len();
        info!(released, "Data collectors stopped");
    }

    pub fn stats(&self) -> CollectionStats {
        self.shared.counters.snapshot()
    }

    /// Process one job on the calling task.
    pub async fn process(&self, job: CollectionJob) {
        self.shared.process(job).await;
    }
}

async fn collector_loop(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Data collector started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let job = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            job = shared.queue.pop_timeout(shared.dequeue_timeout) => job,
        };
        match job {
            Some(job) => {
                let item_id = job.item().id();
                if AssertUnwindSafe(shared.process(job)).catch_unwind().await.is_err() {
                    error!(worker_id, item_id, "Data collection panicked");
                }
            }
            None if shared.queue.is_closed() => break,
            None => {}
        }
    }
    debug!(worker_id, "Data collector stopped");
}

impl Shared {
    async fn process(&self, job: CollectionJob) {
        let item = job.item().clone();
        let owner = job.owner();

        if item.is_scheduled_for_deletion() {
            debug!(object_id = owner.id(), item_id = item.id(), item = item.name(), "Deleting item");
            if let Err(e) = self.persistence.delete_item(owner.id(), item.id()).await {
                warn!(object_id = owner.id(), item_id = item.id(), error = %e, "Cannot delete item");
            }
            owner.remove_item(item.id());
            CollectionCounters::bump(&self.counters.deleted);
            return;
        }

        if self.cancel.is_cancelled() {
            return;
        }

        let status = item.status();
        match self.resolve_target(owner, &item) {
            Some(target) => {
                let result = self.fetch(target.object(), owner, &item).await;
                drop(target);
                self.apply(owner, &item, result).await;
            }
            None => CollectionCounters::bump(&self.counters.skipped),
        }
        if item.status() != status {
            self.save_item(owner, &item).await;
        }
    }

    async fn save_item(&self, owner: &ManagedObject, item: &DataCollectionItem) {
        if let Err(e) = self.persistence.save_item(owner.id(), item).await {
            warn!(
                object_id = owner.id(),
                item_id = item.id(),
                status = ?item.status(),
                error = %e,
                "Cannot save item status"
            );
        }
    }

    fn resolve_target<'a>(
        &self,
        owner: &'a ObjectPin,
        item: &DataCollectionItem,
    ) -> Option<Target<'a>> {
        let Some(proxy_id) = item.proxy_node() else {
            return Some(Target::Owner(owner));
        };
        let Some(proxy) = self.index.checkout(proxy_id) else {
            debug!(
                object_id = owner.id(),
                item_id = item.id(),
                proxy = proxy_id,
                "Proxy node for item not found"
            );
            return None;
        };
        let trusted = proxy
            .with_node(|n| n.is_trusted(owner.id()))
            .unwrap_or(false);
        if !trusted {
            debug!(
                object_id = owner.id(),
                item_id = item.id(),
                proxy = proxy_id,
                "Proxy node does not trust item owner"
            );
            item.set_status(ItemStatus::NotSupported);
            return None;
        }
        Some(Target::Proxy(proxy))
    }

    async fn fetch(
        &self,
        target: &ManagedObject,
        owner: &ManagedObject,
        item: &DataCollectionItem,
    ) -> std::result::Result<MetricValue, FetchError> {
        if owner.class() == ObjectClass::Cluster && !item.is_aggregated() {
            return Err(FetchError::Ignore);
        }
        if item.source().requires_node() && target.class() != ObjectClass::Node {
            return Err(FetchError::NotSupported);
        }
        match self.sources.get(item.source()) {
            Some(source) => source.fetch(target, item).await,
            None => Err(FetchError::NotSupported),
        }
    }

    async fn apply(
        &self,
        owner: &ManagedObject,
        item: &DataCollectionItem,
        result: std::result::Result<MetricValue, FetchError>,
    ) {
        let counters = &self.counters;
        match result {
            Ok(value) => {
                item.reactivate();
                if self
                    .sink
                    .process_new_value(owner, item, Utc::now(), value)
                    .await
                {
                    CollectionCounters::bump(&counters.success);
                } else {
                    item.record_error();
                    CollectionCounters::bump(&counters.rejected_values);
                }
            }
            Err(FetchError::CollectionError) => {
                item.reactivate();
                item.record_error();
                CollectionCounters::bump(&counters.collection_errors);
            }
            Err(FetchError::NoSuchInstance) => {
                item.reactivate();
                item.record_error();
                CollectionCounters::bump(&counters.no_such_instance);
            }
            Err(FetchError::CommError) => {
                item.record_error();
                CollectionCounters::bump(&counters.comm_errors);
            }
            Err(FetchError::NotSupported) => {
                if item.status() != ItemStatus::NotSupported {
                    debug!(object_id = owner.id(), item_id = item.id(), item = item.name(), "Item not supported");
                }
                item.set_status(ItemStatus::NotSupported);
                CollectionCounters::bump(&counters.not_supported);
            }
            Err(FetchError::Ignore) => CollectionCounters::bump(&counters.ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ClusterData, NodeData, NullPersistence, ObjectKind};
    use tokio::time::Instant;

    struct Fixed(std::result::Result<MetricValue, FetchError>);

    #[async_trait]
    impl MetricSource for Fixed {
        async fn fetch(
            &self,
            _target: &ManagedObject,
            _item: &DataCollectionItem,
        ) -> std::result::Result<MetricValue, FetchError> {
            self.0.clone()
        }
    }

    fn pool(index: &Arc<ObjectIndex>, sources: MetricSources) -> DataCollectorPool {
        DataCollectorPool::new(
            &DataCollectionConfig::default(),
            index.clone(),
            Arc::new(CollectionQueue::new(16, 16)),
            sources,
            Arc::new(LastValueSink),
            Arc::new(NullPersistence),
            CancellationToken::new(),
        )
    }

    fn job(index: &ObjectIndex, owner: &Arc<ManagedObject>, item: DataCollectionItem) -> CollectionJob {
        let item = Arc::new(item);
        owner.add_item(item.clone());
        assert!(item.try_begin_collection(Instant::now()));
        CollectionJob::new(item, index.pin(owner))
    }

    fn item(source: DataSource) -> DataCollectionItem {
        DataCollectionItem::new(1, 0, "metric", source, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_success_and_reactivation() {
        let index = Arc::new(ObjectIndex::new());
        let sources = MetricSources::new().with(
            DataSource::Agent,
            Arc::new(Fixed(Ok(MetricValue::Integer(42)))),
        );
        let pool = pool(&index, sources);
        let node = index.create("node", ObjectKind::Node(NodeData::new(0)));
        let job = job(&index, &node, item(DataSource::Agent));
        let item = job.item().clone();
        item.set_status(ItemStatus::NotSupported);

        pool.process(job).await;
        assert_eq!(item.status(), ItemStatus::Active);
        assert_eq!(item.last_value().map(|(_, v)| v), Some(MetricValue::Integer(42)));
        assert!(!item.is_busy());
        assert_eq!(node.pin_count(), 0);
        assert_eq!(pool.stats().success, 1);
    }

    #[tokio::test]
    async fn test_missing_source_marks_not_supported() {
        let index = Arc::new(ObjectIndex::new());
        let pool = pool(&index, MetricSources::new());
        let node = index.create("node", ObjectKind::Node(NodeData::new(0)));
        let job = job(&index, &node, item(DataSource::Snmp));
        let item = job.item().clone();

        pool.process(job).await;
        assert_eq!(item.status(), ItemStatus::NotSupported);
        assert_eq!(pool.stats().not_supported, 1);
    }

    #[tokio::test]
    async fn test_comm_error_keeps_status() {
        let index = Arc::new(ObjectIndex::new());
        let sources = MetricSources::new()
            .with(DataSource::Internal, Arc::new(Fixed(Err(FetchError::CommError))));
        let pool = pool(&index, sources);
        let node = index.create("node", ObjectKind::Node(NodeData::new(0)));
        let job = job(&index, &node, item(DataSource::Internal));
        let item = job.item().clone();
        item.set_status(ItemStatus::NotSupported);

        pool.process(job).await;
        assert_eq!(item.status(), ItemStatus::NotSupported);
        assert_eq!(item.error_count(), 1);
    }

    #[tokio::test]
    async fn test_cluster_items_need_aggregation() {
        let index = Arc::new(ObjectIndex::new());
        let sources = MetricSources::new()
            .with(DataSource::Internal, Arc::new(Fixed(Ok(MetricValue::Float(1.5)))));
        let pool = pool(&index, sources);
        let cluster = index.create("cluster", ObjectKind::Cluster(ClusterData::default()));

        let plain = job(&index, &cluster, item(DataSource::Internal));
        pool.process(plain).await;
        assert_eq!(pool.stats().ignored, 1);

        let aggregated = job(
            &index,
            &cluster,
            DataCollectionItem::new(2, 0, "sum", DataSource::Internal, Duration::from_secs(60)).aggregated(),
        );
        pool.process(aggregated).await;
        assert_eq!(pool.stats().success, 1);

        let snmp = job(
            &index,
            &cluster,
            DataCollectionItem::new(3, 0, "snmp", DataSource::Snmp, Duration::from_secs(60)).aggregated(),
        );
        pool.process(snmp).await;
        assert_eq!(pool.stats().not_supported, 1);
    }

    #[tokio::test]
    async fn test_untrusted_proxy() {
        let index = Arc::new(ObjectIndex::new());
        let sources = MetricSources::new()
            .with(DataSource::Agent, Arc::new(Fixed(Ok(MetricValue::Integer(1)))));
        let pool = pool(&index, sources);
        let proxy = index.create("proxy", ObjectKind::Node(NodeData::new(0)));
        let node = index.create("node", ObjectKind::Node(NodeData::new(0)));

        let job1 = job(&index, &node, item(DataSource::Agent).with_proxy(proxy.id()));
        let item1 = job1.item().clone();
        pool.process(job1).await;
        assert_eq!(item1.status(), ItemStatus::NotSupported);
        assert_eq!(pool.stats().skipped, 1);

        proxy.update_node(|n| n.trusted_nodes.insert(node.id()));
        item1.set_status(ItemStatus::Active);
        item1.request_force_poll();
        let job2 = CollectionJob::new(item1.clone(), index.pin(&node));
        assert!(item1.try_begin_collection(Instant::now()));
        pool.process(job2).await;
        assert_eq!(pool.stats().success, 1);
        assert_eq!(proxy.pin_count(), 0);
    }

    #[tokio::test]
    async fn test_deletion_removes_item() {
        let index = Arc::new(ObjectIndex::new());
        let pool = pool(&index, MetricSources::new());
        let node = index.create("node", ObjectKind::Node(NodeData::new(0)));
        let job = job(&index, &node, item(DataSource::Agent));
        job.item().schedule_deletion();

        pool.process(job).await;
        assert!(node.items().is_empty());
        assert_eq!(pool.stats().deleted, 1);
    }
}
