//! Integration tests for the metric collection pipeline and the service
//! container.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use common::{CountingPersistence, FakeLocalHost, GatedOperations, SetPinger, node, wait_until};
use netsched::collection::{
    CollectionQueue, DataCollectionItem, DataCollectorPool, DataSource, FetchError, ItemPoller,
    ItemStatus, LastValueSink, MetricSource, MetricSources, MetricValue,
};
use netsched::config::{DataCollectionConfig, ServerConfig};
use netsched::discovery::NoDeviceAccess;
use netsched::objects::{ManagedObject, ObjectIndex};
use netsched::poller::PollType;
use netsched::services::{Collaborators, ServiceContainer};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct Counter;

#[async_trait]
impl MetricSource for Counter {
    async fn fetch(
        &self,
        target: &ManagedObject,
        item: &DataCollectionItem,
    ) -> Result<MetricValue, FetchError> {
        Ok(MetricValue::Integer(i64::from(target.id() * 100 + item.id())))
    }
}

fn add_item(object: &Arc<ManagedObject>, id: u32, interval: Duration) -> Arc<DataCollectionItem> {
    let item = Arc::new(DataCollectionItem::new(
        id,
        object.id(),
        format!("metric-{id}"),
        DataSource::Internal,
        interval,
    ));
    object.add_item(item.clone());
    item
}

fn collectors(
    index: &Arc<ObjectIndex>,
    queue: &Arc<CollectionQueue>,
    persistence: Arc<CountingPersistence>,
    cancel: CancellationToken,
) -> DataCollectorPool {
    DataCollectorPool::new(
        &DataCollectionConfig {
            workers: 3,
            dequeue_timeout_ms: 20,
            ..Default::default()
        },
        index.clone(),
        queue.clone(),
        MetricSources::new().with(DataSource::Internal, Arc::new(Counter)),
        Arc::new(LastValueSink),
        persistence,
        cancel,
    )
}

mod pipeline_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_item_requeued_after_interval() {
        let index = Arc::new(ObjectIndex::new());
        let queue = Arc::new(CollectionQueue::new(16, 16));
        let poller = ItemPoller::new(index.clone(), queue.clone());
        let pool = collectors(&index, &queue, Arc::default(), CancellationToken::new());
        let node = node(&index, "db-01");
        let item = add_item(&node, 1, Duration::from_secs(60));

        assert_eq!(poller.tick(Instant::now()), 1);
        let job = queue.try_pop().unwrap();
        pool.process(job).await;
        assert!(!item.is_busy());
        assert_eq!(item.last_value().map(|(_, v)| v), Some(MetricValue::Integer(101)));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(poller.tick(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(poller.tick(Instant::now()), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_item_busy_while_queued_or_processing() {
        let index = Arc::new(ObjectIndex::new());
        let queue = Arc::new(CollectionQueue::new(4, 4));
        let poller = ItemPoller::new(index.clone(), queue.clone());
        let nodes: Vec<_> = (0..3).map(|i| node(&index, &format!("n{i}"))).collect();
        let items: Vec<_> = nodes
            .iter()
            .flat_map(|n| (1..=3).map(|id| add_item(n, id, Duration::from_secs(60))))
            .collect();

        let now = Instant::now();
        assert_eq!(poller.tick(now), items.len());
        for _ in 0..3 {
            assert_eq!(poller.tick(now + Duration::from_secs(120)), 0);
        }
        assert_eq!(queue.len(), items.len());
        assert_eq!(queue.growth_count(), 2);
        assert!(items.iter().all(|i| i.is_busy()));

        let cancel = CancellationToken::new();
        let pool = collectors(&index, &queue, Arc::default(), cancel.clone());
        pool.start();
        assert!(wait_until(WAIT, || queue.is_empty() && items.iter().all(|i| !i.is_busy())).await);
        assert_eq!(pool.stats().success, items.len() as u64);
        assert!(nodes.iter().all(|n| n.pin_count() == 0));

        cancel.cancel();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_deletion_goes_through_persistence() {
        let index = Arc::new(ObjectIndex::new());
        let queue = Arc::new(CollectionQueue::new(4, 4));
        let poller = ItemPoller::new(index.clone(), queue.clone());
        let persistence = Arc::new(CountingPersistence::default());
        let pool = collectors(&index, &queue, persistence.clone(), CancellationToken::new());
        let node = node(&index, "n");
        let item = add_item(&node, 7, Duration::from_secs(60));
        item.schedule_deletion();

        poller.tick(Instant::now());
        pool.process(queue.try_pop().unwrap()).await;
        assert_eq!(persistence.deleted_items.load(Ordering::SeqCst), 1);
        assert!(node.items().is_empty());
    }

    #[tokio::test]
    async fn test_status_change_is_saved() {
        let index = Arc::new(ObjectIndex::new());
        let queue = Arc::new(CollectionQueue::new(4, 4));
        let poller = ItemPoller::new(index.clone(), queue.clone());
        let persistence = Arc::new(CountingPersistence::default());
        let pool = collectors(&index, &queue, persistence.clone(), CancellationToken::new());
        let node = node(&index, "n");
        let item = Arc::new(DataCollectionItem::new(
            3,
            node.id(),
            "script-metric",
            DataSource::Script,
            Duration::from_secs(60),
        ));
        node.add_item(item.clone());

        poller.tick(Instant::now());
        pool.process(queue.try_pop().unwrap()).await;
        assert_eq!(item.status(), ItemStatus::NotSupported);
        assert_eq!(persistence.saved_items.load(Ordering::SeqCst), 1);

        poller.tick(Instant::now() + Duration::from_secs(3600));
        pool.process(queue.try_pop().unwrap()).await;
        assert_eq!(persistence.saved_items.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().not_supported, 2);
    }

    #[tokio::test]
    async fn test_shutdown_releases_queued_items() {
        let index = Arc::new(ObjectIndex::new());
        let queue = Arc::new(CollectionQueue::new(4, 4));
        let poller = ItemPoller::new(index.clone(), queue.clone());
        let cancel = CancellationToken::new();
        let pool = collectors(&index, &queue, Arc::default(), cancel.clone());
        let node = node(&index, "n");
        let item = add_item(&node, 1, Duration::from_secs(60));

        poller.tick(Instant::now());
        assert!(item.is_busy());
        cancel.cancel();
        pool.start();
        pool.shutdown().await;

        assert!(queue.is_empty());
        assert!(!item.is_busy());
        assert!(item.last_value().is_none());
        assert_eq!(node.pin_count(), 0);
    }
}

mod container_tests {
    use super::*;

    fn collaborators(ops: Arc<GatedOperations>) -> Collaborators {
        Collaborators {
            operations: ops,
            device_access: Arc::new(NoDeviceAccess),
            pinger: Arc::new(SetPinger::new(&[])),
            metric_sources: MetricSources::new().with(DataSource::Internal, Arc::new(Counter)),
            value_sink: Arc::new(LastValueSink),
            persistence: Arc::new(CountingPersistence::default()),
            local_host: Arc::new(FakeLocalHost::none()),
            ranges: None,
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let ops = Arc::new(GatedOperations::closed());
        let index = Arc::new(ObjectIndex::new());
        let core = node(&index, "core");
        let item = add_item(&core, 1, Duration::from_secs(60));

        let container =
            ServiceContainer::with_index(ServerConfig::default(), collaborators(ops.clone()), index.clone())
                .unwrap();
        container.start();

        assert!(wait_until(WAIT, || ops.started() >= 5).await);
        assert!(wait_until(WAIT, || item.last_value().is_some()).await);
        assert!(container.show_pollers().lines().count() > 2);

        let stats = container.stats();
        assert!(stats.in_flight_polls >= 5);
        assert_eq!(stats.collection.success, 1);
        assert!(stats.queues.averages.contains_key("poller"));

        container.shutdown_with_timeout(WAIT).await.unwrap();
        assert!(container.is_shutting_down());
        assert!(container.registry().is_empty());
        assert_eq!(core.pin_count(), 0);
        assert!(!core.is_poll_busy(PollType::Status));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ServerConfig::default();
        config.poller.pool_base_size = 20;
        config.poller.pool_max_size = 5;
        let result = ServiceContainer::new(config, collaborators(Arc::new(GatedOperations::open())));
        assert!(matches!(result, Err(netsched::Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_reset_discovery() {
        let container = ServiceContainer::new(
            ServerConfig::default(),
            collaborators(Arc::new(GatedOperations::open())),
        )
        .unwrap();
        container.discovery().check_potential_node(
            "10.8.0.1".parse().unwrap(),
            0,
            netsched::discovery::DiscoverySource::ActiveDiscovery,
            None,
        );
        assert_eq!(container.new_node_queue().len(), 1);

        let mut discovery = container.config().discovery.clone();
        discovery.passive_enabled = true;
        container.reset_discovery(&discovery).unwrap();
        assert!(container.new_node_queue().is_empty());
        assert!(container.discovery().passive_enabled());
    }
}
