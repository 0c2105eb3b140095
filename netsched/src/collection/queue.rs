//! FIFO between the item poller and the collector workers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use super::DataCollectionItem;
use crate::config::DataCollectionConfig;
use crate::objects::ObjectPin;

/// Queued item together with a pin on its owner.
///
/// The job holds the item's busy lease: dropping it records the poll time
/// and clears busy.
pub struct CollectionJob {
    item: Arc<DataCollectionItem>,
    owner: ObjectPin,
    queued_at: Instant,
}

impl CollectionJob {
    /// The item must already be marked busy.
    pub fn new(item: Arc<DataCollectionItem>, owner: ObjectPin) -> Self {
        Self {
            item,
            owner,
            queued_at: Instant::now(),
        }
    }

    pub fn item(&self) -> &Arc<DataCollectionItem> {
        &self.item
    }

    pub fn owner(&self) -> &ObjectPin {
        &self.owner
    }

    pub fn queued_at(&self) -> Instant {
        self.queued_at
    }
}

impl Drop for CollectionJob {
    fn drop(&mut self) {
        self.item.finish_collection(Instant::now());
    }
}

impl std::fmt::Debug for CollectionJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionJob")
            .field("item", &self.item.id())
            .field("owner", &self.owner.id())
            .finish()
    }
}

struct Inner {
    jobs: VecDeque<CollectionJob>,
    capacity: usize,
    closed: bool,
}

/// Unbounded FIFO that starts at a fixed capacity and grows in steps.
///
/// Pushing never blocks and never drops. Each growth is counted and logged
/// so a backlog shows up in statistics.
pub struct CollectionQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    growth_step: usize,
    growth_count: AtomicU64,
}

impl CollectionQueue {
    pub fn new(initial_capacity: usize, growth_step: usize) -> Self {
        let capacity = initial_capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                jobs: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            notify: Notify::new(),
            growth_step: growth_step.max(1),
            growth_count: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &DataCollectionConfig) -> Self {
        Self::new(config.queue_initial_capacity, config.queue_growth_step)
    }

    /// Append a job. A closed queue drops it, releasing the item.
    pub fn push(&self, job: CollectionJob) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            if inner.jobs.len() >= inner.capacity {
                inner.capacity += self.growth_step;
                let additional = inner.capacity - inner.jobs.len();
                inner.jobs.reserve(additional);
                let growths = self.growth_count.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = inner.capacity,
                    growths, "Data collection queue full, growing"
                );
            }
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<CollectionJob> {
        self.inner.lock().jobs.pop_front()
    }

    /// Wait up to `timeout` for a job.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<CollectionJob> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Refuse further jobs and wake every waiting worker.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove every queued job. Dropping them releases their items.
    pub fn drain(&self) -> Vec<CollectionJob> {
        self.inner.lock().jobs.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn growth_count(&self) -> u64 {
        self.growth_count.load(Ordering::Relaxed)
    }
}
