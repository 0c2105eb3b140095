use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::{CollectionJob, CollectionQueue};
use crate::objects::ObjectIndex;
use crate::stats::RollingWindow;

const ITEM_POLL_TICK: Duration = Duration::from_secs(1);

/// Number of passes averaged by [`ItemPoller::average_queuing_time`].
const QUEUING_TIME_SAMPLES: usize = 60;

/// Walks data collection targets once a second and queues every ready item.
pub struct ItemPoller {
    index: Arc<ObjectIndex>,
    queue: Arc<CollectionQueue>,
    timings: Mutex<RollingWindow>,
}

impl ItemPoller {
    pub fn new(index: Arc<ObjectIndex>, queue: Arc<CollectionQueue>) -> Self {
        Self {
            index,
            queue,
            timings: Mutex::new(RollingWindow::new(QUEUING_TIME_SAMPLES)),
        }
    }

    /// One pass over every target. Returns the number of items queued.
    pub fn tick(&self, now: Instant) -> usize {
        let started = std::time::Instant::now();
        let mut queued = 0;

        for object in self.index.data_collection_targets() {
            if !object.is_managed() || object.is_data_collection_disabled() {
                continue;
            }
            for item in object.items() {
                if !item.try_begin_collection(now) {
                    continue;
                }
                trace!(object_id = object.id(), item_id = item.id(), item = item.name(), "Queued item");
                let job = CollectionJob::new(item, self.index.pin(&object));
                if self.queue.push(job) {
                    queued += 1;
                }
            }
        }

        let elapsed = started.elapsed();
        self.timings.lock().push(elapsed.as_secs_f64() * 1000.0);
        queued
    }

    /// Mean wall-clock cost of the recent passes.
    pub fn average_queuing_time(&self) -> Duration {
        Duration::from_secs_f64(self.timings.lock().average() / 1000.0)
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Item poller started");
        let mut ticker = tokio::time::interval(ITEM_POLL_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                now = ticker.tick() => {
                    self.tick(now);
                }
            }
        }
        info!("Item poller stopped");
    }
}
