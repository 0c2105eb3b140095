//! Rolling averages of internal queue depths.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::RollingWindow;
use crate::config::StatsConfig;

/// Source of a queue depth sample.
pub trait QueueDepth: Send + Sync {
    fn depth(&self) -> usize;
}

impl<F> QueueDepth for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn depth(&self) -> usize {
        self()
    }
}

/// Point-in-time view of the collected statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Trailing average depth per registered queue.
    pub averages: BTreeMap<String, f64>,
    /// Average time the item poller spends per pass.
    pub item_queuing_time_ms: f64,
}

struct Tracked {
    source: Arc<dyn QueueDepth>,
    window: RollingWindow,
}

type QueuingTime = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Samples every registered [`QueueDepth`] on a fixed interval.
pub struct StatsCollector {
    interval: Duration,
    samples: usize,
    queues: Mutex<BTreeMap<String, Tracked>>,
    queuing_time: Mutex<Option<QueuingTime>>,
}

impl StatsCollector {
    pub fn new(config: &StatsConfig) -> Self {
        Self {
            interval: config.interval(),
            samples: config.samples.max(1),
            queues: Mutex::new(BTreeMap::new()),
            queuing_time: Mutex::new(None),
        }
    }

    /// Track a queue under `name`. Re-registering a name replaces it.
    pub fn register(&self, name: impl Into<String>, source: Arc<dyn QueueDepth>) {
        let name = name.into();
        debug!(queue = %name, "Registered queue for statistics");
        self.queues.lock().insert(
            name,
            Tracked {
                source,
                window: RollingWindow::new(self.samples),
            },
        );
    }

    pub fn set_queuing_time_source(&self, source: impl Fn() -> Duration + Send + Sync + 'static) {
        *self.queuing_time.lock() = Some(Arc::new(source));
    }

    /// Take one sample of every queue.
    pub fn sample(&self) {
        let mut queues = self.queues.lock();
        for tracked in queues.values_mut() {
            let depth = tracked.source.depth();
            tracked.window.push(depth as f64);
        }
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        self.queues.lock().get(name).map(|t| t.window.average())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let averages = self
            .queues
            .lock()
            .iter()
            .map(|(name, t)| (name.clone(), t.window.average()))
            .collect();
        let queuing_time = self.queuing_time.lock().clone();
        StatsSnapshot {
            averages,
            item_queuing_time_ms: queuing_time.map_or(0.0, |f| f().as_secs_f64() * 1000.0),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval = ?self.interval, samples = self.samples, "Statistics collector started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample(),
            }
        }
        info!("Statistics collector stopped");
    }
}
