//! Elastic worker pool for poll tasks.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::PollerConfig;
use crate::{Error, Result};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Workers kept alive while idle.
    pub base_size: usize,
    /// Hard limit on concurrent workers.
    pub max_size: usize,
    /// Idle time after which a worker above the base size exits.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "POLLERS".to_string(),
            base_size: 10,
            max_size: 250,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&PollerConfig> for PoolConfig {
    fn from(config: &PollerConfig) -> Self {
        Self {
            name: "POLLERS".to_string(),
            base_size: config.pool_base_size,
            max_size: config.pool_max_size.max(config.pool_base_size),
            idle_timeout: config.worker_idle_timeout(),
        }
    }
}

/// Point-in-time view of pool utilisation.
#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub base_size: usize,
    pub max_size: usize,
    pub workers: usize,
    pub active: usize,
    pub queued: usize,
}

struct Shared {
    config: PoolConfig,
    queue: Mutex<VecDeque<BoxFuture<'static, ()>>>,
    notify: Notify,
    closed: AtomicBool,
    workers: AtomicUsize,
    idle: AtomicUsize,
    active: AtomicUsize,
}

/// Bounded elastic pool.
///
/// Keeps `base_size` workers alive, grows one worker per submission while no
/// worker is idle, up to `max_size`, and lets surplus workers exit after
/// `idle_timeout`. Jobs are run under `catch_unwind`.
pub struct PollWorkerPool {
    shared: Arc<Shared>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl PollWorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
            tasks: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the base workers.
    pub fn start(&self) {
        info!(
            pool = %self.shared.config.name,
            base = self.shared.config.base_size,
            max = self.shared.config.max_size,
            "Starting worker pool"
        );
        for _ in 0..self.shared.config.base_size {
            if !self.try_spawn_worker() {
                break;
            }
        }
    }

    /// Queue a job. Fails once shutdown has begun; the job is dropped.
    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        self.shared.queue.lock().push_back(job.boxed());

        if self.shared.idle.load(Ordering::Acquire) == 0 {
            self.try_spawn_worker();
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Stop accepting jobs and wait for every worker to exit.
    ///
    /// Jobs already queued still run; they observe cancellation through
    /// their own tokens.
    pub async fn shutdown(&self) {
        info!(pool = %self.shared.config.name, "Stopping worker pool");
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!(pool = %self.shared.config.name, error = %e, "Worker task failed");
                }
            }
        }

        info!(pool = %self.shared.config.name, "Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            name: self.shared.config.name.clone(),
            base_size: self.shared.config.base_size,
            max_size: self.shared.config.max_size,
            workers: self.shared.workers.load(Ordering::Acquire),
            active: self.shared.active.load(Ordering::Acquire),
            queued: self.queued(),
        }
    }

    fn try_spawn_worker(&self) -> bool {
        let max = self.shared.config.max_size;
        let reserved = self
            .shared
            .workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1));
        let Ok(previous) = reserved else {
            return false;
        };

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            self.shared.workers.fetch_sub(1, Ordering::AcqRel);
            return false;
        };
        // reap workers that exited on idle timeout
        while join_set.try_join_next().is_some() {}

        let shared = self.shared.clone();
        let worker_id = previous;
        join_set.spawn(worker_loop(shared, worker_id));
        debug!(pool = %self.shared.config.name, worker_id, "Worker started");
        true
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    loop {
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let job = shared.queue.lock().pop_front();
        if let Some(job) = job {
            shared.active.fetch_add(1, Ordering::AcqRel);
            if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(pool = %shared.config.name, worker_id, panic = %message, "Job panicked");
            }
            shared.active.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        shared.idle.fetch_add(1, Ordering::AcqRel);
        let timed_out = tokio::select! {
            _ = &mut notified => false,
            _ = tokio::time::sleep(shared.config.idle_timeout) => true,
        };
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        if timed_out {
            let base = shared.config.base_size;
            let shrunk = shared
                .workers
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > base).then(|| n - 1))
                .is_ok();
            if shrunk {
                debug!(pool = %shared.config.name, worker_id, "Idle worker exiting");
                return;
            }
        }
    }

    shared.workers.fetch_sub(1, Ordering::AcqRel);
    debug!(pool = %shared.config.name, worker_id, "Worker stopped");
}
