//! Periodic poll admission.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    ManagementNodeCheck, PollDispatcher, PollTask, PollType, PollWorkerPool, PollerRegistry,
};
use crate::config::PollerConfig;
use crate::discovery::NewNodeQueue;
use crate::objects::{ManagedObject, ObjectId, ObjectIndex};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub interval: Duration,
    /// Management node check period, in ticks.
    pub mgmt_check_ticks: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            mgmt_check_ticks: 120,
        }
    }
}

impl From<&PollerConfig> for AdmissionConfig {
    fn from(config: &PollerConfig) -> Self {
        Self {
            interval: config.admission_interval(),
            mgmt_check_ticks: config.mgmt_check_ticks.max(1),
        }
    }
}

/// Counters for one admission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub examined: usize,
    pub dispatched: usize,
    /// Admitted polls the pool refused.
    pub rejected: usize,
}

/// Walks the object index every tick and dispatches due polls.
pub struct PollAdmissionLoop {
    index: Arc<ObjectIndex>,
    registry: Arc<PollerRegistry>,
    pool: Arc<PollWorkerPool>,
    dispatcher: Arc<PollDispatcher>,
    mgmt: Arc<ManagementNodeCheck>,
    new_nodes: Arc<NewNodeQueue>,
    config: AdmissionConfig,
    cancel: CancellationToken,
    ticks: AtomicU64,
}

impl PollAdmissionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<ObjectIndex>,
        registry: Arc<PollerRegistry>,
        pool: Arc<PollWorkerPool>,
        dispatcher: Arc<PollDispatcher>,
        mgmt: Arc<ManagementNodeCheck>,
        new_nodes: Arc<NewNodeQueue>,
        config: AdmissionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            registry,
            pool,
            dispatcher,
            mgmt,
            new_nodes,
            config,
            cancel,
            ticks: AtomicU64::new(0),
        }
    }

    /// Request a poll of `poll_type` on the next tick.
    pub fn force_poll(&self, object_id: ObjectId, poll_type: PollType) -> Result<()> {
        let object = self
            .index
            .get(object_id)
            .ok_or_else(|| Error::not_found("object", object_id))?;
        if !object.force_poll(poll_type) {
            return Err(Error::validation(format!(
                "{} {} does not support {} polls",
                object.class(),
                object_id,
                poll_type
            )));
        }
        debug!(object_id, poll_type = %poll_type, "Forced poll requested");
        Ok(())
    }

    /// One admission pass over the whole index.
    pub fn tick(&self, now: Instant) -> AdmissionStats {
        let mut stats = AdmissionStats::default();
        if self.cancel.is_cancelled() {
            return stats;
        }
        let passive_discovery = self.dispatcher.discovery().passive_enabled();

        for object in self.index.snapshot() {
            stats.examined += 1;
            if object.is_deleted() || !object.is_managed() {
                continue;
            }
            for &poll_type in object.class().supported_polls() {
                if poll_type == PollType::Discovery && !passive_discovery {
                    continue;
                }
                match self.admit(&object, poll_type, now) {
                    Some(Ok(())) => stats.dispatched += 1,
                    Some(Err(e)) => {
                        stats.rejected += 1;
                        warn!(
                            object_id = object.id(),
                            poll_type = %poll_type,
                            error = %e,
                            "Poll not dispatched"
                        );
                    }
                    None => {}
                }
            }
        }

        if stats.dispatched > 0 || stats.rejected > 0 {
            debug!(
                examined = stats.examined,
                dispatched = stats.dispatched,
                rejected = stats.rejected,
                "Admission pass finished"
            );
        }
        stats
    }

    fn admit(
        &self,
        object: &Arc<ManagedObject>,
        poll_type: PollType,
        now: Instant,
    ) -> Option<Result<()>> {
        if !object.try_begin_poll(poll_type, now) {
            return None;
        }
        let handle = self.registry.register(
            poll_type,
            self.index.pin(object),
            self.cancel.child_token(),
        );
        trace!(object_id = object.id(), poll_type = %poll_type, "Poll admitted");
        let task = PollTask::new(handle);
        let dispatcher = self.dispatcher.clone();
        // on rejection the task is dropped, which releases busy without
        // recording completion
        Some(self.pool.submit(async move { dispatcher.execute(task).await }))
    }

    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Run until cancelled, then close the new node queue and drain the pool.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval = ?self.config.interval,
            mgmt_check_ticks = self.config.mgmt_check_ticks,
            "Poll manager started"
        );
        self.check_mgmt_node().await;

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            if ticks % self.config.mgmt_check_ticks == 0 {
                self.check_mgmt_node().await;
            }
            self.tick(Instant::now());
        }

        self.new_nodes.clear();
        self.new_nodes.close();
        debug!(in_flight = self.registry.len(), "Waiting for outstanding poll requests");
        self.pool.shutdown().await;
        info!("Poll manager stopped");
    }

    async fn check_mgmt_node(&self) {
        match self.mgmt.run().await {
            Ok(outcome) => trace!(?outcome, "Management node check finished"),
            Err(e) => warn!(error = %e, "Management node check failed"),
        }
    }
}
