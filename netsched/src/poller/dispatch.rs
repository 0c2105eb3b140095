use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{PollTask, PollType, PollerHandle};
use crate::discovery::DiscoveryEngine;
use crate::{Error, Result};

/// Poll bodies implemented outside the scheduler (status, configuration,
/// instance discovery, routing table, topology, condition and business
/// service polls).
#[async_trait]
pub trait PollOperations: Send + Sync {
    async fn poll(&self, poll_type: PollType, handle: &PollerHandle) -> Result<()>;
}

/// Poll operations for a scheduler running without device access.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPollOperations;

#[async_trait]
impl PollOperations for UnsupportedPollOperations {
    async fn poll(&self, poll_type: PollType, handle: &PollerHandle) -> Result<()> {
        handle.set_status("not supported");
        Err(Error::collaborator(
            "poll operations",
            format!("{poll_type} poll is not available"),
        ))
    }
}

/// Routes admitted poll tasks to their implementation.
pub struct PollDispatcher {
    operations: Arc<dyn PollOperations>,
    discovery: Arc<DiscoveryEngine>,
}

impl PollDispatcher {
    pub fn new(operations: Arc<dyn PollOperations>, discovery: Arc<DiscoveryEngine>) -> Self {
        Self {
            operations,
            discovery,
        }
    }

    pub fn discovery(&self) -> &Arc<DiscoveryEngine> {
        &self.discovery
    }

    /// Run one task to completion. The task's handle is released on return.
    pub async fn execute(&self, task: PollTask) {
        let handle = &task.handle;
        let poll_type = handle.poll_type();
        let object_id = handle.object_id();

        if handle.checkpoint().is_err() {
            debug!(object_id, poll_type = %poll_type, "Poll skipped, shutting down");
            return;
        }
        handle.start_execution();

        let result = match poll_type {
            PollType::Discovery => self.discovery.discovery_poll(handle).await.map(|_| ()),
            other => self.operations.poll(other, handle).await,
        };

        match result {
            Ok(()) => debug!(
                object_id,
                poll_type = %poll_type,
                session = ?task.session,
                "Poll finished"
            ),
            Err(Error::ShuttingDown) => {
                debug!(object_id, poll_type = %poll_type, "Poll interrupted by shutdown")
            }
            Err(e) => warn!(
                object_id,
                object = handle.object().name(),
                poll_type = %poll_type,
                error = %e,
                "Poll failed"
            ),
        }
    }
}
