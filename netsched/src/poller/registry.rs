//! Registry of in-flight polls.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::PollType;
use crate::objects::{ManagedObject, ObjectId, ObjectPin};
use crate::{Error, Result};

const NAME_WIDTH: usize = 30;

/// Snapshot of one in-flight poll.
#[derive(Debug, Clone, Serialize)]
pub struct PollerInfo {
    pub request_id: u64,
    pub poll_type: PollType,
    pub object_id: ObjectId,
    pub object_name: String,
    pub status: String,
    pub registered_at: DateTime<Utc>,
}

struct Entry {
    poll_type: PollType,
    object_id: ObjectId,
    object_name: String,
    status: Arc<Mutex<String>>,
    registered_at: DateTime<Utc>,
}

/// Table of polls that are admitted and not yet finished.
#[derive(Default)]
pub struct PollerRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a poll on a pinned object.
    ///
    /// The caller must already have marked the poll type busy on the object;
    /// the returned handle clears it when dropped.
    pub fn register(
        self: &Arc<Self>,
        poll_type: PollType,
        pin: ObjectPin,
        cancel: CancellationToken,
    ) -> PollerHandle {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let status = Arc::new(Mutex::new("wait".to_string()));
        self.entries.lock().insert(
            request_id,
            Entry {
                poll_type,
                object_id: pin.id(),
                object_name: pin.name().to_string(),
                status: status.clone(),
                registered_at: Utc::now(),
            },
        );
        trace!(request_id, object_id = pin.id(), poll_type = %poll_type, "Poller registered");

        PollerHandle {
            request_id,
            poll_type,
            pin,
            registry: self.clone(),
            status,
            started: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// In-flight polls ordered by request id.
    pub fn snapshot(&self) -> Vec<PollerInfo> {
        let entries = self.entries.lock();
        let mut infos: Vec<_> = entries
            .iter()
            .map(|(id, e)| PollerInfo {
                request_id: *id,
                poll_type: e.poll_type,
                object_id: e.object_id,
                object_name: e.object_name.clone(),
                status: e.status.lock().clone(),
                registered_at: e.registered_at,
            })
            .collect();
        drop(entries);
        infos.sort_by_key(|i| i.request_id);
        infos
    }

    /// Fixed-width table of in-flight polls for operator consoles.
    pub fn show_pollers(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<4} | {:>9} | {:<width$} | Status",
            "Type",
            "Object ID",
            "Object name",
            width = NAME_WIDTH
        );
        let _ = writeln!(
            out,
            "-----+-----------+-{}-+--------------------------",
            "-".repeat(NAME_WIDTH)
        );
        for info in self.snapshot() {
            let name: String = info.object_name.chars().take(NAME_WIDTH).collect();
            let _ = writeln!(
                out,
                "{} | {:>9} | {:<width$} | {}",
                info.poll_type.code(),
                info.object_id,
                name,
                info.status,
                width = NAME_WIDTH
            );
        }
        out
    }

    fn unregister(&self, request_id: u64) {
        self.entries.lock().remove(&request_id);
    }
}

/// Lease on one admitted poll.
///
/// Dropping the handle removes the registry entry, clears the busy flag of
/// its poll type and, if execution had started, records the completion time.
/// The object pin is released last.
pub struct PollerHandle {
    request_id: u64,
    poll_type: PollType,
    pin: ObjectPin,
    registry: Arc<PollerRegistry>,
    status: Arc<Mutex<String>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl PollerHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn poll_type(&self) -> PollType {
        self.poll_type
    }

    pub fn object(&self) -> &Arc<ManagedObject> {
        self.pin.object()
    }

    pub fn object_id(&self) -> ObjectId {
        self.pin.id()
    }

    /// Update the status column shown by [`PollerRegistry::show_pollers`].
    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock() = status.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().clone()
    }

    /// Mark the poll as running. Only started polls record a completion time.
    pub fn start_execution(&self) {
        self.started.store(true, Ordering::Release);
        self.set_status("started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancellation checkpoint for long poll bodies.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.request_id);
        let started = self.is_started();
        self.pin.finish_poll(self.poll_type, started, Instant::now());
        trace!(
            request_id = self.request_id,
            object_id = self.pin.id(),
            poll_type = %self.poll_type,
            completed = started,
            "Poller released"
        );
    }
}

impl std::fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerHandle")
            .field("request_id", &self.request_id)
            .field("poll_type", &self.poll_type)
            .field("object_id", &self.pin.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{NodeData, ObjectIndex, ObjectKind};

    #[test]
    fn test_handle_drop_releases_everything() {
        let index = ObjectIndex::new();
        let registry = Arc::new(PollerRegistry::new());
        let obj = index.create("core-sw", ObjectKind::Node(NodeData::new(0)));
        let now = Instant::now();

        assert!(obj.try_begin_poll(PollType::Status, now));
        let handle = registry.register(PollType::Status, index.pin(&obj), CancellationToken::new());
        assert_eq!(registry.len(), 1);
        assert_eq!(obj.pin_count(), 1);

        handle.start_execution();
        drop(handle);

        assert!(registry.is_empty());
        assert_eq!(obj.pin_count(), 0);
        assert!(!obj.is_poll_busy(PollType::Status));
        assert!(obj.poll_state(PollType::Status).unwrap().last_poll.is_some());
    }

    #[test]
    fn test_unstarted_handle_not_recorded() {
        let index = ObjectIndex::new();
        let registry = Arc::new(PollerRegistry::new());
        let obj = index.create("core-sw", ObjectKind::Node(NodeData::new(0)));

        assert!(obj.try_begin_poll(PollType::Configuration, Instant::now()));
        drop(registry.register(PollType::Configuration, index.pin(&obj), CancellationToken::new()));

        assert!(!obj.is_poll_busy(PollType::Configuration));
        assert!(obj.poll_state(PollType::Configuration).unwrap().last_poll.is_none());
    }

    #[test]
    fn test_checkpoint_after_cancel() {
        let index = ObjectIndex::new();
        let registry = Arc::new(PollerRegistry::new());
        let obj = index.create("n", ObjectKind::Node(NodeData::new(0)));
        let token = CancellationToken::new();
        let handle = registry.register(PollType::Status, index.pin(&obj), token.child_token());

        assert!(handle.checkpoint().is_ok());
        token.cancel();
        assert!(matches!(handle.checkpoint(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_show_pollers_format() {
        let index = ObjectIndex::new();
        let registry = Arc::new(PollerRegistry::new());
        let obj = index.create(
            "a-very-long-node-name-that-exceeds-the-column",
            ObjectKind::Node(NodeData::new(0)),
        );
        let handle = registry.register(PollType::Topology, index.pin(&obj), CancellationToken::new());
        handle.set_status("reading LLDP");

        let table = registry.show_pollers();
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Type | Object ID | Object name"));
        assert!(lines[2].starts_with("TOPO | "));
        assert!(lines[2].contains("a-very-long-node-name-that-exc |"));
        assert!(lines[2].ends_with("| reading LLDP"));
        assert_eq!(lines[0].find("| Status"), lines[2].find("| reading"));
    }
}
