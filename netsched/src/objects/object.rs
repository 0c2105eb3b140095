//! Managed objects and their per poll type scheduling state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::kind::{NodeData, ObjectClass, ObjectId, ObjectKind, ObjectStatus, ZoneId};
use crate::collection::DataCollectionItem;
use crate::config::PollIntervals;
use crate::poller::PollType;

/// Scheduling state of one poll type on one object.
#[derive(Debug, Clone)]
pub struct PollState {
    pub interval: Duration,
    pub last_poll: Option<Instant>,
    /// A poll of this type is admitted and not yet finished.
    pub busy: bool,
    /// Run on the next tick regardless of schedule.
    pub forced: bool,
    pub disabled: bool,
}

impl PollState {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_poll: None,
            busy: false,
            forced: false,
            disabled: false,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.forced
            || self
                .last_poll
                .is_none_or(|last| now.saturating_duration_since(last) >= self.interval)
    }
}

/// An object known to the scheduler.
///
/// Objects live in an [`ObjectIndex`](super::ObjectIndex) and are shared as
/// `Arc`s. Work referencing an object holds an [`ObjectPin`](super::ObjectPin)
/// so the number of outstanding references is observable.
pub struct ManagedObject {
    id: ObjectId,
    name: String,
    class: ObjectClass,
    kind: RwLock<ObjectKind>,
    status: RwLock<ObjectStatus>,
    deleted: AtomicBool,
    data_collection_disabled: AtomicBool,
    polls: Mutex<HashMap<PollType, PollState>>,
    items: RwLock<Vec<Arc<DataCollectionItem>>>,
    last_discovery: Mutex<Option<DateTime<Utc>>>,
    pub(super) pins: AtomicUsize,
}

impl ManagedObject {
    pub fn new(id: ObjectId, name: impl Into<String>, kind: ObjectKind, intervals: &PollIntervals) -> Self {
        let class = kind.class();
        let polls = class
            .supported_polls()
            .iter()
            .map(|pt| (*pt, PollState::new(intervals.interval(*pt))))
            .collect();

        Self {
            id,
            name: name.into(),
            class,
            kind: RwLock::new(kind),
            status: RwLock::new(ObjectStatus::Unknown),
            deleted: AtomicBool::new(false),
            data_collection_disabled: AtomicBool::new(false),
            polls: Mutex::new(polls),
            items: RwLock::new(Vec::new()),
            last_discovery: Mutex::new(None),
            pins: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn zone(&self) -> ZoneId {
        self.kind.read().zone()
    }

    pub fn status(&self) -> ObjectStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ObjectStatus) {
        *self.status.write() = status;
    }

    pub fn is_managed(&self) -> bool {
        self.status() != ObjectStatus::Unmanaged
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_data_collection_disabled(&self) -> bool {
        self.data_collection_disabled.load(Ordering::Acquire)
    }

    pub fn set_data_collection_disabled(&self, disabled: bool) {
        self.data_collection_disabled
            .store(disabled, Ordering::Release);
    }

    /// Number of live pins on this object.
    pub fn pin_count(&self) -> usize {
        self.pins.load(Ordering::Acquire)
    }

    /// Run `f` against the class data.
    pub fn with_kind<R>(&self, f: impl FnOnce(&ObjectKind) -> R) -> R {
        f(&self.kind.read())
    }

    /// Mutate the class data.
    pub fn update_kind<R>(&self, f: impl FnOnce(&mut ObjectKind) -> R) -> R {
        f(&mut self.kind.write())
    }

    /// Run `f` against node data; `None` for other classes.
    pub fn with_node<R>(&self, f: impl FnOnce(&NodeData) -> R) -> Option<R> {
        match &*self.kind.read() {
            ObjectKind::Node(node) => Some(f(node)),
            _ => None,
        }
    }

    pub fn update_node<R>(&self, f: impl FnOnce(&mut NodeData) -> R) -> Option<R> {
        match &mut *self.kind.write() {
            ObjectKind::Node(node) => Some(f(node)),
            _ => None,
        }
    }

    pub fn is_local_management_node(&self) -> bool {
        self.with_node(|n| n.local_management).unwrap_or(false)
    }

    /// Check readiness and mark the poll type busy in one step.
    ///
    /// Returns `false` when the object is deleted or unmanaged, the poll type
    /// is unsupported, disabled, already busy, or not yet due. A pending force
    /// request is consumed on admission.
    pub fn try_begin_poll(&self, poll_type: PollType, now: Instant) -> bool {
        if self.is_deleted() || !self.is_managed() {
            return false;
        }
        let mut polls = self.polls.lock();
        let Some(state) = polls.get_mut(&poll_type) else {
            return false;
        };
        if state.busy || state.disabled || !state.is_due(now) {
            return false;
        }
        state.busy = true;
        state.forced = false;
        true
    }

    /// Clear the busy flag. `completed` records `now` as the last poll time.
    pub fn finish_poll(&self, poll_type: PollType, completed: bool, now: Instant) {
        let mut polls = self.polls.lock();
        if let Some(state) = polls.get_mut(&poll_type) {
            state.busy = false;
            if completed {
                state.last_poll = Some(now);
            }
        }
    }

    /// Request a poll on the next admission tick. Returns `false` if the poll
    /// type is not supported by this object.
    pub fn force_poll(&self, poll_type: PollType) -> bool {
        match self.polls.lock().get_mut(&poll_type) {
            Some(state) => {
                state.forced = true;
                true
            }
            None => false,
        }
    }

    pub fn set_poll_disabled(&self, poll_type: PollType, disabled: bool) {
        if let Some(state) = self.polls.lock().get_mut(&poll_type) {
            state.disabled = disabled;
        }
    }

    pub fn set_poll_interval(&self, poll_type: PollType, interval: Duration) {
        if let Some(state) = self.polls.lock().get_mut(&poll_type) {
            state.interval = interval;
        }
    }

    pub fn is_poll_busy(&self, poll_type: PollType) -> bool {
        self.polls
            .lock()
            .get(&poll_type)
            .is_some_and(|s| s.busy)
    }

    pub fn poll_state(&self, poll_type: PollType) -> Option<PollState> {
        self.polls.lock().get(&poll_type).cloned()
    }

    pub fn add_item(&self, item: Arc<DataCollectionItem>) {
        self.items.write().push(item);
    }

    pub fn remove_item(&self, item_id: u32) -> Option<Arc<DataCollectionItem>> {
        let mut items = self.items.write();
        let pos = items.iter().position(|i| i.id() == item_id)?;
        Some(items.remove(pos))
    }

    /// Snapshot of the object's data collection items.
    pub fn items(&self) -> Vec<Arc<DataCollectionItem>> {
        self.items.read().clone()
    }

    pub fn last_discovery(&self) -> Option<DateTime<Utc>> {
        *self.last_discovery.lock()
    }

    pub fn set_last_discovery(&self, at: DateTime<Utc>) {
        *self.last_discovery.lock() = Some(at);
    }
}

impl std::fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("deleted", &self.is_deleted())
            .field("pins", &self.pin_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::NodeData;

    fn node() -> ManagedObject {
        ManagedObject::new(
            1,
            "router",
            ObjectKind::Node(NodeData::new(0)),
            &PollIntervals::default(),
        )
    }

    #[test]
    fn test_begin_poll_sets_busy_once() {
        let obj = node();
        let now = Instant::now();
        assert!(obj.try_begin_poll(PollType::Status, now));
        assert!(obj.is_poll_busy(PollType::Status));
        assert!(!obj.try_begin_poll(PollType::Status, now));
        // other poll types are independent
        assert!(obj.try_begin_poll(PollType::Configuration, now));
    }

    #[test]
    fn test_interval_respected_after_completion() {
        let obj = node();
        let start = Instant::now();
        assert!(obj.try_begin_poll(PollType::Status, start));
        obj.finish_poll(PollType::Status, true, start);

        assert!(!obj.try_begin_poll(PollType::Status, start + Duration::from_secs(30)));
        assert!(obj.try_begin_poll(PollType::Status, start + Duration::from_secs(60)));
    }

    #[test]
    fn test_rejected_poll_does_not_record_completion() {
        let obj = node();
        let now = Instant::now();
        assert!(obj.try_begin_poll(PollType::Status, now));
        obj.finish_poll(PollType::Status, false, now);
        assert!(obj.poll_state(PollType::Status).unwrap().last_poll.is_none());
        assert!(obj.try_begin_poll(PollType::Status, now));
    }

    #[test]
    fn test_force_poll_consumed() {
        let obj = node();
        let now = Instant::now();
        assert!(obj.try_begin_poll(PollType::Topology, now));
        obj.finish_poll(PollType::Topology, true, now);

        assert!(obj.force_poll(PollType::Topology));
        assert!(obj.try_begin_poll(PollType::Topology, now));
        obj.finish_poll(PollType::Topology, true, now);
        assert!(!obj.try_begin_poll(PollType::Topology, now));
        assert!(!obj.force_poll(PollType::Condition));
    }

    #[test]
    fn test_unmanaged_deleted_disabled_never_admitted() {
        let now = Instant::now();

        let unmanaged = node();
        unmanaged.set_status(ObjectStatus::Unmanaged);
        assert!(!unmanaged.try_begin_poll(PollType::Status, now));

        let deleted = node();
        deleted.mark_deleted();
        assert!(!deleted.try_begin_poll(PollType::Status, now));

        let disabled = node();
        disabled.set_poll_disabled(PollType::Status, true);
        assert!(!disabled.try_begin_poll(PollType::Status, now));
        assert!(disabled.try_begin_poll(PollType::Configuration, now));
    }
}
