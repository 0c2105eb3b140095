use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::objects::ObjectId;

pub type ItemId = u32;

/// Factor applied to the polling interval of unsupported items.
const NOT_SUPPORTED_BACKOFF: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Item,
    Table,
}

/// Where an item's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSource {
    Internal,
    Snmp,
    Agent,
    CheckPoint,
    WinPerf,
    DeviceDriver,
    Script,
    /// Values pushed by an external sender. Never polled.
    Push,
}

impl DataSource {
    /// Sources that can only be read from a node.
    pub fn requires_node(&self) -> bool {
        matches!(
            self,
            Self::Snmp | Self::Agent | Self::CheckPoint | Self::WinPerf | Self::DeviceDriver
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    #[default]
    Active,
    NotSupported,
    Disabled,
}

/// Collected value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Table(Vec<Vec<String>>),
}

#[derive(Debug, Default)]
struct ItemState {
    status: ItemStatus,
    last_poll: Option<Instant>,
    error_count: u32,
    busy: bool,
    scheduled_for_deletion: bool,
    force_poll: bool,
    last_value: Option<(DateTime<Utc>, MetricValue)>,
}

/// Data collection item (DCI): one metric collected periodically from its
/// owner object.
#[derive(Debug)]
pub struct DataCollectionItem {
    id: ItemId,
    owner: ObjectId,
    name: String,
    kind: ItemKind,
    source: DataSource,
    interval: Duration,
    proxy_node: Option<ObjectId>,
    aggregate_on_cluster: bool,
    state: Mutex<ItemState>,
}

impl DataCollectionItem {
    pub fn new(
        id: ItemId,
        owner: ObjectId,
        name: impl Into<String>,
        source: DataSource,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            owner,
            name: name.into(),
            kind: ItemKind::Item,
            source,
            interval,
            proxy_node: None,
            aggregate_on_cluster: false,
            state: Mutex::new(ItemState::default()),
        }
    }

    pub fn table(mut self) -> Self {
        self.kind = ItemKind::Table;
        self
    }

    /// Collect through `proxy` instead of the owner.
    pub fn with_proxy(mut self, proxy: ObjectId) -> Self {
        self.proxy_node = Some(proxy);
        self
    }

    pub fn aggregated(mut self) -> Self {
        self.aggregate_on_cluster = true;
        self
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn source(&self) -> DataSource {
        self.source
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn proxy_node(&self) -> Option<ObjectId> {
        self.proxy_node
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregate_on_cluster
    }

    pub fn status(&self) -> ItemStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: ItemStatus) {
        self.state.lock().status = status;
    }

    /// Back to Active if the item was marked NotSupported.
    pub fn reactivate(&self) {
        let mut state = self.state.lock();
        if state.status == ItemStatus::NotSupported {
            state.status = ItemStatus::Active;
        }
    }

    pub fn record_error(&self) {
        self.state.lock().error_count += 1;
    }

    pub fn error_count(&self) -> u32 {
        self.state.lock().error_count
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn last_poll(&self) -> Option<Instant> {
        self.state.lock().last_poll
    }

    pub fn schedule_deletion(&self) {
        self.state.lock().scheduled_for_deletion = true;
    }

    pub fn is_scheduled_for_deletion(&self) -> bool {
        self.state.lock().scheduled_for_deletion
    }

    pub fn request_force_poll(&self) {
        self.state.lock().force_poll = true;
    }

    pub fn last_value(&self) -> Option<(DateTime<Utc>, MetricValue)> {
        self.state.lock().last_value.clone()
    }

    pub fn set_last_value(&self, timestamp: DateTime<Utc>, value: MetricValue) {
        let mut state = self.state.lock();
        state.last_value = Some((timestamp, value));
        state.error_count = 0;
    }

    pub fn is_ready_for_polling(&self, now: Instant) -> bool {
        Self::ready(&self.state.lock(), self.source, self.interval, now)
    }

    /// Mark the item busy if it is ready. A pending force poll is consumed.
    pub fn try_begin_collection(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if !Self::ready(&state, self.source, self.interval, now) {
            return false;
        }
        state.busy = true;
        state.force_poll = false;
        true
    }

    /// Record the poll time and clear busy.
    pub fn finish_collection(&self, now: Instant) {
        let mut state = self.state.lock();
        state.last_poll = Some(now);
        state.busy = false;
    }

    fn ready(state: &ItemState, source: DataSource, interval: Duration, now: Instant) -> bool {
        if state.status == ItemStatus::Disabled || state.busy || source == DataSource::Push {
            return false;
        }
        if state.force_poll {
            return true;
        }
        let interval = match state.status {
            ItemStatus::NotSupported => interval.saturating_mul(NOT_SUPPORTED_BACKOFF),
            _ => interval,
        };
        state
            .last_poll
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> DataCollectionItem {
        DataCollectionItem::new(1, 10, "cpu.usage", DataSource::Agent, Duration::from_secs(60))
    }

    #[test]
    fn test_interval_readiness() {
        let item = item();
        let t0 = Instant::now();
        assert!(item.try_begin_collection(t0));
        assert!(!item.is_ready_for_polling(t0));
        item.finish_collection(t0);

        assert!(!item.is_ready_for_polling(t0 + Duration::from_secs(30)));
        assert!(item.is_ready_for_polling(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn test_not_supported_backoff() {
        let item = item();
        let t0 = Instant::now();
        item.finish_collection(t0);
        item.set_status(ItemStatus::NotSupported);
        assert!(!item.is_ready_for_polling(t0 + Duration::from_secs(61)));
        assert!(item.is_ready_for_polling(t0 + Duration::from_secs(600)));

        item.reactivate();
        assert_eq!(item.status(), ItemStatus::Active);
    }

    #[test]
    fn test_not_supported_backoff_saturates() {
        let item = DataCollectionItem::new(3, 10, "rare", DataSource::Agent, Duration::MAX);
        let t0 = Instant::now();
        item.finish_collection(t0);
        item.set_status(ItemStatus::NotSupported);
        assert!(!item.is_ready_for_polling(t0 + Duration::from_secs(86_400)));
    }

    #[test]
    fn test_force_poll_and_exclusions() {
        let item = item();
        let t0 = Instant::now();
        item.finish_collection(t0);
        item.request_force_poll();
        assert!(item.try_begin_collection(t0));
        item.finish_collection(t0);
        assert!(!item.is_ready_for_polling(t0));

        item.set_status(ItemStatus::Disabled);
        item.request_force_poll();
        assert!(!item.is_ready_for_polling(t0 + Duration::from_secs(3600)));

        let push = DataCollectionItem::new(2, 10, "pushed", DataSource::Push, Duration::from_secs(1));
        assert!(!push.is_ready_for_polling(t0));
    }

    #[test]
    fn test_value_resets_errors() {
        let item = item();
        item.record_error();
        item.record_error();
        assert_eq!(item.error_count(), 2);
        item.set_last_value(Utc::now(), MetricValue::Integer(5));
        assert_eq!(item.error_count(), 0);
        assert_eq!(item.last_value().map(|(_, v)| v), Some(MetricValue::Integer(5)));
    }
}
