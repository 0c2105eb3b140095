//! Metric collection pipeline.
//!
//! The [`ItemPoller`] marks ready items busy and queues them on the
//! [`CollectionQueue`]; the [`DataCollectorPool`] fetches each value through
//! the [`MetricSource`] registered for the item's source and hands it to a
//! [`ValueSink`].

mod collector;
mod item;
mod item_poller;
mod queue;

pub use collector::{
    CollectionCounters, CollectionStats, DataCollectorPool, FetchError, LastValueSink,
    MetricSource, MetricSources, ValueSink,
};
pub use item::{DataCollectionItem, DataSource, ItemId, ItemKind, ItemStatus, MetricValue};
pub use item_poller::ItemPoller;
pub use queue::{CollectionJob, CollectionQueue};
