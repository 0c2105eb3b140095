//! Internal statistics.

mod collector;
mod window;

pub use collector::{QueueDepth, StatsCollector, StatsSnapshot};
pub use window::RollingWindow;
