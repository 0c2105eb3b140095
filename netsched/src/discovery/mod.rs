//! Network discovery.
//!
//! Passive discovery reads the ARP cache and routing table of each polled
//! node; active discovery pings configured address ranges. Both verify
//! candidate addresses through the [`DiscoveryEngine`] and feed the
//! [`NewNodeQueue`].

mod access;
mod active;
mod candidate;
mod engine;
mod pinger;
mod queue;
mod settings;

pub use access::{ArpEntry, DeviceAccess, NoDeviceAccess, RouteEntry};
pub use active::{ActiveDiscovery, ConfiguredRanges, RangeScanSummary, RangeSource, ScanOptions};
pub use candidate::{CandidateVerdict, DiscoverySource, NewNodeCandidate};
pub use engine::{DiscoveryEngine, DiscoveryPollSummary, DiscoveryStage};
pub use pinger::{IcmpPinger, NoPinger, PingOptions, Pinger};
pub use queue::{NewNodeQueue, QueuedCandidate};
pub use settings::DiscoverySettings;
