//! Poll scheduling.
//!
//! The [`PollAdmissionLoop`] walks the object index on a fixed tick and
//! admits every due poll type, registering it in the [`PollerRegistry`] and
//! handing it to the elastic [`PollWorkerPool`]. The [`PollDispatcher`]
//! routes each task to the discovery engine or to external poll operations.

mod admission;
mod dispatch;
mod mgmt;
mod pool;
mod registry;

use serde::{Deserialize, Serialize};

pub use admission::{AdmissionConfig, AdmissionStats, PollAdmissionLoop};
pub use dispatch::{PollDispatcher, PollOperations, UnsupportedPollOperations};
pub use mgmt::{LocalHost, LocalInterface, ManagementNodeCheck, MgmtCheckOutcome, SystemLocalHost};
pub use pool::{PollWorkerPool, PoolConfig, PoolInfo};
pub use registry::{PollerHandle, PollerInfo, PollerRegistry};

/// Kind of probe run against an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PollType {
    Status,
    Configuration,
    InstanceDiscovery,
    RoutingTable,
    Discovery,
    Topology,
    Condition,
    BusinessService,
}

impl PollType {
    pub const ALL: [PollType; 8] = [
        PollType::Status,
        PollType::Configuration,
        PollType::InstanceDiscovery,
        PollType::RoutingTable,
        PollType::Discovery,
        PollType::Topology,
        PollType::Condition,
        PollType::BusinessService,
    ];

    /// Four-letter code used in the poller table.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Status => "STAT",
            Self::Configuration => "CONF",
            Self::InstanceDiscovery => "INST",
            Self::RoutingTable => "ROUT",
            Self::Discovery => "DISC",
            Self::Topology => "TOPO",
            Self::Condition => "COND",
            Self::BusinessService => "BSVC",
        }
    }
}

impl std::fmt::Display for PollType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Status => "status",
            Self::Configuration => "configuration",
            Self::InstanceDiscovery => "instance discovery",
            Self::RoutingTable => "routing table",
            Self::Discovery => "discovery",
            Self::Topology => "topology",
            Self::Condition => "condition",
            Self::BusinessService => "business service",
        };
        f.write_str(name)
    }
}

/// Console session that requested a manual poll.
pub type SessionId = u32;

/// Unit of work handed to the poller pool.
#[derive(Debug)]
pub struct PollTask {
    pub handle: PollerHandle,
    pub session: Option<SessionId>,
}

impl PollTask {
    pub fn new(handle: PollerHandle) -> Self {
        Self {
            handle,
            session: None,
        }
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn poll_type(&self) -> PollType {
        self.handle.poll_type()
    }

    pub fn request_id(&self) -> u64 {
        self.handle.request_id()
    }
}
