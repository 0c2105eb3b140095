//! Managed objects.
//!
//! The scheduler sees the object model through a closed set of classes
//! ([`ObjectKind`]), an arena ([`ObjectIndex`]) and pin tokens
//! ([`ObjectPin`]) that count references held by in-flight work.

mod index;
mod kind;
mod object;
mod persistence;

pub use index::{ObjectIndex, ObjectPin};
pub use kind::{
    ClusterData, DEFAULT_ZONE, Interface, MobileDeviceData, NodeData, ObjectClass, ObjectId,
    ObjectKind, ObjectStatus, SubnetData, ZoneId,
};
pub use object::{ManagedObject, PollState};
pub use persistence::{NullPersistence, Persistence};
