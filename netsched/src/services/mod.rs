//! Service layer.

pub mod container;

pub use container::{Collaborators, ServiceContainer, ServiceStats};
