//! netsched library crate.
//!
//! Poll scheduling, network discovery and metric collection for a network
//! management server core.

pub mod collection;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod objects;
pub mod panic_hook;
pub mod poller;
pub mod services;
pub mod stats;

pub use error::{Error, Result};
