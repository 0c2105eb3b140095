//! # inet-util
//!
//! Address helpers shared by the discovery and polling code.
//!
//! ## Features
//!
//! - `InetAddress`: an IP address together with the mask length of the
//!   subnet it was seen in
//! - `MacAddress`: 48-bit hardware address as reported by ARP caches
//! - `Ipv4Range`: inclusive IPv4 range with chunked iteration for scanners
//!

use thiserror::Error;

mod address;
mod mac;
mod range;

pub use address::InetAddress;
pub use mac::MacAddress;
pub use range::{Ipv4Range, Ipv4RangeIter};

/// Errors produced while parsing or constructing addresses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InetError {
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("invalid mask length {bits} (maximum {max})")]
    InvalidMaskBits { bits: u8, max: u8 },

    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("invalid address range: {from} > {to}")]
    InvalidRange { from: String, to: String },
}

pub type Result<T> = std::result::Result<T, InetError>;
