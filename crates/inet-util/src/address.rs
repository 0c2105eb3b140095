use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};

use crate::{InetError, Result};

/// IP address with the mask length of the subnet it belongs to.
///
/// A bare host address carries the full mask (`/32` or `/128`). Equality and
/// hashing take the mask into account; use [`InetAddress::address`] to compare
/// hosts only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InetAddress {
    addr: IpAddr,
    mask_bits: u8,
}

impl InetAddress {
    pub fn new(addr: IpAddr, mask_bits: u8) -> Result<Self> {
        let max = max_bits(&addr);
        if mask_bits > max {
            return Err(InetError::InvalidMaskBits {
                bits: mask_bits,
                max,
            });
        }
        Ok(Self { addr, mask_bits })
    }

    /// Host address with a full-length mask.
    pub fn host(addr: IpAddr) -> Self {
        Self {
            mask_bits: max_bits(&addr),
            addr,
        }
    }

    pub fn v4(addr: Ipv4Addr, mask_bits: u8) -> Result<Self> {
        Self::new(IpAddr::V4(addr), mask_bits)
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn mask_bits(&self) -> u8 {
        self.mask_bits
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Same host, different mask. Out-of-range lengths are clamped.
    pub fn with_mask_bits(&self, mask_bits: u8) -> Self {
        Self {
            addr: self.addr,
            mask_bits: mask_bits.min(max_bits(&self.addr)),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.addr.is_loopback()
    }

    pub fn is_multicast(&self) -> bool {
        self.addr.is_multicast()
    }

    /// Limited broadcast (`255.255.255.255`).
    pub fn is_broadcast(&self) -> bool {
        matches!(self.addr, IpAddr::V4(v4) if v4.is_broadcast())
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.is_unspecified()
    }

    /// Address usable as a node address.
    pub fn is_valid_unicast(&self) -> bool {
        !(self.is_unspecified() || self.is_broadcast() || self.is_multicast() || self.is_loopback())
    }

    pub fn network(&self) -> IpNetwork {
        IpNetwork::new(self.addr, self.mask_bits).unwrap_or_else(|_| IpNetwork::from(self.addr))
    }

    /// Base address of the subnet.
    pub fn subnet_address(&self) -> IpAddr {
        self.network().network()
    }

    /// Directed broadcast address of the subnet. `/31` and `/32` have none.
    pub fn subnet_broadcast(&self) -> Option<Ipv4Addr> {
        match self.v4_network() {
            Some(net) if net.prefix() < 31 => Some(net.broadcast()),
            _ => None,
        }
    }

    /// Whether this host is the broadcast address of a `mask_bits` subnet.
    pub fn is_subnet_broadcast(&self, mask_bits: u8) -> bool {
        self.with_mask_bits(mask_bits)
            .subnet_broadcast()
            .is_some_and(|bcast| IpAddr::V4(bcast) == self.addr)
    }

    /// Whether this host is the base address of a `mask_bits` subnet.
    pub fn is_subnet_base(&self, mask_bits: u8) -> bool {
        if !self.is_ipv4() || mask_bits >= 31 {
            return false;
        }
        self.with_mask_bits(mask_bits).subnet_address() == self.addr
    }

    /// Whether `ip` falls inside this address' subnet.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.network().contains(ip)
    }

    pub fn same_subnet(&self, other: &InetAddress) -> bool {
        self.contains(other.addr)
    }

    fn v4_network(&self) -> Option<Ipv4Network> {
        match self.addr {
            IpAddr::V4(v4) => Ipv4Network::new(v4, self.mask_bits).ok(),
            IpAddr::V6(_) => None,
        }
    }
}

fn max_bits(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl From<IpAddr> for InetAddress {
    fn from(addr: IpAddr) -> Self {
        Self::host(addr)
    }
}

impl From<Ipv4Addr> for InetAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self::host(IpAddr::V4(addr))
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask_bits)
    }
}

impl FromStr for InetAddress {
    type Err = InetError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (addr, bits) = match s.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| InetError::InvalidAddress(s.to_string()))?;
        match bits {
            Some(bits) => {
                let bits: u8 = bits
                    .parse()
                    .map_err(|_| InetError::InvalidAddress(s.to_string()))?;
                Self::new(addr, bits)
            }
            None => Ok(Self::host(addr)),
        }
    }
}

impl TryFrom<String> for InetAddress {
    type Error = InetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<InetAddress> for String {
    fn from(value: InetAddress) -> Self {
        value.to_string()
    }
}
