use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::{InetAddress, InetError, Result};

/// Inclusive range of IPv4 addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Range {
    from: u32,
    to: u32,
}

impl Ipv4Range {
    pub fn new(from: Ipv4Addr, to: Ipv4Addr) -> Result<Self> {
        let (f, t) = (u32::from(from), u32::from(to));
        if f > t {
            return Err(InetError::InvalidRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { from: f, to: t })
    }

    /// Host addresses of a subnet, excluding its base and broadcast.
    ///
    /// Returns `None` for IPv6 and for subnets without host addresses
    /// (`/31`, `/32`).
    pub fn hosts_of(subnet: &InetAddress) -> Option<Self> {
        let IpAddr::V4(base) = subnet.subnet_address() else {
            return None;
        };
        let bcast = subnet.subnet_broadcast()?;
        let (from, to) = (u32::from(base) + 1, u32::from(bcast) - 1);
        (from <= to).then_some(Self { from, to })
    }

    pub fn from_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.from)
    }

    pub fn to_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.to)
    }

    pub fn len(&self) -> u64 {
        u64::from(self.to - self.from) + 1
    }

    /// Always false: a range holds at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (self.from..=self.to).contains(&u32::from(addr))
    }

    pub fn iter(&self) -> Ipv4RangeIter {
        Ipv4RangeIter {
            next: Some(self.from),
            to: self.to,
        }
    }

    /// Splits the range into consecutive sub-ranges of at most `size` addresses.
    pub fn chunks(&self, size: u32) -> impl Iterator<Item = Ipv4Range> + use<> {
        let size = size.max(1);
        let to = self.to;
        let mut next = Some(self.from);
        std::iter::from_fn(move || {
            let from = next?;
            let end = from.saturating_add(size - 1).min(to);
            next = if end >= to { None } else { Some(end + 1) };
            Some(Ipv4Range { from, to: end })
        })
    }
}

impl fmt::Display for Ipv4Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.from_addr(), self.to_addr())
    }
}

impl IntoIterator for &Ipv4Range {
    type Item = Ipv4Addr;
    type IntoIter = Ipv4RangeIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Ipv4RangeIter {
    next: Option<u32>,
    to: u32,
}

impl Iterator for Ipv4RangeIter {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = if current >= self.to {
            None
        } else {
            Some(current + 1)
        };
        Some(Ipv4Addr::from(current))
    }
}
