//! ICMP reachability checks.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use surge_ping::{Client, Config, PingIdentifier, PingSequence};
use tracing::trace;

use crate::config::DiscoveryConfig;
use crate::Result;

#[derive(Debug, Clone, Copy)]
pub struct PingOptions {
    pub attempts: u32,
    pub timeout: Duration,
    pub payload_size: usize,
}

impl Default for PingOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_millis(1500),
            payload_size: 46,
        }
    }
}

impl From<&DiscoveryConfig> for PingOptions {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            attempts: config.ping_attempts.max(1),
            timeout: config.ping_timeout(),
            payload_size: config.ping_payload_size,
        }
    }
}

/// Answers whether a host responds to ICMP echo.
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self, addr: IpAddr, options: &PingOptions) -> bool;
}

/// [`Pinger`] sending real ICMP echo requests over IPv4.
pub struct IcmpPinger {
    client: Client,
}

impl IcmpPinger {
    /// Open the ICMP socket. Fails without raw socket permission.
    pub fn new() -> Result<Self> {
        let client = Client::new(&Config::default())?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, addr: IpAddr, options: &PingOptions) -> bool {
        if !addr.is_ipv4() {
            return false;
        }
        let payload = vec![0u8; options.payload_size];
        let mut pinger = self
            .client
            .pinger(addr, PingIdentifier(rand::random::<u16>()))
            .await;
        pinger.timeout(options.timeout);

        for attempt in 0..options.attempts {
            match pinger.ping(PingSequence(attempt as u16), &payload).await {
                Ok((_, rtt)) => {
                    trace!(%addr, ?rtt, attempt, "Host responded to ICMP echo");
                    return true;
                }
                Err(e) => trace!(%addr, attempt, error = %e, "ICMP echo failed"),
            }
        }
        false
    }
}

/// [`Pinger`] for hosts where ICMP sockets cannot be opened. Nothing responds.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPinger;

#[async_trait]
impl Pinger for NoPinger {
    async fn ping(&self, _addr: IpAddr, _options: &PingOptions) -> bool {
        false
    }
}
