use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::config::DiscoveryConfig;

/// Discovery switches that can change at runtime.
#[derive(Debug, Default)]
pub struct DiscoverySettings {
    passive: AtomicBool,
    active: AtomicBool,
    snmp_trap: AtomicBool,
    syslog: AtomicBool,
    active_interval_secs: AtomicU64,
    changed: Notify,
}

impl DiscoverySettings {
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let settings = Self::default();
        settings.apply(config);
        settings
    }

    /// Replace every switch with the values from `config`.
    pub fn apply(&self, config: &DiscoveryConfig) {
        self.passive.store(config.passive_enabled, Ordering::Release);
        self.active.store(config.active_enabled, Ordering::Release);
        self.snmp_trap
            .store(config.snmp_trap_enabled, Ordering::Release);
        self.syslog.store(config.syslog_enabled, Ordering::Release);
        self.active_interval_secs
            .store(config.active_interval_secs.max(1), Ordering::Release);
        info!(
            passive = config.passive_enabled,
            active = config.active_enabled,
            snmp_trap = config.snmp_trap_enabled,
            syslog = config.syslog_enabled,
            "Discovery settings applied"
        );
        self.changed.notify_one();
    }

    pub fn passive_enabled(&self) -> bool {
        self.passive.load(Ordering::Acquire)
    }

    pub fn set_passive_enabled(&self, enabled: bool) {
        self.passive.store(enabled, Ordering::Release);
    }

    pub fn active_enabled(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active_enabled(&self, enabled: bool) {
        self.active.store(enabled, Ordering::Release);
        self.changed.notify_one();
    }

    pub fn snmp_trap_enabled(&self) -> bool {
        self.snmp_trap.load(Ordering::Acquire)
    }

    pub fn syslog_enabled(&self) -> bool {
        self.syslog.load(Ordering::Acquire)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs.load(Ordering::Acquire))
    }

    /// Resolves after the next change to the active discovery switch or
    /// interval. A change made while nobody waits is kept for the next call.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}
