//! Configuration loading.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults
//! 2. JSON file named by `NETSCHED_CONFIG`
//! 3. `NETSCHED_*` environment variables (a `.env` file is honoured)

use std::path::Path;
use std::str::FromStr;

use tracing::{debug, info, warn};

use super::ServerConfig;
use crate::{Error, Result};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "NETSCHED_CONFIG";

impl ServerConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply `NETSCHED_*` overrides obtained through `lookup`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        override_parsed(&get, "NETSCHED_POLLER_BASE_SIZE", &mut self.poller.pool_base_size);
        override_parsed(&get, "NETSCHED_POLLER_MAX_SIZE", &mut self.poller.pool_max_size);
        override_parsed(
            &get,
            "NETSCHED_POLL_ADMISSION_INTERVAL",
            &mut self.poller.admission_interval_secs,
        );
        override_parsed(
            &get,
            "NETSCHED_STATUS_POLLING_INTERVAL",
            &mut self.poller.intervals.status_secs,
        );
        override_parsed(
            &get,
            "NETSCHED_CONFIGURATION_POLLING_INTERVAL",
            &mut self.poller.intervals.configuration_secs,
        );
        override_parsed(
            &get,
            "NETSCHED_DISCOVERY_POLLING_INTERVAL",
            &mut self.poller.intervals.discovery_secs,
        );
        override_parsed(
            &get,
            "NETSCHED_DATA_COLLECTOR_WORKERS",
            &mut self.data_collection.workers,
        );
        override_bool(&get, "NETSCHED_NETWORK_DISCOVERY", &mut self.discovery.passive_enabled);
        override_bool(
            &get,
            "NETSCHED_ACTIVE_NETWORK_DISCOVERY",
            &mut self.discovery.active_enabled,
        );
        override_bool(
            &get,
            "NETSCHED_SNMP_TRAP_DISCOVERY",
            &mut self.discovery.snmp_trap_enabled,
        );
        override_bool(&get, "NETSCHED_SYSLOG_DISCOVERY", &mut self.discovery.syslog_enabled);
        override_parsed(
            &get,
            "NETSCHED_ACTIVE_DISCOVERY_INTERVAL",
            &mut self.discovery.active_interval_secs,
        );

        if let Some(dir) = get("NETSCHED_LOG_DIR") {
            self.logging.dir = dir;
        }
        if let Some(filter) = get("NETSCHED_LOG_FILTER") {
            self.logging.filter = Some(filter);
        }
    }
}

fn override_parsed<T, F>(get: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => {
                debug!(key, value = %raw.trim(), "Applied configuration override");
                *target = value;
            }
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable configuration override"),
        }
    }
}

fn override_bool<F>(get: &F, key: &str, target: &mut bool)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *target = true,
            "0" | "false" | "no" | "off" => *target = false,
            _ => warn!(key, value = %raw, "Ignoring unparseable boolean override"),
        }
    }
}
