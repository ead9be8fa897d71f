// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device agent configuration.
//!
//! ```yaml
//! broker:
//!   host: broker.local
//!   port: 1883
//! backoff:
//!   min_secs: 1
//!   max_secs: 120
//! namespace: device/data
//! publish_interval_ms: 1000
//! queue:
//!   dir: queues
//!   capacity: 10000
//! devices:
//!   count: 3
//!   id_prefix: vehicle_
//! ```

use fleetwire_core::config::{self, BackoffConfig, BrokerConfig, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flush::FlushOptions;

/// Client ids are `device_<device_id>` unless the broker block overrides the prefix.
pub const CLIENT_ID_PREFIX: &str = "device_";

/// Durable queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding one `<device_id>_queue.db` per device.
    pub dir: PathBuf,
    /// Maximum entries per device before the oldest is evicted.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("queues"),
            capacity: 10_000,
        }
    }
}

/// Which devices this process runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub count: usize,
    pub id_prefix: String,
    /// Explicit ids. When non-empty, `count` and `id_prefix` are ignored.
    pub ids: Vec<String>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            count: 1,
            id_prefix: "vehicle_".to_string(),
            ids: Vec::new(),
        }
    }
}

impl DevicesConfig {
    /// Device ids in start order: explicit ids, or `<prefix>01` .. `<prefix>NN`.
    pub fn device_ids(&self) -> Vec<String> {
        if !self.ids.is_empty() {
            return self.ids.clone();
        }
        (1..=self.count)
            .map(|i| format!("{}{:02}", self.id_prefix, i))
            .collect()
    }
}

/// Top-level device agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub broker: BrokerConfig,
    pub backoff: BackoffConfig,
    /// Topic namespace; records go to `<namespace>/<device_id>`.
    pub namespace: String,
    pub publish_interval_ms: u64,
    pub queue: QueueConfig,
    /// Pause between drained entries.
    pub drain_interval_ms: u64,
    /// Pause before retrying an interrupted drain while still connected.
    pub drain_retry_ms: u64,
    /// Budget for the final drain at shutdown.
    pub shutdown_flush_timeout_ms: u64,
    pub devices: DevicesConfig,
    /// Statistics log period (0 disables).
    pub stats_interval_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            backoff: BackoffConfig::default(),
            namespace: "device/data".to_string(),
            publish_interval_ms: 1_000,
            queue: QueueConfig::default(),
            drain_interval_ms: 10,
            drain_retry_ms: 1_000,
            shutdown_flush_timeout_ms: 5_000,
            devices: DevicesConfig::default(),
            stats_interval_secs: 10,
        }
    }
}

impl DeviceConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = config::from_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = config::from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.backoff.validate()?;

        if self.namespace.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid("namespace is empty".into()));
        }
        if self.namespace.contains(['+', '#']) {
            return Err(ConfigError::Invalid(format!(
                "namespace '{}' must not contain wildcards",
                self.namespace
            )));
        }
        if self.publish_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "publish_interval_ms must be non-zero".into(),
            ));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be >= 1".into()));
        }

        let ids = self.devices.device_ids();
        if ids.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for id in &ids {
            if id.is_empty() || id.contains(['/', '\\', '+', '#']) {
                return Err(ConfigError::Invalid(format!("invalid device id '{}'", id)));
            }
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device id '{}'", id)));
            }
        }
        Ok(())
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn flush_options(&self) -> FlushOptions {
        FlushOptions {
            drain_interval: Duration::from_millis(self.drain_interval_ms),
            retry_pause: Duration::from_millis(self.drain_retry_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_flush_timeout_ms),
        }
    }

    pub fn client_id(&self, device_id: &str) -> String {
        self.broker.client_id(CLIENT_ID_PREFIX, device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::from_yaml("{}").unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.namespace, "device/data");
        assert_eq!(config.queue.capacity, 10_000);
        assert_eq!(config.publish_interval(), Duration::from_secs(1));
        assert_eq!(config.flush_options(), FlushOptions::default());
        assert_eq!(config.devices.device_ids(), vec!["vehicle_01"]);
        assert_eq!(config.client_id("vehicle_01"), "device_vehicle_01");
    }

    #[test]
    fn test_fleet_ids() {
        let yaml = r#"
broker:
  host: broker.local
devices:
  count: 3
queue:
  dir: /var/lib/fleetwire
  capacity: 500
"#;
        let config = DeviceConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.queue.capacity, 500);
        assert_eq!(
            config.devices.device_ids(),
            vec!["vehicle_01", "vehicle_02", "vehicle_03"]
        );

        let explicit = DevicesConfig {
            ids: vec!["truck_a".into(), "truck_b".into()],
            ..Default::default()
        };
        assert_eq!(explicit.device_ids(), vec!["truck_a", "truck_b"]);
    }

    #[test]
    fn test_validation() {
        assert!(DeviceConfig::from_yaml("queue:\n  capacity: 0\n").is_err());
        assert!(DeviceConfig::from_yaml("publish_interval_ms: 0\n").is_err());
        assert!(DeviceConfig::from_yaml("namespace: device/+\n").is_err());
        assert!(DeviceConfig::from_yaml("devices:\n  count: 0\n").is_err());
        assert!(DeviceConfig::from_yaml("devices:\n  ids: [a, a]\n").is_err());
        assert!(DeviceConfig::from_yaml("devices:\n  ids: [a/b]\n").is_err());
        assert!(DeviceConfig::from_yaml("backoff:\n  min_secs: 0\n").is_err());
    }

    #[test]
    fn test_bad_yaml() {
        let err = DeviceConfig::from_yaml("queue: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
