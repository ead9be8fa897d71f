// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector configuration.
//!
//! ```yaml
//! broker:
//!   host: broker.local
//! subscriptions:
//!   - device/data/+
//!   - vehicle/speed/+
//! batch:
//!   size: 250
//!   flush_interval_ms: 500
//!   max_retries: 3
//!   retry_delay_ms: 5000
//!   max_pending: 2500
//! influxdb:
//!   url: http://localhost:8086
//!   org: fleet
//!   bucket: telemetry
//!   token: my-token
//! tags:
//!   - detection_label
//! ```
//!
//! Without an `influxdb` block the collector runs in dry-run mode.

use fleetwire_core::config::{self, BackoffConfig, BrokerConfig, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Client id is `collector_<name>` unless the broker block overrides the prefix.
pub const CLIENT_ID_PREFIX: &str = "collector_";

/// Speed-only topic of older vehicle firmware, same record schema.
pub const LEGACY_SPEED_FILTER: &str = "vehicle/speed/+";

/// Batch Writer thresholds and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as this many records are waiting.
    pub size: usize,
    /// Flush at most this long after the oldest waiting record arrived.
    pub flush_interval_ms: u64,
    /// Retries after the first failed write.
    pub max_retries: u32,
    /// Fixed pause between write attempts.
    pub retry_delay_ms: u64,
    /// Records held while a batch is being written; the oldest are dropped
    /// past this.
    pub max_pending: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 250,
            flush_interval_ms: 500,
            max_retries: 3,
            retry_delay_ms: 5_000,
            max_pending: 2_500,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// InfluxDB v2 connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub measurement: String,
    /// HTTP request timeout.
    pub timeout_ms: u64,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: "fleetwire".to_string(),
            bucket: "telemetry".to_string(),
            token: None,
            measurement: "device_data".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Top-level collector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub broker: BrokerConfig,
    pub backoff: BackoffConfig,
    /// Collector identity, used for the client id.
    pub name: String,
    pub subscriptions: Vec<String>,
    pub batch: BatchConfig,
    pub influxdb: Option<InfluxConfig>,
    /// Measurement used when no `influxdb` block is present.
    pub measurement: String,
    /// Record fields written as tags instead of fields.
    pub tags: Vec<String>,
    /// Value of the `collector` tag (empty to omit).
    pub collector_tag: String,
    /// Statistics log period (0 disables).
    pub stats_interval_secs: u64,
    /// Number of recent transit latencies kept for percentiles.
    pub latency_window: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            backoff: BackoffConfig::default(),
            name: "fleetwire".to_string(),
            subscriptions: vec!["device/data/+".to_string(), LEGACY_SPEED_FILTER.to_string()],
            batch: BatchConfig::default(),
            influxdb: None,
            measurement: "device_data".to_string(),
            tags: vec!["detection_label".to_string()],
            collector_tag: "fleetwire".to_string(),
            stats_interval_secs: 10,
            latency_window: 1024,
        }
    }
}

impl CollectorConfig {
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

        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name is empty".into()));
        }
        if self.subscriptions.is_empty() {
            return Err(ConfigError::Invalid("no subscriptions configured".into()));
        }
        for filter in &self.subscriptions {
            if !valid_filter(filter) {
                return Err(ConfigError::Invalid(format!(
                    "invalid subscription filter '{}'",
                    filter
                )));
            }
        }
        if self.batch.size == 0 {
            return Err(ConfigError::Invalid("batch.size must be >= 1".into()));
        }
        if self.batch.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch.flush_interval_ms must be non-zero".into(),
            ));
        }
        if self.batch.max_pending < self.batch.size {
            return Err(ConfigError::Invalid(
                "batch.max_pending must be >= batch.size".into(),
            ));
        }
        if self.latency_window == 0 {
            return Err(ConfigError::Invalid("latency_window must be >= 1".into()));
        }
        if let Some(influx) = &self.influxdb {
            if !influx.url.starts_with("http://") && !influx.url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "influxdb.url '{}' must start with http:// or https://",
                    influx.url
                )));
            }
            if influx.org.is_empty() || influx.bucket.is_empty() {
                return Err(ConfigError::Invalid(
                    "influxdb.org and influxdb.bucket are required".into(),
                ));
            }
            if influx.measurement.is_empty() {
                return Err(ConfigError::Invalid("influxdb.measurement is empty".into()));
            }
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        self.broker.client_id(CLIENT_ID_PREFIX, &self.name)
    }

    /// Measurement of written points.
    pub fn measurement(&self) -> &str {
        self.influxdb
            .as_ref()
            .map(|i| i.measurement.as_str())
            .unwrap_or(&self.measurement)
    }
}

/// `#` only as the whole last level, `+` only as a whole level.
fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}
