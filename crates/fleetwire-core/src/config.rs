// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker and backoff configuration shared by the device and collector.
//!
//! Both binaries embed these blocks in their own YAML files:
//!
//! ```yaml
//! broker:
//!   host: broker.local
//!   port: 8883
//!   username: fleet
//!   password: secret
//!   tls:
//!     ca_cert: /etc/fleetwire/ca.pem
//! backoff:
//!   min_secs: 1
//!   max_secs: 120
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::broker::ConnectOptions;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Parse a YAML document into any config type.
pub fn from_yaml<T: DeserializeOwned>(yaml: &str) -> Result<T, ConfigError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Read and parse a YAML file.
pub fn from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_yaml(&content)
}

/// TLS material for the broker connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle of trusted CAs. Falls back to the Mozilla root set when absent.
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Skip server certificate verification (testing only).
    pub insecure: bool,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
    /// Prefix for the client identity. Each binary has its own default.
    pub client_id_prefix: Option<String>,
    /// Keep-alive interval in seconds (0 disables pings).
    pub keep_alive_secs: u16,
    /// How long a publish may wait for its acknowledgement.
    pub ack_timeout_ms: u64,
    /// TCP connect plus CONNACK deadline.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            tls: None,
            client_id_prefix: None,
            keep_alive_secs: 60,
            ack_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Client identity for `name`, using `default_prefix` unless the
    /// config overrides it.
    pub fn client_id(&self, default_prefix: &str, name: &str) -> String {
        let prefix = self.client_id_prefix.as_deref().unwrap_or(default_prefix);
        format!("{}{}", prefix, name)
    }

    /// Connect options for a persistent session under `client_id`.
    pub fn connect_options(&self, client_id: impl Into<String>) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.into(),
            clean_session: false,
            keep_alive_secs: self.keep_alive_secs,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("broker.port must be non-zero".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.ack_timeout_ms must be non-zero".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.connect_timeout_ms must be non-zero".into(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::Invalid(
                "broker.password requires broker.username".into(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err(ConfigError::Invalid(
                    "broker.tls.client_cert and client_key must be set together".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Reconnect backoff bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_secs: 1,
            max_secs: 120,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_secs == 0 {
            return Err(ConfigError::Invalid("backoff.min_secs must be >= 1".into()));
        }
        if self.max_secs < self.min_secs {
            return Err(ConfigError::Invalid(format!(
                "backoff.max_secs ({}) is below backoff.min_secs ({})",
                self.max_secs, self.min_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_block() {
        let broker: BrokerConfig = from_yaml("{}").unwrap();
        assert_eq!(broker, BrokerConfig::default());
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.ack_timeout(), Duration::from_secs(10));
        assert_eq!(broker.connect_timeout(), Duration::from_secs(10));

        let backoff: BackoffConfig = from_yaml("{}").unwrap();
        assert_eq!(backoff.min_secs, 1);
        assert_eq!(backoff.max_secs, 120);
    }

    #[test]
    fn test_partial_override() {
        let yaml = r#"
host: broker.local
port: 8883
tls:
  ca_cert: /etc/fleetwire/ca.pem
"#;
        let broker: BrokerConfig = from_yaml(yaml).unwrap();
        assert_eq!(broker.host, "broker.local");
        assert_eq!(broker.port, 8883);
        assert_eq!(broker.keep_alive_secs, 60);
        let tls = broker.tls.unwrap();
        assert_eq!(tls.ca_cert, Some(PathBuf::from("/etc/fleetwire/ca.pem")));
        assert!(!tls.insecure);
    }

    #[test]
    fn test_connect_options_persistent() {
        let broker = BrokerConfig {
            username: Some("fleet".into()),
            password: Some("pw".into()),
            ..Default::default()
        };
        assert_eq!(broker.client_id("device_", "vehicle_01"), "device_vehicle_01");
        let opts = broker.connect_options("device_vehicle_01");
        assert_eq!(opts.client_id, "device_vehicle_01");
        assert!(!opts.clean_session);
        assert_eq!(opts.username.as_deref(), Some("fleet"));

        let prefixed = BrokerConfig {
            client_id_prefix: Some("site1_".into()),
            ..Default::default()
        };
        assert_eq!(prefixed.client_id("device_", "vehicle_01"), "site1_vehicle_01");
    }

    #[test]
    fn test_validation() {
        assert!(BrokerConfig::default().validate().is_ok());
        let bad = BrokerConfig {
            password: Some("pw".into()),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::Invalid(_))));

        let no_timeout = BrokerConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert!(no_timeout.validate().is_err());

        let bad_tls = BrokerConfig {
            tls: Some(TlsConfig {
                client_cert: Some("cert.pem".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(bad_tls.validate().is_err());

        let backoff = BackoffConfig {
            min_secs: 10,
            max_secs: 5,
        };
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = from_file::<BrokerConfig>("/nonexistent/fleetwire.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
