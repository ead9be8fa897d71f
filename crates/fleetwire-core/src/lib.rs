// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetwire core
//!
//! Shared building blocks for the device and collector sides of fleetwire.
//!
//! This crate provides:
//! - The `TelemetryRecord` data model and its JSON wire schema
//! - A broker abstraction (`Broker` / `BrokerLink`) with an in-process
//!   implementation and a built-in MQTT 3.1.1 client
//! - The reconnecting `TransportSession` state machine with capped
//!   exponential backoff
//!
//! # Overview
//!
//! ```text
//! TransportSession --connect--> Broker --> BrokerLink (publish / subscribe / closed)
//!        |
//!        +-- watch<SessionState>  (Disconnected | Connecting | Connected | Backoff)
//! ```

pub mod backoff;
pub mod broker;
pub mod clock;
pub mod config;
pub mod record;
pub mod session;

pub use backoff::Backoff;
pub use broker::{Broker, BrokerError, BrokerLink, ConnectOptions, MemoryBroker, Message, MqttBroker};
pub use config::{BackoffConfig, BrokerConfig, ConfigError, TlsConfig};
pub use record::{FieldValue, PayloadError, TelemetryRecord};
pub use session::{PublishError, SessionOptions, SessionState, SessionStatsSnapshot, TransportSession};
