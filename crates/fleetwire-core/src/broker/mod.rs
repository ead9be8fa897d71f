// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe broker abstraction.
//!
//! A [`Broker`] opens a [`BrokerLink`] for one client identity. The link
//! publishes with at-least-once acknowledgement, subscribes with `+` / `#`
//! wildcard filters, pushes inbound messages into the inbox channel handed
//! to `connect`, and resolves [`BrokerLink::closed`] once the connection is
//! gone.
//!
//! Implementations:
//! - [`memory::MemoryBroker`]: in-process broker with persistent sessions
//!   and fault injection
//! - [`mqtt::MqttBroker`]: MQTT 3.1.1 over TCP (optionally TLS)

pub mod memory;
pub mod mqtt;

pub use memory::MemoryBroker;
pub use mqtt::MqttBroker;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A message as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Client identity and session options for a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    /// `false` asks the broker to keep subscriptions and undelivered
    /// messages across reconnects.
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectOptions {
    /// Persistent session with no credentials.
    pub fn persistent(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: false,
            keep_alive_secs: 60,
            username: None,
            password: None,
        }
    }
}

/// Transport-level failures. All variants are transient from the
/// session's point of view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        BrokerError::Io(e.to_string())
    }
}

/// Something that can open links to a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a link. Inbound messages for this client are sent to `inbox`.
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbox: mpsc::Sender<Message>,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError>;
}

/// One live connection.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Publish and wait for the broker's acknowledgement.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Subscribe to a topic filter and wait for the broker to confirm.
    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError>;

    /// Resolves with the reason once the link is down.
    async fn closed(&self) -> BrokerError;

    /// Close the link gracefully.
    async fn disconnect(&self);
}

/// Close signal shared between a link and its background tasks.
#[derive(Debug, Clone)]
pub(crate) struct LinkStatus {
    tx: Arc<watch::Sender<Option<BrokerError>>>,
}

impl LinkStatus {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the link closed. The first reason wins.
    pub(crate) fn close(&self, reason: BrokerError) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn error(&self) -> Option<BrokerError> {
        self.tx.borrow().clone()
    }

    pub(crate) async fn closed(&self) -> BrokerError {
        let mut rx = self.tx.subscribe();
        let reason = rx.wait_for(|s| s.is_some()).await.map(|s| (*s).clone());
        match reason {
            Ok(Some(e)) => e,
            _ => BrokerError::ConnectionLost("link dropped".to_string()),
        }
    }
}

/// MQTT-style topic filter match (`+` one level, `#` trailing levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(fl), Some(tl)) if fl == tl => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
