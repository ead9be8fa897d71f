// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport session: one logical broker connection with automatic recovery.
//!
//! # State machine
//!
//! ```text
//!                 start / backoff expiry
//!  Disconnected ─────────────────────────► Connecting ──handshake ok──► Connected
//!        ▲                                   │    ▲                         │
//!        │ cancel                      error │    │ delay elapsed           │ link lost
//!        │                                   ▼    │                         │
//!        └──────────────────────────────── Backoff ◄────────────────────────┘
//! ```
//!
//! The state lives in a `watch` channel: [`TransportSession::run`] is the
//! only writer, publishers and flush coordinators read it.
//!
//! Subscriptions listed in [`SessionOptions`] are issued while `Connecting`,
//! so `Connected` always means the inbox is fed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::broker::{Broker, BrokerError, BrokerLink, ConnectOptions, Message};
use crate::config::BackoffConfig;

const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Connection state of a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Backoff => "backoff",
        };
        f.write_str(name)
    }
}

/// Why a publish through the session did not complete.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("session not connected (state: {0})")]
    NotConnected(SessionState),

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect: ConnectOptions,
    pub backoff: BackoffConfig,
    pub ack_timeout: Duration,
    /// Filters re-subscribed after every successful connect.
    pub subscriptions: Vec<String>,
    pub inbox_capacity: usize,
}

impl SessionOptions {
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            backoff: BackoffConfig::default(),
            ack_timeout: Duration::from_secs(10),
            subscriptions: Vec::new(),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn subscribe(mut self, filter: impl Into<String>) -> Self {
        self.subscriptions.push(filter.into());
        self
    }
}

#[derive(Debug, Default)]
struct SessionStats {
    connects: AtomicU64,
    connect_failures: AtomicU64,
    disconnects: AtomicU64,
    publishes: AtomicU64,
    publish_failures: AtomicU64,
}

/// Point-in-time session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub connects: u64,
    pub connect_failures: u64,
    pub disconnects: u64,
    pub publishes: u64,
    pub publish_failures: u64,
}

/// Reconnecting broker session.
pub struct TransportSession {
    broker: Arc<dyn Broker>,
    options: SessionOptions,
    state_tx: watch::Sender<SessionState>,
    link: RwLock<Option<Arc<dyn BrokerLink>>>,
    inbox: mpsc::Sender<Message>,
    stats: SessionStats,
}

impl TransportSession {
    /// Create a session in `Disconnected`. Inbound messages arrive on the
    /// returned receiver once [`run`](Self::run) is driving the session.
    pub fn new(
        broker: Arc<dyn Broker>,
        options: SessionOptions,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (inbox, inbox_rx) = mpsc::channel(options.inbox_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let session = Arc::new(Self {
            broker,
            options,
            state_tx,
            link: RwLock::new(None),
            inbox,
            stats: SessionStats::default(),
        });
        (session, inbox_rx)
    }

    pub fn client_id(&self) -> &str {
        &self.options.connect.client_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Receiver for state-change notifications.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the session reaches `wanted`. Returns false if cancelled first.
    pub async fn wait_for_state(&self, wanted: SessionState, cancel: &CancellationToken) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| *s == wanted) => res.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }

    pub async fn wait_connected(&self, cancel: &CancellationToken) -> bool {
        self.wait_for_state(SessionState::Connected, cancel).await
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            connects: self.stats.connects.load(Ordering::Relaxed),
            connect_failures: self.stats.connect_failures.load(Ordering::Relaxed),
            disconnects: self.stats.disconnects.load(Ordering::Relaxed),
            publishes: self.stats.publishes.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
        }
    }

    /// Publish with at-least-once acknowledgement.
    ///
    /// Fails immediately with [`PublishError::NotConnected`] unless the
    /// session is `Connected`; the caller is expected to queue the record.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let state = self.state();
        let link = match (state, self.current_link()) {
            (SessionState::Connected, Some(link)) => link,
            _ => return Err(PublishError::NotConnected(state)),
        };

        let result = match tokio::time::timeout(self.options.ack_timeout, link.publish(topic, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Broker(e)),
            Err(_) => Err(PublishError::Timeout(self.options.ack_timeout)),
        };

        match &result {
            Ok(()) => {
                self.stats.publishes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{}: publish to {} failed: {}", self.client_id(), topic, e);
            }
        }
        result
    }

    /// Drive the state machine until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut backoff = Backoff::from_config(&self.options.backoff);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(SessionState::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.establish() => attempt,
            };

            let delay = match attempt {
                Ok(link) => {
                    backoff.reset();
                    self.stats.connects.fetch_add(1, Ordering::Relaxed);
                    self.set_link(Some(Arc::clone(&link)));
                    self.set_state(SessionState::Connected);
                    tracing::info!("{}: connected", self.client_id());

                    let reason = tokio::select! {
                        _ = cancel.cancelled() => break,
                        reason = link.closed() => reason,
                    };

                    self.set_link(None);
                    self.stats.disconnects.fetch_add(1, Ordering::Relaxed);
                    self.set_state(SessionState::Backoff);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{}: connection lost ({}), reconnecting in {:?}",
                        self.client_id(),
                        reason,
                        delay
                    );
                    delay
                }
                Err(e) => {
                    self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                    self.set_state(SessionState::Backoff);
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "{}: connect failed ({}), retrying in {:?}",
                        self.client_id(),
                        e,
                        delay
                    );
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if let Some(link) = self.take_link() {
            link.disconnect().await;
        }
        self.set_state(SessionState::Disconnected);
        tracing::info!("{}: session stopped", self.client_id());
    }

    async fn establish(&self) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let link = self
            .broker
            .connect(&self.options.connect, self.inbox.clone())
            .await?;
        for filter in &self.options.subscriptions {
            if let Err(e) = link.subscribe(filter).await {
                link.disconnect().await;
                return Err(e);
            }
            tracing::debug!("{}: subscribed to {}", self.client_id(), filter);
        }
        Ok(link)
    }

    fn set_state(&self, next: SessionState) {
        let client_id = self.client_id();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!("{}: session {} -> {}", client_id, current, next);
            *current = next;
            true
        });
    }

    fn current_link(&self) -> Option<Arc<dyn BrokerLink>> {
        match self.link.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_link(&self, link: Option<Arc<dyn BrokerLink>>) {
        match self.link.write() {
            Ok(mut guard) => *guard = link,
            Err(poisoned) => *poisoned.into_inner() = link,
        }
    }

    fn take_link(&self) -> Option<Arc<dyn BrokerLink>> {
        match self.link.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}
