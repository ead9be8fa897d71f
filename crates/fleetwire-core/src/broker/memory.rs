// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process broker.
//!
//! Behaves like an MQTT broker with QoS 1 and persistent sessions:
//! subscriptions and undelivered messages of a `clean_session = false`
//! client survive its disconnects and are replayed when it comes back.
//!
//! Fault injection for tests and `--mock` runs:
//! - [`MemoryBroker::set_available`] refuses connects and drops every link
//! - [`MemoryBroker::sever`] drops one client's link
//! - [`MemoryBroker::fail_next_publishes`] fails publishes and drops the
//!   publishing link, like a connection lost before the ack

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{topic_matches, Broker, BrokerError, BrokerLink, ConnectOptions, LinkStatus, Message};

#[derive(Debug)]
struct OnlineLink {
    id: u64,
    inbox: mpsc::Sender<Message>,
    status: LinkStatus,
}

#[derive(Debug, Default)]
struct ClientSession {
    subscriptions: Vec<String>,
    persistent: bool,
    pending: VecDeque<Message>,
    online: Option<OnlineLink>,
}

impl ClientSession {
    fn wants(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|f| topic_matches(f, topic))
    }

    /// Push queued messages into the live inbox until it is full.
    fn deliver_pending(&mut self) {
        let Some(online) = &self.online else {
            return;
        };
        while let Some(msg) = self.pending.pop_front() {
            if let Err(e) = online.inbox.try_send(msg) {
                let msg = match e {
                    mpsc::error::TrySendError::Full(m) | mpsc::error::TrySendError::Closed(m) => m,
                };
                self.pending.push_front(msg);
                break;
            }
        }
    }
}

#[derive(Debug)]
struct BrokerState {
    available: bool,
    sessions: HashMap<String, ClientSession>,
    published: Vec<Message>,
    connect_attempts: u64,
    fail_publishes: u32,
    next_link_id: u64,
}

impl BrokerState {
    fn route(&mut self, msg: &Message) {
        self.published.push(msg.clone());
        for session in self.sessions.values_mut() {
            if !session.wants(&msg.topic) {
                continue;
            }
            session.pending.push_back(msg.clone());
            session.deliver_pending();
        }
    }

    fn drop_link(&mut self, client_id: &str, link_id: Option<u64>, reason: BrokerError) -> bool {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return false;
        };
        let matches = match (&session.online, link_id) {
            (Some(online), Some(id)) => online.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        if let Some(online) = session.online.take() {
            online.status.close(reason);
        }
        if !session.persistent {
            self.sessions.remove(client_id);
        }
        true
    }
}

/// Cloneable handle to an in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                sessions: HashMap::new(),
                published: Vec::new(),
                connect_attempts: 0,
                fail_publishes: 0,
                next_link_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Take the broker down (dropping every link) or bring it back.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            let clients: Vec<String> = state.sessions.keys().cloned().collect();
            for client in clients {
                state.drop_link(
                    &client,
                    None,
                    BrokerError::ConnectionLost("broker unavailable".to_string()),
                );
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Drop the current link of `client_id`. Returns false if it was offline.
    pub fn sever(&self, client_id: &str) -> bool {
        self.lock().drop_link(
            client_id,
            None,
            BrokerError::ConnectionLost("link severed".to_string()),
        )
    }

    /// Fail the next `n` publishes (from any client) and drop their links.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().fail_publishes = n;
    }

    /// Publish from outside any session.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let msg = Message::new(topic, payload);
        self.lock().route(&msg);
    }

    /// Every acknowledged publish, in broker order.
    pub fn published(&self) -> Vec<Message> {
        self.lock().published.clone()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    pub fn is_online(&self, client_id: &str) -> bool {
        self.lock()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.online.is_some())
    }

    /// Messages retained for an offline (or backed-up) client.
    pub fn pending_for(&self, client_id: &str) -> usize {
        self.lock()
            .sessions
            .get(client_id)
            .map_or(0, |s| s.pending.len())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbox: mpsc::Sender<Message>,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.available {
            return Err(BrokerError::Refused("server unavailable".to_string()));
        }
        if options.client_id.is_empty() {
            return Err(BrokerError::Refused("invalid client identifier".to_string()));
        }

        let link_id = state.next_link_id;
        state.next_link_id += 1;

        let session = state.sessions.entry(options.client_id.clone()).or_default();
        if let Some(previous) = session.online.take() {
            previous
                .status
                .close(BrokerError::ConnectionLost("session taken over".to_string()));
        }
        if options.clean_session {
            session.subscriptions.clear();
            session.pending.clear();
        }
        session.persistent = !options.clean_session;

        let status = LinkStatus::new();
        session.online = Some(OnlineLink {
            id: link_id,
            inbox,
            status: status.clone(),
        });
        session.deliver_pending();

        tracing::debug!(
            "memory broker: {} connected (link {}, persistent={})",
            options.client_id,
            link_id,
            session.persistent
        );

        Ok(Arc::new(MemoryLink {
            broker: self.clone(),
            client_id: options.client_id.clone(),
            link_id,
            status,
        }))
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    client_id: String,
    link_id: u64,
    status: LinkStatus,
}

impl MemoryLink {
    fn check_open(&self) -> Result<(), BrokerError> {
        match self.status.error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.lock();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            let reason = BrokerError::ConnectionLost("publish not acknowledged".to_string());
            state.drop_link(&self.client_id, Some(self.link_id), reason.clone());
            return Err(reason);
        }
        state.route(&Message::new(topic, payload));
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.lock();
        let session = state
            .sessions
            .get_mut(&self.client_id)
            .ok_or_else(|| BrokerError::ConnectionLost("session gone".to_string()))?;
        if !session.subscriptions.iter().any(|f| f == filter) {
            session.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    async fn closed(&self) -> BrokerError {
        self.status.closed().await
    }

    async fn disconnect(&self) {
        self.broker.lock().drop_link(
            &self.client_id,
            Some(self.link_id),
            BrokerError::ConnectionLost("disconnected by client".to_string()),
        );
        self.status
            .close(BrokerError::ConnectionLost("disconnected by client".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_to_subscriber() {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let sub = broker
            .connect(&ConnectOptions::persistent("collector"), tx)
            .await
            .unwrap();
        sub.subscribe("device/data/+").await.unwrap();

        let (ptx, _prx) = mpsc::channel(16);
        let publ = broker
            .connect(&ConnectOptions::persistent("device_a"), ptx)
            .await
            .unwrap();
        publ.publish("device/data/a", b"{}").await.unwrap();
        publ.publish("other/topic", b"{}").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "device/data/a");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_session_retains_while_offline() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(16);
        let link = broker
            .connect(&ConnectOptions::persistent("collector"), tx)
            .await
            .unwrap();
        link.subscribe("device/data/+").await.unwrap();
        link.disconnect().await;
        assert!(!broker.is_online("collector"));

        broker.inject("device/data/a", b"1".to_vec());
        broker.inject("device/data/b", b"2".to_vec());
        assert_eq!(broker.pending_for("collector"), 2);

        let (tx, mut rx) = mpsc::channel(16);
        let _link = broker
            .connect(&ConnectOptions::persistent("collector"), tx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"1");
        assert_eq!(rx.recv().await.unwrap().payload, b"2");
        assert_eq!(broker.pending_for("collector"), 0);
    }

    #[tokio::test]
    async fn test_clean_session_forgets() {
        let broker = MemoryBroker::new();
        let mut opts = ConnectOptions::persistent("c");
        opts.clean_session = true;
        let (tx, _rx) = mpsc::channel(4);
        let link = broker.connect(&opts, tx).await.unwrap();
        link.subscribe("t").await.unwrap();
        link.disconnect().await;
        broker.inject("t", b"x".to_vec());
        assert_eq!(broker.pending_for("c"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_refuses_and_drops() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(4);
        let link = broker
            .connect(&ConnectOptions::persistent("d"), tx)
            .await
            .unwrap();

        broker.set_available(false);
        assert!(matches!(link.closed().await, BrokerError::ConnectionLost(_)));
        assert!(link.publish("t", b"x").await.is_err());

        let (tx, _rx) = mpsc::channel(4);
        let err = broker
            .connect(&ConnectOptions::persistent("d"), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrokerError::Refused(_)));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_failed_publish_drops_link() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(4);
        let link = broker
            .connect(&ConnectOptions::persistent("d"), tx)
            .await
            .unwrap();
        broker.fail_next_publishes(1);
        assert!(link.publish("t", b"x").await.is_err());
        assert!(!broker.is_online("d"));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_takeover_closes_previous_link() {
        let broker = MemoryBroker::new();
        let (tx, _rx) = mpsc::channel(4);
        let first = broker
            .connect(&ConnectOptions::persistent("d"), tx)
            .await
            .unwrap();
        let (tx, _rx2) = mpsc::channel(4);
        let second = broker
            .connect(&ConnectOptions::persistent("d"), tx)
            .await
            .unwrap();
        assert!(matches!(first.closed().await, BrokerError::ConnectionLost(_)));
        // The stale link must not tear down the new one
        first.disconnect().await;
        assert!(broker.is_online("d"));
        second.publish("t", b"x").await.unwrap();
    }
}
