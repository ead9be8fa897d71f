// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher loop: one record per cadence tick, sent live or queued.
//!
//! Per tick:
//! 1. sample the telemetry source and stamp the record with the current time
//! 2. if the session is `Connected`, publish and wait for the ack
//! 3. otherwise, or if the publish fails, persist the record in the durable
//!    queue and wake the flush coordinator
//!
//! The only error that stops the loop is a queue storage failure.

use fleetwire_core::record::{self, TelemetryRecord};
use fleetwire_core::session::{PublishError, TransportSession};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::queue::{DurableQueue, QueueError};
use crate::source::TelemetrySource;

/// Publisher counters.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub queued: AtomicU64,
    pub send_failures: AtomicU64,
}

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    pub queued: u64,
    pub send_failures: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}

/// What happened to the record produced by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Acknowledged by the broker.
    Sent,
    /// Persisted in the durable queue under this sequence.
    Queued(u64),
}

pub struct PublisherLoop {
    device_id: String,
    topic: String,
    interval: Duration,
    session: Arc<TransportSession>,
    queue: Arc<DurableQueue>,
    source: Box<dyn TelemetrySource>,
    wake: Arc<Notify>,
    stats: Arc<PublisherStats>,
}

impl PublisherLoop {
    pub fn new(
        device_id: impl Into<String>,
        namespace: &str,
        interval: Duration,
        session: Arc<TransportSession>,
        queue: Arc<DurableQueue>,
        source: Box<dyn TelemetrySource>,
        wake: Arc<Notify>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            topic: record::topic_for(namespace, &device_id),
            device_id,
            interval,
            session,
            queue,
            source,
            wake,
            stats: Arc::new(PublisherStats::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn stats(&self) -> Arc<PublisherStats> {
        Arc::clone(&self.stats)
    }

    /// Produce and deliver (or queue) one record.
    pub async fn tick(&mut self) -> Result<Delivery, QueueError> {
        let record = TelemetryRecord::now(self.device_id.as_str(), self.source.sample());
        let payload = record.to_payload()?;

        match self.session.publish(&self.topic, &payload).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                return Ok(Delivery::Sent);
            }
            Err(PublishError::NotConnected(_)) => {}
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{}: live send failed ({}), queueing", self.device_id, e);
            }
        }

        let sequence = self.queue.enqueue_payload(&self.topic, &payload)?;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.wake.notify_one();
        Ok(Delivery::Queued(sequence))
    }

    /// Tick at the configured cadence until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), QueueError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "{}: publishing to {} every {:?}",
            self.device_id,
            self.topic,
            self.interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick().await {
                tracing::error!("{}: cannot persist record, stopping device: {}", self.device_id, e);
                return Err(e);
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            "{}: publisher stopped ({} sent, {} queued, {} send failures)",
            self.device_id,
            stats.published,
            stats.queued,
            stats.send_failures
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwire_core::broker::{ConnectOptions, MemoryBroker};
    use fleetwire_core::record::FieldValue;
    use fleetwire_core::session::SessionOptions;
    use std::collections::BTreeMap;

    struct Counter(i64);

    impl TelemetrySource for Counter {
        fn sample(&mut self) -> BTreeMap<String, FieldValue> {
            self.0 += 1;
            BTreeMap::from([("n".to_string(), FieldValue::Integer(self.0))])
        }
    }

    fn publisher(broker: &MemoryBroker) -> (PublisherLoop, Arc<TransportSession>, Arc<DurableQueue>) {
        let (session, _inbox) = TransportSession::new(
            Arc::new(broker.clone()),
            SessionOptions::new(ConnectOptions::persistent("device_v1")),
        );
        let queue = Arc::new(DurableQueue::open_in_memory("v1", 100).unwrap());
        let publisher = PublisherLoop::new(
            "v1",
            "device/data",
            Duration::from_secs(1),
            Arc::clone(&session),
            Arc::clone(&queue),
            Box::new(Counter(0)),
            Arc::new(Notify::new()),
        );
        (publisher, session, queue)
    }

    #[tokio::test]
    async fn test_queues_when_disconnected() {
        let broker = MemoryBroker::new();
        let (mut publisher, _session, queue) = publisher(&broker);
        assert_eq!(publisher.topic(), "device/data/v1");

        assert!(matches!(publisher.tick().await.unwrap(), Delivery::Queued(_)));
        assert!(matches!(publisher.tick().await.unwrap(), Delivery::Queued(_)));
        assert_eq!(queue.len().unwrap(), 2);
        assert!(broker.published().is_empty());

        let stats = publisher.stats().snapshot();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.send_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_live_when_connected() {
        let broker = MemoryBroker::new();
        let (mut publisher, session, queue) = publisher(&broker);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&session).run(cancel.clone()));
        assert!(session.wait_connected(&cancel).await);

        assert_eq!(publisher.tick().await.unwrap(), Delivery::Sent);
        assert!(queue.is_empty().unwrap());
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "device/data/v1");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_falls_back_to_queue() {
        let broker = MemoryBroker::new();
        let (mut publisher, session, queue) = publisher(&broker);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&session).run(cancel.clone()));
        assert!(session.wait_connected(&cancel).await);

        broker.fail_next_publishes(1);
        assert!(matches!(publisher.tick().await.unwrap(), Delivery::Queued(_)));
        assert_eq!(queue.len().unwrap(), 1);
        assert_eq!(publisher.stats().snapshot().send_failures, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_at_cadence() {
        let broker = MemoryBroker::new();
        let (publisher, _session, queue) = publisher(&broker);
        let stats = publisher.stats();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(publisher.run(cancel.clone()));

        // Ticks at t = 0, 1, 2, 3
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stats.snapshot().queued, 4);
        assert_eq!(queue.len().unwrap(), 4);
    }
}
