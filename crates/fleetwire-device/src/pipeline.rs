// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One device: session, publisher loop and flush coordinator wired to the
//! device's durable queue.
//!
//! ```text
//!  source ──► PublisherLoop ──connected──► TransportSession ──► Broker
//!                 │                              ▲
//!                 └─offline──► DurableQueue ─────┘ FlushCoordinator
//!                                (SQLite)            (drains on Connected)
//! ```
//!
//! Shutdown order: stop the publisher, let the coordinator make its final
//! bounded drain, then disconnect the session.

use fleetwire_core::broker::{Broker, ConnectOptions};
use fleetwire_core::session::{SessionOptions, SessionState, SessionStatsSnapshot, TransportSession};
use fleetwire_core::BackoffConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::flush::{FlushCoordinator, FlushOptions, FlushStats, FlushStatsSnapshot};
use crate::publisher::{PublisherLoop, PublisherStats, PublisherStatsSnapshot};
use crate::queue::{DurableQueue, QueueError, QueueStatsSnapshot};
use crate::registry::QueueRegistry;
use crate::source::TelemetrySource;

/// Device pipeline errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("device task failed: {0}")]
    Join(#[from] JoinError),
}

/// Everything needed to run one device.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub device_id: String,
    pub namespace: String,
    pub publish_interval: Duration,
    pub flush: FlushOptions,
    pub session: SessionOptions,
}

impl DeviceOptions {
    /// Defaults for `device_id`: client id `device_<id>`, namespace
    /// `device/data`, one record per second.
    pub fn new(device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        let client_id = format!("{}{}", crate::config::CLIENT_ID_PREFIX, device_id);
        Self {
            device_id,
            namespace: "device/data".to_string(),
            publish_interval: Duration::from_secs(1),
            flush: FlushOptions::default(),
            session: SessionOptions::new(ConnectOptions::persistent(client_id))
                .with_backoff(BackoffConfig::default()),
        }
    }

    pub fn from_config(config: &DeviceConfig, device_id: &str) -> Self {
        let connect = config.broker.connect_options(config.client_id(device_id));
        Self {
            device_id: device_id.to_string(),
            namespace: config.namespace.clone(),
            publish_interval: config.publish_interval(),
            flush: config.flush_options(),
            session: SessionOptions::new(connect)
                .with_backoff(config.backoff.clone())
                .with_ack_timeout(config.broker.ack_timeout()),
        }
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = interval;
        self
    }

    pub fn with_flush(mut self, flush: FlushOptions) -> Self {
        self.flush = flush;
        self
    }
}

/// Point-in-time view of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStats {
    pub device_id: String,
    pub state: SessionState,
    pub session: SessionStatsSnapshot,
    pub publisher: PublisherStatsSnapshot,
    pub flush: FlushStatsSnapshot,
    pub queue: QueueStatsSnapshot,
    /// Entries waiting in the durable queue.
    pub queue_depth: usize,
}

pub struct DevicePipeline;

impl DevicePipeline {
    /// Restore the device's queue, then spawn its session, publisher and
    /// flush coordinator.
    pub fn start(
        broker: Arc<dyn Broker>,
        registry: &QueueRegistry,
        options: DeviceOptions,
        source: Box<dyn TelemetrySource>,
    ) -> Result<DeviceHandle, DeviceError> {
        let queue = registry.open(&options.device_id)?;
        // Entries left by a previous run go out before anything new
        queue.restore()?;

        let (session, _inbox) = TransportSession::new(broker, options.session.clone());
        let wake = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        let session_cancel = CancellationToken::new();

        let publisher = PublisherLoop::new(
            options.device_id.as_str(),
            &options.namespace,
            options.publish_interval,
            Arc::clone(&session),
            Arc::clone(&queue),
            source,
            Arc::clone(&wake),
        );
        let publisher_stats = publisher.stats();

        let coordinator = FlushCoordinator::new(
            options.device_id.as_str(),
            Arc::clone(&session),
            Arc::clone(&queue),
            wake,
            options.flush,
        );
        let flush_stats = coordinator.stats();

        let session_task = tokio::spawn(Arc::clone(&session).run(session_cancel.clone()));
        let publisher_task = spawn_fatal(publisher.run(stop.clone()), &stop, &session_cancel);
        let flush_task = spawn_fatal(coordinator.run(stop.clone()), &stop, &session_cancel);

        tracing::info!(
            "{}: device started (client id {}, {} queued)",
            options.device_id,
            session.client_id(),
            queue.len()?
        );

        Ok(DeviceHandle {
            device_id: options.device_id,
            session,
            queue,
            publisher_stats,
            flush_stats,
            stop,
            session_cancel,
            publisher_task,
            flush_task,
            session_task,
        })
    }
}

/// A queue failure in either task stops the whole device.
fn spawn_fatal<F>(
    task: F,
    stop: &CancellationToken,
    session_cancel: &CancellationToken,
) -> JoinHandle<Result<(), QueueError>>
where
    F: std::future::Future<Output = Result<(), QueueError>> + Send + 'static,
{
    let stop = stop.clone();
    let session_cancel = session_cancel.clone();
    tokio::spawn(async move {
        let result = task.await;
        if result.is_err() {
            stop.cancel();
            session_cancel.cancel();
        }
        result
    })
}

/// Running device.
pub struct DeviceHandle {
    device_id: String,
    session: Arc<TransportSession>,
    queue: Arc<DurableQueue>,
    publisher_stats: Arc<PublisherStats>,
    flush_stats: Arc<FlushStats>,
    stop: CancellationToken,
    session_cancel: CancellationToken,
    publisher_task: JoinHandle<Result<(), QueueError>>,
    flush_task: JoinHandle<Result<(), QueueError>>,
    session_task: JoinHandle<()>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Resolves once the device has stopped on its own (fatal queue error).
    pub async fn stopped(&self) {
        self.session_cancel.cancelled().await
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            device_id: self.device_id.clone(),
            state: self.session.state(),
            session: self.session.stats(),
            publisher: self.publisher_stats.snapshot(),
            flush: self.flush_stats.snapshot(),
            queue: self.queue.stats(),
            queue_depth: self.queue.len().unwrap_or(0),
        }
    }

    /// Stop the device and wait for every task.
    pub async fn shutdown(self) -> Result<DeviceStats, DeviceError> {
        self.stop.cancel();
        let published = self.publisher_task.await?;
        let flushed = self.flush_task.await?;
        self.session_cancel.cancel();
        self.session_task.await?;

        let stats = DeviceStats {
            device_id: self.device_id.clone(),
            state: self.session.state(),
            session: self.session.stats(),
            publisher: self.publisher_stats.snapshot(),
            flush: self.flush_stats.snapshot(),
            queue: self.queue.stats(),
            queue_depth: self.queue.len()?,
        };
        tracing::info!(
            "{}: device stopped ({} sent live, {} queued, {} drained, {} left)",
            self.device_id,
            stats.publisher.published,
            stats.publisher.queued,
            stats.flush.drained,
            stats.queue_depth
        );

        published?;
        flushed?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwire_core::broker::MemoryBroker;
    use fleetwire_core::record::{FieldValue, TelemetryRecord};
    use std::collections::BTreeMap;

    struct Counter(i64);

    impl TelemetrySource for Counter {
        fn sample(&mut self) -> BTreeMap<String, FieldValue> {
            self.0 += 1;
            BTreeMap::from([("n".to_string(), FieldValue::Integer(self.0))])
        }
    }

    fn sent(broker: &MemoryBroker) -> Vec<i64> {
        broker
            .published()
            .iter()
            .map(|m| match TelemetryRecord::from_payload(&m.payload).unwrap().field("n") {
                Some(FieldValue::Integer(n)) => *n,
                other => panic!("unexpected {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_options_from_config() {
        let config = DeviceConfig::default();
        let options = DeviceOptions::from_config(&config, "vehicle_07");
        assert_eq!(options.session.connect.client_id, "device_vehicle_07");
        assert!(!options.session.connect.clean_session);
        assert_eq!(options.namespace, "device/data");
        assert_eq!(options.session.ack_timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_then_offline_then_drained() {
        let broker = MemoryBroker::new();
        let registry = QueueRegistry::in_memory(100);
        let device = DevicePipeline::start(
            Arc::new(broker.clone()),
            &registry,
            DeviceOptions::new("v1"),
            Box::new(Counter(0)),
        )
        .unwrap();

        // Ticks at t = 0, 1, 2 go out live
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(sent(&broker), vec![1, 2, 3]);

        // Outage across ticks 4, 5, 6
        broker.set_available(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(device.stats().queue_depth, 3);

        broker.set_available(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let order = sent(&broker);
        let mut sorted = order.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(order, sorted, "records out of order: {:?}", order);
        assert_eq!(order.len() as i64, *order.last().unwrap());
        assert_eq!(device.stats().queue_depth, 0);

        let stats = device.shutdown().await.unwrap();
        assert_eq!(stats.state, SessionState::Disconnected);
        assert_eq!(stats.flush.drained, stats.publisher.queued);
        assert!(stats.publisher.queued >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_entries_go_first() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let registry = QueueRegistry::in_memory(100);
        let queue = registry.open("v1").unwrap();
        for n in [-2i64, -1] {
            let fields = BTreeMap::from([("n".to_string(), FieldValue::Integer(n))]);
            queue
                .enqueue("device/data/v1", &TelemetryRecord::new("v1", 1.0, fields))
                .unwrap();
        }

        let device = DevicePipeline::start(
            Arc::new(broker.clone()),
            &registry,
            DeviceOptions::new("v1"),
            Box::new(Counter(0)),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let queued: Vec<i64> = device
            .queue()
            .entries()
            .unwrap()
            .iter()
            .map(|e| match e.record().unwrap().field("n") {
                Some(FieldValue::Integer(n)) => *n,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(queued, vec![-2, -1, 1, 2, 3]);
        assert_eq!(device.queue().stats().restored, 2);

        device.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_offline_keeps_queue() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let registry = QueueRegistry::in_memory(100);
        let device = DevicePipeline::start(
            Arc::new(broker.clone()),
            &registry,
            DeviceOptions::new("v1"),
            Box::new(Counter(0)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        let stats = device.shutdown().await.unwrap();
        assert_eq!(stats.publisher.queued, 5);
        assert_eq!(stats.queue_depth, 5);
        assert_eq!(registry.get("v1").unwrap().len().unwrap(), 5);
    }
}
