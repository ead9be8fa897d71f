// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Collector service: subscribing session, ingestion and batch writer.
//!
//! ```text
//!  Broker ──► TransportSession ──inbox──► IngestionSubscriber ──► BatchWriter ──► Sink
//!             (subscribed on connect)     (stamp, decode, latency)   (size / time)
//! ```
//!
//! Shutdown order: disconnect the session, drain the inbox into the writer,
//! then let the writer make its final flush.

use fleetwire_core::broker::Broker;
use fleetwire_core::session::{SessionOptions, SessionState, SessionStatsSnapshot, TransportSession};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;
use crate::latency::{LatencySummary, LatencyTracker};
use crate::mapping::PointMapper;
use crate::sink::Sink;
use crate::subscriber::{IngestStats, IngestStatsSnapshot, IngestionSubscriber};
use crate::writer::{BatchOptions, BatchWriter, WriterStatsSnapshot};

/// Point-in-time view of the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorStats {
    pub state: SessionState,
    pub session: SessionStatsSnapshot,
    pub ingest: IngestStatsSnapshot,
    pub writer: WriterStatsSnapshot,
    /// Records waiting for the next flush.
    pub pending: usize,
    pub latency: Option<LatencySummary>,
}

pub struct CollectorService;

impl CollectorService {
    pub fn session_options(config: &CollectorConfig) -> SessionOptions {
        let connect = config.broker.connect_options(config.client_id());
        config.subscriptions.iter().fold(
            SessionOptions::new(connect)
                .with_backoff(config.backoff.clone())
                .with_ack_timeout(config.broker.ack_timeout()),
            |options, filter| options.subscribe(filter.as_str()),
        )
    }

    /// Spawn the session, ingestion and writer tasks.
    pub fn start(
        broker: Arc<dyn Broker>,
        config: &CollectorConfig,
        sink: Arc<dyn Sink>,
    ) -> CollectorHandle {
        let (session, inbox) = TransportSession::new(broker, Self::session_options(config));

        let mapper = PointMapper::new(
            config.measurement(),
            config.collector_tag.as_str(),
            config.tags.clone(),
        );
        let writer = BatchWriter::new(sink, mapper, BatchOptions::from_config(&config.batch));
        let latency = Arc::new(LatencyTracker::new(config.latency_window));
        let subscriber = IngestionSubscriber::new(Arc::clone(&writer), Arc::clone(&latency));
        let ingest_stats = subscriber.stats();

        let session_cancel = CancellationToken::new();
        let ingest_cancel = CancellationToken::new();
        let writer_cancel = CancellationToken::new();

        let session_task = tokio::spawn(Arc::clone(&session).run(session_cancel.clone()));
        let ingest_task = tokio::spawn(subscriber.run(inbox, ingest_cancel.clone()));
        let writer_task = tokio::spawn(Arc::clone(&writer).run(writer_cancel.clone()));

        tracing::info!(
            "collector started (client id {}, subscriptions {:?}, measurement {})",
            session.client_id(),
            config.subscriptions,
            config.measurement()
        );

        CollectorHandle {
            session,
            writer,
            latency,
            ingest_stats,
            session_cancel,
            ingest_cancel,
            writer_cancel,
            session_task,
            ingest_task,
            writer_task,
        }
    }
}

/// Running collector.
pub struct CollectorHandle {
    session: Arc<TransportSession>,
    writer: Arc<BatchWriter>,
    latency: Arc<LatencyTracker>,
    ingest_stats: Arc<IngestStats>,
    session_cancel: CancellationToken,
    ingest_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    session_task: JoinHandle<()>,
    ingest_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl CollectorHandle {
    pub fn session(&self) -> &Arc<TransportSession> {
        &self.session
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            state: self.session.state(),
            session: self.session.stats(),
            ingest: self.ingest_stats.snapshot(),
            writer: self.writer.stats(),
            pending: self.writer.pending(),
            latency: self.latency.summary(),
        }
    }

    /// Stop ingesting, flush what was received and wait for every task.
    pub async fn shutdown(mut self) -> Result<CollectorStats, JoinError> {
        self.session_cancel.cancel();
        (&mut self.session_task).await?;
        self.ingest_cancel.cancel();
        (&mut self.ingest_task).await?;
        self.writer_cancel.cancel();
        (&mut self.writer_task).await?;

        let stats = self.stats();
        tracing::info!(
            "collector stopped ({} received, {} malformed, {} points written, {} dropped)",
            stats.ingest.received,
            stats.ingest.malformed,
            stats.writer.points_written,
            stats.writer.points_dropped
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use fleetwire_core::broker::MemoryBroker;
    use std::time::Duration;

    #[test]
    fn test_session_options() {
        let config = CollectorConfig::default();
        let options = CollectorService::session_options(&config);
        assert_eq!(options.connect.client_id, "collector_fleetwire");
        assert!(!options.connect.clean_session);
        assert_eq!(options.subscriptions, vec!["device/data/+", "vehicle/speed/+"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_injected_records() {
        let broker = MemoryBroker::new();
        let sink = MemorySink::new();
        let mut config = CollectorConfig::default();
        config.batch.size = 2;

        let handle = CollectorService::start(Arc::new(broker.clone()), &config, Arc::new(sink.clone()));
        let cancel = CancellationToken::new();
        assert!(handle.session().wait_connected(&cancel).await);

        for n in 1..=3 {
            let payload = format!(r#"{{"device_id":"v1","timestamp":{}.0,"n":{}}}"#, n, n);
            broker.inject("device/data/v1", payload);
        }
        broker.inject("vehicle/speed/v1", r#"{"device_id":"v1","timestamp":4.0,"speed":12.5}"#);
        broker.inject("other/topic", r#"{"device_id":"v1","timestamp":5.0}"#);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.batch_sizes(), vec![2]);

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![2, 2]);
        assert_eq!(stats.ingest.received, 4);
        assert_eq!(stats.writer.points_written, 4);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.state, SessionState::Disconnected);
    }
}
