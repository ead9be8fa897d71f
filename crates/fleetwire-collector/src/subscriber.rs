// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ingestion subscriber: decodes inbound messages and hands them to the
//! batch writer.
//!
//! The receive time is stamped before decoding. Malformed payloads are
//! logged and dropped; they never reach the writer.

use fleetwire_core::broker::Message;
use fleetwire_core::clock;
use fleetwire_core::record::{device_from_topic, TelemetryRecord};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::ReceivedRecord;
use crate::latency::LatencyTracker;
use crate::writer::BatchWriter;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub malformed: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestionSubscriber {
    writer: Arc<BatchWriter>,
    latency: Arc<LatencyTracker>,
    stats: Arc<IngestStats>,
}

impl IngestionSubscriber {
    pub fn new(writer: Arc<BatchWriter>, latency: Arc<LatencyTracker>) -> Self {
        Self {
            writer,
            latency,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Handle one message received now.
    pub fn handle(&self, message: &Message) {
        self.handle_at(message, clock::epoch_secs());
    }

    /// Handle one message received at `receive_time` (epoch seconds).
    pub fn handle_at(&self, message: &Message, receive_time: f64) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let record = match TelemetryRecord::from_payload(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "dropping malformed payload on {} ({} bytes): {}",
                    message.topic,
                    message.payload.len(),
                    e
                );
                return;
            }
        };

        if let Some(from_topic) = device_from_topic(&message.topic) {
            if from_topic != record.device_id() {
                tracing::debug!(
                    "topic {} carries a record for device {}",
                    message.topic,
                    record.device_id()
                );
            }
        }

        let received = ReceivedRecord::new(record, receive_time);
        self.latency.record(received.transit());
        self.writer.push(received);
    }

    /// Consume the session inbox until cancelled, then drain what is
    /// already buffered.
    pub async fn run(self, mut inbox: mpsc::Receiver<Message>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => self.handle(&message),
                    None => break,
                },
            }
        }

        let mut drained = 0;
        while let Ok(message) = inbox.try_recv() {
            self.handle(&message);
            drained += 1;
        }
        let stats = self.stats.snapshot();
        tracing::info!(
            "ingestion stopped ({} received, {} malformed, {} drained at shutdown)",
            stats.received,
            stats.malformed,
            drained
        );
    }
}
