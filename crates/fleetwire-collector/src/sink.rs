// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sink abstraction: where batches of points end up.
//!
//! - [`MemorySink`]: keeps points in memory, stamps a write time, can be
//!   told to fail the next N writes
//! - [`DryRunSink`]: renders line protocol to the log and discards it
//! - [`crate::influx::InfluxSink`]: InfluxDB v2 HTTP write API

use async_trait::async_trait;
use fleetwire_core::clock;
use fleetwire_core::record::FieldValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

/// One time-series point.
///
/// `timestamp_ns` is left empty by the collector so the sink assigns the
/// write time.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: Option<u64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(FieldValue::as_f64)
    }
}

/// Sink write errors. All of them are retried by the batch writer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("sink returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("sink configuration error: {0}")]
    Config(String),
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Write one batch. Either every point is stored or the call fails.
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;

    fn name(&self) -> &str;
}

/// A point as stored by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenPoint {
    pub point: Point,
    /// Epoch seconds at which the sink accepted the batch.
    pub write_time: f64,
}

#[derive(Debug, Default)]
struct MemoryInner {
    points: Vec<WrittenPoint>,
    batch_sizes: Vec<usize>,
    attempts: u64,
    fail_next: u32,
}

/// In-memory sink with fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next `n` write calls.
    pub fn fail_next(&self, n: u32) {
        self.lock().fail_next = n;
    }

    pub fn points(&self) -> Vec<WrittenPoint> {
        self.lock().points.clone()
    }

    /// Size of every successful write, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Write calls, successful or not.
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let mut inner = self.lock();
        inner.attempts += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SinkError::Rejected("injected failure".into()));
        }
        let write_time = clock::epoch_secs();
        inner.points.extend(points.iter().cloned().map(|point| WrittenPoint { point, write_time }));
        inner.batch_sizes.push(points.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Logs line protocol, stamped with the write time, instead of writing it.
#[derive(Debug, Default)]
pub struct DryRunSink {
    points: AtomicU64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> u64 {
        self.points.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Sink for DryRunSink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let now_ns = clock::secs_to_nanos(clock::epoch_secs());
        for point in points {
            let mut stamped = point.clone();
            stamped.timestamp_ns = point.timestamp_ns.or(Some(now_ns));
            tracing::debug!("[dry-run] {}", crate::influx::to_line(&stamped));
        }
        self.points.fetch_add(points.len() as u64, Ordering::Relaxed);
        tracing::info!("[dry-run] batch of {} points", points.len());
        Ok(())
    }

    fn name(&self) -> &str {
        "dry-run"
    }
}
