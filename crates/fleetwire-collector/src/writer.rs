// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch Writer: size-or-time flushing with fixed-delay retries.
//!
//! ```text
//! push() ──► Mutex<Batch> ──notify──► flush task
//!                                      │ sleep until full or oldest + flush_interval
//!                                      │ take() under the lock, write outside it
//!                                      ▼
//!                                   Sink::write ──fail──► sleep(retry_delay), retry
//!                                                         (max_retries, then drop)
//! ```
//!
//! The flush task sleeps exactly until the oldest record's deadline, so an
//! idle sink never delays a time-triggered flush. Failed batches are not
//! persisted: after the last retry they are dropped, counted and logged.
//! While a write is retried at most `max_pending` records wait; beyond that
//! the oldest are dropped and counted the same way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Batch, ReceivedRecord};
use crate::config::BatchConfig;
use crate::mapping::PointMapper;
use crate::sink::Sink;

/// Batch Writer thresholds and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_pending: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl BatchOptions {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            size: config.size,
            flush_interval: config.flush_interval(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            max_pending: config.max_pending,
        }
    }
}

/// Writer counters.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub batches_written: AtomicU64,
    pub batches_failed: AtomicU64,
    pub points_written: AtomicU64,
    pub points_dropped: AtomicU64,
    pub retries: AtomicU64,
}

/// Point-in-time writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStatsSnapshot {
    pub batches_written: u64,
    pub batches_failed: u64,
    pub points_written: u64,
    pub points_dropped: u64,
    pub retries: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

pub struct BatchWriter {
    batch: Mutex<Batch>,
    wake: Notify,
    sink: Arc<dyn Sink>,
    mapper: PointMapper,
    options: BatchOptions,
    stats: WriterStats,
    /// Records evicted since the last flush, for the overflow warning.
    evicted: AtomicU64,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn Sink>, mapper: PointMapper, options: BatchOptions) -> Arc<Self> {
        Arc::new(Self {
            batch: Mutex::new(Batch::new(
                options.size,
                options.max_pending,
                options.flush_interval,
            )),
            wake: Notify::new(),
            sink,
            mapper,
            options,
            stats: WriterStats::default(),
            evicted: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Batch> {
        match self.batch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Records waiting for a flush.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Append a received record. Never blocks on the sink.
    pub fn push(&self, record: ReceivedRecord) {
        let (len, max, evicted) = {
            let mut batch = self.lock();
            let evicted = batch.push(record).is_some();
            (batch.len(), batch.max_size(), evicted)
        };
        if evicted {
            self.stats.points_dropped.fetch_add(1, Ordering::Relaxed);
            if self.evicted.fetch_add(1, Ordering::Relaxed) == 0 {
                tracing::warn!(
                    "{} records pending while {} is behind, dropping the oldest",
                    self.options.max_pending.max(self.options.size),
                    self.sink.name()
                );
            }
        }
        // First record arms the deadline; a full batch flushes now
        if len == 1 || len >= max {
            self.wake.notify_one();
        }
    }

    fn report_evicted(&self) {
        let evicted = self.evicted.swap(0, Ordering::Relaxed);
        if evicted > 0 {
            tracing::warn!(
                "dropped {} pending records (limit {})",
                evicted,
                self.options.max_pending.max(self.options.size)
            );
        }
    }

    /// Flush on size or time until cancelled, then flush what is left.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            "batch writer started (sink {}, measurement {}, size {}, interval {:?}, max pending {}, {} retries every {:?})",
            self.sink.name(),
            self.mapper.measurement(),
            self.options.size,
            self.options.flush_interval,
            self.options.max_pending,
            self.options.max_retries,
            self.options.retry_delay
        );

        loop {
            let (due, deadline) = {
                let batch = self.lock();
                (batch.is_due(tokio::time::Instant::now()), batch.deadline())
            };

            if !due {
                let sleep = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.wake.notified() => continue,
                    _ = sleep => {}
                }
            }

            let records = self.lock().take();
            self.report_evicted();
            if records.is_empty() {
                continue;
            }
            self.write_with_retry(records, &cancel).await;
        }
        self.report_evicted();

        // Shutdown: one attempt per remaining chunk
        loop {
            let records = self.lock().take();
            if records.is_empty() {
                break;
            }
            tracing::info!("final flush of {} records", records.len());
            self.write_with_retry(records, &cancel).await;
        }

        let stats = self.stats();
        tracing::info!(
            "batch writer stopped ({} points in {} batches, {} batches dropped)",
            stats.points_written,
            stats.batches_written,
            stats.batches_failed
        );
    }

    /// Write one batch, retrying with a fixed delay. Once cancelled, the
    /// current attempt completes but no further retry is made.
    async fn write_with_retry(&self, records: Vec<ReceivedRecord>, cancel: &CancellationToken) {
        let points = self.mapper.map_all(&records);
        let attempts = self.options.max_retries + 1;
        let mut attempt = 1;

        loop {
            let error = match self.sink.write(&points).await {
                Ok(()) => {
                    self.stats.batches_written.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .points_written
                        .fetch_add(points.len() as u64, Ordering::Relaxed);
                    tracing::debug!(
                        "wrote batch of {} points to {} (attempt {})",
                        points.len(),
                        self.sink.name(),
                        attempt
                    );
                    return;
                }
                Err(e) => e,
            };

            if attempt >= attempts || cancel.is_cancelled() {
                self.stats.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .points_dropped
                    .fetch_add(points.len() as u64, Ordering::Relaxed);
                tracing::error!(
                    "dropping batch of {} points after {} attempts: {}",
                    points.len(),
                    attempt,
                    error
                );
                return;
            }

            tracing::warn!(
                "batch write failed (attempt {}/{}): {}, retrying in {:?}",
                attempt,
                attempts,
                error,
                self.options.retry_delay
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
            attempt += 1;
        }
    }
}
