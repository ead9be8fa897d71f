// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flush coordinator: drains the durable queue through the session.
//!
//! Drain protocol, one entry at a time:
//!
//! ```text
//! peek_front ──► publish (await ack) ──ok──► pop_front(seq) ──► sleep(drain_interval) ──┐
//!     ▲                 │                                                                │
//!     │                 └─fail──► stop, wait for the next Connected                      │
//!     └──────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! An entry is removed only after its publish was acknowledged, so a drop
//! mid-drain leaves it at the front. A lost ack means the entry is sent
//! again later (at-least-once), never skipped.

use fleetwire_core::session::TransportSession;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::queue::{DurableQueue, QueueError};

/// Drain pacing and shutdown budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// Pause between two drained entries.
    pub drain_interval: Duration,
    /// Pause before retrying after a failed send while still connected.
    pub retry_pause: Duration,
    /// Budget for the final best-effort drain at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_millis(10),
            retry_pause: Duration::from_millis(1_000),
            shutdown_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Flush counters.
#[derive(Debug, Default)]
pub struct FlushStats {
    pub drained: AtomicU64,
    pub interrupted: AtomicU64,
    pub drains: AtomicU64,
}

/// Point-in-time flush counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStatsSnapshot {
    pub drained: u64,
    pub interrupted: u64,
    pub drains: u64,
}

impl FlushStats {
    pub fn snapshot(&self) -> FlushStatsSnapshot {
        FlushStatsSnapshot {
            drained: self.drained.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    Empty,
    Interrupted,
    Cancelled,
}

pub struct FlushCoordinator {
    device_id: String,
    session: Arc<TransportSession>,
    queue: Arc<DurableQueue>,
    wake: Arc<Notify>,
    options: FlushOptions,
    stats: Arc<FlushStats>,
}

impl FlushCoordinator {
    pub fn new(
        device_id: impl Into<String>,
        session: Arc<TransportSession>,
        queue: Arc<DurableQueue>,
        wake: Arc<Notify>,
        options: FlushOptions,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            session,
            queue,
            wake,
            options,
            stats: Arc::new(FlushStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FlushStats> {
        Arc::clone(&self.stats)
    }

    /// Drain whenever connected until cancelled, then make one bounded
    /// best-effort drain.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), QueueError> {
        let mut state_rx = self.session.watch_state();

        loop {
            if !self.session.wait_connected(&cancel).await {
                break;
            }

            match self.drain(&cancel).await? {
                DrainOutcome::Empty => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = state_rx.changed() => {}
                    }
                }
                DrainOutcome::Interrupted => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_pause) => {}
                    }
                }
                DrainOutcome::Cancelled => break,
            }
        }

        self.final_flush().await
    }

    async fn drain(&self, cancel: &CancellationToken) -> Result<DrainOutcome, QueueError> {
        let backlog = self.queue.len()?;
        if backlog == 0 {
            return Ok(DrainOutcome::Empty);
        }

        self.stats.drains.fetch_add(1, Ordering::Relaxed);
        tracing::info!("{}: draining {} queued entries", self.device_id, backlog);

        let mut sent = 0u64;
        let outcome = loop {
            if cancel.is_cancelled() {
                break DrainOutcome::Cancelled;
            }
            let Some(entry) = self.queue.peek_front()? else {
                break DrainOutcome::Empty;
            };

            if let Err(e) = self.session.publish(&entry.topic, &entry.payload).await {
                self.stats.interrupted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "{}: drain interrupted at seq={} after {} entries: {}",
                    self.device_id,
                    entry.sequence,
                    sent,
                    e
                );
                break DrainOutcome::Interrupted;
            }

            if self.queue.pop_front(entry.sequence)? {
                sent += 1;
                self.stats.drained.fetch_add(1, Ordering::Relaxed);
            }

            tokio::select! {
                _ = cancel.cancelled() => break DrainOutcome::Cancelled,
                _ = tokio::time::sleep(self.options.drain_interval) => {}
            }
        };

        if outcome == DrainOutcome::Empty {
            tracing::info!("{}: drain complete, {} entries flushed", self.device_id, sent);
        }
        Ok(outcome)
    }

    async fn final_flush(&self) -> Result<(), QueueError> {
        let remaining = self.queue.len()?;
        if remaining == 0 {
            return Ok(());
        }
        if !self.session.is_connected() {
            tracing::info!(
                "{}: offline at shutdown, {} entries kept for next start",
                self.device_id,
                remaining
            );
            return Ok(());
        }

        tracing::info!("{}: final flush of {} queued entries", self.device_id, remaining);
        let attempt = tokio::time::timeout(self.options.shutdown_timeout, async {
            let mut flushed = 0u64;
            while let Some(entry) = self.queue.peek_front()? {
                if self
                    .session
                    .publish(&entry.topic, &entry.payload)
                    .await
                    .is_err()
                {
                    break;
                }
                if self.queue.pop_front(entry.sequence)? {
                    flushed += 1;
                    self.stats.drained.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok::<u64, QueueError>(flushed)
        })
        .await;

        match attempt {
            Ok(result) => {
                let flushed = result?;
                tracing::info!("{}: final flush sent {} entries", self.device_id, flushed);
            }
            Err(_) => tracing::warn!(
                "{}: final flush timed out after {:?}",
                self.device_id,
                self.options.shutdown_timeout
            ),
        }

        let left = self.queue.len()?;
        if left > 0 {
            tracing::info!("{}: {} entries kept for next start", self.device_id, left);
        }
        Ok(())
    }
}
