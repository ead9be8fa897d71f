// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Batch accumulator for received records.
//!
//! A batch is due when it holds `max_size` records or when `flush_interval`
//! has elapsed since its oldest record arrived, whichever comes first.
//! At most `max_pending` records are held; past that the oldest is evicted.

use fleetwire_core::record::TelemetryRecord;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A record plus the collector's receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedRecord {
    pub record: TelemetryRecord,
    /// Epoch seconds, stamped as soon as the message arrived.
    pub receive_time: f64,
}

impl ReceivedRecord {
    pub fn new(record: TelemetryRecord, receive_time: f64) -> Self {
        Self {
            record,
            receive_time,
        }
    }

    /// `receive_time - publish_time`, in seconds. Negative under clock skew.
    pub fn transit(&self) -> f64 {
        self.receive_time - self.record.publish_time()
    }
}

pub struct Batch {
    records: VecDeque<(ReceivedRecord, Instant)>,
    max_size: usize,
    max_pending: usize,
    flush_interval: Duration,
}

impl Batch {
    pub fn new(max_size: usize, max_pending: usize, flush_interval: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            records: VecDeque::with_capacity(max_size),
            max_size,
            max_pending: max_pending.max(max_size),
            flush_interval,
        }
    }

    /// Append a record. Returns the oldest record if it had to make room.
    pub fn push(&mut self, record: ReceivedRecord) -> Option<ReceivedRecord> {
        let evicted = if self.records.len() >= self.max_pending {
            self.records.pop_front().map(|(r, _)| r)
        } else {
            None
        };
        self.records.push_back((record, Instant::now()));
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_size
    }

    /// When the oldest record must be flushed, or `None` if empty.
    pub fn deadline(&self) -> Option<Instant> {
        self.records.front().map(|(_, at)| *at + self.flush_interval)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.is_full() || self.deadline().is_some_and(|d| now >= d)
    }

    /// Remove up to `max_size` of the oldest records.
    pub fn take(&mut self) -> Vec<ReceivedRecord> {
        let n = self.records.len().min(self.max_size);
        self.records.drain(..n).map(|(r, _)| r).collect()
    }
}
