// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable per-device offline queue (SQLite).
//!
//! Bounded FIFO of serialized records that could not be delivered. One
//! database file per device; every mutation is a single transaction, so a
//! crash leaves either the old or the new state on disk.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE entries (
//!     sequence INTEGER PRIMARY KEY AUTOINCREMENT,
//!     topic TEXT NOT NULL,
//!     payload BLOB NOT NULL,
//!     enqueued_at REAL NOT NULL
//! );
//! ```
//!
//! `AUTOINCREMENT` never reuses a sequence, even after the front entries are
//! deleted, so sequence order is enqueue order for the life of the file.
//!
//! # Overflow
//!
//! When the queue holds `capacity` entries, `enqueue` deletes the single
//! oldest entry before inserting, in the same transaction. Evictions are
//! counted and logged.

use fleetwire_core::clock;
use fleetwire_core::record::{PayloadError, TelemetryRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Queue errors. Any of these is fatal for the owning device pipeline.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("cannot prepare queue directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize record: {0}")]
    Payload(#[from] PayloadError),

    #[error("queue capacity must be at least 1")]
    InvalidCapacity,

    #[error("invalid device id '{0}'")]
    InvalidDeviceId(String),
}

/// One persisted entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Strictly increasing per device.
    pub sequence: u64,
    pub topic: String,
    /// Serialized wire payload.
    pub payload: Vec<u8>,
    /// Epoch seconds at enqueue.
    pub enqueued_at: f64,
}

impl QueueEntry {
    /// Decode the stored record.
    pub fn record(&self) -> Result<TelemetryRecord, PayloadError> {
        TelemetryRecord::from_payload(&self.payload)
    }
}

/// Queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub evicted: AtomicU64,
    pub drained: AtomicU64,
    pub restored: AtomicU64,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub evicted: u64,
    pub drained: u64,
    pub restored: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
        }
    }
}

/// Bounded, crash-durable FIFO for one device.
///
/// Thread-safe via an internal Mutex (SQLite `Connection` is not `Sync`);
/// the lock serializes the publisher's appends against the flush
/// coordinator's removals.
pub struct DurableQueue {
    device_id: String,
    capacity: usize,
    conn: Mutex<Connection>,
    stats: QueueStats,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("device_id", &self.device_id)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl DurableQueue {
    /// Open (or create) the queue database at `path`.
    pub fn open(
        device_id: impl Into<String>,
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| QueueError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(device_id.into(), conn, capacity)
    }

    /// In-memory queue (tests and `--mock` runs).
    pub fn open_in_memory(device_id: impl Into<String>, capacity: usize) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(device_id.into(), conn, capacity)
    }

    fn with_connection(device_id: String, conn: Connection, capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity);
        }
        if device_id.is_empty() {
            return Err(QueueError::InvalidDeviceId(device_id));
        }
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                enqueued_at REAL NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            device_id,
            capacity,
            conn: Mutex::new(conn),
            stats: QueueStats::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Persist a record, evicting the oldest entry first if the queue is full.
    /// Returns the assigned sequence.
    pub fn enqueue(&self, topic: &str, record: &TelemetryRecord) -> Result<u64, QueueError> {
        let payload = record.to_payload()?;
        self.enqueue_payload(topic, &payload)
    }

    /// Persist an already serialized payload.
    pub fn enqueue_payload(&self, topic: &str, payload: &[u8]) -> Result<u64, QueueError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut count: i64 = tx.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        let mut evicted = 0u64;
        while count as usize >= self.capacity {
            tx.execute(
                "DELETE FROM entries WHERE sequence = (SELECT MIN(sequence) FROM entries)",
                [],
            )?;
            count -= 1;
            evicted += 1;
        }

        tx.execute(
            "INSERT INTO entries (topic, payload, enqueued_at) VALUES (?1, ?2, ?3)",
            params![topic, payload, clock::epoch_secs()],
        )?;
        let sequence = tx.last_insert_rowid() as u64;
        tx.commit()?;
        drop(conn);

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            let total = self.stats.evicted.fetch_add(evicted, Ordering::Relaxed) + evicted;
            tracing::warn!(
                "{}: queue full ({} entries), evicted oldest entry ({} evicted so far)",
                self.device_id,
                self.capacity,
                total
            );
        }
        tracing::trace!("{}: queued seq={} on {}", self.device_id, sequence, topic);
        Ok(sequence)
    }

    /// Oldest entry, if any.
    pub fn peek_front(&self) -> Result<Option<QueueEntry>, QueueError> {
        let conn = self.lock();
        let entry = conn
            .query_row(
                "SELECT sequence, topic, payload, enqueued_at FROM entries
                 ORDER BY sequence ASC LIMIT 1",
                [],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Remove the front entry if it is still `sequence`.
    ///
    /// Returns false when the front has moved on (the entry was evicted
    /// while being sent), in which case nothing is removed.
    pub fn pop_front(&self, sequence: u64) -> Result<bool, QueueError> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM entries
             WHERE sequence = ?1 AND sequence = (SELECT MIN(sequence) FROM entries)",
            params![sequence as i64],
        )?;
        drop(conn);
        if removed == 1 {
            self.stats.drained.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed == 1)
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }

    /// All entries in sequence order, without modifying the queue.
    pub fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT sequence, topic, payload, enqueued_at FROM entries ORDER BY sequence ASC",
        )?;
        let entries = stmt
            .query_map([], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Reload persisted entries at startup, oldest first.
    ///
    /// A file written with a larger capacity is trimmed to the current one
    /// by evicting its oldest entries.
    pub fn restore(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let surplus = {
            let conn = self.lock();
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
            let surplus = (count as usize).saturating_sub(self.capacity);
            if surplus > 0 {
                conn.execute(
                    "DELETE FROM entries WHERE sequence IN
                     (SELECT sequence FROM entries ORDER BY sequence ASC LIMIT ?1)",
                    params![surplus as i64],
                )?;
            }
            surplus as u64
        };

        if surplus > 0 {
            self.stats.evicted.fetch_add(surplus, Ordering::Relaxed);
            tracing::warn!(
                "{}: persisted queue exceeded capacity {}, evicted {} oldest entries",
                self.device_id,
                self.capacity,
                surplus
            );
        }

        let entries = self.entries()?;
        self.stats
            .restored
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        if !entries.is_empty() {
            tracing::info!(
                "{}: restored {} queued entries (seq {}..={})",
                self.device_id,
                entries.len(),
                entries[0].sequence,
                entries[entries.len() - 1].sequence
            );
        }
        Ok(entries)
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM entries", [])?)
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        sequence: row.get::<_, i64>(0)? as u64,
        topic: row.get(1)?,
        payload: row.get(2)?,
        enqueued_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwire_core::record::FieldValue;
    use std::collections::BTreeMap;

    fn record(n: i64) -> TelemetryRecord {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FieldValue::Integer(n));
        TelemetryRecord::new("v1", 1000.0 + n as f64, fields)
    }

    fn drain(queue: &DurableQueue) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(entry) = queue.peek_front().unwrap() {
            let rec = entry.record().unwrap();
            match rec.field("n") {
                Some(FieldValue::Integer(n)) => out.push(*n),
                other => panic!("unexpected field {:?}", other),
            }
            assert!(queue.pop_front(entry.sequence).unwrap());
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let queue = DurableQueue::open_in_memory("v1", 10).unwrap();
        let seqs: Vec<u64> = (1..=4)
            .map(|n| queue.enqueue("device/data/v1", &record(n)).unwrap())
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(queue.len().unwrap(), 4);
        assert_eq!(drain(&queue), vec![1, 2, 3, 4]);
        assert!(queue.is_empty().unwrap());
        assert_eq!(queue.stats().drained, 4);
    }

    #[test]
    fn test_capacity_evicts_oldest_one_at_a_time() {
        let queue = DurableQueue::open_in_memory("v1", 5).unwrap();
        for n in 1..=7 {
            queue.enqueue("t", &record(n)).unwrap();
            assert!(queue.len().unwrap() <= 5);
        }
        let stats = queue.stats();
        assert_eq!(stats.enqueued, 7);
        assert_eq!(stats.evicted, 2);
        assert_eq!(drain(&queue), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_sequences_not_reused_after_drain() {
        let queue = DurableQueue::open_in_memory("v1", 3).unwrap();
        let a = queue.enqueue("t", &record(1)).unwrap();
        assert!(queue.pop_front(a).unwrap());
        let b = queue.enqueue("t", &record(2)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_pop_front_requires_current_front() {
        let queue = DurableQueue::open_in_memory("v1", 2).unwrap();
        let first = queue.enqueue("t", &record(1)).unwrap();
        let front = queue.peek_front().unwrap().unwrap();
        assert_eq!(front.sequence, first);

        // Front evicted while "in flight"
        queue.enqueue("t", &record(2)).unwrap();
        queue.enqueue("t", &record(3)).unwrap();
        assert!(!queue.pop_front(front.sequence).unwrap());
        assert_eq!(queue.len().unwrap(), 2);

        // A later sequence is never popped out of order
        let entries = queue.entries().unwrap();
        assert!(!queue.pop_front(entries[1].sequence).unwrap());
        assert_eq!(drain(&queue), vec![2, 3]);
    }

    #[test]
    fn test_peek_empty() {
        let queue = DurableQueue::open_in_memory("v1", 2).unwrap();
        assert!(queue.peek_front().unwrap().is_none());
        assert!(!queue.pop_front(1).unwrap());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(matches!(
            DurableQueue::open_in_memory("v1", 0),
            Err(QueueError::InvalidCapacity)
        ));
        assert!(matches!(
            DurableQueue::open_in_memory("", 5),
            Err(QueueError::InvalidDeviceId(_))
        ));
    }

    #[test]
    fn test_restore_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("v1_queue.db");
        {
            let queue = DurableQueue::open("v1", &path, 10).unwrap();
            for n in 1..=3 {
                queue.enqueue("t", &record(n)).unwrap();
            }
        }
        let queue = DurableQueue::open("v1", &path, 10).unwrap();
        let restored = queue.restore().unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[0].record().unwrap(), record(1));
        assert_eq!(queue.stats().restored, 3);

        // New entries land behind the restored ones
        queue.enqueue("t", &record(4)).unwrap();
        assert_eq!(drain(&queue), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_restore_trims_to_smaller_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1_queue.db");
        {
            let queue = DurableQueue::open("v1", &path, 10).unwrap();
            for n in 1..=6 {
                queue.enqueue("t", &record(n)).unwrap();
            }
        }
        let queue = DurableQueue::open("v1", &path, 4).unwrap();
        let restored = queue.restore().unwrap();
        assert_eq!(restored.len(), 4);
        assert_eq!(queue.stats().evicted, 2);
        assert_eq!(drain(&queue), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_clear() {
        let queue = DurableQueue::open_in_memory("v1", 5).unwrap();
        queue.enqueue("t", &record(1)).unwrap();
        queue.enqueue("t", &record(2)).unwrap();
        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.is_empty().unwrap());
    }
}
