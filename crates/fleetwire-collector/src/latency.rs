// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transit latency statistics (`receive_time - publish_time`).
//!
//! Keeps the most recent `window` samples for percentiles; totals cover
//! every sample. Negative transit means the device clock is ahead of the
//! collector's and is counted, not clamped.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Summary over the current window, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    /// Samples in the window.
    pub count: usize,
    /// Samples ever recorded.
    pub total: u64,
    /// Samples ever recorded with negative transit.
    pub negative: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug)]
struct Window {
    samples: VecDeque<f64>,
    total: u64,
    negative: u64,
}

#[derive(Debug)]
pub struct LatencyTracker {
    capacity: usize,
    window: Mutex<Window>,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window: Mutex::new(Window {
                samples: VecDeque::with_capacity(capacity),
                total: 0,
                negative: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        match self.window.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one transit time in seconds.
    pub fn record(&self, transit_secs: f64) {
        if !transit_secs.is_finite() {
            return;
        }
        let mut window = self.lock();
        if window.samples.len() == self.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(transit_secs * 1000.0);
        window.total += 1;
        if transit_secs < 0.0 {
            window.negative += 1;
        }
    }

    /// `None` until the first sample.
    pub fn summary(&self) -> Option<LatencySummary> {
        let window = self.lock();
        if window.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = window.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let mean = sorted.iter().sum::<f64>() / count as f64;
        Some(LatencySummary {
            count,
            total: window.total,
            negative: window.negative,
            min_ms: sorted[0],
            mean_ms: mean,
            p50_ms: percentile(&sorted, 50.0),
            p90_ms: percentile(&sorted, 90.0),
            p99_ms: percentile(&sorted, 99.0),
            max_ms: sorted[count - 1],
        })
    }
}

/// Nearest-rank on a sorted, non-empty slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let idx = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(LatencyTracker::new(8).summary(), None);
    }

    #[test]
    fn test_percentiles() {
        let tracker = LatencyTracker::new(1000);
        for ms in 1..=100 {
            tracker.record(ms as f64 / 1000.0);
        }
        let s = tracker.summary().unwrap();
        assert_eq!(s.count, 100);
        assert!((s.min_ms - 1.0).abs() < 1e-9);
        assert!((s.max_ms - 100.0).abs() < 1e-9);
        assert!((s.mean_ms - 50.5).abs() < 1e-9);
        // idx = round(0.5 * 99) = 50 -> 51ms
        assert!((s.p50_ms - 51.0).abs() < 1e-9);
        assert!((s.p90_ms - 90.0).abs() < 1e-9);
        assert!((s.p99_ms - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_rolls_and_negative_counted() {
        let tracker = LatencyTracker::new(3);
        tracker.record(-0.2);
        tracker.record(0.1);
        tracker.record(0.2);
        tracker.record(0.3);
        tracker.record(f64::NAN);
        let s = tracker.summary().unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.total, 4);
        assert_eq!(s.negative, 1);
        assert!((s.min_ms - 100.0).abs() < 1e-9);
    }
}
