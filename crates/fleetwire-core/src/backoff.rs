// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Capped exponential reconnect backoff.
//!
//! Delay for the n-th consecutive failure is `min * 2^(n-1)`, capped at
//! `max`. A successful connect resets the schedule to `min`.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Reconnect delay schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            failures: 0,
        }
    }

    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_secs),
            Duration::from_secs(config.max_secs),
        )
    }

    /// Record a failure and return the delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Delay the next failure would produce, without recording it.
    pub fn peek(&self) -> Duration {
        self.delay_for(self.failures)
    }

    /// Back to the minimum delay after a successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.min.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}
