// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wall-clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Convert fractional epoch seconds to whole nanoseconds, saturating at zero.
pub fn secs_to_nanos(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1_000_000_000.0) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_secs_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_secs() > 1_577_836_800.0);
    }

    #[test]
    fn test_secs_to_nanos() {
        assert_eq!(secs_to_nanos(1.5), 1_500_000_000);
        assert_eq!(secs_to_nanos(-3.0), 0);
        assert_eq!(secs_to_nanos(f64::NAN), 0);
    }
}
