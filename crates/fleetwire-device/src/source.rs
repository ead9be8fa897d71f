// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry sources sampled once per publisher tick.

use fleetwire_core::record::FieldValue;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// Produces the telemetry fields for one record.
pub trait TelemetrySource: Send {
    fn sample(&mut self) -> BTreeMap<String, FieldValue>;
}

const MIN_SPEED: f64 = 0.0;
const MAX_SPEED: f64 = 120.0;
const TARGET_CHANGE_PROBABILITY: f64 = 0.05;
const NOISE_STD_DEV: f64 = 0.5;

/// Driver-state labels raised by the in-cabin camera.
const ALERT_LABELS: [&str; 4] = ["eyes_closed", "distracted", "smoking", "phone_usage"];
const NORMAL_LABEL: &str = "normal";
const ALERT_PROBABILITY: f64 = 0.1;

/// Simulated vehicle: speed in km/h plus a driver-state detection.
///
/// Speed moves toward a target at a per-vehicle acceleration rate, with
/// gaussian noise, clamped to 0..=120 and rounded to 2 decimals. The target
/// changes with 5% probability per tick. Detections stay `normal` most of
/// the time; an alert lasts a few ticks before reverting.
pub struct VehicleSimulator {
    rng: StdRng,
    speed: f64,
    target: f64,
    acceleration: f64,
    label: &'static str,
    label_ticks: u32,
}

impl VehicleSimulator {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    /// Deterministic simulator for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let speed = rng.random_range(20.0..60.0);
        let target = rng.random_range(30.0..100.0);
        let acceleration = rng.random_range(0.5..2.0);
        Self {
            rng,
            speed,
            target,
            acceleration,
            label: NORMAL_LABEL,
            label_ticks: 0,
        }
    }

    /// Advance one tick and return the new speed.
    pub fn next_speed(&mut self) -> f64 {
        if self.rng.random::<f64>() < TARGET_CHANGE_PROBABILITY {
            self.target = self.rng.random_range(MIN_SPEED..MAX_SPEED);
        }

        let diff = self.target - self.speed;
        if diff.abs() > 0.1 {
            self.speed += diff.abs().min(self.acceleration).copysign(diff);
        } else {
            self.speed += self.rng.random_range(-1.0..1.0);
        }

        self.speed += self.gaussian() * NOISE_STD_DEV;
        self.speed = self.speed.clamp(MIN_SPEED, MAX_SPEED);
        (self.speed * 100.0).round() / 100.0
    }

    /// Advance one tick and return `(label, confidence)`.
    pub fn next_detection(&mut self) -> (&'static str, f64) {
        if self.rng.random::<f64>() < ALERT_PROBABILITY {
            let idx = self.rng.random_range(0..ALERT_LABELS.len());
            self.label = ALERT_LABELS[idx];
            self.label_ticks = 0;
        } else if self.label != NORMAL_LABEL {
            self.label_ticks += 1;
            if self.label_ticks > self.rng.random_range(3..=5) {
                self.label = NORMAL_LABEL;
                self.label_ticks = 0;
            }
        }

        let confidence = if self.label == NORMAL_LABEL {
            1.0
        } else {
            (self.rng.random_range(0.75..0.99) * 1000.0_f64).round() / 1000.0
        };
        (self.label, confidence)
    }

    /// Standard normal sample (Box-Muller).
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = 1.0 - self.rng.random::<f64>();
        let u2: f64 = self.rng.random::<f64>();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}

impl Default for VehicleSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySource for VehicleSimulator {
    fn sample(&mut self) -> BTreeMap<String, FieldValue> {
        let speed = self.next_speed();
        let (label, confidence) = self.next_detection();
        let mut fields = BTreeMap::new();
        fields.insert("speed".to_string(), FieldValue::Float(speed));
        fields.insert("detection_label".to_string(), FieldValue::from(label));
        fields.insert("detection_confidence".to_string(), FieldValue::Float(confidence));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_stays_in_range_and_rounded() {
        let mut sim = VehicleSimulator::with_seed(7);
        for _ in 0..5_000 {
            let speed = sim.next_speed();
            assert!((MIN_SPEED..=MAX_SPEED).contains(&speed));
            assert!(((speed * 100.0).round() - speed * 100.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_speed_changes_gradually() {
        let mut sim = VehicleSimulator::with_seed(11);
        let mut prev = sim.next_speed();
        for _ in 0..1_000 {
            let next = sim.next_speed();
            // acceleration <= 2 km/h plus noise
            assert!((next - prev).abs() < 8.0, "jump {} -> {}", prev, next);
            prev = next;
        }
    }

    #[test]
    fn test_detection_mostly_normal() {
        let mut sim = VehicleSimulator::with_seed(3);
        let mut normal = 0;
        for _ in 0..2_000 {
            let (label, confidence) = sim.next_detection();
            if label == NORMAL_LABEL {
                normal += 1;
                assert_eq!(confidence, 1.0);
            } else {
                assert!(ALERT_LABELS.contains(&label));
                assert!((0.75..=0.99).contains(&confidence));
            }
        }
        assert!(normal > 700 && normal < 2_000, "normal={}", normal);
    }

    #[test]
    fn test_sample_fields() {
        let mut sim = VehicleSimulator::with_seed(1);
        let fields = sim.sample();
        assert!(matches!(fields.get("speed"), Some(FieldValue::Float(_))));
        assert!(matches!(fields.get("detection_label"), Some(FieldValue::String(_))));
        assert!(matches!(
            fields.get("detection_confidence"),
            Some(FieldValue::Float(_))
        ));
    }

    #[test]
    fn test_seeded_is_deterministic() {
        let mut a = VehicleSimulator::with_seed(42);
        let mut b = VehicleSimulator::with_seed(42);
        for _ in 0..100 {
            assert_eq!(a.sample(), b.sample());
        }
    }
}
