// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Received record to sink point mapping.
//!
//! Tags: `device_id`, `collector`, plus any configured tag field present in
//! the record (moved out of the field set, stringified).
//!
//! Fields: every other telemetry value, plus
//! - `publish_timestamp`: the origin `timestamp`, untouched
//! - `collector_receive_time`: when the collector received the message
//!
//! The point carries no timestamp of its own; the sink assigns its write
//! time, so `write_time - publish_timestamp` is the end-to-end latency.

use crate::buffer::ReceivedRecord;
use crate::sink::Point;
use fleetwire_core::record::{FieldValue, DEVICE_ID_KEY};

pub const PUBLISH_TIMESTAMP_FIELD: &str = "publish_timestamp";
pub const RECEIVE_TIME_FIELD: &str = "collector_receive_time";
pub const COLLECTOR_TAG: &str = "collector";

#[derive(Debug, Clone)]
pub struct PointMapper {
    measurement: String,
    collector: String,
    tag_fields: Vec<String>,
}

impl PointMapper {
    pub fn new(
        measurement: impl Into<String>,
        collector: impl Into<String>,
        tag_fields: Vec<String>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            collector: collector.into(),
            tag_fields,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn map(&self, received: &ReceivedRecord) -> Point {
        let record = &received.record;
        let mut point = Point::new(self.measurement.as_str()).tag(DEVICE_ID_KEY, record.device_id());
        if !self.collector.is_empty() {
            point = point.tag(COLLECTOR_TAG, self.collector.as_str());
        }

        for (key, value) in record.fields() {
            if self.tag_fields.iter().any(|t| t == key) {
                point = point.tag(key.as_str(), value.to_string());
            } else {
                point.fields.insert(key.clone(), value.clone());
            }
        }

        point
            .fields
            .insert(PUBLISH_TIMESTAMP_FIELD.to_string(), FieldValue::Float(record.publish_time()));
        point
            .fields
            .insert(RECEIVE_TIME_FIELD.to_string(), FieldValue::Float(received.receive_time));
        point
    }

    pub fn map_all(&self, records: &[ReceivedRecord]) -> Vec<Point> {
        records.iter().map(|r| self.map(r)).collect()
    }
}
