// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Telemetry record data model and JSON wire schema.
//!
//! Wire format (one JSON object per message):
//!
//! ```text
//! {"device_id": "vehicle_01", "timestamp": 1712345678.123, "speed": 42.5, ...}
//! ```
//!
//! `device_id` and `timestamp` are required. Every other key is an open
//! telemetry field. Nested objects are flattened with `_`, a top-level
//! `telemetry` object is unwrapped in place, and `null` / array values are
//! dropped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::clock;

/// Wire key carrying the device identifier.
pub const DEVICE_ID_KEY: &str = "device_id";

/// Wire key carrying the origin publish time (epoch seconds).
pub const TIMESTAMP_KEY: &str = "timestamp";

/// Legacy envelope key whose members are lifted to the top level.
const ENVELOPE_KEY: &str = "telemetry";

/// Errors raised while decoding a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A single telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    /// Convert a scalar JSON value. Returns `None` for null, arrays and objects.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FieldValue::Integer(i))
                } else {
                    n.as_f64().map(FieldValue::Float)
                }
            }
            Value::String(s) => Some(FieldValue::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Numeric view of this value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            FieldValue::Boolean(b) => Value::Bool(*b),
            FieldValue::Integer(i) => Value::from(*i),
            FieldValue::Float(f) => Value::from(*f),
            FieldValue::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

/// One device reading.
///
/// Immutable once built: accessors only, no setters.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    device_id: String,
    publish_time: f64,
    fields: BTreeMap<String, FieldValue>,
}

impl TelemetryRecord {
    /// Build a record. Fields named like the required wire keys are discarded.
    pub fn new(
        device_id: impl Into<String>,
        publish_time: f64,
        mut fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        fields.remove(DEVICE_ID_KEY);
        fields.remove(TIMESTAMP_KEY);
        Self {
            device_id: device_id.into(),
            publish_time,
            fields,
        }
    }

    /// Build a record stamped with the current wall-clock time.
    pub fn now(device_id: impl Into<String>, fields: BTreeMap<String, FieldValue>) -> Self {
        Self::new(device_id, clock::epoch_secs(), fields)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Origin publish time in epoch seconds.
    pub fn publish_time(&self) -> f64 {
        self.publish_time
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Serialize to the flat JSON wire object.
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        let mut obj = Map::new();
        obj.insert(DEVICE_ID_KEY.to_string(), Value::String(self.device_id.clone()));
        obj.insert(TIMESTAMP_KEY.to_string(), Value::from(self.publish_time));
        for (key, value) in &self.fields {
            obj.insert(key.clone(), value.to_json());
        }
        Ok(serde_json::to_vec(&Value::Object(obj))?)
    }

    /// Decode and validate a wire payload.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(obj) = value else {
            return Err(PayloadError::NotAnObject);
        };

        let device_id = match obj.get(DEVICE_ID_KEY) {
            None | Some(Value::Null) => return Err(PayloadError::MissingField(DEVICE_ID_KEY)),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(PayloadError::InvalidField {
                    field: DEVICE_ID_KEY,
                    reason: "empty string".to_string(),
                })
            }
            Some(other) => {
                return Err(PayloadError::InvalidField {
                    field: DEVICE_ID_KEY,
                    reason: format!("expected string, got {}", json_kind(other)),
                })
            }
        };

        let publish_time = match obj.get(TIMESTAMP_KEY) {
            None | Some(Value::Null) => return Err(PayloadError::MissingField(TIMESTAMP_KEY)),
            Some(Value::Number(n)) => match n.as_f64() {
                Some(t) if t.is_finite() && t >= 0.0 => t,
                _ => {
                    return Err(PayloadError::InvalidField {
                        field: TIMESTAMP_KEY,
                        reason: format!("not a valid epoch time: {}", n),
                    })
                }
            },
            Some(other) => {
                return Err(PayloadError::InvalidField {
                    field: TIMESTAMP_KEY,
                    reason: format!("expected number, got {}", json_kind(other)),
                })
            }
        };

        let mut fields = BTreeMap::new();
        for (key, value) in &obj {
            if key == DEVICE_ID_KEY || key == TIMESTAMP_KEY || key == ENVELOPE_KEY {
                continue;
            }
            flatten_into(&mut fields, key, value);
        }

        // Envelope members never override top-level keys
        match obj.get(ENVELOPE_KEY) {
            Some(Value::Object(inner)) => {
                let mut lifted = BTreeMap::new();
                for (key, value) in inner {
                    flatten_into(&mut lifted, key, value);
                }
                for (key, value) in lifted {
                    fields.entry(key).or_insert(value);
                }
            }
            Some(other) => flatten_into(&mut fields, ENVELOPE_KEY, other),
            None => {}
        }

        Ok(Self::new(device_id, publish_time, fields))
    }
}

fn flatten_into(out: &mut BTreeMap<String, FieldValue>, key: &str, value: &Value) {
    match value {
        Value::Object(inner) => {
            for (child, v) in inner {
                flatten_into(out, &format!("{}_{}", key, child), v);
            }
        }
        other => {
            if let Some(field) = FieldValue::from_json(other) {
                out.insert(key.to_string(), field);
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Per-device topic: `<namespace>/<device_id>`.
pub fn topic_for(namespace: &str, device_id: &str) -> String {
    format!("{}/{}", namespace.trim_end_matches('/'), device_id)
}

/// Last topic level, which carries the device id.
pub fn device_from_topic(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TelemetryRecord {
        let mut fields = BTreeMap::new();
        fields.insert("speed".to_string(), FieldValue::Float(42.5));
        fields.insert("detection_label".to_string(), FieldValue::from("normal"));
        fields.insert("odometer".to_string(), FieldValue::Integer(1200));
        TelemetryRecord::new("vehicle_01", 1_712_345_678.25, fields)
    }

    #[test]
    fn test_payload_preserves_publish_time() {
        let record = sample();
        let bytes = record.to_payload().unwrap();
        let decoded = TelemetryRecord::from_payload(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.publish_time(), 1_712_345_678.25);
    }

    #[test]
    fn test_payload_is_flat_object() {
        let bytes = sample().to_payload().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["device_id"], "vehicle_01");
        assert_eq!(value["speed"], 42.5);
        assert_eq!(value["odometer"], 1200);
    }

    #[test]
    fn test_reserved_field_names_stripped() {
        let mut fields = BTreeMap::new();
        fields.insert("timestamp".to_string(), FieldValue::Float(1.0));
        fields.insert("device_id".to_string(), FieldValue::from("spoofed"));
        let record = TelemetryRecord::new("vehicle_02", 5.0, fields);
        assert!(record.fields().is_empty());
        assert_eq!(record.device_id(), "vehicle_02");
    }

    #[test]
    fn test_missing_required_fields() {
        let err = TelemetryRecord::from_payload(br#"{"timestamp": 1.0, "speed": 3}"#).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("device_id")));

        let err = TelemetryRecord::from_payload(br#"{"device_id": "a", "speed": 3}"#).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("timestamp")));
    }

    #[test]
    fn test_invalid_required_fields() {
        let err = TelemetryRecord::from_payload(br#"{"device_id": 7, "timestamp": 1.0}"#).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidField { field: "device_id", .. }));

        let err = TelemetryRecord::from_payload(br#"{"device_id": "", "timestamp": 1.0}"#).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidField { field: "device_id", .. }));

        let err =
            TelemetryRecord::from_payload(br#"{"device_id": "a", "timestamp": "now"}"#).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidField { field: "timestamp", .. }));

        let err = TelemetryRecord::from_payload(br#"{"device_id": "a", "timestamp": -4}"#).unwrap_err();
        assert!(matches!(err, PayloadError::InvalidField { field: "timestamp", .. }));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            TelemetryRecord::from_payload(b"not json"),
            Err(PayloadError::Json(_))
        ));
        assert!(matches!(
            TelemetryRecord::from_payload(b"[1, 2]"),
            Err(PayloadError::NotAnObject)
        ));
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let record = TelemetryRecord::from_payload(
            br#"{"device_id": "a", "timestamp": 10, "firmware": "1.2.0", "door_open": true}"#,
        )
        .unwrap();
        assert_eq!(record.publish_time(), 10.0);
        assert_eq!(record.field("firmware"), Some(&FieldValue::from("1.2.0")));
        assert_eq!(record.field("door_open"), Some(&FieldValue::Boolean(true)));
    }

    #[test]
    fn test_nested_payload_flattened() {
        let payload = br#"{
            "device_id": "legacy_01",
            "timestamp": 100.5,
            "telemetry": {
                "cpu_usage": 12.5,
                "memory": {"total": 2048, "used": 1024},
                "detection": {"label": "smoking", "confidence": 0.91}
            },
            "tags": ["a", "b"],
            "note": null
        }"#;
        let record = TelemetryRecord::from_payload(payload).unwrap();
        assert_eq!(record.field("cpu_usage"), Some(&FieldValue::Float(12.5)));
        assert_eq!(record.field("memory_total"), Some(&FieldValue::Integer(2048)));
        assert_eq!(record.field("detection_label"), Some(&FieldValue::from("smoking")));
        assert!(record.field("tags").is_none());
        assert!(record.field("note").is_none());
        assert!(record.field("telemetry").is_none());
    }

    #[test]
    fn test_top_level_wins_over_envelope() {
        let payload =
            br#"{"device_id": "a", "timestamp": 1, "speed": 10, "telemetry": {"speed": 99}}"#;
        let record = TelemetryRecord::from_payload(payload).unwrap();
        assert_eq!(record.field("speed"), Some(&FieldValue::Integer(10)));
    }

    #[test]
    fn test_topics() {
        assert_eq!(topic_for("device/data", "vehicle_03"), "device/data/vehicle_03");
        assert_eq!(topic_for("device/data/", "vehicle_03"), "device/data/vehicle_03");
        assert_eq!(device_from_topic("device/data/vehicle_03"), Some("vehicle_03"));
        assert_eq!(device_from_topic("device/data/"), None);
    }
}
