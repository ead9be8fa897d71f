// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v2 sink.
//!
//! Line Protocol format:
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 [timestamp_ns]
//! ```
//!
//! Points without a timestamp get the server's write time.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use async_trait::async_trait;
use fleetwire_core::record::FieldValue;
use std::time::Duration;

use crate::config::InfluxConfig;
use crate::sink::{Point, Sink, SinkError};

/// Format a field value for Line Protocol.
///
/// - Float: written as-is (e.g., `3.14`)
/// - Integer: suffixed with `i` (e.g., `42i`)
/// - String: double-quoted, inner quotes and backslashes escaped
/// - Boolean: `true` or `false`
pub fn field_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Float(v) => format!("{}", v),
        FieldValue::Integer(v) => format!("{}i", v),
        FieldValue::String(v) => {
            let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{}\"", escaped)
        }
        FieldValue::Boolean(v) => v.to_string(),
    }
}

/// Render one point. Tags and fields come out sorted by key; empty tag
/// values and non-finite floats are left out.
pub fn to_line(point: &Point) -> String {
    let mut line = escape_measurement(&point.measurement);

    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    line.push(' ');
    let mut first = true;
    for (key, value) in point.fields.iter().filter(|(_, v)| renderable(v)) {
        if !first {
            line.push(',');
        }
        first = false;
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&field_value(value));
    }

    if let Some(ts) = point.timestamp_ns {
        line.push(' ');
        line.push_str(&ts.to_string());
    }
    line
}

fn renderable(value: &FieldValue) -> bool {
    !matches!(value, FieldValue::Float(f) if !f.is_finite())
}

/// A point needs at least one field the server will accept.
pub fn is_writable(point: &Point) -> bool {
    point.fields.values().any(renderable)
}

/// Render a batch, one point per line. Points with no writable field are
/// skipped.
pub fn to_body(points: &[Point]) -> String {
    points
        .iter()
        .filter(|p| is_writable(p))
        .map(to_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Spaces and commas.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Commas, equals signs and spaces (tag keys, tag values, field keys).
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

/// Writes batches through `POST /api/v2/write`.
pub struct InfluxSink {
    client: reqwest::Client,
    endpoint: String,
    org: String,
    bucket: String,
    token: Option<String>,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    /// Write endpoint, without the query string.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        let skipped = points.iter().filter(|p| !is_writable(p)).count();
        if skipped > 0 {
            tracing::warn!("skipping {} points without a writable field", skipped);
        }
        if skipped == points.len() {
            return Ok(());
        }
        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(to_body(points));
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status { status, body });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "influxdb"
    }
}
