// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetwire collector
//!
//! Subscribes to device telemetry, stamps each record with its receive time
//! and writes it to a time-series sink in batches.
//!
//! This crate provides:
//! - The ingestion subscriber (decode, drop malformed, transit latency)
//! - A batch writer flushing on size or age, with fixed-delay retries
//! - Record to point mapping with configurable tag fields
//! - Sinks: InfluxDB v2 line protocol over HTTP, dry-run, in-memory
//!
//! # Overview
//!
//! ```text
//! Broker --> TransportSession --> IngestionSubscriber --> BatchWriter --> PointMapper --> Sink
//! ```
//!
//! Points carry `publish_timestamp` (device clock) and
//! `collector_receive_time` as fields; the sink's write time is the point
//! time, so end-to-end latency is visible without extra bookkeeping.

pub mod buffer;
pub mod config;
pub mod influx;
pub mod latency;
pub mod mapping;
pub mod service;
pub mod sink;
pub mod subscriber;
pub mod writer;

pub use buffer::ReceivedRecord;
pub use config::{BatchConfig, CollectorConfig, InfluxConfig};
pub use influx::InfluxSink;
pub use latency::{LatencySummary, LatencyTracker};
pub use mapping::PointMapper;
pub use service::{CollectorHandle, CollectorService, CollectorStats};
pub use sink::{DryRunSink, MemorySink, Point, Sink, SinkError, WrittenPoint};
pub use subscriber::{IngestStatsSnapshot, IngestionSubscriber};
pub use writer::{BatchOptions, BatchWriter, WriterStatsSnapshot};
