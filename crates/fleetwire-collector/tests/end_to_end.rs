// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device pipeline to collector over the in-process broker.

use fleetwire_collector::mapping::{PUBLISH_TIMESTAMP_FIELD, RECEIVE_TIME_FIELD};
use fleetwire_collector::{CollectorConfig, CollectorService, MemorySink};
use fleetwire_core::broker::MemoryBroker;
use fleetwire_core::record::FieldValue;
use fleetwire_device::{DeviceOptions, DevicePipeline, QueueRegistry, TelemetrySource};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Counter(i64);

impl TelemetrySource for Counter {
    fn sample(&mut self) -> BTreeMap<String, FieldValue> {
        self.0 += 1;
        BTreeMap::from([
            ("n".to_string(), FieldValue::Integer(self.0)),
            ("detection_label".to_string(), FieldValue::from("normal")),
        ])
    }
}

fn collector_config(size: usize) -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.batch.size = size;
    config
}

fn numbers(sink: &MemorySink) -> Vec<i64> {
    sink.points()
        .iter()
        .map(|p| match p.point.fields.get("n") {
            Some(FieldValue::Integer(n)) => *n,
            other => panic!("unexpected {:?}", other),
        })
        .collect()
}

fn assert_complete(mut seen: Vec<i64>, last: i64) {
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen, (1..=last).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_records_reach_sink_with_timestamps() {
    let broker = MemoryBroker::new();
    let sink = MemorySink::new();
    let collector = CollectorService::start(
        Arc::new(broker.clone()),
        &collector_config(3),
        Arc::new(sink.clone()),
    );
    let cancel = CancellationToken::new();
    assert!(collector.session().wait_connected(&cancel).await);

    let registry = QueueRegistry::in_memory(100);
    let device = DevicePipeline::start(
        Arc::new(broker.clone()),
        &registry,
        DeviceOptions::new("vehicle_01"),
        Box::new(Counter(0)),
    )
    .unwrap();

    // Ticks at t = 0..=5
    tokio::time::sleep(Duration::from_millis(5_500)).await;
    device.shutdown().await.unwrap();
    let stats = collector.shutdown().await.unwrap();

    assert_eq!(numbers(&sink), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(stats.ingest.received, 6);
    assert_eq!(stats.ingest.malformed, 0);

    for written in sink.points() {
        let point = &written.point;
        assert_eq!(point.measurement, "device_data");
        assert_eq!(point.tags.get("device_id").map(String::as_str), Some("vehicle_01"));
        assert_eq!(point.tags.get("collector").map(String::as_str), Some("fleetwire"));
        assert_eq!(point.tags.get("detection_label").map(String::as_str), Some("normal"));

        let published = point.field_f64(PUBLISH_TIMESTAMP_FIELD).unwrap();
        let received = point.field_f64(RECEIVE_TIME_FIELD).unwrap();
        assert!(published > 0.0);
        assert!(received >= published);
        assert!(written.write_time >= published);
    }
}

#[tokio::test(start_paused = true)]
async fn test_outage_loses_nothing() {
    let broker = MemoryBroker::new();
    let sink = MemorySink::new();
    let collector = CollectorService::start(
        Arc::new(broker.clone()),
        &collector_config(10),
        Arc::new(sink.clone()),
    );
    let cancel = CancellationToken::new();
    assert!(collector.session().wait_connected(&cancel).await);

    let registry = QueueRegistry::in_memory(100);
    let device = DevicePipeline::start(
        Arc::new(broker.clone()),
        &registry,
        DeviceOptions::new("vehicle_01"),
        Box::new(Counter(0)),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    broker.set_available(false);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(device.stats().queue_depth > 0);
    broker.set_available(true);
    tokio::time::sleep(Duration::from_secs(20)).await;

    let device_stats = device.shutdown().await.unwrap();
    let stats = collector.shutdown().await.unwrap();

    assert_eq!(device_stats.queue_depth, 0);
    let last = (device_stats.publisher.published + device_stats.publisher.queued) as i64;
    assert_complete(numbers(&sink), last);
    assert_eq!(stats.writer.points_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_collector_reconnect_replays_retained_messages() {
    let broker = MemoryBroker::new();
    let sink = MemorySink::new();
    let config = collector_config(10);
    let collector = CollectorService::start(
        Arc::new(broker.clone()),
        &config,
        Arc::new(sink.clone()),
    );
    let cancel = CancellationToken::new();
    assert!(collector.session().wait_connected(&cancel).await);

    let registry = QueueRegistry::in_memory(100);
    let device = DevicePipeline::start(
        Arc::new(broker.clone()),
        &registry,
        DeviceOptions::new("vehicle_01"),
        Box::new(Counter(0)),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    // Only the collector drops; the device keeps publishing into its
    // persistent session
    assert!(broker.sever(&config.client_id()));
    tokio::time::sleep(Duration::from_millis(3_000)).await;

    device.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let stats = collector.shutdown().await.unwrap();

    assert_eq!(numbers(&sink), vec![1, 2, 3, 4, 5]);
    assert_eq!(stats.session.disconnects, 1);
    assert_eq!(stats.session.connects, 2);
}

#[tokio::test(start_paused = true)]
async fn test_sink_failures_retried() {
    let broker = MemoryBroker::new();
    let sink = MemorySink::new();
    sink.fail_next(2);
    let collector = CollectorService::start(
        Arc::new(broker.clone()),
        &collector_config(5),
        Arc::new(sink.clone()),
    );
    let cancel = CancellationToken::new();
    assert!(collector.session().wait_connected(&cancel).await);

    for n in 1..=5 {
        let payload = format!(r#"{{"device_id":"v1","timestamp":{}.0,"n":{}}}"#, n, n);
        broker.inject("device/data/v1", payload);
    }
    broker.inject("device/data/v1", "{broken");

    // First attempt at t = 0, retries at 5s and 10s
    tokio::time::sleep(Duration::from_secs(11)).await;
    let stats = collector.shutdown().await.unwrap();

    assert_eq!(numbers(&sink), vec![1, 2, 3, 4, 5]);
    assert_eq!(sink.batch_sizes(), vec![5]);
    assert_eq!(stats.writer.retries, 2);
    assert_eq!(stats.ingest.malformed, 1);
}
