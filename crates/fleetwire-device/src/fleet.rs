// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Several device pipelines in one process, sharing one queue registry.
//!
//! Each device keeps its own session, queue file, publisher and flush
//! coordinator; nothing is shared between devices except the registry.

use fleetwire_core::broker::Broker;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::pipeline::{DeviceError, DeviceHandle, DeviceOptions, DevicePipeline, DeviceStats};
use crate::registry::QueueRegistry;
use crate::source::TelemetrySource;

pub struct Fleet {
    registry: Arc<QueueRegistry>,
    devices: Vec<DeviceHandle>,
}

impl Fleet {
    /// Start every configured device. `source_for` builds the telemetry
    /// source of each device id.
    ///
    /// If one device fails to start, the ones already running are shut
    /// down before the error is returned.
    pub async fn start<F>(
        broker: Arc<dyn Broker>,
        registry: Arc<QueueRegistry>,
        config: &DeviceConfig,
        mut source_for: F,
    ) -> Result<Self, DeviceError>
    where
        F: FnMut(&str) -> Box<dyn TelemetrySource>,
    {
        let mut devices = Vec::new();
        for device_id in config.devices.device_ids() {
            let options = DeviceOptions::from_config(config, &device_id);
            let source = source_for(&device_id);
            match DevicePipeline::start(Arc::clone(&broker), &registry, options, source) {
                Ok(handle) => devices.push(handle),
                Err(e) => {
                    tracing::error!("{}: cannot start device: {}", device_id, e);
                    for handle in devices {
                        let _ = handle.shutdown().await;
                    }
                    return Err(e);
                }
            }
        }
        tracing::info!("fleet started with {} devices", devices.len());
        Ok(Self { registry, devices })
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn devices(&self) -> &[DeviceHandle] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn stats(&self) -> Vec<DeviceStats> {
        self.devices.iter().map(DeviceHandle::stats).collect()
    }

    /// Resolves once every device has stopped on its own.
    pub async fn all_stopped(&self) {
        for device in &self.devices {
            device.stopped().await;
        }
    }

    /// Shut every device down. All devices are stopped even if one fails;
    /// the first failure is returned.
    pub async fn shutdown(self) -> Result<Vec<DeviceStats>, DeviceError> {
        let mut stats = Vec::with_capacity(self.devices.len());
        let mut first_error = None;
        for device in self.devices {
            let device_id = device.device_id().to_string();
            match device.shutdown().await {
                Ok(s) => stats.push(s),
                Err(e) => {
                    tracing::error!("{}: device stopped with error: {}", device_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DevicesConfig;
    use crate::source::VehicleSimulator;
    use fleetwire_core::broker::MemoryBroker;
    use fleetwire_core::record::TelemetryRecord;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_fleet_devices_are_independent() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(QueueRegistry::in_memory(100));
        let config = DeviceConfig {
            devices: DevicesConfig {
                count: 3,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut seed = 0;
        let fleet = Fleet::start(Arc::new(broker.clone()), Arc::clone(&registry), &config, |_| {
            seed += 1;
            Box::new(VehicleSimulator::with_seed(seed))
        })
        .await
        .unwrap();
        assert_eq!(fleet.len(), 3);
        assert_eq!(
            registry.device_ids(),
            vec!["vehicle_01", "vehicle_02", "vehicle_03"]
        );

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(broker.is_online("device_vehicle_02"));

        // Only vehicle_02 loses its link
        broker.sever("device_vehicle_02");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = fleet.stats();
        assert_eq!(stats.len(), 3);
        assert!(stats.iter().all(|s| s.queue_depth == 0));

        for message in broker.published() {
            let record = TelemetryRecord::from_payload(&message.payload).unwrap();
            assert_eq!(message.topic, format!("device/data/{}", record.device_id()));
        }

        let stats = fleet.shutdown().await.unwrap();
        assert_eq!(stats.len(), 3);
        assert!(stats.iter().all(|s| s.publisher.published + s.publisher.queued >= 2));
    }

    #[tokio::test]
    async fn test_failed_start_reports_error() {
        let broker = MemoryBroker::new();
        let registry = Arc::new(QueueRegistry::in_memory(100));
        let config = DeviceConfig {
            devices: DevicesConfig {
                ids: vec!["ok".into(), "bad/id".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        let result = Fleet::start(Arc::new(broker), registry, &config, |_| {
            Box::new(VehicleSimulator::with_seed(1))
        })
        .await;
        assert!(matches!(result, Err(DeviceError::Queue(_))));
    }
}
