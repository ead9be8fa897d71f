// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetwire device agent
//!
//! Publishes one telemetry record per tick to `<namespace>/<device_id>` and
//! never loses a record to a broker outage: anything that cannot be sent
//! goes to a per-device SQLite queue, which is drained in order once the
//! session reconnects.
//!
//! # Features
//!
//! - **Durable queue**: bounded FIFO per device, drop-oldest on overflow,
//!   survives restarts
//! - **Flush coordinator**: rate-limited, ack-before-pop drain
//! - **Fleet mode**: N simulated vehicles in one process
//!
//! # Architecture
//!
//! ```text
//! Fleet
//! +-- QueueRegistry            (device_id -> DurableQueue)
//! +-- DeviceHandle (per device)
//!     +-- TransportSession     (reconnect FSM, from fleetwire-core)
//!     +-- PublisherLoop        (cadence tick, send or enqueue)
//!     +-- FlushCoordinator     (drain on Connected)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleetwire_device::{DeviceOptions, DevicePipeline, QueueRegistry, VehicleSimulator};
//!
//! let registry = QueueRegistry::new("queues", 10_000);
//! let device = DevicePipeline::start(
//!     broker,
//!     &registry,
//!     DeviceOptions::new("vehicle_01"),
//!     Box::new(VehicleSimulator::new()),
//! )?;
//! // ...
//! device.shutdown().await?;
//! ```

pub mod config;
pub mod fleet;
pub mod flush;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod source;

pub use config::{DeviceConfig, DevicesConfig, QueueConfig};
pub use fleet::Fleet;
pub use flush::{FlushCoordinator, FlushOptions, FlushStatsSnapshot};
pub use pipeline::{DeviceError, DeviceHandle, DeviceOptions, DevicePipeline, DeviceStats};
pub use publisher::{Delivery, PublisherLoop, PublisherStatsSnapshot};
pub use queue::{DurableQueue, QueueEntry, QueueError, QueueStatsSnapshot};
pub use registry::QueueRegistry;
pub use source::{TelemetrySource, VehicleSimulator};
