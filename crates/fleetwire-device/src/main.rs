// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetwire device agent CLI
//!
//! # Usage
//!
//! ```bash
//! # One simulated vehicle against a local broker
//! fleetwire-device
//!
//! # Ten vehicles from a config file
//! fleetwire-device --config device.yaml --count 10
//!
//! # No broker at all (in-process broker, queues still on disk)
//! fleetwire-device --mock
//!
//! # Inspect or clear persisted queues
//! fleetwire-device queues
//! fleetwire-device queues --clear --confirm
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetwire_core::broker::{Broker, MemoryBroker, MqttBroker};
use fleetwire_device::{DeviceConfig, DeviceStats, Fleet, QueueRegistry, VehicleSimulator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// fleetwire device agent
#[derive(Parser, Debug)]
#[command(name = "fleetwire-device")]
#[command(about = "fleetwire device agent - telemetry publisher with a durable offline queue")]
#[command(version)]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Broker port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Number of simulated devices (overrides config)
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Queue directory (overrides config)
    #[arg(long)]
    queue_dir: Option<PathBuf>,

    /// Use the in-process broker instead of MQTT
    #[arg(long)]
    mock: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a configuration file with every default filled in
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "device.yaml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show persisted queue depths
    Queues {
        /// Delete every queued entry
        #[arg(long)]
        clear: bool,

        /// Confirm deletion
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(Commands::Validate { config }) = &args.command {
        return cmd_validate(config);
    }

    let config = build_config(&args)?;

    match args.command {
        Some(Commands::GenConfig { output }) => cmd_gen_config(&config, output),
        Some(Commands::Queues { clear, confirm }) => cmd_queues(&config, clear, confirm),
        Some(Commands::Validate { .. }) | None => run(config, args.mock).await,
    }
}

fn build_config(args: &Args) -> Result<DeviceConfig> {
    let mut config = match &args.config {
        Some(path) => DeviceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::default(),
    };

    if let Some(host) = &args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(count) = args.count {
        config.devices.count = count;
        config.devices.ids.clear();
    }
    if let Some(dir) = &args.queue_dir {
        config.queue.dir = dir.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: DeviceConfig, mock: bool) -> Result<()> {
    let broker: Arc<dyn Broker> = if mock {
        tracing::info!("Using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        tracing::info!(
            "Using MQTT broker at {}:{}",
            config.broker.host,
            config.broker.port
        );
        Arc::new(MqttBroker::new(config.broker.clone())?)
    };

    tracing::info!("fleetwire device agent v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Namespace: {}", config.namespace);
    tracing::info!("  Queue dir: {}", config.queue.dir.display());
    tracing::info!("  Queue capacity: {}", config.queue.capacity);
    tracing::info!("  Devices: {}", config.devices.device_ids().join(", "));

    let registry = Arc::new(QueueRegistry::new(&config.queue.dir, config.queue.capacity));
    let fleet = Fleet::start(broker, registry, &config, |_| {
        Box::new(VehicleSimulator::new())
    })
    .await?;

    let stats_period = (config.stats_interval_secs > 0)
        .then(|| Duration::from_secs(config.stats_interval_secs));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
        }
        _ = fleet.all_stopped() => {
            tracing::error!("Every device stopped on a storage error");
        }
        _ = report_stats(&fleet, stats_period) => {}
    }

    let stats = fleet.shutdown().await?;
    tracing::info!("Final statistics:");
    for s in &stats {
        log_stats(s);
    }
    Ok(())
}

/// Log fleet statistics every period. Never returns.
async fn report_stats(fleet: &Fleet, period: Option<Duration>) {
    let Some(period) = period else {
        return std::future::pending().await;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        for s in fleet.stats() {
            log_stats(&s);
        }
    }
}

fn log_stats(s: &DeviceStats) {
    tracing::info!(
        "{} [{}]: {} sent, {} queued, {} drained, {} evicted, depth {}, {} connects / {} failed",
        s.device_id,
        s.state,
        s.publisher.published,
        s.publisher.queued,
        s.flush.drained,
        s.queue.evicted,
        s.queue_depth,
        s.session.connects,
        s.session.connect_failures
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn cmd_gen_config(config: &DeviceConfig, output: PathBuf) -> Result<()> {
    let yaml = serde_yaml::to_string(config)?;
    let content = format!(
        "# fleetwire device agent configuration\n# Generated by fleetwire-device gen-config\n\n{}",
        yaml
    );
    std::fs::write(&output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    match DeviceConfig::from_file(path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker: {}:{}", config.broker.host, config.broker.port);
            println!("Namespace: {}", config.namespace);
            println!("Devices: {}", config.devices.device_ids().join(", "));
            println!(
                "Queue: {} (capacity {})",
                config.queue.dir.display(),
                config.queue.capacity
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_queues(config: &DeviceConfig, clear: bool, confirm: bool) -> Result<()> {
    let registry = QueueRegistry::new(&config.queue.dir, config.queue.capacity);
    let ids = registry.discover()?;
    if ids.is_empty() {
        println!("No queues in {}", config.queue.dir.display());
        return Ok(());
    }

    if clear && !confirm {
        eprintln!("Use --confirm to delete every queued entry");
        std::process::exit(1);
    }

    println!("Queues in {}:", config.queue.dir.display());
    for id in ids {
        let queue = registry.open(&id)?;
        if clear {
            let removed = queue.clear()?;
            println!("  {}: cleared {} entries", id, removed);
            continue;
        }
        let entries = queue.entries()?;
        match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => println!(
                "  {}: {} entries (seq {}..={})",
                id,
                entries.len(),
                first.sequence,
                last.sequence
            ),
            _ => println!("  {}: empty", id),
        }
    }
    Ok(())
}
