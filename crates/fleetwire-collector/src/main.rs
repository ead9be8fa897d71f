// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! fleetwire collector CLI
//!
//! # Usage
//!
//! ```bash
//! # Log batches instead of writing them
//! fleetwire-collector --dry-run
//!
//! # Write to the InfluxDB configured in collector.yaml
//! fleetwire-collector --config collector.yaml
//!
//! # Everything in one process: in-process broker, nothing published
//! fleetwire-collector --mock --dry-run
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetwire_collector::{
    CollectorConfig, CollectorHandle, CollectorService, CollectorStats, DryRunSink, InfluxSink,
    Sink,
};
use fleetwire_core::broker::{Broker, MemoryBroker, MqttBroker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// fleetwire collector
#[derive(Parser, Debug)]
#[command(name = "fleetwire-collector")]
#[command(about = "fleetwire collector - batches device telemetry into InfluxDB")]
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

    /// Log points instead of writing them, even if InfluxDB is configured
    #[arg(long)]
    dry_run: bool,

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
        #[arg(short, long, default_value = "collector.yaml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
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
        Some(Commands::Validate { .. }) | None => run(config, args.mock, args.dry_run).await,
    }
}

fn build_config(args: &Args) -> Result<CollectorConfig> {
    let mut config = match &args.config {
        Some(path) => CollectorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CollectorConfig::default(),
    };

    if let Some(host) = &args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: CollectorConfig, mock: bool, dry_run: bool) -> Result<()> {
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

    let sink: Arc<dyn Sink> = match (&config.influxdb, dry_run) {
        (Some(influx), false) => {
            let sink = InfluxSink::new(influx)?;
            tracing::info!("Writing to {} (bucket {})", sink.endpoint(), sink.bucket());
            Arc::new(sink)
        }
        _ => {
            tracing::info!("Dry-run mode: points are logged, not written");
            Arc::new(DryRunSink::new())
        }
    };

    tracing::info!("fleetwire collector v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Subscriptions: {}", config.subscriptions.join(", "));
    tracing::info!("  Measurement: {}", config.measurement());
    tracing::info!(
        "  Batch: {} records / {} ms, {} retries every {} ms",
        config.batch.size,
        config.batch.flush_interval_ms,
        config.batch.max_retries,
        config.batch.retry_delay_ms
    );

    let collector = CollectorService::start(broker, &config, sink);

    let stats_period = (config.stats_interval_secs > 0)
        .then(|| Duration::from_secs(config.stats_interval_secs));

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutting down...");
        }
        _ = report_stats(&collector, stats_period) => {}
    }

    let stats = collector.shutdown().await?;
    tracing::info!("Final statistics:");
    log_stats(&stats);
    Ok(())
}

/// Log collector statistics every period. Never returns.
async fn report_stats(collector: &CollectorHandle, period: Option<Duration>) {
    let Some(period) = period else {
        return std::future::pending().await;
    };
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        log_stats(&collector.stats());
    }
}

fn log_stats(s: &CollectorStats) {
    tracing::info!(
        "[{}] {} received, {} malformed, {} pending, {} points in {} batches, {} dropped, {} retries",
        s.state,
        s.ingest.received,
        s.ingest.malformed,
        s.pending,
        s.writer.points_written,
        s.writer.batches_written,
        s.writer.points_dropped,
        s.writer.retries
    );
    if let Some(l) = &s.latency {
        tracing::info!(
            "transit latency over {} samples: min {:.1} ms, mean {:.1} ms, p50 {:.1} ms, p90 {:.1} ms, p99 {:.1} ms, max {:.1} ms ({} negative)",
            l.count,
            l.min_ms,
            l.mean_ms,
            l.p50_ms,
            l.p90_ms,
            l.p99_ms,
            l.max_ms,
            l.negative
        );
    }
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

fn cmd_gen_config(config: &CollectorConfig, output: PathBuf) -> Result<()> {
    let mut config = config.clone();
    if config.influxdb.is_none() {
        config.influxdb = Some(Default::default());
    }
    let yaml = serde_yaml::to_string(&config)?;
    let content = format!(
        "# fleetwire collector configuration\n# Generated by fleetwire-collector gen-config\n# Remove the influxdb block to run in dry-run mode\n\n{}",
        yaml
    );
    std::fs::write(&output, content).with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    match CollectorConfig::from_file(path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Broker: {}:{}", config.broker.host, config.broker.port);
            println!("Client id: {}", config.client_id());
            println!("Subscriptions: {}", config.subscriptions.join(", "));
            match &config.influxdb {
                Some(influx) => println!(
                    "InfluxDB: {} (org {}, bucket {})",
                    influx.url, influx.org, influx.bucket
                ),
                None => println!("InfluxDB: not configured (dry-run)"),
            }
            println!("Measurement: {}", config.measurement());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
