//! Prometheus exporter for KEBA KeContact charging stations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::builder::BoolishValueParser;
use tokio::sync::watch;
use tracing::{info, warn};

use keba_exporter_prometheus::{CliOverrides, ExporterConfig, GaugeRegistry, HttpServer};
use keba_modbus::{PollingEngine, RegisterTable, TcpTransport, TokioClock};

/// Prometheus exporter for KEBA KeContact charging stations.
#[derive(Parser, Debug)]
#[command(name = "keba-exporter-prometheus")]
#[command(about = "Export KEBA charging station registers as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// Charging station IP address or host name.
    #[arg(long, env = "wallboxName")]
    host: Option<String>,

    /// Charging station Modbus/TCP port [default: 502].
    #[arg(long, env = "wallboxPort")]
    port: Option<u16>,

    /// Enable debug logging.
    #[arg(long, env = "debug", value_parser = BoolishValueParser::new())]
    debug: bool,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            host: self.host.clone(),
            port: self.port,
            debug: self.debug,
            listen: self.listen.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => ExporterConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => ExporterConfig::default(),
    };
    config.apply(args.overrides());

    keba_common::init_tracing(&config.logging)?;

    info!("Starting KEBA Prometheus Exporter");
    info!(
        wallbox_name = %config.device.host,
        wallbox_port = config.device.port,
        debug = args.debug,
        listen = %config.prometheus.listen,
        "Configuration"
    );

    config.validate().context("Invalid configuration")?;
    let listen_addr = config.listen_addr()?;

    let table = RegisterTable::keba();
    let registry = Arc::new(GaugeRegistry::new(&table, &config.prometheus.prefix));

    let engine = PollingEngine::new(
        config.engine_config(),
        table,
        TcpTransport::new(config.device.connect_timeout()),
        registry.clone(),
        TokioClock,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );
    let mut http_task = tokio::spawn(http_server.run(shutdown_rx));

    let outcome = tokio::select! {
        result = engine.run_forever() => match result {
            Ok(never) => match never {},
            Err(e) => Err(anyhow::Error::new(e).context("Polling stopped")),
        },
        result = &mut http_task => {
            return match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("HTTP server stopped unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
        _ = shutdown_signal() => Ok(()),
    };

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), http_task).await;

    let status = registry.status();
    info!(
        cycles_completed = status.cycles_completed,
        values_published = status.values_published,
        "Final statistics"
    );

    info!("Exporter stopped");
    outcome
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
