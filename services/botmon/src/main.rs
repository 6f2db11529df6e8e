use anyhow::{bail, Context, Result};
use botmon::{ClickHouseSink, Config, Monitor, Sink, Update};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Run mode selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Create the tables and exit
    Init,
    /// Read newline-delimited JSON updates from stdin
    Ingest,
}

impl Mode {
    fn from_args() -> Result<Self> {
        match std::env::args().nth(1).as_deref() {
            None | Some("ingest") => Ok(Mode::Ingest),
            Some("init") => Ok(Mode::Init),
            Some(other) => bail!("Unknown mode '{}', expected 'ingest' or 'init'", other),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mode = Mode::from_args()?;
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level, config.service.json_logs);

    info!(
        service = %config.service.name,
        mode = ?mode,
        clickhouse = %config.clickhouse.url,
        "Starting botmon"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    match mode {
        Mode::Init => init_schema(&config).await,
        Mode::Ingest => ingest(&config).await,
    }
}

async fn init_schema(config: &Config) -> Result<()> {
    let sink = ClickHouseSink::new(&config.clickhouse, config.monitor.tables.clone());
    sink.prepare()
        .await
        .context("Failed to prepare ClickHouse schema")?;

    info!("Schema initialized");
    Ok(())
}

async fn ingest(config: &Config) -> Result<()> {
    let monitor = Monitor::connect(config)
        .await
        .context("Failed to start monitor")?;

    tokio::select! {
        result = read_updates(&monitor) => {
            result?;
            monitor.flush().await?;
        }
        _ = shutdown_signal() => {}
    }

    monitor.close().await?;

    let stats = monitor.stats();
    info!(
        enqueued = stats.records_enqueued,
        skipped = stats.records_skipped,
        persisted = stats.rows_persisted,
        dropped = stats.rows_dropped,
        flushes = stats.flushes,
        "Botmon stopped"
    );

    Ok(())
}

/// Submit every update read from stdin until EOF
async fn read_updates(monitor: &Monitor) -> Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Update>(&line) {
            Ok(update) => {
                monitor.submit(&update).await;
            }
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed update");
                monitor
                    .warn(
                        "malformed update",
                        Some(serde_json::json!({ "line": line_no, "error": e.to_string() })),
                    )
                    .await;
            }
        }
    }

    info!(lines = line_no, "Input exhausted");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
