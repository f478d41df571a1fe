use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rescue_server::ServerConfig;
use rescue_telemetry::TelemetryConfig;
use tracing::Level;

/// Real-time relay for rescue teams, SOS alerts and facility updates.
#[derive(Parser, Debug)]
#[command(name = "rescue", version)]
struct Cli {
    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Address to bind (overrides BIND_ADDR).
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Additional origin allowed to open WebSocket connections. Repeatable.
    #[arg(long = "allow-origin", value_name = "ORIGIN")]
    allow_origins: Vec<String>,

    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Do not persist warnings and metric snapshots to SQLite.
    #[arg(long)]
    no_log_db: bool,

    /// Directory for the log and metrics databases (default: ~/.rescue).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::from_env().context("invalid server environment")?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        for origin in &self.allow_origins {
            config = config.with_origin(origin.clone());
        }
        Ok(config)
    }

    fn telemetry_config(&self) -> TelemetryConfig {
        let mut config = match &self.data_dir {
            Some(dir) => TelemetryConfig::under(dir.clone()),
            None => TelemetryConfig::default(),
        };
        config.log_level = self.log_level;
        config.json_logs = self.json_logs;
        config.persist = !self.no_log_db;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry = rescue_telemetry::init_telemetry(cli.telemetry_config());
    let _snapshots = telemetry.spawn_snapshot_task();

    let config = cli.server_config()?;
    let handle = rescue_server::start(config, telemetry.metrics())
        .await
        .context("failed to start rescue relay")?;
    tracing::info!(port = handle.port, "rescue relay ready");

    wait_for_signal().await?;
    tracing::info!("shutting down");
    handle.shutdown().await;

    if let Err(e) = telemetry.metrics().snapshot() {
        tracing::warn!(error = %e, "final metrics snapshot failed");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl+c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")
}
