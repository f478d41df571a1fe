mod logging;
pub mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{MetricType, MetricsQuery, MetricsSnapshot, RelayMetrics};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for logging and metrics.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "rescue_server::relay" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit stdout logs as JSON lines.
    pub json_logs: bool,
    /// Persist WARN+ events and metric snapshots to SQLite.
    pub persist: bool,
    pub log_db_path: PathBuf,
    pub metrics_db_path: PathBuf,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::under(default_data_dir())
    }
}

impl TelemetryConfig {
    /// Defaults with both databases placed in `data_dir`.
    pub fn under(data_dir: PathBuf) -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_logs: false,
            persist: true,
            log_db_path: data_dir.join("logs.db"),
            metrics_db_path: data_dir.join("metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }

    fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Handles kept alive for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<RelayMetrics>,
    snapshot_interval: Duration,
    retention_days: u32,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    /// Periodically persist metric snapshots and prune old ones.
    pub fn spawn_snapshot_task(&self) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(&self.metrics);
        let interval = self.snapshot_interval;
        let retention_days = self.retention_days;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = metrics.snapshot() {
                    tracing::warn!(error = %e, "metrics snapshot failed");
                }
                if let Err(e) = metrics.prune(retention_days) {
                    tracing::warn!(error = %e, "metrics prune failed");
                }
            }
        })
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, log_sink) = if config.persist {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("rescue-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    let metrics = open_metrics(&config);

    TelemetryGuard {
        log_sink,
        metrics,
        snapshot_interval: Duration::from_secs(config.metrics_snapshot_interval_secs.max(1)),
        retention_days: config.metrics_retention_days,
    }
}

fn open_metrics(config: &TelemetryConfig) -> Arc<RelayMetrics> {
    if !config.persist {
        return Arc::new(RelayMetrics::detached());
    }
    match RelayMetrics::new(&config.metrics_db_path) {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::warn!(error = %e, "failed to open metrics DB, snapshots disabled");
            Arc::new(RelayMetrics::detached())
        }
    }
}

/// `$HOME/.rescue`, falling back to `/tmp/.rescue`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".rescue")
}
