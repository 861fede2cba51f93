mod metrics;

pub use metrics::{MetricsSnapshot, RelayMetrics};

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};
use tuicub_settings::{LogFormat, LoggingSettings};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive. Overridden by RUST_LOG env var.
    pub log_level: String,
    pub format: LogFormat,
    /// Append to this file instead of writing to stdout.
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::Json,
            log_file: None,
        }
    }
}

impl From<&LoggingSettings> for TelemetryConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            log_level: settings.level.clone(),
            format: settings.format,
            log_file: settings.file.clone(),
        }
    }
}

/// Holds the relay counters for the lifetime of the process.
pub struct TelemetryGuard {
    metrics: Arc<RelayMetrics>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            published = snapshot.events_published,
            delivered = snapshot.events_delivered,
            auth_rejected = snapshot.auth_rejected,
            callbacks_dropped = snapshot.callbacks_dropped,
            "telemetry shut down"
        );
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let log_file = match &config.log_file {
        Some(path) => Some(open_log_file(path)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer(config.format, log_file).with_filter(env_filter))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    Ok(TelemetryGuard {
        metrics: Arc::new(RelayMetrics::new()),
    })
}

fn fmt_layer(
    format: LogFormat,
    log_file: Option<Arc<File>>,
) -> Box<dyn Layer<Registry> + Send + Sync> {
    match (format, log_file) {
        (LogFormat::Json, Some(file)) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(file)
            .boxed(),
        (LogFormat::Json, None) => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed(),
        (LogFormat::Pretty, Some(file)) => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .boxed(),
        (LogFormat::Pretty, None) => tracing_subscriber::fmt::layer().boxed(),
    }
}

fn open_log_file(path: &Path) -> Result<Arc<File>, TelemetryError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
        .map_err(|source| TelemetryError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}
