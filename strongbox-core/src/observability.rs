/*!
Observability for the backup engine: tracing subscriber setup and, with the
`metrics` feature, Prometheus counters for backup, restore and retention runs.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

/// Filter directive applied when `RUST_LOG` is not set
pub const DEFAULT_LOG_DIRECTIVE: &str = "strongbox=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Prometheus metrics for backup operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub backups_total: Counter,
    pub backup_failures_total: Counter,
    pub restores_total: Counter,
    pub retention_deleted_total: Counter,
    pub backup_duration_seconds: Histogram,
    pub archive_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| BackupError::observability(format!("Failed to create {name}: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| BackupError::observability(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| BackupError::observability(format!("Failed to create {name}: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| BackupError::observability(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_total = counter(
            &registry,
            "strongbox_backups_total",
            "Total backup runs that produced an archive",
        )?;
        let backup_failures_total = counter(
            &registry,
            "strongbox_backup_failures_total",
            "Total backup runs that failed",
        )?;
        let restores_total = counter(
            &registry,
            "strongbox_restores_total",
            "Total completed restores",
        )?;
        let retention_deleted_total = counter(
            &registry,
            "strongbox_retention_deleted_total",
            "Total backups removed by retention",
        )?;
        let backup_duration_seconds = histogram(
            &registry,
            HistogramOpts::new(
                "strongbox_backup_duration_seconds",
                "Duration of backup runs in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        )?;
        let archive_size_bytes = histogram(
            &registry,
            HistogramOpts::new("strongbox_archive_size_bytes", "Size of backup archives")
                .buckets(prometheus::exponential_buckets(1024.0, 8.0, 9).map_err(|e| {
                    BackupError::observability(format!("Invalid size buckets: {e}"))
                })?),
        )?;

        Ok(Self {
            backups_total,
            backup_failures_total,
            restores_total,
            retention_deleted_total,
            backup_duration_seconds,
            archive_size_bytes,
            registry,
        })
    }

    /// Global metrics instance, `None` if the registry could not be built
    pub fn global() -> Option<&'static BackupMetrics> {
        if let Some(metrics) = METRICS.get() {
            return Some(metrics);
        }
        match Self::new() {
            Ok(metrics) => Some(METRICS.get_or_init(|| metrics)),
            Err(e) => {
                tracing::error!("Failed to initialize backup metrics: {}", e);
                None
            }
        }
    }

    pub fn record_backup(&self, duration: std::time::Duration, size_bytes: u64) {
        self.backups_total.inc();
        self.backup_duration_seconds.observe(duration.as_secs_f64());
        self.archive_size_bytes.observe(size_bytes as f64);
    }

    pub fn record_backup_failure(&self, duration: std::time::Duration) {
        self.backup_failures_total.inc();
        self.backup_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_restore(&self) {
        self.restores_total.inc();
    }

    pub fn record_retention(&self, removed: usize) {
        self.retention_deleted_total.inc_by(removed as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| BackupError::observability(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            BackupError::observability(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise [`DEFAULT_LOG_DIRECTIVE`] applies.
/// With `json` set, events are written as one JSON object per line.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_DIRECTIVE))
        .map_err(|e| BackupError::observability(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        BackupError::observability(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("Strongbox observability initialized");
    Ok(())
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metrics_recording() {
        let metrics = BackupMetrics::global().unwrap();
        metrics.record_backup(Duration::from_secs(3), 4096);
        metrics.record_backup_failure(Duration::from_millis(20));
        metrics.record_restore();
        metrics.record_retention(2);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("strongbox_backups_total"));
        assert!(text.contains("strongbox_retention_deleted_total"));
        assert!(text.contains("strongbox_archive_size_bytes"));
    }
}
