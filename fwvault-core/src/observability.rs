/*!
Observability infrastructure for the backup engine.

- Structured logging through a global `tracing-subscriber` registry
- Prometheus counters and histograms behind the `metrics` feature

The `record_*` helpers are always callable; without the `metrics` feature
they compile to nothing.
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::job::JobState;
use crate::{Result, VaultError};

/// Global metrics instance; `None` if registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackupMetrics>> = OnceLock::new();

/// Metrics collection for backup and restore operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub jobs_total: Counter,
    pub job_failures_total: Counter,
    pub job_retries_total: Counter,
    pub drift_detected_total: Counter,
    pub restores_total: Counter,
    pub restore_failures_total: Counter,
    pub job_duration_seconds: Histogram,
    pub snapshot_size_bytes: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| VaultError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| VaultError::config(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| VaultError::config(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| VaultError::config(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            jobs_total: counter(&registry, "fwvault_jobs_total", "Backup jobs started")?,
            job_failures_total: counter(
                &registry,
                "fwvault_job_failures_total",
                "Backup jobs that ended failed or aborted",
            )?,
            job_retries_total: counter(
                &registry,
                "fwvault_job_retries_total",
                "Transport attempts retried after a transient error",
            )?,
            drift_detected_total: counter(
                &registry,
                "fwvault_drift_detected_total",
                "Snapshots whose normalized content differed from their predecessor",
            )?,
            restores_total: counter(&registry, "fwvault_restores_total", "Restores attempted")?,
            restore_failures_total: counter(
                &registry,
                "fwvault_restore_failures_total",
                "Restores that were rejected or failed",
            )?,
            job_duration_seconds: histogram(
                &registry,
                HistogramOpts::new("fwvault_job_duration_seconds", "Backup job wall time")
                    .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            )?,
            snapshot_size_bytes: histogram(
                &registry,
                HistogramOpts::new("fwvault_snapshot_size_bytes", "Raw configuration size")
                    .buckets(prometheus::exponential_buckets(1024.0, 4.0, 8).unwrap_or_default()),
            )?,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static BackupMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!("Metrics disabled: {e}");
                    None
                }
            })
            .as_ref()
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| VaultError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| VaultError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn with_metrics(f: impl FnOnce(&BackupMetrics)) {
    if let Some(metrics) = BackupMetrics::global() {
        f(metrics);
    }
}

pub fn record_job_started() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.jobs_total.inc());
}

pub fn record_job_finished(state: JobState, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.job_duration_seconds.observe(elapsed.as_secs_f64());
        if state != JobState::Succeeded {
            m.job_failures_total.inc();
        }
    });
    #[cfg(not(feature = "metrics"))]
    let _ = (state, elapsed);
}

pub fn record_retry() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.job_retries_total.inc());
}

pub fn record_drift() {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.drift_detected_total.inc());
}

pub fn record_snapshot_size(bytes: usize) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| m.snapshot_size_bytes.observe(bytes as f64));
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

pub fn record_restore(succeeded: bool) {
    #[cfg(feature = "metrics")]
    with_metrics(|m| {
        m.restores_total.inc();
        if !succeeded {
            m.restore_failures_total.inc();
        }
    });
    #[cfg(not(feature = "metrics"))]
    let _ = succeeded;
}

/// Render the metrics registry, if metrics are compiled in
pub fn gather_metrics() -> Result<Option<String>> {
    #[cfg(feature = "metrics")]
    let rendered = BackupMetrics::global()
        .map(BackupMetrics::gather_metrics)
        .transpose();
    #[cfg(not(feature = "metrics"))]
    let rendered = Ok(None);
    rendered
}

/// Log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Initialize the global observability system
///
/// Installs an `EnvFilter` (`RUST_LOG` wins; otherwise `fwvault=info`, or
/// `fwvault=debug` when `verbose`) and a JSON or human-readable formatter.
/// Calling it twice is an error.
pub fn init_observability(format: LogFormat, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let directive = if verbose { "fwvault=debug" } else { "fwvault=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .map_err(|e| VaultError::config(format!("Invalid log filter: {e}")))?;

    let result = match format {
        LogFormat::Json => set_global_default(
            TracingRegistry::default().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            ),
        ),
        LogFormat::Pretty => set_global_default(
            TracingRegistry::default().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .with_target(verbose)
                    .with_writer(std::io::stderr),
            ),
        ),
    };
    result.map_err(|e| {
        VaultError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("fwvault observability initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_helpers_never_panic() {
        record_job_started();
        record_retry();
        record_drift();
        record_snapshot_size(4096);
        record_job_finished(JobState::Failed, Duration::from_millis(250));
        record_restore(false);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_job_started();
        record_drift();
        let text = gather_metrics().unwrap().unwrap();
        assert!(text.contains("fwvault_jobs_total"));
        assert!(text.contains("fwvault_drift_detected_total"));
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_gather_without_metrics_feature() {
        assert!(gather_metrics().unwrap().is_none());
    }
}
