/*!
Observability infrastructure for Backstop.

- Structured logging through `tracing`, with JSON or human-readable output
- Prometheus metrics behind the `metrics` feature, gathered in text format so the
  CLI can drop them into a node-exporter textfile directory after each run
*/

#[cfg(feature = "metrics")]
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackupError, Result};

#[cfg(feature = "metrics")]
use crate::run::{BackupRun, RunStatus};

/// Directive applied when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "backstop=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Metrics collected across backup runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub runs_total: IntCounterVec,
    pub run_failures_total: IntCounter,
    pub partial_failures_total: IntCounter,
    pub artifact_size_bytes: Histogram,
    pub run_duration_seconds: Histogram,
    pub remote_uploads_total: IntCounterVec,
    pub remote_errors_total: IntCounterVec,
    pub retries_total: IntCounter,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(e: prometheus::Error) -> BackupError {
    BackupError::validation(format!("metrics registry error: {e}"))
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_total = IntCounterVec::new(
            Opts::new("backstop_runs_total", "Backup runs by terminal status"),
            &["status"],
        )
        .map_err(metric_error)?;
        let run_failures_total =
            IntCounter::new("backstop_run_failures_total", "Backup runs that ended in Failure")
                .map_err(metric_error)?;
        let partial_failures_total = IntCounter::new(
            "backstop_partial_failures_total",
            "Backup runs that ended in PartialFailure",
        )
        .map_err(metric_error)?;
        let artifact_size_bytes = Histogram::with_opts(
            HistogramOpts::new("backstop_artifact_size_bytes", "Size of stored artifacts in bytes")
                .buckets(prometheus::exponential_buckets(1024.0 * 1024.0, 4.0, 10).map_err(metric_error)?),
        )
        .map_err(metric_error)?;
        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("backstop_run_duration_seconds", "Wall time of backup runs")
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 16).map_err(metric_error)?),
        )
        .map_err(metric_error)?;
        let remote_uploads_total = IntCounterVec::new(
            Opts::new("backstop_remote_uploads_total", "Artifacts uploaded per remote tier"),
            &["tier"],
        )
        .map_err(metric_error)?;
        let remote_errors_total = IntCounterVec::new(
            Opts::new("backstop_remote_errors_total", "Failed remote operations per tier"),
            &["tier"],
        )
        .map_err(metric_error)?;
        let retries_total =
            IntCounter::new("backstop_retries_total", "Remote upload attempts beyond the first")
                .map_err(metric_error)?;

        registry.register(Box::new(runs_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(run_failures_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(partial_failures_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(artifact_size_bytes.clone())).map_err(metric_error)?;
        registry.register(Box::new(run_duration_seconds.clone())).map_err(metric_error)?;
        registry.register(Box::new(remote_uploads_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(remote_errors_total.clone())).map_err(metric_error)?;
        registry.register(Box::new(retries_total.clone())).map_err(metric_error)?;

        Ok(Self {
            runs_total,
            run_failures_total,
            partial_failures_total,
            artifact_size_bytes,
            run_duration_seconds,
            remote_uploads_total,
            remote_errors_total,
            retries_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static BackupMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize Backstop metrics"))
    }

    /// Record everything a finished run reports
    pub fn record_run(&self, run: &BackupRun) {
        self.runs_total
            .with_label_values(&[&run.status().to_string()])
            .inc();
        match run.status() {
            RunStatus::Failure => self.run_failures_total.inc(),
            RunStatus::PartialFailure => self.partial_failures_total.inc(),
            RunStatus::Success => {}
        }
        if let Some(artifact) = run.artifact() {
            self.artifact_size_bytes.observe(artifact.size_bytes() as f64);
        }
        let seconds = run.duration().num_milliseconds().max(0) as f64 / 1000.0;
        self.run_duration_seconds.observe(seconds);

        for report in run.sync_reports() {
            self.remote_uploads_total
                .with_label_values(&[&report.tier])
                .inc_by(report.uploaded.len() as u64);
            self.remote_errors_total
                .with_label_values(&[&report.tier])
                .inc_by(report.failed.len() as u64);
            self.retries_total.inc_by(report.retries as u64);
        }
        for report in run.prune_reports() {
            self.remote_errors_total
                .with_label_values(&[&report.tier])
                .inc_by(report.failed.len() as u64);
        }
    }

    /// Count a remote failure that produced no per-key report
    pub fn record_remote_error(&self, tier: &str) {
        self.remote_errors_total.with_label_values(&[tier]).inc();
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| BackupError::validation(format!("Failed to encode metrics: {e}")))
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise only `backstop` targets at `info` and
/// above are shown. `json` selects one JSON object per event, which is what log
/// shippers expect; the plain format is meant for terminals. Both write to stderr so
/// stdout stays free for command output.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with_directive(json, DEFAULT_LOG_DIRECTIVE)
}

/// Same as [`init_observability`] with a different fallback directive
pub fn init_observability_with_directive(json: bool, directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .map_err(|e| BackupError::validation(format!("invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| {
        BackupError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Backstop observability initialized");
    Ok(())
}
