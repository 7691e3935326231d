//! Prometheus metrics for job throughput, failures and latency.
//!
//! Recording goes through the `metrics` facade, so every call is a no-op until
//! [`init_metrics`] installs a recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use jobforge_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::record_enqueued("default", "send_email");
//! JobMetrics::record_completed("default", "send_email", 0.125);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Labels added to every metric
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the buckets are empty or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("jobforge_jobs_enqueued_total", "Jobs accepted by the queue");
    describe_counter!(
        "jobforge_jobs_completed_total",
        "Jobs whose handler returned a result"
    );
    describe_counter!(
        "jobforge_jobs_failed_total",
        "Jobs that failed after exhausting retries"
    );
    describe_counter!("jobforge_jobs_retried_total", "Failed attempts that were retried");
    describe_counter!(
        "jobforge_jobs_timed_out_total",
        "Attempts that exceeded their deadline"
    );
    describe_histogram!(
        "jobforge_job_duration_seconds",
        "Duration of a single job attempt in seconds"
    );
    describe_gauge!("jobforge_jobs_in_flight", "Attempts currently executing");
    describe_counter!(
        "jobforge_jobs_promoted_total",
        "Scheduled jobs promoted to pending"
    );
    describe_counter!("jobforge_errors_total", "Errors constructed by code and category");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_enqueued(queue: &str, job_name: &str) {
        counter!(
            "jobforge_jobs_enqueued_total",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
        )
        .increment(1);
    }

    /// Record the start of an attempt.
    pub fn record_started(queue: &str) {
        gauge!("jobforge_jobs_in_flight", "queue" => queue.to_string()).increment(1.0);
    }

    /// Record a successful attempt.
    pub fn record_completed(queue: &str, job_name: &str, duration_seconds: f64) {
        counter!(
            "jobforge_jobs_completed_total",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
        )
        .increment(1);
        Self::record_finished(queue, job_name, "completed", duration_seconds);
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retried(queue: &str, job_name: &str, duration_seconds: f64) {
        counter!(
            "jobforge_jobs_retried_total",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
        )
        .increment(1);
        Self::record_finished(queue, job_name, "retrying", duration_seconds);
    }

    /// Record a terminal failure.
    pub fn record_failed(queue: &str, job_name: &str, error_kind: &str, duration_seconds: f64) {
        counter!(
            "jobforge_jobs_failed_total",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
            "kind" => error_kind.to_string(),
        )
        .increment(1);
        Self::record_finished(queue, job_name, "failed", duration_seconds);
    }

    pub fn record_timed_out(queue: &str, job_name: &str) {
        counter!(
            "jobforge_jobs_timed_out_total",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
        )
        .increment(1);
    }

    pub fn record_promoted(queue: &str, count: usize) {
        counter!("jobforge_jobs_promoted_total", "queue" => queue.to_string())
            .increment(count as u64);
    }

    fn record_finished(queue: &str, job_name: &str, outcome: &'static str, duration_seconds: f64) {
        histogram!(
            "jobforge_job_duration_seconds",
            "queue" => queue.to_string(),
            "job" => job_name.to_string(),
            "outcome" => outcome,
        )
        .record(duration_seconds);
        gauge!("jobforge_jobs_in_flight", "queue" => queue.to_string()).decrement(1.0);
    }
}
