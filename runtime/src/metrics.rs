//! Prometheus metrics for sell attempts, runs and setup retries.
//!
//! Metrics are a side channel: recording never feeds back into any decision.
//! Without an installed recorder every call here is a no-op.
//!
//! # Example
//!
//! ```rust,no_run
//! use vouchers_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = MetricsRecorder::install()?;
//! // ... run workloads ...
//! println!("{}", recorder.render());
//! # Ok(())
//! # }
//! ```

use crate::report::{AttemptClass, RunReport};
use crate::strategy::Strategy;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Handle to the process-wide Prometheus recorder.
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// Install a Prometheus recorder as the global recorder.
    ///
    /// # Errors
    ///
    /// Returns `Install` if a global recorder is already installed.
    pub fn install() -> Result<Self, MetricsError> {
        let recorder = builder()?.build_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        register_metrics();
        tracing::debug!("Metrics recorder installed");
        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Exporter configuration shared by the global and test recorders.
///
/// # Errors
///
/// Returns `Build` if the histogram buckets are rejected.
pub fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[
                0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "vouchers_sell_attempts_total",
        "Sell attempts by strategy and outcome"
    );
    describe_histogram!(
        "vouchers_sell_duration_seconds",
        "Latency of one sell attempt, any outcome"
    );
    describe_counter!("vouchers_runs_total", "Completed load runs");
    describe_histogram!(
        "vouchers_run_duration_seconds",
        "Wall-clock duration of a load run"
    );
    describe_gauge!(
        "vouchers_run_ambiguous",
        "Ambiguous attempts in the latest run"
    );
    describe_counter!(
        "vouchers_setup_retries_total",
        "Retries of idempotent setup operations"
    );
    describe_counter!(
        "vouchers_setup_retries_exhausted_total",
        "Setup operations that failed after every retry"
    );
}

/// Sell attempt and run metrics recorder.
pub struct SellMetrics;

impl SellMetrics {
    /// Record one classified attempt and its latency.
    pub fn record_attempt(strategy: Strategy, class: AttemptClass, latency: Duration) {
        counter!(
            "vouchers_sell_attempts_total",
            "strategy" => strategy.as_str(),
            "outcome" => class.label()
        )
        .increment(1);
        histogram!("vouchers_sell_duration_seconds", "strategy" => strategy.as_str())
            .record(latency.as_secs_f64());
    }

    /// Record a completed run.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_run(report: &RunReport) {
        let strategy = report.strategy.as_str();
        counter!("vouchers_runs_total", "strategy" => strategy).increment(1);
        histogram!("vouchers_run_duration_seconds", "strategy" => strategy)
            .record(Duration::from_millis(report.elapsed_ms).as_secs_f64());
        gauge!("vouchers_run_ambiguous", "strategy" => strategy)
            .set(report.aggregate.ambiguous() as f64);
    }
}

/// Setup retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry of `operation`.
    pub fn record_retry(operation: &'static str) {
        counter!("vouchers_setup_retries_total", "operation" => operation).increment(1);
    }

    /// Record that `operation` failed after its last retry.
    pub fn record_exhausted(operation: &'static str) {
        counter!("vouchers_setup_retries_exhausted_total", "operation" => operation)
            .increment(1);
    }
}
