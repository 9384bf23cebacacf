//! Prometheus metrics for the gateway.
//!
//! Counters and histograms are recorded through the `metrics` facade and are
//! no-ops until a recorder is installed. [`MetricsExporter`] installs the
//! Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use fluxgate_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

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

/// Prometheus recorder installation.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Create an exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe the gateway metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed. A
    /// recorder that is already installed (common in tests) is not an error.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "fluxgate_messages_produced_total",
        "Total number of messages acknowledged by the broker"
    );
    describe_counter!(
        "fluxgate_produce_errors_total",
        "Total number of failed publishes"
    );
    describe_histogram!(
        "fluxgate_produce_duration_seconds",
        "Time from send to broker acknowledgment"
    );
    describe_counter!(
        "fluxgate_messages_consumed_total",
        "Total number of consumed messages, labelled by outcome"
    );
    describe_counter!(
        "fluxgate_consume_errors_total",
        "Total number of consumer group errors seen by the supervisor"
    );
    describe_counter!(
        "fluxgate_rebalances_total",
        "Total number of consumer group generations started"
    );
}

/// Gateway metrics recorder.
pub struct GatewayMetrics;

impl GatewayMetrics {
    /// Record an acknowledged publish.
    pub fn record_produce(topic: &str, duration: Duration) {
        counter!("fluxgate_messages_produced_total", "topic" => topic.to_string()).increment(1);
        histogram!("fluxgate_produce_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_produce_error(topic: &str) {
        counter!("fluxgate_produce_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a consumed message and what the handler made of it.
    pub fn record_consume(topic: &str, outcome: &'static str) {
        counter!(
            "fluxgate_messages_consumed_total",
            "topic" => topic.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a consumer group error.
    pub fn record_consume_error() {
        counter!("fluxgate_consume_errors_total").increment(1);
    }

    /// Record the start of a generation.
    pub fn record_rebalance() {
        counter!("fluxgate_rebalances_total").increment(1);
    }
}
