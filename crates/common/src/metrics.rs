//! Metrics collection for MLServe
//!
//! This module provides Prometheus metrics for observability.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for MLServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub workers: WorkerMetrics,
}

/// Request-path metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of prediction requests
    pub predictions_total: IntCounter,

    /// Total number of successful predictions
    pub predictions_success: IntCounter,

    /// Total number of failed predictions
    pub predictions_failed: IntCounter,

    /// Requests rejected because no worker entry matched
    pub not_found_total: IntCounter,

    /// Predict duration histogram
    pub predict_duration: Histogram,

    /// Current in-flight predictions
    pub active_requests: IntGauge,

    /// Requests aborted by framing or connection errors
    pub transport_errors: IntCounter,
}

/// Worker registry metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Registered worker entries
    pub entries: IntGauge,

    /// Live handler instances across all entries
    pub instances: IntGauge,

    /// Successful worker entry creations
    pub created_total: IntCounter,

    /// Failed worker entry creations
    pub creation_failed_total: IntCounter,

    /// Handler load duration
    pub load_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("unique counter name");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("unique gauge name");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("unique histogram name");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests = RequestMetrics {
            predictions_total: counter(
                &registry,
                "mlserve_predictions_total",
                "Total number of prediction requests",
            ),
            predictions_success: counter(
                &registry,
                "mlserve_predictions_success_total",
                "Total number of successful prediction requests",
            ),
            predictions_failed: counter(
                &registry,
                "mlserve_predictions_failed_total",
                "Total number of failed prediction requests",
            ),
            not_found_total: counter(
                &registry,
                "mlserve_predictions_not_found_total",
                "Prediction requests for unregistered models",
            ),
            predict_duration: histogram(
                &registry,
                "mlserve_predict_duration_seconds",
                "Handler predict duration in seconds",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
            active_requests: gauge(
                &registry,
                "mlserve_active_requests",
                "Current number of in-flight predictions",
            ),
            transport_errors: counter(
                &registry,
                "mlserve_transport_errors_total",
                "Requests aborted by framing or connection errors",
            ),
        };

        let workers = WorkerMetrics {
            entries: gauge(
                &registry,
                "mlserve_worker_entries",
                "Registered (model_name, model_version) entries",
            ),
            instances: gauge(
                &registry,
                "mlserve_worker_instances",
                "Live handler instances across all entries",
            ),
            created_total: counter(
                &registry,
                "mlserve_worker_entries_created_total",
                "Worker entries created",
            ),
            creation_failed_total: counter(
                &registry,
                "mlserve_worker_entries_failed_total",
                "Worker entry creations that were rolled back",
            ),
            load_duration: histogram(
                &registry,
                "mlserve_handler_load_duration_seconds",
                "Archive unpack and handler construction duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            ),
        };

        MetricsRegistry {
            registry,
            requests,
            workers,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
