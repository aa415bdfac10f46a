//! Request routing
//!
//! Transport-independent request handling shared by the gRPC service and the
//! multipart frame server. Every operation resolves against the worker
//! registry; predictions run on the blocking pool.

use mlserve_common::{MlServeError, Result, METRICS};
use mlserve_worker::{Payload, WorkerKey, WorkerRegistry, WorkerSummary};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Liveness answer returned by `Ping`
pub const HEALTHY: &str = "OK";

/// Successful prediction
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Entry that served the request
    pub key: WorkerKey,

    /// Handler output
    pub output: Payload,
}

/// Result of a worker creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorkers {
    pub key: WorkerKey,
    pub num_workers: usize,
}

/// Tracks one in-flight prediction in the active requests gauge
struct ActiveRequest;

impl ActiveRequest {
    fn start() -> Self {
        METRICS.requests.active_requests.inc();
        ActiveRequest
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        METRICS.requests.active_requests.dec();
    }
}

/// Parse a wire model version ("1", " 2 ")
pub fn parse_model_version(version: &str) -> Result<u32> {
    let trimmed = version.trim();
    match trimmed.parse::<u32>() {
        Ok(v) if v >= 1 => Ok(v),
        _ => Err(MlServeError::invalid_input(format!(
            "model_version `{}` is not a positive integer",
            version
        ))),
    }
}

/// Routes requests to worker entries
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<WorkerRegistry>,
}

impl Router {
    /// Create a router over `registry`
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self { registry }
    }

    /// Underlying worker registry
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Liveness check; never touches the registry
    pub fn ping(&self) -> &'static str {
        HEALTHY
    }

    /// Run a prediction on the next worker of `(model_name, model_version)`
    pub async fn predict(
        &self,
        model_name: &str,
        model_version: &str,
        input: Payload,
    ) -> Result<Prediction> {
        METRICS.requests.predictions_total.inc();
        let result = self.dispatch(model_name, model_version, input).await;
        match &result {
            Ok(_) => METRICS.requests.predictions_success.inc(),
            Err(MlServeError::NotFound(_)) => {
                METRICS.requests.not_found_total.inc();
                METRICS.requests.predictions_failed.inc();
            }
            Err(_) => METRICS.requests.predictions_failed.inc(),
        }
        result
    }

    async fn dispatch(
        &self,
        model_name: &str,
        model_version: &str,
        input: Payload,
    ) -> Result<Prediction> {
        let version = parse_model_version(model_version)?;
        let entry = self.registry.lookup(model_name, version).await?;
        let key = entry.key().clone();

        let _active = ActiveRequest::start();
        let start = Instant::now();
        let output = tokio::task::spawn_blocking(move || entry.predict(input))
            .await
            .map_err(|e| {
                warn!("Predict task for {} failed: {}", key, e);
                MlServeError::predict(format!("handler for {} aborted: {}", key, e))
            })??;
        let elapsed = start.elapsed();
        METRICS.requests.predict_duration.observe(elapsed.as_secs_f64());

        debug!(
            "Prediction for {} returned {} field(s) in {:?}",
            key,
            output.len(),
            elapsed
        );
        Ok(Prediction { key, output })
    }

    /// Create a worker entry from the archive at `model_path`
    pub async fn create_model_worker(
        &self,
        model_name: &str,
        model_path: &str,
        num_workers: u32,
    ) -> Result<CreatedWorkers> {
        if model_path.trim().is_empty() {
            return Err(MlServeError::invalid_input("model_path must not be empty"));
        }

        info!(
            "Creating {} worker(s) for {} from {}",
            num_workers, model_name, model_path
        );
        let key = self
            .registry
            .create_workers(model_name, Path::new(model_path), num_workers as usize)
            .await?;
        let entry = self.registry.lookup(&key.model_name, key.model_version).await?;

        Ok(CreatedWorkers {
            num_workers: entry.len(),
            key,
        })
    }

    /// Evict the entry for `(model_name, model_version)`; idempotent
    pub async fn evict_model_worker(&self, model_name: &str, model_version: &str) -> Result<bool> {
        let version = parse_model_version(model_version)?;
        Ok(self.registry.evict(model_name, version).await)
    }

    /// Registered entries
    pub async fn list(&self) -> Vec<WorkerSummary> {
        self.registry.list().await
    }
}
