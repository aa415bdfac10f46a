//! MLServe Server - Main Entry Point
//!
//! Preloads the configured model archives and serves them over gRPC and,
//! when enabled, the multipart frame protocol.

use mlserve_common::{ModelConfig, Result, ServerConfig, METRICS};
use mlserve_server::{service, Router};
use mlserve_worker::{Archive, HandlerLoader, HandlerRegistry, WorkerRegistry};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("mlserve_server={level},mlserve_worker={level},mlserve_common={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting MLServe Server");
    info!(
        "Configuration loaded: bind={}, grpc_port={}, multipart_port={:?}",
        config.bind_address, config.grpc_port, config.multipart_port
    );

    let handlers = HandlerRegistry::with_builtins();
    info!("Registered handlers: {}", handlers.identifiers().join(", "));
    let registry = Arc::new(
        WorkerRegistry::new(HandlerLoader::new(handlers))
            .with_max_workers(config.max_workers_per_model),
    );

    for model in config.preload_models() {
        if let Err(e) = preload(&registry, &model).await {
            error!("Failed to preload {}: {}", model.model_path.display(), e);
        }
    }

    let router = Arc::new(Router::new(registry.clone()));

    // Run until ctrl-c or until a server stops on its own
    let outcome = service::run(router, &config, async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await;

    let released = registry.clear().await;
    info!("Released {} worker entr(ies)", released);

    if config.observability.enable_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }

    match &outcome {
        Ok(()) => info!("MLServe Server shutdown complete"),
        Err(e) => error!("MLServe Server stopped: {}", e),
    }
    outcome
}

/// Create workers for one configured archive
async fn preload(registry: &WorkerRegistry, model: &ModelConfig) -> Result<()> {
    let model_name = match &model.model_name {
        Some(name) => name.clone(),
        None => Archive::open(&model.model_path)?.manifest().model_name.clone(),
    };
    let key = registry
        .create_workers(&model_name, &model.model_path, model.num_workers as usize)
        .await?;
    info!("Preloaded {} from {}", key, model.model_path.display());
    Ok(())
}
