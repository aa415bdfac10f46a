//! Server lifecycle
//!
//! Binds every configured endpoint up front, then runs the servers until the
//! shutdown future resolves or one of them stops on its own.

use crate::grpc;
use crate::multipart::MultipartServer;
use crate::router::Router;
use mlserve_common::{MlServeError, Result, ServerConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

type ServerTask = Option<JoinHandle<Result<()>>>;

/// Run the gRPC and (optional) multipart servers
///
/// Bind failures are returned before anything is spawned. A server that
/// stops before `shutdown` resolves stops the other one and is reported as
/// an error.
pub async fn run<F>(router: Arc<Router>, config: &ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let grpc_listener = bind("gRPC", config.grpc_addr()?).await?;
    let multipart_listener = match config.multipart_addr()? {
        Some(addr) => Some(bind("multipart", addr).await?),
        None => {
            info!("Multipart server disabled");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut grpc_task: ServerTask = Some(tokio::spawn(grpc::serve_with_listener(
        router.clone(),
        grpc_listener,
        wait_for_shutdown(shutdown_rx.clone()),
    )));
    let mut multipart_task: ServerTask = multipart_listener.map(|listener| {
        let server = MultipartServer::new(router.clone(), config.max_frame_bytes);
        tokio::spawn(server.serve(listener, wait_for_shutdown(shutdown_rx.clone())))
    });

    info!("MLServe Server running");

    let outcome = tokio::select! {
        _ = shutdown => {
            info!("Received shutdown signal");
            Ok(())
        }
        result = watch_task(&mut grpc_task) => stopped_early("gRPC", result),
        result = watch_task(&mut multipart_task) => stopped_early("Multipart", result),
    };

    let _ = shutdown_tx.send(true);
    for (name, task) in [("gRPC", grpc_task), ("Multipart", multipart_task)] {
        if let Some(handle) = task {
            if let Err(e) = join(handle).await {
                error!("{} server error: {}", name, e);
            }
        }
    }

    outcome
}

async fn bind(name: &str, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|e| {
        MlServeError::config(format!("failed to bind {} endpoint {}: {}", name, addr, e))
    })
}

/// Resolve when the task in `slot` finishes, clearing the slot; never resolves for an empty slot
async fn watch_task(slot: &mut ServerTask) -> Result<()> {
    let result = match slot.as_mut() {
        Some(handle) => flatten(handle.await),
        None => return std::future::pending().await,
    };
    *slot = None;
    result
}

fn stopped_early(name: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            warn!("{} server stopped before shutdown", name);
            Err(MlServeError::internal(format!(
                "{} server stopped before shutdown",
                name
            )))
        }
        Err(e) => {
            error!("{} server failed: {}", name, e);
            Err(e)
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    flatten(handle.await)
}

fn flatten(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.map_err(|e| MlServeError::internal(format!("server task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlserve_worker::WorkerRegistry;
    use std::time::Duration;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(Arc::new(WorkerRegistry::default())))
    }

    fn local_config(grpc_port: u16, multipart_port: Option<u16>) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            grpc_port,
            multipart_port,
            ..ServerConfig::default()
        }
    }

    /// Two distinct ports that were free a moment ago
    async fn free_ports() -> (u16, u16) {
        let a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
    }

    #[tokio::test]
    async fn test_taken_grpc_port_fails_startup() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(taken.local_addr().unwrap().port(), None);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(router(), &config, std::future::pending::<()>()),
        )
        .await
        .expect("startup should fail instead of running");
        match result {
            Err(MlServeError::Config(msg)) => assert!(msg.contains("gRPC")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_taken_multipart_port_fails_startup() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (grpc_port, _) = free_ports().await;
        let config = local_config(grpc_port, Some(taken.local_addr().unwrap().port()));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run(router(), &config, std::future::pending::<()>()),
        )
        .await
        .expect("startup should fail instead of running");
        assert!(matches!(result, Err(MlServeError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_both_servers() {
        let (grpc_port, multipart_port) = free_ports().await;
        let config = local_config(grpc_port, Some(multipart_port));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn({
            let config = config.clone();
            async move {
                run(router(), &config, async move {
                    let _ = rx.await;
                })
                .await
            }
        });

        // Both endpoints accept connections while running
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::net::TcpStream::connect(config.grpc_addr().unwrap()).await.unwrap();
        tokio::net::TcpStream::connect(config.multipart_addr().unwrap().unwrap())
            .await
            .unwrap();

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
