//! gRPC inference service

use crate::router::Router;
use mlserve_common::{MlServeError, Result};
use mlserve_proto::{
    CreateModelWorkerRequest, CreateModelWorkerResponse, EvictModelWorkerRequest,
    EvictModelWorkerResponse, Inference, InferenceServer, PingResponse, PredictionResponse,
    PredictionsRequest,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `predict.Inference` implementation backed by a [`Router`]
#[derive(Debug, Clone)]
pub struct InferenceService {
    router: Arc<Router>,
}

impl InferenceService {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Wrap into a tonic server
    pub fn into_server(self) -> InferenceServer<Self> {
        InferenceServer::new(self)
    }
}

fn status(err: MlServeError) -> Status {
    match &err {
        MlServeError::NotFound(_) | MlServeError::InvalidInput(_) => debug!("Request rejected: {}", err),
        _ => warn!("Request failed: {}", err),
    }
    err.to_status()
}

#[tonic::async_trait]
impl Inference for InferenceService {
    async fn ping(&self, _request: Request<()>) -> std::result::Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            health: self.router.ping().to_string(),
        }))
    }

    async fn predictions(
        &self,
        request: Request<PredictionsRequest>,
    ) -> std::result::Result<Response<PredictionResponse>, Status> {
        let request = request.into_inner();
        let sequence_id = Uuid::new_v4().to_string();
        debug!(
            "Predictions {} for {}:{}",
            sequence_id, request.model_name, request.model_version
        );

        let prediction = self
            .router
            .predict(&request.model_name, &request.model_version, request.input)
            .await
            .map_err(status)?;

        Ok(Response::new(PredictionResponse {
            prediction: prediction.output,
            model_name: prediction.key.model_name,
            model_version: prediction.key.model_version.to_string(),
            sequence_id: Some(sequence_id),
        }))
    }

    async fn create_model_worker(
        &self,
        request: Request<CreateModelWorkerRequest>,
    ) -> std::result::Result<Response<CreateModelWorkerResponse>, Status> {
        let request = request.into_inner();
        let created = self
            .router
            .create_model_worker(&request.model_name, &request.model_path, request.num_workers)
            .await
            .map_err(status)?;

        Ok(Response::new(CreateModelWorkerResponse {
            status: "OK".to_string(),
            model_name: created.key.model_name,
            model_version: created.key.model_version,
            num_workers: created.num_workers as u32,
        }))
    }

    async fn evict_model_worker(
        &self,
        request: Request<EvictModelWorkerRequest>,
    ) -> std::result::Result<Response<EvictModelWorkerResponse>, Status> {
        let request = request.into_inner();
        let evicted = self
            .router
            .evict_model_worker(&request.model_name, &request.model_version)
            .await
            .map_err(status)?;

        Ok(Response::new(EvictModelWorkerResponse {
            status: "OK".to_string(),
            evicted,
        }))
    }
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_with_listener<F>(router: Arc<Router>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!("gRPC server listening on {}", listener.local_addr()?);
    tonic::transport::Server::builder()
        .add_service(InferenceService::new(router).into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    info!("gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{echo_archive, faulty_input, faulty_router};
    use mlserve_proto::InferenceClient;
    use mlserve_worker::{Payload, WorkerRegistry};
    use tonic::transport::Channel;
    use tonic::Code;

    async fn start(router: Arc<Router>) -> (InferenceClient<Channel>, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve_with_listener(router, listener, async move {
            let _ = rx.await;
        }));
        let client = InferenceClient::connect(format!("http://{}", addr)).await.unwrap();
        (client, tx)
    }

    fn empty_router() -> Arc<Router> {
        Arc::new(Router::new(Arc::new(WorkerRegistry::default())))
    }

    fn predictions(name: &str, version: &str, text: &str) -> PredictionsRequest {
        PredictionsRequest {
            model_name: name.to_string(),
            model_version: version.to_string(),
            input: Payload::from([("text".to_string(), text.as_bytes().to_vec())]),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let (mut client, _shutdown) = start(empty_router()).await;
        let response = client.ping(()).await.unwrap().into_inner();
        assert_eq!(response.health, "OK");
    }

    #[tokio::test]
    async fn test_predictions_unknown_model_is_not_found() {
        let (mut client, _shutdown) = start(empty_router()).await;
        let status = client
            .predictions(predictions("ghost", "1", "x"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = client
            .predictions(predictions("ghost", "one", "x"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_predict_evict() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo");
        let (mut client, _shutdown) = start(empty_router()).await;

        let created = client
            .create_model_worker(CreateModelWorkerRequest {
                model_name: "demo".to_string(),
                model_path: archive.to_string_lossy().into_owned(),
                num_workers: 1,
            })
            .await
            .unwrap()
            .into_inner();
        assert_eq!(created.status, "OK");
        assert_eq!(created.model_version, 1);
        assert_eq!(created.num_workers, 1);

        let response = client
            .predictions(predictions("demo", "1", "hello"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.model_name, "demo");
        assert_eq!(response.model_version, "1");
        assert_eq!(response.prediction["text"], b"hello".to_vec());
        assert!(response.sequence_id.is_some());

        let status = client
            .create_model_worker(CreateModelWorkerRequest {
                model_name: "demo".to_string(),
                model_path: archive.to_string_lossy().into_owned(),
                num_workers: 1,
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);

        let evicted = client
            .evict_model_worker(EvictModelWorkerRequest {
                model_name: "demo".to_string(),
                model_version: "1".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        assert!(evicted.evicted);

        let status = client
            .predictions(predictions("demo", "1", "gone"))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_create_from_missing_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _shutdown) = start(empty_router()).await;
        let status = client
            .create_model_worker(CreateModelWorkerRequest {
                model_name: "demo".to_string(),
                model_path: dir.path().join("absent.mlkeep").to_string_lossy().into_owned(),
                num_workers: 1,
            })
            .await
            .unwrap_err();
        assert_ne!(status.code(), Code::Ok);
    }

    #[tokio::test]
    async fn test_concurrent_predictions_use_separate_workers() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo");
        let registry = Arc::new(WorkerRegistry::default());
        registry.create_workers("demo", &archive, 2).await.unwrap();
        let (client, _shutdown) = start(Arc::new(Router::new(registry))).await;

        let mut first = client.clone();
        let mut second = client.clone();
        let (a, b) = tokio::join!(
            first.predictions(predictions("demo", "1", "a")),
            second.predictions(predictions("demo", "1", "b")),
        );
        let a = a.unwrap().into_inner();
        let b = b.unwrap().into_inner();

        assert_eq!(a.prediction["text"], b"a".to_vec());
        assert_eq!(b.prediction["text"], b"b".to_vec());
        // Round robin hands each request a fresh instance
        assert_eq!(a.prediction["calls"], b"1".to_vec());
        assert_eq!(b.prediction["calls"], b"1".to_vec());
        assert_ne!(a.sequence_id, b.sequence_id);
    }

    #[tokio::test]
    async fn test_handler_failures_are_internal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _shutdown) = start(faulty_router(dir.path()).await).await;
        let request = |mode: &str| PredictionsRequest {
            model_name: "faulty".to_string(),
            model_version: "1".to_string(),
            input: faulty_input(mode),
        };

        let status = client.predictions(request("fail")).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        let status = client.predictions(request("panic")).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);

        let response = client.predictions(request("ok")).await.unwrap().into_inner();
        assert_eq!(response.prediction["ok"], b"x".to_vec());
    }

    #[tokio::test]
    async fn test_create_with_unbounded_worker_count_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo");
        let (mut client, _shutdown) = start(empty_router()).await;

        let status = client
            .create_model_worker(CreateModelWorkerRequest {
                model_name: "demo".to_string(),
                model_path: archive.to_string_lossy().into_owned(),
                num_workers: u32::MAX,
            })
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
