//! MLServe Protocol Buffers
//!
//! Generated tonic/prost bindings for the `predict.Inference` service.

pub mod predict {
    tonic::include_proto!("predict");
}

pub use predict::inference_client::InferenceClient;
pub use predict::inference_server::{Inference, InferenceServer};
pub use predict::{
    CreateModelWorkerRequest, CreateModelWorkerResponse, EvictModelWorkerRequest,
    EvictModelWorkerResponse, PingResponse, PredictionResponse, PredictionsRequest,
};
