//! MLServe Server
//!
//! Routes inference and worker-management requests to the worker registry
//! over gRPC and the multipart frame protocol.

pub mod grpc;
pub mod multipart;
pub mod router;
pub mod service;

#[cfg(test)]
mod test_support;

pub use grpc::{serve_with_listener, InferenceService};
pub use multipart::{MultipartClient, MultipartServer};
pub use router::{CreatedWorkers, Prediction, Router};
pub use service::run;
