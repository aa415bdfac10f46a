//! Common error types for MLServe
//!
//! This module defines all error types used across the MLServe system.
//! All errors are convertible to gRPC status codes for proper error propagation.

use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for MLServe
#[derive(Error, Debug)]
pub enum MlServeError {
    /// Bad pack-time input (missing path, empty name, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Archive container cannot be opened or a member cannot be read
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Archive has no manifest member
    #[error("Missing manifest: {0}")]
    MissingManifest(String),

    /// Manifest is not valid JSON or has the wrong shape
    #[error("Manifest parse error: {0}")]
    ManifestParse(String),

    /// Manifest lacks a required field or references an absent member
    #[error("Manifest incomplete: {0}")]
    ManifestIncomplete(String),

    /// No constructor registered for the manifest's handler identifiers
    #[error("Handler resolution error: {0}")]
    HandlerResolution(String),

    /// Handler constructor failed
    #[error("Handler init error: {0}")]
    HandlerInit(String),

    /// At least one worker instance failed to load
    #[error("Worker creation error: {0}")]
    WorkerCreation(String),

    /// A worker entry already exists for this model identity
    #[error("Duplicate worker: {0}")]
    DuplicateWorker(String),

    /// No worker entry registered for this model identity
    #[error("Not found: {0}")]
    NotFound(String),

    /// Framing or connection problems
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error surfaced by a handler's predict
    #[error("Prediction error: {0}")]
    Predict(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AddrParseError> for MlServeError {
    fn from(err: AddrParseError) -> Self {
        MlServeError::Config(format!("Invalid bind address: {}", err))
    }
}

impl MlServeError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        let msg = self.to_string();
        match self {
            MlServeError::InvalidInput(_) => tonic::Status::invalid_argument(msg),
            MlServeError::CorruptArchive(_)
            | MlServeError::MissingManifest(_)
            | MlServeError::ManifestParse(_)
            | MlServeError::ManifestIncomplete(_)
            | MlServeError::HandlerResolution(_) => tonic::Status::failed_precondition(msg),
            MlServeError::HandlerInit(_)
            | MlServeError::WorkerCreation(_)
            | MlServeError::Predict(_) => tonic::Status::internal(msg),
            MlServeError::DuplicateWorker(_) => tonic::Status::already_exists(msg),
            MlServeError::NotFound(_) => tonic::Status::not_found(msg),
            MlServeError::Transport(_) | MlServeError::GrpcTransport(_) => {
                tonic::Status::unavailable(msg)
            }
            MlServeError::Config(_)
            | MlServeError::Serialization(_)
            | MlServeError::Io(_)
            | MlServeError::Internal(_) => tonic::Status::internal(msg),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        MlServeError::InvalidInput(msg.into())
    }

    /// Create a corrupt archive error
    pub fn corrupt_archive(msg: impl Into<String>) -> Self {
        MlServeError::CorruptArchive(msg.into())
    }

    /// Create a manifest incomplete error
    pub fn manifest_incomplete(msg: impl Into<String>) -> Self {
        MlServeError::ManifestIncomplete(msg.into())
    }

    /// Create a handler resolution error
    pub fn handler_resolution(msg: impl Into<String>) -> Self {
        MlServeError::HandlerResolution(msg.into())
    }

    /// Create a handler init error
    pub fn handler_init(msg: impl Into<String>) -> Self {
        MlServeError::HandlerInit(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        MlServeError::NotFound(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        MlServeError::Transport(msg.into())
    }

    /// Create a prediction error
    pub fn predict(msg: impl Into<String>) -> Self {
        MlServeError::Predict(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        MlServeError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        MlServeError::Internal(msg.into())
    }
}

/// Result type alias for MLServe operations
pub type Result<T> = std::result::Result<T, MlServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            MlServeError::not_found("demo:1").to_status().code(),
            tonic::Code::NotFound
        );
        assert_eq!(
            MlServeError::DuplicateWorker("demo:1".into()).to_status().code(),
            tonic::Code::AlreadyExists
        );
        assert_eq!(
            MlServeError::invalid_input("missing").to_status().code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            MlServeError::handler_init("boom").to_status().code(),
            tonic::Code::Internal
        );
    }

    #[test]
    fn test_status_message_keeps_context() {
        let status = MlServeError::not_found("no worker for demo:1").to_status();
        assert!(status.message().contains("demo:1"));
    }
}
