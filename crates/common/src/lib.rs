//! MLServe common library
//!
//! This crate contains shared code used across MLServe components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{ModelConfig, ServerConfig};
pub use error::{MlServeError, Result};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
