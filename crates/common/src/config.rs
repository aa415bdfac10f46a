//! Configuration structures for MLServe
//!
//! The server is configured from an optional YAML file layered under
//! `MLSERVE__*` environment variables (e.g. `MLSERVE__GRPC_PORT=50052`).

use crate::error::{MlServeError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "MLSERVE_CONFIG";

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "configs/server.yaml";

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port of the typed RPC (gRPC) endpoint
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Port of the multipart frame endpoint (disabled when absent)
    #[serde(default)]
    pub multipart_port: Option<u16>,

    /// Largest single frame accepted on the multipart endpoint
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Upper bound on the instances one model entry may hold
    #[serde(default = "default_max_workers_per_model")]
    pub max_workers_per_model: usize,

    /// Shorthand for preloading a single archive under its manifest name
    #[serde(default)]
    pub archive_path: Option<PathBuf>,

    /// Archives to load into the worker registry at startup
    #[serde(default)]
    pub models: Vec<ModelConfig>,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// A model archive to preload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name to register under; defaults to the manifest's model name
    #[serde(default)]
    pub model_name: Option<String>,

    /// Path to the `.mlkeep` archive
    pub model_path: PathBuf,

    /// Number of workers (0 = handler's declared count)
    #[serde(default)]
    pub num_workers: u32,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log a metrics snapshot on shutdown
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_max_frame_bytes() -> usize {
    64 * 1024 * 1024 // 64 MiB
}

fn default_max_workers_per_model() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            grpc_port: default_grpc_port(),
            multipart_port: None,
            max_frame_bytes: default_max_frame_bytes(),
            max_workers_per_model: default_max_workers_per_model(),
            archive_path: None,
            models: Vec::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from an optional YAML file overridden by the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("MLSERVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| MlServeError::Config(format!("Failed to build configuration: {}", e)))?;

        let config: ServerConfig = settings
            .try_deserialize()
            .map_err(|e| MlServeError::Config(format!("Failed to parse configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration using `$MLSERVE_CONFIG` or the default location
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(Some(Path::new(&path)))
    }

    /// Load configuration from a YAML file only
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| MlServeError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let config: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| MlServeError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.trim().is_empty() {
            return Err(MlServeError::config("bind_address must not be empty"));
        }
        if self.grpc_port == 0 {
            return Err(MlServeError::config("grpc_port must be non-zero"));
        }
        match self.multipart_port {
            Some(0) => return Err(MlServeError::config("multipart_port must be non-zero")),
            Some(port) if port == self.grpc_port => {
                return Err(MlServeError::config(format!(
                    "multipart_port and grpc_port are both {}",
                    port
                )));
            }
            _ => {}
        }
        if self.max_frame_bytes == 0 {
            return Err(MlServeError::config("max_frame_bytes must be non-zero"));
        }
        if self.max_workers_per_model == 0 {
            return Err(MlServeError::config("max_workers_per_model must be non-zero"));
        }
        for model in self.preload_models() {
            if model.model_path.as_os_str().is_empty() {
                return Err(MlServeError::config("model_path must not be empty"));
            }
            if model.num_workers as usize > self.max_workers_per_model {
                return Err(MlServeError::config(format!(
                    "{} asks for {} workers, limit is {}",
                    model.model_path.display(),
                    model.num_workers,
                    self.max_workers_per_model
                )));
            }
            if matches!(model.model_name.as_deref(), Some(name) if name.trim().is_empty()) {
                return Err(MlServeError::config(format!(
                    "empty model_name for {}",
                    model.model_path.display()
                )));
            }
        }
        Ok(())
    }

    /// Every archive to load at startup, `archive_path` first
    pub fn preload_models(&self) -> Vec<ModelConfig> {
        let mut models = Vec::with_capacity(self.models.len() + 1);
        if let Some(path) = &self.archive_path {
            models.push(ModelConfig {
                model_name: None,
                model_path: path.clone(),
                num_workers: 0,
            });
        }
        models.extend(self.models.iter().cloned());
        models
    }

    /// Socket address of the gRPC endpoint
    pub fn grpc_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.bind_address, self.grpc_port).parse()?)
    }

    /// Socket address of the multipart endpoint, if enabled
    pub fn multipart_addr(&self) -> Result<Option<SocketAddr>> {
        match self.multipart_port {
            Some(port) => Ok(Some(format!("{}:{}", self.bind_address, port).parse()?)),
            None => Ok(None),
        }
    }
}
