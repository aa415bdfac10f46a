//! Built-in echo handler
//!
//! Serves an archive end to end without a real model: every input field is
//! returned unchanged, together with the model name and the number of calls
//! this instance has answered.

use crate::handler::{Handler, HandlerContext, Payload};
use mlserve_common::{MlServeError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Handler configuration read from the archive's YAML config member
#[derive(Debug, Clone, Deserialize)]
pub struct EchoConfig {
    /// Overrides the manifest's model name when set
    #[serde(default)]
    pub model_name: Option<String>,

    /// Declared worker count
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_num_workers() -> usize {
    1
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            model_name: None,
            num_workers: default_num_workers(),
        }
    }
}

/// Echoes its input back
#[derive(Debug)]
pub struct EchoHandler {
    model_name: String,
    model_version: u32,
    model_path: PathBuf,
    num_workers: usize,
    artifact_bytes: u64,
    calls: u64,
}

impl EchoHandler {
    /// Handler module identifier
    pub const MODULE: &'static str = "echo";

    /// Handler class identifier
    pub const CLASS: &'static str = "EchoHandler";

    /// Construct from an extracted archive
    pub fn from_context(ctx: &HandlerContext) -> Result<Self> {
        let config_path = ctx.config_path();
        let text = std::fs::read_to_string(&config_path)?;
        let config: EchoConfig = if text.trim().is_empty() {
            EchoConfig::default()
        } else {
            serde_yaml::from_str(&text).map_err(|e| {
                MlServeError::handler_init(format!("invalid config {}: {}", config_path.display(), e))
            })?
        };
        if config.num_workers == 0 {
            return Err(MlServeError::handler_init("num_workers must be at least 1"));
        }

        let model_path = ctx.model_artifact_path();
        let artifact_bytes = std::fs::metadata(&model_path)?.len();

        debug!(
            "Echo handler ready: {} bytes of model artifact at {}",
            artifact_bytes,
            model_path.display()
        );

        Ok(Self {
            model_name: config
                .model_name
                .unwrap_or_else(|| ctx.manifest.model_name.clone()),
            model_version: ctx.manifest.model_version,
            model_path,
            num_workers: config.num_workers,
            artifact_bytes,
            calls: 0,
        })
    }

    /// Size of the model artifact in bytes
    pub fn artifact_bytes(&self) -> u64 {
        self.artifact_bytes
    }
}

impl Handler for EchoHandler {
    fn predict(&mut self, input: Payload) -> Result<Payload> {
        self.calls += 1;
        let mut output = input;
        output.insert("model".to_string(), self.model_name.clone().into_bytes());
        output.insert("calls".to_string(), self.calls.to_string().into_bytes());
        Ok(output)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn model_version(&self) -> String {
        self.model_version.to_string()
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }
}
