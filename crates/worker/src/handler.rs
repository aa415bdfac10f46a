//! The `Handler` capability
//!
//! A handler wraps one loaded model. Everything outside the loader treats it
//! purely through this trait.

use crate::manifest::Manifest;
use mlserve_common::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Named fields to opaque byte payloads, used for both input and output
pub type Payload = HashMap<String, Vec<u8>>;

/// A live, stateful model instance
///
/// Instances are never invoked concurrently; the worker registry serializes
/// access to each one, which is why `predict` takes `&mut self`.
pub trait Handler: Send {
    /// Run inference on one request
    fn predict(&mut self, input: Payload) -> Result<Payload>;

    /// Model name this instance serves
    fn model_name(&self) -> &str;

    /// Model version this instance serves
    fn model_version(&self) -> String;

    /// Location of the model artifact backing this instance
    fn model_path(&self) -> &Path;

    /// Number of workers the handler would like to be replicated across
    fn num_workers(&self) -> usize {
        1
    }
}

/// Everything a handler constructor gets to see
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Directory the archive was extracted into
    pub model_dir: PathBuf,

    /// Manifest of the archive being loaded
    pub manifest: Manifest,
}

impl HandlerContext {
    /// Create a context for an extracted archive
    pub fn new(model_dir: impl Into<PathBuf>, manifest: Manifest) -> Self {
        Self {
            model_dir: model_dir.into(),
            manifest,
        }
    }

    /// Extracted model artifact
    pub fn model_artifact_path(&self) -> PathBuf {
        self.model_dir.join(&self.manifest.model_artifact_name)
    }

    /// Extracted config file
    pub fn config_path(&self) -> PathBuf {
        self.model_dir.join(&self.manifest.config_name)
    }

    /// Extracted auxiliary files, in manifest order
    pub fn auxiliary_paths(&self) -> Vec<PathBuf> {
        self.manifest
            .auxiliary_file_names
            .iter()
            .map(|name| self.model_dir.join(name))
            .collect()
    }
}
