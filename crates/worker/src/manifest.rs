//! Archive manifest
//!
//! The manifest is the `manifest.json` member of every model archive. It names
//! the handler to construct and the members the handler needs.

use mlserve_common::{MlServeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the manifest member inside an archive
pub const MANIFEST_FILE: &str = "manifest.json";

/// File extension of model archives
pub const ARCHIVE_EXTENSION: &str = "mlkeep";

/// Keys that must be present (and non-null) in every manifest
const REQUIRED_FIELDS: [&str; 6] = [
    "model_name",
    "model_version",
    "handler",
    "handler_class_name",
    "model",
    "config",
];

/// Declarative descriptor of an archive's contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Model name
    pub model_name: String,

    /// Model version (>= 1)
    pub model_version: u32,

    /// Logical unit of the handler (stem of the handler source member)
    #[serde(rename = "handler")]
    pub handler_module: String,

    /// Concrete handler implementation inside `handler_module`
    pub handler_class_name: String,

    /// Model artifact member name
    #[serde(rename = "model")]
    pub model_artifact_name: String,

    /// Config member name
    #[serde(rename = "config")]
    pub config_name: String,

    /// Auxiliary member names, in pack order
    #[serde(rename = "files", default)]
    pub auxiliary_file_names: Vec<String>,
}

impl Manifest {
    /// Parse and validate manifest JSON
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| MlServeError::ManifestParse(format!("invalid JSON: {}", e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| MlServeError::ManifestParse("manifest is not a JSON object".to_string()))?;

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| object.get(*field).map_or(true, |v| v.is_null()))
            .collect();
        if !missing.is_empty() {
            return Err(MlServeError::manifest_incomplete(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let manifest: Manifest = serde_json::from_value(value)
            .map_err(|e| MlServeError::ManifestParse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize as pretty-printed JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Reject empty identifiers and versions below 1
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("model_name", &self.model_name),
            ("handler", &self.handler_module),
            ("handler_class_name", &self.handler_class_name),
            ("model", &self.model_artifact_name),
            ("config", &self.config_name),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(MlServeError::manifest_incomplete(format!(
                    "field `{}` is empty",
                    field
                )));
            }
        }
        if self.model_version < 1 {
            return Err(MlServeError::manifest_incomplete(
                "model_version must be at least 1",
            ));
        }
        Ok(())
    }

    /// Member names the manifest references by exact name
    pub fn referenced_files(&self) -> impl Iterator<Item = &str> {
        [self.model_artifact_name.as_str(), self.config_name.as_str()]
            .into_iter()
            .chain(self.auxiliary_file_names.iter().map(String::as_str))
    }

    /// Check every referenced member against the archive's member names
    ///
    /// The handler module is matched by file stem, everything else by exact name.
    pub fn check_members<'a, I>(&self, members: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let members: Vec<&str> = members.into_iter().collect();

        let has_handler = members
            .iter()
            .filter(|member| **member != MANIFEST_FILE)
            .any(|member| {
                Path::new(member)
                    .file_stem()
                    .map_or(false, |stem| stem == self.handler_module.as_str())
            });
        if !has_handler {
            return Err(MlServeError::manifest_incomplete(format!(
                "handler `{}` has no source member in the archive",
                self.handler_module
            )));
        }

        for name in self.referenced_files() {
            if !members.contains(&name) {
                return Err(MlServeError::manifest_incomplete(format!(
                    "referenced member `{}` is not in the archive",
                    name
                )));
            }
        }
        Ok(())
    }
}
