//! Model archive codec
//!
//! An archive is a zip container holding a handler source file, a model
//! artifact, a config file, optional auxiliary files and a generated
//! `manifest.json`. Archives are written once by [`pack`] and only ever read
//! afterwards.

use crate::manifest::{Manifest, ARCHIVE_EXTENSION, MANIFEST_FILE};
use mlserve_common::{MlServeError, Result};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

/// Inputs to [`pack`]
#[derive(Debug, Clone)]
pub struct PackRequest {
    /// Handler source file; its stem becomes the manifest's handler module
    pub handler_file: PathBuf,

    /// Model artifact
    pub model_file: PathBuf,

    /// Handler configuration file
    pub config_file: PathBuf,

    /// Extra files shipped alongside the model
    pub auxiliary_files: Vec<PathBuf>,

    /// Model name, also the archive's file stem
    pub model_name: String,

    /// Handler implementation to construct at load time
    pub handler_class_name: String,
}

impl PackRequest {
    /// Create a pack request without auxiliary files
    pub fn new(
        handler_file: impl Into<PathBuf>,
        model_file: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
        model_name: impl Into<String>,
        handler_class_name: impl Into<String>,
    ) -> Self {
        Self {
            handler_file: handler_file.into(),
            model_file: model_file.into(),
            config_file: config_file.into(),
            auxiliary_files: Vec::new(),
            model_name: model_name.into(),
            handler_class_name: handler_class_name.into(),
        }
    }

    /// Add an auxiliary file
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auxiliary_files.push(path.into());
        self
    }

    /// Build the manifest these inputs describe
    pub fn manifest(&self) -> Result<Manifest> {
        let handler_module = self
            .handler_file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| {
                MlServeError::invalid_input(format!(
                    "handler file {} has no usable stem",
                    self.handler_file.display()
                ))
            })?;

        let manifest = Manifest {
            model_name: self.model_name.clone(),
            model_version: 1,
            handler_module: handler_module.to_string(),
            handler_class_name: self.handler_class_name.clone(),
            model_artifact_name: basename(&self.model_file)?,
            config_name: basename(&self.config_file)?,
            auxiliary_file_names: self
                .auxiliary_files
                .iter()
                .map(|path| basename(path))
                .collect::<Result<_>>()?,
        };
        Ok(manifest)
    }

    /// Every input file in member order
    fn members(&self) -> impl Iterator<Item = &PathBuf> {
        [&self.handler_file, &self.model_file, &self.config_file]
            .into_iter()
            .chain(self.auxiliary_files.iter())
    }

    fn validate(&self, output_dir: &Path) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(MlServeError::invalid_input("model name must not be empty"));
        }
        if self.model_name.contains(|c: char| c == '/' || c == '\\') || self.model_name == "." || self.model_name == ".." {
            return Err(MlServeError::invalid_input(format!(
                "model name `{}` is not a valid file name",
                self.model_name
            )));
        }
        if self.handler_class_name.trim().is_empty() {
            return Err(MlServeError::invalid_input(
                "handler class name must not be empty",
            ));
        }

        for path in self.members() {
            if !path.is_file() {
                return Err(MlServeError::invalid_input(format!(
                    "input path {} does not exist",
                    path.display()
                )));
            }
        }
        if !output_dir.is_dir() {
            return Err(MlServeError::invalid_input(format!(
                "output path {} does not exist",
                output_dir.display()
            )));
        }

        let mut seen = HashSet::from([MANIFEST_FILE.to_string()]);
        for path in self.members() {
            let name = basename(path)?;
            if !seen.insert(name.clone()) {
                return Err(MlServeError::invalid_input(format!(
                    "member name `{}` is used more than once",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn basename(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            MlServeError::invalid_input(format!("path {} has no file name", path.display()))
        })
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> MlServeError {
    MlServeError::corrupt_archive(format!("{}: {}", path.display(), err))
}

/// Fixed entry options so identical inputs produce identical archives
fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(DateTime::default())
        .unix_permissions(0o644)
}

/// Pack a model into `{output_dir}/{model_name}.mlkeep`
pub fn pack(request: &PackRequest, output_dir: impl AsRef<Path>) -> Result<Archive> {
    let output_dir = output_dir.as_ref();
    request.validate(output_dir)?;
    let manifest = request.manifest()?;

    let path = output_dir.join(format!("{}.{}", request.model_name, ARCHIVE_EXTENSION));
    let mut writer = ZipWriter::new(File::create(&path)?);

    let mut write_member = |name: &str, bytes: &[u8]| -> Result<()> {
        writer
            .start_file(name, entry_options())
            .map_err(|e| MlServeError::internal(format!("failed to add {}: {}", name, e)))?;
        writer.write_all(bytes)?;
        Ok(())
    };

    write_member(&basename(&request.handler_file)?, &fs::read(&request.handler_file)?)?;
    write_member(&manifest.model_artifact_name, &fs::read(&request.model_file)?)?;
    write_member(&manifest.config_name, &fs::read(&request.config_file)?)?;
    write_member(MANIFEST_FILE, &manifest.to_json()?)?;
    for (name, file) in manifest
        .auxiliary_file_names
        .iter()
        .zip(request.auxiliary_files.iter())
    {
        write_member(name, &fs::read(file)?)?;
    }

    writer
        .finish()
        .map_err(|e| MlServeError::internal(format!("failed to finish {}: {}", path.display(), e)))?;

    info!(
        "Packed model {} (handler {}.{}) into {}",
        manifest.model_name,
        manifest.handler_module,
        manifest.handler_class_name,
        path.display()
    );

    let members = std::iter::once(basename(&request.handler_file)?)
        .chain([
            manifest.model_artifact_name.clone(),
            manifest.config_name.clone(),
            MANIFEST_FILE.to_string(),
        ])
        .chain(manifest.auxiliary_file_names.iter().cloned())
        .collect();

    Ok(Archive {
        path,
        manifest,
        members,
    })
}

/// Extract every member of the archive at `archive_path` into `destination`
pub fn unpack(archive_path: impl AsRef<Path>, destination: impl AsRef<Path>) -> Result<()> {
    let archive_path = archive_path.as_ref();
    let destination = destination.as_ref();
    let mut zip = open_zip(archive_path)?;

    if zip.index_for_name(MANIFEST_FILE).is_none() {
        return Err(MlServeError::MissingManifest(format!(
            "{} has no {} member",
            archive_path.display(),
            MANIFEST_FILE
        )));
    }

    fs::create_dir_all(destination)?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| zip_error(archive_path, e))?;

        let relative = entry.enclosed_name().ok_or_else(|| {
            MlServeError::corrupt_archive(format!(
                "{}: member `{}` escapes the extraction directory",
                archive_path.display(),
                entry.name()
            ))
        })?;
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            MlServeError::corrupt_archive(format!(
                "{}: failed to read member `{}`: {}",
                archive_path.display(),
                entry.name(),
                e
            ))
        })?;
        debug!("Extracted {} -> {}", entry.name(), target.display());
    }

    Ok(())
}

fn open_zip(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| {
        MlServeError::corrupt_archive(format!("cannot open {}: {}", path.display(), e))
    })?;
    ZipArchive::new(file).map_err(|e| zip_error(path, e))
}

/// Read-only view of a packed archive
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    manifest: Manifest,
    members: Vec<String>,
}

impl Archive {
    /// Open an archive and read its manifest without extracting it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut zip = open_zip(&path)?;
        let members: Vec<String> = zip.file_names().map(str::to_string).collect();

        let mut bytes = Vec::new();
        match zip.by_name(MANIFEST_FILE) {
            Ok(mut entry) => {
                entry.read_to_end(&mut bytes).map_err(|e| {
                    MlServeError::corrupt_archive(format!("{}: {}", path.display(), e))
                })?;
            }
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(MlServeError::MissingManifest(format!(
                    "{} has no {} member",
                    path.display(),
                    MANIFEST_FILE
                )));
            }
            Err(e) => return Err(zip_error(&path, e)),
        }

        let manifest = Manifest::from_json(&bytes)?;
        manifest.check_members(members.iter().map(String::as_str))?;

        Ok(Self {
            path,
            manifest,
            members,
        })
    }

    /// Location of the archive on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed manifest
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Member names in container order
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Read a single member's bytes
    pub fn read_member(&self, name: &str) -> Result<Vec<u8>> {
        let mut zip = open_zip(&self.path)?;
        let mut entry = zip.by_name(name).map_err(|e| match e {
            zip::result::ZipError::FileNotFound => MlServeError::not_found(format!(
                "{} has no member `{}`",
                self.path.display(),
                name
            )),
            other => zip_error(&self.path, other),
        })?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| MlServeError::corrupt_archive(format!("{}: {}", self.path.display(), e)))?;
        Ok(bytes)
    }

    /// Extract every member into `destination`
    pub fn unpack(&self, destination: impl AsRef<Path>) -> Result<()> {
        unpack(&self.path, destination)
    }
}
