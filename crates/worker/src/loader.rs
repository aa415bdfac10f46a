//! Handler loading
//!
//! Turns an archive into a live [`Handler`]. The manifest names the handler by
//! `(module, class)`; those identifiers are resolved against a
//! [`HandlerRegistry`] of constructors populated at startup.

use crate::archive;
use crate::echo::EchoHandler;
use crate::handler::{Handler, HandlerContext, Payload};
use crate::manifest::{Manifest, MANIFEST_FILE};
use mlserve_common::{LatencyTimer, MlServeError, Result, METRICS};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Constructor producing a fresh handler for an extracted archive
pub type HandlerConstructor =
    Arc<dyn Fn(&HandlerContext) -> Result<Box<dyn Handler>> + Send + Sync>;

/// Constructors keyed by handler module, then handler class
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    modules: HashMap<String, HashMap<String, HandlerConstructor>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.identifiers())
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers shipped in this crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoHandler::MODULE, EchoHandler::CLASS, |ctx| {
            let handler: Box<dyn Handler> = Box::new(EchoHandler::from_context(ctx)?);
            Ok(handler)
        });
        registry
    }

    /// Register a constructor, replacing any previous one with the same identifiers
    pub fn register<F>(&mut self, module: &str, class: &str, constructor: F) -> &mut Self
    where
        F: Fn(&HandlerContext) -> Result<Box<dyn Handler>> + Send + Sync + 'static,
    {
        let previous = self
            .modules
            .entry(module.to_string())
            .or_default()
            .insert(class.to_string(), Arc::new(constructor));
        if previous.is_some() {
            warn!("Replaced handler constructor {}.{}", module, class);
        }
        self
    }

    /// Look up the constructor for `module.class`
    pub fn resolve(&self, module: &str, class: &str) -> Result<HandlerConstructor> {
        let classes = self.modules.get(module).ok_or_else(|| {
            MlServeError::handler_resolution(format!("no handler module named `{}`", module))
        })?;
        classes.get(class).cloned().ok_or_else(|| {
            MlServeError::handler_resolution(format!(
                "handler module `{}` has no class `{}`",
                module, class
            ))
        })
    }

    /// All registered `module.class` identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .modules
            .iter()
            .flat_map(|(module, classes)| {
                classes.keys().map(move |class| format!("{}.{}", module, class))
            })
            .collect();
        ids.sort();
        ids
    }
}

/// A handler together with the scratch directory its archive was extracted to
///
/// The scratch directory is removed when the instance is dropped.
pub struct LoadedHandler {
    // Declared before `scratch` so the handler is dropped while its files still exist
    handler: Box<dyn Handler>,
    manifest: Manifest,
    archive_path: PathBuf,
    scratch: TempDir,
}

impl std::fmt::Debug for LoadedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedHandler")
            .field("model_name", &self.handler.model_name())
            .field("model_version", &self.handler.model_version())
            .field("archive_path", &self.archive_path)
            .field("scratch", &self.scratch.path())
            .finish_non_exhaustive()
    }
}

impl LoadedHandler {
    /// Run a prediction on the wrapped handler
    pub fn predict(&mut self, input: Payload) -> Result<Payload> {
        self.handler.predict(input)
    }

    /// The wrapped handler
    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    /// Manifest the handler was loaded from
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Archive the handler was loaded from
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Directory holding the extracted archive
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }
}

/// Loads archives into live handlers
#[derive(Debug, Clone)]
pub struct HandlerLoader {
    registry: Arc<HandlerRegistry>,
}

impl Default for HandlerLoader {
    fn default() -> Self {
        Self::new(HandlerRegistry::with_builtins())
    }
}

impl HandlerLoader {
    /// Create a loader resolving handlers against `registry`
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Constructor registry in use
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Extract, resolve and construct the handler in `archive_path`
    ///
    /// Blocking: performs file I/O and runs the handler constructor.
    pub fn load(&self, archive_path: impl AsRef<Path>) -> Result<LoadedHandler> {
        let archive_path = archive_path.as_ref();
        METRICS
            .workers
            .load_duration
            .time(|| self.load_inner(archive_path))
    }

    fn load_inner(&self, archive_path: &Path) -> Result<LoadedHandler> {
        info!("Loading model archive {}", archive_path.display());

        // Fresh directory per load so concurrently loaded archives never collide
        let scratch = tempfile::Builder::new().prefix("mlserve-").tempdir()?;
        archive::unpack(archive_path, scratch.path())?;

        let manifest_bytes = std::fs::read(scratch.path().join(MANIFEST_FILE))?;
        let manifest = Manifest::from_json(&manifest_bytes)?;
        debug!("Manifest for {}: {:?}", archive_path.display(), manifest);

        let members = extracted_members(scratch.path())?;
        manifest.check_members(members.iter().map(String::as_str))?;

        let constructor = self
            .registry
            .resolve(&manifest.handler_module, &manifest.handler_class_name)?;

        let ctx = HandlerContext::new(scratch.path(), manifest.clone());
        let handler = construct(&constructor, &ctx)?;

        info!(
            "Loaded handler {}.{} for model {} v{} from {}",
            manifest.handler_module,
            manifest.handler_class_name,
            handler.model_name(),
            handler.model_version(),
            archive_path.display()
        );

        Ok(LoadedHandler {
            handler,
            manifest,
            archive_path: archive_path.to_path_buf(),
            scratch,
        })
    }
}

/// Run a constructor, turning both errors and panics into `HandlerInit`
fn construct(constructor: &HandlerConstructor, ctx: &HandlerContext) -> Result<Box<dyn Handler>> {
    let id = format!(
        "{}.{}",
        ctx.manifest.handler_module, ctx.manifest.handler_class_name
    );

    match panic::catch_unwind(AssertUnwindSafe(|| constructor(ctx))) {
        Ok(Ok(handler)) => Ok(handler),
        Ok(Err(MlServeError::HandlerInit(msg))) => {
            Err(MlServeError::handler_init(format!("{}: {}", id, msg)))
        }
        Ok(Err(e)) => Err(MlServeError::handler_init(format!("{}: {}", id, e))),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(MlServeError::handler_init(format!(
                "{} panicked during construction: {}",
                id, reason
            )))
        }
    }
}

/// Relative paths of every regular file under `root`, using `/` separators
fn extracted_members(root: &Path) -> Result<Vec<String>> {
    let mut members = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                members.push(parts.join("/"));
            }
        }
    }
    Ok(members)
}
