//! Fixture archives and handlers for the server tests

use crate::router::Router;
use mlserve_common::{MlServeError, Result};
use mlserve_worker::{
    pack, EchoHandler, Handler, HandlerContext, HandlerLoader, HandlerRegistry, PackRequest,
    Payload, WorkerRegistry,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Pack an archive for handler `module.class` named `model_name` under `dir`
fn handler_archive(dir: &Path, model_name: &str, module: &str, class: &str) -> PathBuf {
    let src = dir.join(format!("{}-src", model_name));
    std::fs::create_dir_all(&src).unwrap();
    let handler = src.join(format!("{}.toml", module));
    std::fs::write(&handler, format!("# {} handler\n", module)).unwrap();
    std::fs::write(src.join("model.bin"), b"model weights").unwrap();
    std::fs::write(src.join("config.yaml"), b"").unwrap();

    let request = PackRequest::new(
        handler,
        src.join("model.bin"),
        src.join("config.yaml"),
        model_name,
        class,
    );
    pack(&request, dir).unwrap().path().to_path_buf()
}

/// Pack an echo handler archive for `model_name` under `dir`
pub fn echo_archive(dir: &Path, model_name: &str) -> PathBuf {
    handler_archive(dir, model_name, EchoHandler::MODULE, EchoHandler::CLASS)
}

/// Fails when the input has a `fail` field, panics on `panic`, echoes otherwise
pub struct FaultyHandler {
    model_name: String,
    model_path: PathBuf,
}

impl FaultyHandler {
    pub const MODULE: &'static str = "faulty";
    pub const CLASS: &'static str = "FaultyHandler";
}

impl Handler for FaultyHandler {
    fn predict(&mut self, input: Payload) -> Result<Payload> {
        if input.contains_key("panic") {
            panic!("faulty handler asked to panic");
        }
        if input.contains_key("fail") {
            return Err(MlServeError::predict("faulty handler asked to fail"));
        }
        Ok(input)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn model_version(&self) -> String {
        "1".to_string()
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// Router with a single-worker `faulty:1` entry registered
pub async fn faulty_router(dir: &Path) -> Arc<Router> {
    let mut handlers = HandlerRegistry::with_builtins();
    handlers.register(FaultyHandler::MODULE, FaultyHandler::CLASS, |ctx: &HandlerContext| {
        let handler: Box<dyn Handler> = Box::new(FaultyHandler {
            model_name: ctx.manifest.model_name.clone(),
            model_path: ctx.model_artifact_path(),
        });
        Ok(handler)
    });

    let registry = Arc::new(WorkerRegistry::new(HandlerLoader::new(handlers)));
    let archive = handler_archive(dir, "faulty", FaultyHandler::MODULE, FaultyHandler::CLASS);
    registry.create_workers("faulty", &archive, 1).await.unwrap();
    Arc::new(Router::new(registry))
}

/// Input that makes `FaultyHandler` behave as `mode` (`fail`, `panic` or anything else)
pub fn faulty_input(mode: &str) -> Payload {
    Payload::from([(mode.to_string(), b"x".to_vec())])
}
