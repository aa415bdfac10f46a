//! MLServe Worker
//!
//! Packaging and hosting of model handlers: the archive codec, the handler
//! loader with its constructor registry, and the worker registry that keeps
//! loaded instances per `(model_name, model_version)`.

pub mod archive;
pub mod echo;
pub mod handler;
pub mod loader;
pub mod manifest;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use archive::{pack, unpack, Archive, PackRequest};
pub use echo::EchoHandler;
pub use handler::{Handler, HandlerContext, Payload};
pub use loader::{HandlerConstructor, HandlerLoader, HandlerRegistry, LoadedHandler};
pub use manifest::{Manifest, ARCHIVE_EXTENSION, MANIFEST_FILE};
pub use registry::{
    Worker, WorkerEntry, WorkerEntryId, WorkerKey, WorkerRegistry, WorkerSummary, DEFAULT_MAX_WORKERS,
};
