//! Worker registry
//!
//! Maps `(model_name, model_version)` to a set of independently loaded handler
//! instances. Creation is all-or-nothing; dispatch is round-robin with one lock
//! per instance, so the registry lock is only held for writing on create/evict.

use crate::archive::Archive;
use crate::handler::Payload;
use crate::loader::{HandlerLoader, LoadedHandler};
use crate::manifest::Manifest;
use mlserve_common::{MlServeError, Result, METRICS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Identity of a worker entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub model_name: String,
    pub model_version: u32,
}

impl WorkerKey {
    pub fn new(model_name: impl Into<String>, model_version: u32) -> Self {
        Self {
            model_name: model_name.into(),
            model_version,
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_name, self.model_version)
    }
}

/// Default upper bound on instances per entry
pub const DEFAULT_MAX_WORKERS: usize = 64;

/// Handle returned by a successful create
pub type WorkerEntryId = WorkerKey;

/// One live handler instance
#[derive(Debug)]
pub struct Worker {
    index: usize,
    instance: Mutex<LoadedHandler>,
    served: AtomicU64,
}

impl Worker {
    fn new(index: usize, instance: LoadedHandler) -> Self {
        Self {
            index,
            instance: Mutex::new(instance),
            served: AtomicU64::new(0),
        }
    }

    /// Position of this worker within its entry
    pub fn index(&self) -> usize {
        self.index
    }

    /// Predictions dispatched to this worker so far
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Run a prediction, waiting for any in-flight call on this instance
    ///
    /// Blocking: call from a blocking-capable thread.
    pub fn predict(&self, input: Payload) -> Result<Payload> {
        let mut instance = self.instance.lock();
        self.served.fetch_add(1, Ordering::Relaxed);
        instance.predict(input)
    }
}

/// All workers registered under one model identity
#[derive(Debug)]
pub struct WorkerEntry {
    key: WorkerKey,
    archive_path: PathBuf,
    manifest: Manifest,
    workers: Vec<Arc<Worker>>,
    cursor: AtomicUsize,
}

impl WorkerEntry {
    /// Identity of this entry
    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    /// Archive every worker was loaded from
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Manifest shared by every worker
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Entries always hold at least one worker
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers in dispatch order
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Next worker in round-robin order
    pub fn next_worker(&self) -> Arc<Worker> {
        if self.workers.len() == 1 {
            return self.workers[0].clone();
        }
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[slot].clone()
    }

    /// Dispatch one prediction to the next worker
    ///
    /// Blocking: call from a blocking-capable thread.
    pub fn predict(&self, input: Payload) -> Result<Payload> {
        let worker = self.next_worker();
        debug!("Dispatching {} to worker {}", self.key, worker.index());
        worker.predict(input)
    }
}

/// Summary of an entry for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub key: WorkerKey,
    pub num_workers: usize,
    pub archive_path: PathBuf,
}

/// Table of worker entries
#[derive(Debug)]
pub struct WorkerRegistry {
    loader: HandlerLoader,
    max_workers: usize,
    entries: RwLock<HashMap<WorkerKey, Arc<WorkerEntry>>>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new(HandlerLoader::default())
    }
}

impl WorkerRegistry {
    /// Create an empty registry loading handlers with `loader`
    pub fn new(loader: HandlerLoader) -> Self {
        Self {
            loader,
            max_workers: DEFAULT_MAX_WORKERS,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cap the instances a single entry may hold (at least 1)
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Largest worker count accepted by `create_workers`
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Loader used for new entries
    pub fn loader(&self) -> &HandlerLoader {
        &self.loader
    }

    /// Load `num_workers` instances of the archive at `model_path`
    ///
    /// `num_workers == 0` uses the handler's declared worker count. Either every
    /// instance loads and the entry is registered, or nothing is registered.
    pub async fn create_workers(
        &self,
        model_name: &str,
        model_path: impl AsRef<Path>,
        num_workers: usize,
    ) -> Result<WorkerEntryId> {
        let model_name = model_name.trim();
        if model_name.is_empty() {
            return Err(MlServeError::invalid_input("model name must not be empty"));
        }
        if num_workers > self.max_workers {
            METRICS.workers.creation_failed_total.inc();
            return Err(MlServeError::invalid_input(format!(
                "num_workers {} exceeds the limit of {}",
                num_workers, self.max_workers
            )));
        }
        let model_path = model_path.as_ref().to_path_buf();

        let result = self.try_create(model_name, model_path, num_workers).await;
        if result.is_err() {
            METRICS.workers.creation_failed_total.inc();
        }
        result
    }

    async fn try_create(
        &self,
        model_name: &str,
        model_path: PathBuf,
        num_workers: usize,
    ) -> Result<WorkerEntryId> {
        // Read the manifest up front so duplicates are rejected before any load
        let manifest_path = model_path.clone();
        let archive = tokio::task::spawn_blocking(move || Archive::open(manifest_path))
            .await
            .map_err(|e| MlServeError::internal(format!("manifest read task failed: {}", e)))?
            .map_err(|e| creation_error(model_name, &model_path, e))?;

        let key = WorkerKey::new(model_name, archive.manifest().model_version);
        if archive.manifest().model_name != model_name {
            warn!(
                "Registering archive {} (manifest name {}) as {}",
                model_path.display(),
                archive.manifest().model_name,
                key
            );
        }
        if self.entries.read().await.contains_key(&key) {
            return Err(duplicate_error(&key));
        }

        let loader = self.loader.clone();
        let load_path = model_path.clone();
        let max_workers = self.max_workers;
        let instances = tokio::task::spawn_blocking(move || {
            load_all(&loader, &load_path, num_workers, max_workers)
        })
            .await
            .map_err(|e| MlServeError::internal(format!("worker load task failed: {}", e)))?
            .map_err(|e| creation_error(model_name, &model_path, e))?;

        if let Some(stray) = instances
            .iter()
            .find(|instance| instance.manifest().model_version != key.model_version)
        {
            return Err(creation_error(
                model_name,
                &model_path,
                MlServeError::internal(format!(
                    "archive changed while loading: version {} became {}",
                    key.model_version,
                    stray.manifest().model_version
                )),
            ));
        }

        let manifest = instances[0].manifest().clone();
        let count = instances.len();
        let entry = Arc::new(WorkerEntry {
            key: key.clone(),
            archive_path: model_path,
            manifest,
            workers: instances
                .into_iter()
                .enumerate()
                .map(|(index, instance)| Arc::new(Worker::new(index, instance)))
                .collect(),
            cursor: AtomicUsize::new(0),
        });

        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                // Lost a race with a concurrent create; `entry` is dropped here
                return Err(duplicate_error(&key));
            }
            entries.insert(key.clone(), entry);
        }

        METRICS.workers.created_total.inc();
        METRICS.workers.entries.inc();
        METRICS.workers.instances.add(count as i64);
        info!("Registered {} with {} worker(s)", key, count);

        Ok(key)
    }

    /// Find the entry for `(model_name, model_version)`
    pub async fn lookup(&self, model_name: &str, model_version: u32) -> Result<Arc<WorkerEntry>> {
        let key = WorkerKey::new(model_name, model_version);
        self.entries
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| MlServeError::not_found(format!("no worker registered for {}", key)))
    }

    /// Remove an entry; returns whether anything was removed
    ///
    /// In-flight predictions keep their workers alive until they finish.
    pub async fn evict(&self, model_name: &str, model_version: u32) -> bool {
        let key = WorkerKey::new(model_name, model_version);
        let removed = self.entries.write().await.remove(&key);

        match removed {
            Some(entry) => {
                METRICS.workers.entries.dec();
                METRICS.workers.instances.sub(entry.len() as i64);
                info!("Evicted {} ({} worker(s))", key, entry.len());
                true
            }
            None => {
                debug!("Evict of {} ignored: not registered", key);
                false
            }
        }
    }

    /// Evict every entry
    pub async fn clear(&self) -> usize {
        let drained: Vec<_> = self.entries.write().await.drain().collect();
        for (key, entry) in &drained {
            METRICS.workers.entries.dec();
            METRICS.workers.instances.sub(entry.len() as i64);
            debug!("Evicted {} on shutdown", key);
        }
        drained.len()
    }

    /// Every registered entry, sorted by identity
    pub async fn list(&self) -> Vec<WorkerSummary> {
        let mut summaries: Vec<WorkerSummary> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| WorkerSummary {
                key: entry.key.clone(),
                num_workers: entry.len(),
                archive_path: entry.archive_path.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Number of registered entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when no entry is registered
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Load every instance, dropping (and cleaning up) all of them on the first failure
fn load_all(
    loader: &HandlerLoader,
    path: &Path,
    num_workers: usize,
    max_workers: usize,
) -> Result<Vec<LoadedHandler>> {
    let first = loader.load(path)?;
    let target = if num_workers == 0 {
        first.handler().num_workers().max(1)
    } else {
        num_workers
    };
    if target > max_workers {
        return Err(MlServeError::invalid_input(format!(
            "handler declares {} workers, limit is {}",
            target, max_workers
        )));
    }

    let mut instances = Vec::new();
    instances.push(first);
    while instances.len() < target {
        instances.push(loader.load(path)?);
    }
    Ok(instances)
}

fn creation_error(model_name: &str, path: &Path, cause: MlServeError) -> MlServeError {
    MlServeError::WorkerCreation(format!(
        "{} from {}: {}",
        model_name,
        path.display(),
        cause
    ))
}

fn duplicate_error(key: &WorkerKey) -> MlServeError {
    MlServeError::DuplicateWorker(format!("{} is already registered", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerContext};
    use crate::loader::HandlerRegistry;
    use crate::test_support::echo_archive;

    fn payload(text: &str) -> Payload {
        Payload::from([("text".to_string(), text.as_bytes().to_vec())])
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default();

        let key = registry.create_workers("demo", &archive, 3).await.unwrap();
        assert_eq!(key, WorkerKey::new("demo", 1));

        let entry = registry.lookup("demo", 1).await.unwrap();
        assert_eq!(entry.len(), 3);
        assert_eq!(entry.manifest().model_name, "demo");

        // Every worker is a separate instantiation with its own scratch dir
        let mut dirs: Vec<PathBuf> = entry
            .workers()
            .iter()
            .map(|w| w.instance.lock().scratch_dir().to_path_buf())
            .collect();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), 3);
    }

    #[tokio::test]
    async fn test_lookup_unregistered() {
        let registry = WorkerRegistry::default();
        match registry.lookup("ghost", 1).await {
            Err(MlServeError::NotFound(msg)) => assert!(msg.contains("ghost:1")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_zero_workers_uses_declared_count() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "num_workers: 4\n");
        let registry = WorkerRegistry::default();

        registry.create_workers("demo", &archive, 0).await.unwrap();
        assert_eq!(registry.lookup("demo", 1).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_worker_count_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default().with_max_workers(2);
        assert_eq!(registry.max_workers(), 2);

        let err = registry
            .create_workers("demo", &archive, u32::MAX as usize)
            .await
            .unwrap_err();
        assert!(matches!(err, MlServeError::InvalidInput(_)));
        let err = registry.create_workers("demo", &archive, 3).await.unwrap_err();
        assert!(matches!(err, MlServeError::InvalidInput(_)));
        assert!(registry.is_empty().await);

        registry.create_workers("demo", &archive, 2).await.unwrap();
        assert_eq!(registry.lookup("demo", 1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_declared_count_over_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "num_workers: 8\n");
        let registry = WorkerRegistry::default().with_max_workers(4);

        let err = registry.create_workers("demo", &archive, 0).await.unwrap_err();
        assert!(err.to_string().contains("limit is 4"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_duplicate_leaves_registry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default();

        registry.create_workers("demo", &archive, 2).await.unwrap();
        let before = registry.list().await;
        let entry_before = registry.lookup("demo", 1).await.unwrap();

        let err = registry.create_workers("demo", &archive, 5).await.unwrap_err();
        assert!(matches!(err, MlServeError::DuplicateWorker(_)));

        assert_eq!(registry.list().await, before);
        let entry_after = registry.lookup("demo", 1).await.unwrap();
        assert!(Arc::ptr_eq(&entry_before, &entry_after));
    }

    #[tokio::test]
    async fn test_partial_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");

        // Third construction fails
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let mut handlers = HandlerRegistry::new();
        handlers.register("echo", "EchoHandler", move |ctx: &HandlerContext| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                return Err(MlServeError::handler_init("out of memory"));
            }
            let handler: Box<dyn Handler> = Box::new(crate::echo::EchoHandler::from_context(ctx)?);
            Ok(handler)
        });
        let registry = WorkerRegistry::new(HandlerLoader::new(handlers));

        let err = registry.create_workers("demo", &archive, 4).await.unwrap_err();
        match err {
            MlServeError::WorkerCreation(msg) => assert!(msg.contains("out of memory")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty().await);
        assert!(matches!(
            registry.lookup("demo", 1).await,
            Err(MlServeError::NotFound(_))
        ));
        // Loading stopped at the failure
        assert_eq!(built.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_archive_is_creation_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WorkerRegistry::default();
        let err = registry
            .create_workers("demo", dir.path().join("absent.mlkeep"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MlServeError::WorkerCreation(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_round_robin_spread() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default();
        registry.create_workers("demo", &archive, 3).await.unwrap();
        let entry = registry.lookup("demo", 1).await.unwrap();

        let k = 10;
        for i in 0..k {
            entry.predict(payload(&i.to_string())).unwrap();
        }

        let n = entry.len() as u64;
        for worker in entry.workers() {
            let served = worker.served();
            assert!(served == k / n || served == (k + n - 1) / n, "worker served {}", served);
        }
        let total: u64 = entry.workers().iter().map(|w| w.served()).sum();
        assert_eq!(total, k);
    }

    #[tokio::test]
    async fn test_single_worker_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default();
        registry.create_workers("demo", &archive, 1).await.unwrap();
        let entry = registry.lookup("demo", 1).await.unwrap();

        for _ in 0..3 {
            assert_eq!(entry.next_worker().index(), 0);
        }
        let output = entry.predict(payload("a")).unwrap();
        assert_eq!(output["calls"], b"1".to_vec());
        let output = entry.predict(payload("b")).unwrap();
        assert_eq!(output["calls"], b"2".to_vec());
    }

    #[tokio::test]
    async fn test_evict_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = WorkerRegistry::default();
        registry.create_workers("demo", &archive, 2).await.unwrap();

        let entry = registry.lookup("demo", 1).await.unwrap();
        let scratch = entry.workers()[0].instance.lock().scratch_dir().to_path_buf();

        assert!(registry.evict("demo", 1).await);
        assert!(!registry.evict("demo", 1).await);
        assert!(registry.lookup("demo", 1).await.is_err());

        // Held entry stays usable until dropped, then its scratch dirs go away
        assert!(entry.predict(payload("late")).is_ok());
        assert!(scratch.exists());
        drop(entry);
        assert!(!scratch.exists());

        // Same identity can be created again after eviction
        registry.create_workers("demo", &archive, 1).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_registered_under_requested_name() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "example_model", "");
        let registry = WorkerRegistry::default();

        registry.create_workers("resnet18", &archive, 1).await.unwrap();
        registry.create_workers("example_model", &archive, 1).await.unwrap();

        let listed: Vec<String> = registry.list().await.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(listed, vec!["example_model:1".to_string(), "resnet18:1".to_string()]);
        assert_eq!(registry.clear().await, 2);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let archive = echo_archive(dir.path(), "demo", "");
        let registry = Arc::new(WorkerRegistry::default());
        registry.create_workers("demo", &archive, 2).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let entry = registry.lookup("demo", 1).await.unwrap();
                let text = format!("request-{}", i);
                let output = tokio::task::spawn_blocking(move || entry.predict(payload(&text)))
                    .await
                    .unwrap()
                    .unwrap();
                (i, output)
            }));
        }

        for task in tasks {
            let (i, output) = task.await.unwrap();
            assert_eq!(output["text"], format!("request-{}", i).into_bytes());
        }
        let entry = registry.lookup("demo", 1).await.unwrap();
        assert_eq!(entry.workers().iter().map(|w| w.served()).sum::<u64>(), 16);
    }
}
