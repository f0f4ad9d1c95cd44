//! Test fixtures and manager helpers.
//!
//! Provides managers over fresh storage, and clusters of managers that
//! behave like separate processes sharing one database.

use canopy_cache::{CacheConfig, CacheUtility, MemoryPubSub, MemorySharedCache};
use canopy_codec::{CborCodec, Value};
use canopy_core::{Config, KindRegistry, PersistentObject, StrategyKind, TransactionManager};
use canopy_storage::{FileBackend, InMemoryBackend, Oid, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A test manager with automatic cleanup.
pub struct TestManager {
    /// The manager instance.
    pub manager: Arc<TransactionManager>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestManager {
    /// Creates an initialized manager over in-memory storage.
    pub async fn memory(strategy: StrategyKind) -> Self {
        Self::with_config(Config::default().strategy(strategy)).await
    }

    /// Creates an initialized manager over in-memory storage.
    pub async fn with_config(config: Config) -> Self {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let manager = TransactionManager::new(storage, Arc::new(KindRegistry::new()), config, None);
        manager
            .initialize()
            .await
            .expect("Failed to initialize manager");
        Self {
            manager: Arc::new(manager),
            _temp_dir: None,
        }
    }

    /// Creates an initialized manager over a file in a temporary directory.
    pub async fn file(strategy: StrategyKind) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("data").join("canopy.db");
        let storage: Arc<dyn StorageBackend> = Arc::new(
            FileBackend::open_with_create_dirs(&path).expect("Failed to open file backend"),
        );
        let manager = TransactionManager::new(
            storage,
            Arc::new(KindRegistry::new()),
            Config::default().strategy(strategy),
            None,
        );
        manager
            .initialize()
            .await
            .expect("Failed to initialize manager");
        Self {
            manager: Arc::new(manager),
            _temp_dir: Some(temp_dir),
        }
    }

    /// A handle to the manager for spawned tasks.
    pub fn shared(&self) -> Arc<TransactionManager> {
        Arc::clone(&self.manager)
    }

    /// Returns the data file path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|d| d.path().join("data").join("canopy.db"))
    }
}

impl std::ops::Deref for TestManager {
    type Target = TransactionManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// One simulated process of a [`CacheCluster`].
pub struct ClusterNode {
    /// The process's manager.
    pub manager: TransactionManager,
    /// The process's cache utility.
    pub cache: Arc<CacheUtility>,
}

impl std::ops::Deref for ClusterNode {
    type Target = TransactionManager;

    fn deref(&self) -> &Self::Target {
        &self.manager
    }
}

/// Several managers acting as separate processes.
///
/// Every node has its own in-process cache tier but shares the storage,
/// the shared cache tier and the pub/sub channel.
pub struct CacheCluster {
    /// Shared storage.
    pub storage: Arc<InMemoryBackend>,
    /// Shared cache tier.
    pub shared: Arc<MemorySharedCache>,
    /// Shared invalidation channel.
    pub bus: Arc<MemoryPubSub>,
    /// The simulated processes.
    pub nodes: Vec<ClusterNode>,
}

impl CacheCluster {
    /// Starts `size` nodes with the given configurations.
    pub async fn new(size: usize, config: Config, cache_config: CacheConfig) -> Self {
        let storage = Arc::new(InMemoryBackend::new());
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let mut nodes = Vec::with_capacity(size);
        for _ in 0..size {
            let cache = Arc::new(
                CacheUtility::new(cache_config.clone(), Arc::new(CborCodec))
                    .with_shared(shared.clone())
                    .with_pubsub(bus.clone()),
            );
            cache
                .initialize()
                .await
                .expect("Failed to subscribe cache");
            let manager = TransactionManager::new(
                storage.clone(),
                Arc::new(KindRegistry::new()),
                config.clone(),
                Some(Arc::clone(&cache)),
            );
            nodes.push(ClusterNode { manager, cache });
        }
        if let Some(first) = nodes.first() {
            first
                .initialize()
                .await
                .expect("Failed to initialize manager");
        }
        Self {
            storage,
            shared,
            bus,
            nodes,
        }
    }

    /// Starts `size` nodes with default configurations.
    pub async fn with_defaults(size: usize) -> Self {
        Self::new(size, Config::default(), CacheConfig::default()).await
    }

    /// The `index`-th node.
    pub fn node(&self, index: usize) -> &ClusterNode {
        &self.nodes[index]
    }
}

/// Commits a new child of the root with `fields` and returns its oid.
pub async fn seed_child(
    manager: &TransactionManager,
    name: &str,
    fields: &[(&str, Value)],
) -> Oid {
    let mut object = PersistentObject::new("item");
    for (key, value) in fields {
        object = object.with_field(*key, value.clone());
    }
    let mut txn = manager.begin().await.expect("Failed to begin");
    let oid = txn
        .add_child(&Oid::root(), name, object)
        .await
        .expect("Failed to add child");
    txn.commit().await.expect("Failed to commit seed");
    oid
}

/// Reads one field of a committed object in a fresh read-only transaction.
pub async fn read_field(manager: &TransactionManager, oid: &Oid, field: &str) -> Option<Value> {
    let mut txn = manager.begin_read_only().await.expect("Failed to begin");
    let object = txn.get(oid).await.expect("Failed to load");
    txn.abort().await.expect("Failed to abort");
    object.and_then(|o| o.get(field).cloned())
}
