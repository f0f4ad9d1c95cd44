//! Transaction manager: the entry point for units of work.

use crate::cache::TransactionCache;
use crate::config::Config;
use crate::context::StrategyContext;
use crate::error::CoreResult;
use crate::lock::LockTable;
use crate::object::PersistentObject;
use crate::registry::{KindRegistry, ROOT_KIND};
use crate::strategy::{strategy_for, TransactionStrategy};
use crate::transaction::Transaction;
use canopy_cache::CacheUtility;
use canopy_storage::{Oid, StorageBackend};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Future returned by a unit of work passed to [`TransactionManager::run`].
pub type TxnFuture<'t, T> = Pin<Box<dyn Future<Output = CoreResult<T>> + Send + 't>>;

/// Transaction counters.
///
/// All counters are atomic and can be read while transactions run.
#[derive(Debug, Default)]
pub struct TransactionStats {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    resolved: AtomicU64,
    retries: AtomicU64,
}

impl TransactionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolved(&self, objects: usize) {
        self.resolved.fetch_add(objects as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`TransactionStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transactions begun.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted, including after a conflict.
    pub aborted: u64,
    /// Votes that reported a conflict.
    pub conflicts: u64,
    /// Objects merged by a resolver.
    pub resolved: u64,
    /// Units of work replayed by [`TransactionManager::run`].
    pub retries: u64,
}

/// Creates transactions against one storage backend.
///
/// The manager owns the strategy, the kind registry, the process-wide lock
/// table and (optionally) the cache utility; every transaction it begins
/// shares them.
///
/// # Example
///
/// ```rust,ignore
/// let manager = TransactionManager::new(storage, Arc::new(KindRegistry::new()), Config::default(), None);
/// manager.initialize().await?;
///
/// let mut txn = manager.begin().await?;
/// txn.add_child(&Oid::root(), "page", PersistentObject::new("page")).await?;
/// txn.commit().await?;
/// ```
pub struct TransactionManager {
    storage: Arc<dyn StorageBackend>,
    registry: Arc<KindRegistry>,
    config: Config,
    strategy: Arc<dyn TransactionStrategy>,
    cache: Option<Arc<CacheUtility>>,
    locks: Arc<LockTable>,
    stats: Arc<TransactionStats>,
}

impl TransactionManager {
    /// Creates a manager. Pass `None` for `cache` to read straight from
    /// storage.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        registry: Arc<KindRegistry>,
        config: Config,
        cache: Option<Arc<CacheUtility>>,
    ) -> Self {
        let strategy = strategy_for(config.strategy);
        info!(
            db = %config.db_id,
            strategy = strategy.name(),
            cache = cache.is_some(),
            "transaction manager created"
        );
        Self {
            storage,
            registry,
            config,
            strategy,
            cache,
            locks: Arc::new(LockTable::new()),
            stats: Arc::new(TransactionStats::new()),
        }
    }

    /// Creates the root container if the database is empty.
    pub async fn initialize(&self) -> CoreResult<()> {
        if self.storage.load(&Oid::root()).await?.is_some() {
            return Ok(());
        }
        let root = PersistentObject::with_oid(Oid::root(), ROOT_KIND);
        let record = self.registry.encode(&root)?;
        let tid = self.storage.next_tid().await?;
        let token = self.storage.start_transaction(false).await?;
        if let Err(err) = self.storage.store(token, tid, record).await {
            self.storage.abort(token).await?;
            return Err(err.into());
        }
        let committed = self.storage.commit(token, tid).await?;
        info!(db = %self.config.db_id, tid = %committed, "created root");
        Ok(())
    }

    /// Begins a read-write transaction.
    pub async fn begin(&self) -> CoreResult<Transaction> {
        self.begin_with(self.config.read_only).await
    }

    /// Begins a transaction that rejects writes.
    pub async fn begin_read_only(&self) -> CoreResult<Transaction> {
        self.begin_with(true).await
    }

    async fn begin_with(&self, read_only: bool) -> CoreResult<Transaction> {
        let base_tid = self.storage.current_tid().await?;
        let ctx = StrategyContext::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.registry),
            Arc::clone(&self.locks),
            self.config.lock_timeout,
            read_only,
            base_tid,
        );
        let cache = TransactionCache::new(self.cache.clone(), self.config.db_id.clone());
        let mut txn = Transaction::new(
            ctx,
            Arc::clone(&self.strategy),
            cache,
            Arc::clone(&self.stats),
        );
        txn.tpc_begin().await?;
        self.stats.record_start();
        debug!(base_tid = %base_tid, read_only, "transaction begun");
        Ok(txn)
    }

    /// Runs `work` in a fresh transaction and commits it, replaying the
    /// whole unit on retryable failures.
    ///
    /// `work` runs at most `max_retries` times (at least once). An error
    /// returned by `work` itself aborts the transaction and is returned
    /// unless it is retryable.
    ///
    /// ```rust,ignore
    /// manager
    ///     .run(|txn| Box::pin(async move {
    ///         txn.edit(&oid).await?.set("title", "hello");
    ///         Ok(())
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run<T, F>(&self, mut work: F) -> CoreResult<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Transaction) -> TxnFuture<'t, T> + Send,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let mut txn = self.begin().await?;
            let result = match work(&mut txn).await {
                Ok(value) => txn.commit().await.map(|_| value),
                Err(err) => {
                    if let Err(abort_err) = txn.abort().await {
                        warn!(error = %abort_err, "error aborting unit of work");
                    }
                    Err(err)
                }
            };
            match result {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %err, "retrying unit of work");
                    self.stats.record_retry();
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Transaction counters.
    #[must_use]
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Storage backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Cache utility, if caching is enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<CacheUtility>> {
        self.cache.as_ref()
    }

    /// Manager configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Kind registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<KindRegistry> {
        &self.registry
    }

    /// Process-wide object locks.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Name of the configured strategy.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("strategy", &self.strategy.name())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}
