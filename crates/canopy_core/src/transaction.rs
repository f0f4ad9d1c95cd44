//! One unit of work.
//!
//! A [`Transaction`] accumulates added, modified and deleted objects, reads
//! through the object cache, and commits in three steps driven by its
//! strategy:
//!
//! 1. [`tpc_commit`](Transaction::tpc_commit) buffers every write in the
//!    backend transaction
//! 2. [`vote`](Transaction::vote) checks for (and possibly resolves)
//!    concurrent writes
//! 3. [`finish`](Transaction::finish) commits, updates serials and
//!    publishes cache invalidations
//!
//! [`commit`](Transaction::commit) runs all three and cleans up on failure.

use crate::cache::{ChangeKind, TransactionCache, TransactionCacheStats};
use crate::context::StrategyContext;
use crate::error::{CoreError, CoreResult};
use crate::manager::TransactionStats;
use crate::object::{Location, PersistentObject};
use crate::strategy::{TransactionStrategy, VoteOutcome};
use bytes::Bytes;
use canopy_cache::CacheValue;
use canopy_storage::{BlobId, Oid, Record, StorageError, Tid};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Children fetched per backend round-trip by [`Transaction::get_children`].
pub const CHILD_BATCH_SIZE: usize = 15;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting reads and writes.
    Active,
    /// Voted; waiting for finish or abort.
    Voting,
    /// Committed (terminal).
    Committed,
    /// Aborted (terminal).
    Aborted,
}

impl TransactionStatus {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Committed | TransactionStatus::Aborted)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Voting => "voting",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborted => "aborted",
        })
    }
}

/// A unit of work against one storage backend.
///
/// Created by [`TransactionManager::begin`](crate::TransactionManager::begin).
/// A transaction is driven by one task at a time; every method takes
/// `&mut self`.
pub struct Transaction {
    ctx: StrategyContext,
    strategy: Arc<dyn TransactionStrategy>,
    cache: TransactionCache,
    stats: Arc<TransactionStats>,
    status: TransactionStatus,
    stored: bool,
    vote: Option<VoteOutcome>,
}

impl Transaction {
    pub(crate) fn new(
        ctx: StrategyContext,
        strategy: Arc<dyn TransactionStrategy>,
        cache: TransactionCache,
        stats: Arc<TransactionStats>,
    ) -> Self {
        Self {
            ctx,
            strategy,
            cache,
            stats,
            status: TransactionStatus::Active,
            stored: false,
            vote: None,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Tid taken for this transaction, if any yet.
    #[must_use]
    pub fn tid(&self) -> Option<Tid> {
        self.ctx.tid()
    }

    /// Highest committed tid when the transaction began.
    #[must_use]
    pub fn base_tid(&self) -> Tid {
        self.ctx.base_tid()
    }

    /// Returns true if writes are rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        !self.ctx.is_writable()
    }

    /// Name of the strategy in use.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Returns true if anything was added, modified or deleted.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.ctx.has_changes()
    }

    /// Cache traffic of this transaction.
    #[must_use]
    pub fn cache_stats(&self) -> TransactionCacheStats {
        self.cache.stats()
    }

    /// The registered (added or modified) version of `oid`, if any.
    #[must_use]
    pub fn registered(&self, oid: &Oid) -> Option<&PersistentObject> {
        self.ctx
            .modified
            .get(oid)
            .or_else(|| self.ctx.added.get(oid))
    }

    /// Returns true if `oid` is scheduled for deletion.
    #[must_use]
    pub fn is_deleted(&self, oid: &Oid) -> bool {
        self.ctx.deleted.contains_key(oid)
    }

    fn ensure_active(&self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Voting => {
                Err(CoreError::invalid_operation("transaction is voting"))
            }
            status => Err(CoreError::TransactionClosed { status }),
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        self.ensure_active()
    }

    // ---- reads ---------------------------------------------------------

    async fn cached_record(&mut self, key: &str) -> Option<Record> {
        match self.cache.get(key).await {
            Some(CacheValue::Record(cached)) => Some(cached.to_record()),
            _ => None,
        }
    }

    async fn load_record(&mut self, oid: &Oid) -> CoreResult<Option<Record>> {
        let key = self.cache.oid_key(oid);
        if let Some(record) = self.cached_record(&key).await {
            return Ok(Some(record));
        }
        let record = self.ctx.storage.load(oid).await?;
        if let Some(record) = record.as_ref().filter(|r| !r.is_trashed()) {
            self.cache.set_record(record).await;
        }
        Ok(record)
    }

    async fn load_fresh(&self, oid: &Oid) -> CoreResult<Option<PersistentObject>> {
        match self.ctx.storage.load(oid).await? {
            Some(record) if !record.is_trashed() => Ok(Some(self.ctx.registry.decode(&record)?)),
            _ => Ok(None),
        }
    }

    // A committed record, seen through this transaction's own changes.
    fn view(&self, record: &Record) -> CoreResult<Option<PersistentObject>> {
        if record.is_trashed() || self.ctx.deleted.contains_key(&record.oid) {
            return Ok(None);
        }
        if let Some(object) = self.ctx.modified.get(&record.oid) {
            return Ok(Some(object.clone()));
        }
        Ok(Some(self.ctx.registry.decode(record)?))
    }

    /// Loads an object by id.
    pub async fn get(&mut self, oid: &Oid) -> CoreResult<Option<PersistentObject>> {
        if let Some(object) = self.registered(oid) {
            return Ok(Some(object.clone()));
        }
        if self.ctx.deleted.contains_key(oid) {
            return Ok(None);
        }
        match self.load_record(oid).await? {
            Some(record) => self.view(&record),
            None => Ok(None),
        }
    }

    /// Loads a child by name.
    pub async fn get_child(
        &mut self,
        parent: &Oid,
        name: &str,
    ) -> CoreResult<Option<PersistentObject>> {
        let slot = (parent.clone(), name.to_string());
        if let Some(object) = self
            .ctx
            .added_children
            .get(&slot)
            .and_then(|oid| self.ctx.added.get(oid))
        {
            return Ok(Some(object.clone()));
        }
        let key = self.cache.child_key(parent, name);
        let record = match self.cached_record(&key).await {
            Some(record) => Some(record),
            None => {
                let record = self.ctx.storage.get_child(parent, name).await?;
                if let Some(record) = &record {
                    self.cache.set_record(record).await;
                }
                record
            }
        };
        let Some(record) = record else {
            return Ok(None);
        };
        Ok(self
            .view(&record)?
            .filter(|object| object.parent_id() == Some(parent) && object.name() == Some(name)))
    }

    /// Returns true if `parent` has a child called `name`.
    pub async fn contains(&mut self, parent: &Oid, name: &str) -> CoreResult<bool> {
        if self
            .ctx
            .added_children
            .contains_key(&(parent.clone(), name.to_string()))
        {
            return Ok(true);
        }
        Ok(self.get_child(parent, name).await?.is_some())
    }

    /// Number of committed children of `parent`.
    pub async fn len(&mut self, parent: &Oid) -> CoreResult<usize> {
        let key = self.cache.len_key(parent);
        if let Some(CacheValue::Count(n)) = self.cache.get(&key).await {
            return Ok(usize::try_from(n).unwrap_or(usize::MAX));
        }
        let n = self.ctx.storage.child_count(parent).await?;
        self.cache.set(&[key], CacheValue::Count(n as u64)).await;
        Ok(n)
    }

    /// Sorted names of the committed children of `parent`.
    pub async fn keys(&mut self, parent: &Oid) -> CoreResult<Vec<String>> {
        let key = self.cache.keys_key(parent);
        if let Some(CacheValue::Keys(keys)) = self.cache.get(&key).await {
            return Ok(keys);
        }
        let keys = self.ctx.storage.child_keys(parent).await?;
        self.cache.set(&[key], CacheValue::Keys(keys.clone())).await;
        Ok(keys)
    }

    /// Loads several children, in the order of `names`; missing ones are
    /// skipped.
    pub async fn get_children(
        &mut self,
        parent: &Oid,
        names: &[String],
    ) -> CoreResult<Vec<PersistentObject>> {
        let mut out = Vec::with_capacity(names.len());
        for batch in names.chunks(CHILD_BATCH_SIZE) {
            let mut found: HashMap<String, Record> = HashMap::new();
            let mut missing = Vec::new();
            for name in batch {
                let key = self.cache.child_key(parent, name);
                match self.cached_record(&key).await {
                    Some(record) => {
                        found.insert(name.clone(), record);
                    }
                    None => missing.push(name.clone()),
                }
            }
            if !missing.is_empty() {
                for record in self.ctx.storage.get_children(parent, &missing).await? {
                    self.cache.set_record(&record).await;
                    if let Some(name) = record.local_name.clone() {
                        found.insert(name, record);
                    }
                }
            }
            for name in batch {
                let slot = (parent.clone(), name.clone());
                if let Some(object) = self
                    .ctx
                    .added_children
                    .get(&slot)
                    .and_then(|oid| self.ctx.added.get(oid))
                {
                    out.push(object.clone());
                } else if let Some(record) = found.remove(name) {
                    out.extend(self.view(&record)?);
                }
            }
        }
        Ok(out)
    }

    /// Every committed child of `parent` with its name.
    pub async fn items(&mut self, parent: &Oid) -> CoreResult<Vec<(String, PersistentObject)>> {
        let keys = self.keys(parent).await?;
        let children = self.get_children(parent, &keys).await?;
        Ok(children
            .into_iter()
            .filter_map(|child| child.name().map(|name| (name.to_string(), child.clone())))
            .collect())
    }

    /// Loads an annotation by owner and name.
    pub async fn get_annotation(
        &mut self,
        owner: &Oid,
        name: &str,
    ) -> CoreResult<Option<PersistentObject>> {
        let location = Location::annotation(owner.clone(), name);
        if let Some(object) = self
            .ctx
            .added
            .values()
            .chain(self.ctx.modified.values())
            .find(|object| object.location() == &location)
        {
            return Ok(Some(object.clone()));
        }
        let key = self.cache.annotation_key(owner, name);
        let record = match self.cache.get(&key).await {
            Some(CacheValue::Empty) => return Ok(None),
            Some(CacheValue::Record(cached)) => Some(cached.to_record()),
            _ => {
                let record = self.ctx.storage.get_annotation(owner, name).await?;
                match &record {
                    Some(record) => self.cache.set_record(record).await,
                    None => self.cache.set(&[key], CacheValue::Empty).await,
                }
                record
            }
        };
        let Some(record) = record else {
            return Ok(None);
        };
        Ok(self
            .view(&record)?
            .filter(|object| object.location() == &location))
    }

    /// Sorted annotation names of `owner`.
    pub async fn annotation_keys(&mut self, owner: &Oid) -> CoreResult<Vec<String>> {
        let key = self.cache.annotation_keys_key(owner);
        if let Some(CacheValue::Keys(keys)) = self.cache.get(&key).await {
            return Ok(keys);
        }
        let keys = self.ctx.storage.annotation_keys(owner).await?;
        self.cache.set(&[key], CacheValue::Keys(keys.clone())).await;
        Ok(keys)
    }

    /// Reloads `oid` from storage, bypassing the cache.
    ///
    /// A registered version takes the stored fields and serial; its own
    /// recorded changes are re-applied on top.
    pub async fn refresh(&mut self, oid: &Oid) -> CoreResult<Option<PersistentObject>> {
        let Some(fresh) = self.load_fresh(oid).await? else {
            return Ok(None);
        };
        if let Some(object) = self.ctx.modified.remove(oid) {
            let rebased = rebase(object, fresh)?;
            self.ctx.modified.insert(oid.clone(), rebased.clone());
            return Ok(Some(rebased));
        }
        Ok(Some(fresh))
    }

    // ---- writes --------------------------------------------------------

    async fn touch(&mut self, oid: &Oid) -> CoreResult<bool> {
        let strategy = Arc::clone(&self.strategy);
        match strategy.on_touch(&mut self.ctx, oid).await {
            Ok(refresh) => Ok(refresh),
            Err(err @ CoreError::LockTimeout { .. }) => {
                warn!(oid = %oid, "lock wait timed out; aborting");
                self.abort().await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn index_added(&mut self, object: &PersistentObject) {
        let oid = object.oid();
        self.ctx.added_children.retain(|_, existing| existing != oid);
        if let Location::Tree { parent, name } = object.location() {
            self.ctx
                .added_children
                .insert((parent.clone(), name.clone()), oid.clone());
        }
    }

    /// Registers an object for writing at commit.
    ///
    /// New objects are added; stored ones are modified. Registering an
    /// already registered oid merges change sets, keeping the originals
    /// recorded first.
    pub async fn register(&mut self, object: PersistentObject) -> CoreResult<()> {
        self.ensure_writable()?;
        let oid = object.oid().clone();
        if object.is_new() {
            let object = match self.ctx.added.remove(&oid) {
                Some(mut existing) => {
                    existing.merge(object);
                    existing
                }
                None => {
                    self.ctx.added_order.push(oid.clone());
                    object
                }
            };
            self.index_added(&object);
            self.ctx.added.insert(oid, object);
            return Ok(());
        }
        if let Some(existing) = self.ctx.modified.get_mut(&oid) {
            existing.merge(object);
            return Ok(());
        }
        if self.ctx.deleted.contains_key(&oid) {
            return Err(CoreError::invalid_operation(format!(
                "object {oid} is deleted in this transaction"
            )));
        }
        let mut object = object;
        if self.touch(&oid).await? {
            if let Some(fresh) = self.load_fresh(&oid).await? {
                object = rebase(object, fresh)?;
            }
        }
        debug!(oid = %oid, "registered");
        self.ctx.modified.insert(oid, object);
        Ok(())
    }

    /// Loads and registers an object, returning the registered version.
    pub async fn edit(&mut self, oid: &Oid) -> CoreResult<&mut PersistentObject> {
        self.ensure_writable()?;
        if self.ctx.added.contains_key(oid) {
            return self
                .ctx
                .added
                .get_mut(oid)
                .ok_or_else(|| CoreError::NotFound(oid.clone()));
        }
        if !self.ctx.modified.contains_key(oid) {
            if self.ctx.deleted.contains_key(oid) {
                return Err(CoreError::NotFound(oid.clone()));
            }
            let object = if self.touch(oid).await? {
                self.load_fresh(oid).await?
            } else {
                self.get(oid).await?
            };
            let object = object.ok_or_else(|| CoreError::NotFound(oid.clone()))?;
            self.ctx.modified.insert(oid.clone(), object);
        }
        self.ctx
            .modified
            .get_mut(oid)
            .ok_or_else(|| CoreError::NotFound(oid.clone()))
    }

    /// Adds a new object as child `name` of `parent`.
    pub async fn add_child(
        &mut self,
        parent: &Oid,
        name: &str,
        mut object: PersistentObject,
    ) -> CoreResult<Oid> {
        self.ensure_writable()?;
        if !object.is_new() {
            return Err(CoreError::invalid_operation(format!(
                "object {} is already stored; move it instead",
                object.oid()
            )));
        }
        if self.contains(parent, name).await? {
            return Err(StorageError::DuplicateName {
                parent: parent.clone(),
                name: name.to_string(),
            }
            .into());
        }
        object.place(Location::child(parent.clone(), name));
        let oid = object.oid().clone();
        self.register(object).await?;
        Ok(oid)
    }

    /// Attaches a new annotation `name` to `owner`.
    pub async fn add_annotation(
        &mut self,
        owner: &Oid,
        name: &str,
        mut object: PersistentObject,
    ) -> CoreResult<Oid> {
        self.ensure_writable()?;
        if !object.is_new() {
            return Err(CoreError::invalid_operation(format!(
                "object {} is already stored",
                object.oid()
            )));
        }
        if self.get_annotation(owner, name).await?.is_some() {
            return Err(StorageError::DuplicateName {
                parent: owner.clone(),
                name: name.to_string(),
            }
            .into());
        }
        object.place(Location::annotation(owner.clone(), name));
        let oid = object.oid().clone();
        self.register(object).await?;
        Ok(oid)
    }

    /// Deletes an object at commit.
    pub async fn delete(&mut self, oid: &Oid) -> CoreResult<()> {
        self.ensure_writable()?;
        if self.ctx.added.remove(oid).is_some() {
            self.ctx.added_order.retain(|o| o != oid);
            self.ctx.added_children.retain(|_, o| o != oid);
            return Ok(());
        }
        let object = match self.ctx.modified.remove(oid) {
            Some(object) => object,
            None => {
                self.touch(oid).await?;
                self.get(oid)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(oid.clone()))?
            }
        };
        self.ctx.deleted.insert(oid.clone(), object);
        Ok(())
    }

    // ---- blobs ---------------------------------------------------------

    /// Writes one chunk of a blob owned by `oid`.
    pub async fn write_blob_chunk(
        &mut self,
        blob: &BlobId,
        oid: &Oid,
        index: u32,
        data: Bytes,
    ) -> CoreResult<()> {
        self.ensure_writable()?;
        Ok(self
            .ctx
            .storage
            .write_blob_chunk(blob, oid, index, data)
            .await?)
    }

    /// Reads one chunk of a blob.
    pub async fn read_blob_chunk(&self, blob: &BlobId, index: u32) -> CoreResult<Option<Bytes>> {
        Ok(self.ctx.storage.read_blob_chunk(blob, index).await?)
    }

    /// Reads a whole blob, chunk by chunk.
    pub async fn read_blob_chunks(&self, blob: &BlobId) -> CoreResult<Vec<Bytes>> {
        Ok(self.ctx.storage.read_blob_chunks(blob).await?)
    }

    /// Removes a blob.
    pub async fn delete_blob(&mut self, blob: &BlobId) -> CoreResult<()> {
        self.ensure_writable()?;
        Ok(self.ctx.storage.delete_blob(blob).await?)
    }

    // ---- two-phase commit ----------------------------------------------

    pub(crate) async fn tpc_begin(&mut self) -> CoreResult<()> {
        let strategy = Arc::clone(&self.strategy);
        strategy.begin(&mut self.ctx).await
    }

    /// Store phase: buffers every added, modified and deleted object in the
    /// backend transaction. Runs at most once.
    pub async fn tpc_commit(&mut self) -> CoreResult<()> {
        if self.stored {
            return Ok(());
        }
        self.ensure_active()?;
        if self.ctx.has_changes() {
            self.ctx.take_tid().await?;
            self.ctx.open_backend(self.strategy.verify_serials()).await?;
            // Deletes first, so their names are free for objects added here.
            let deleted: Vec<Oid> = self.ctx.deleted.keys().cloned().collect();
            for oid in &deleted {
                self.ctx.remove(oid).await?;
            }
            for oid in self.ctx.added_order.clone() {
                if let Some(object) = self.ctx.added.get(&oid).cloned() {
                    self.ctx.write(&object, None).await?;
                }
            }
            let modified: Vec<PersistentObject> = self.ctx.modified.values().cloned().collect();
            for object in &modified {
                self.ctx.write(object, object.serial()).await?;
            }
            debug!(
                tid = ?self.ctx.tid(),
                added = self.ctx.added.len(),
                modified = modified.len(),
                deleted = deleted.len(),
                "stored"
            );
        }
        self.stored = true;
        Ok(())
    }

    /// Vote phase. Runs the store phase first if needed.
    ///
    /// The outcome is kept: once voting, repeated calls return the same
    /// result without checking again.
    pub async fn vote(&mut self) -> CoreResult<()> {
        if self.status.is_terminal() {
            return Err(CoreError::TransactionClosed {
                status: self.status,
            });
        }
        if let Some(outcome) = &self.vote {
            return outcome.clone().into_result();
        }
        self.tpc_commit().await?;
        let outcome = if self.ctx.has_changes() {
            let strategy = Arc::clone(&self.strategy);
            strategy.vote(&mut self.ctx).await?
        } else {
            VoteOutcome::COMMIT
        };
        match &outcome {
            VoteOutcome::Commit { resolved } => self.stats.record_resolved(*resolved),
            _ => self.stats.record_conflict(),
        }
        self.status = TransactionStatus::Voting;
        self.vote = Some(outcome.clone());
        outcome.into_result()
    }

    fn invalidation_keys(&self) -> Vec<String> {
        let mut keys = BTreeSet::new();
        let groups = [
            (&self.ctx.added, ChangeKind::Added),
            (&self.ctx.modified, ChangeKind::Modified),
            (&self.ctx.deleted, ChangeKind::Deleted),
        ];
        for (objects, change) in groups {
            for object in objects.values() {
                keys.extend(self.cache.keys_for(object, change));
            }
        }
        keys.into_iter().collect()
    }

    /// Finish phase: commits after a successful vote.
    ///
    /// Returns the commit tid, or `None` if nothing was written. On error
    /// the caller must [`abort`](Transaction::abort).
    pub async fn finish(&mut self) -> CoreResult<Option<Tid>> {
        match (&self.status, &self.vote) {
            (TransactionStatus::Voting, Some(outcome)) if outcome.is_commit() => {}
            (TransactionStatus::Voting, Some(outcome)) => {
                return outcome.clone().into_result().map(|()| None);
            }
            (status, _) if status.is_terminal() => {
                return Err(CoreError::TransactionClosed { status: *status });
            }
            _ => return Err(CoreError::invalid_operation("finish called before vote")),
        }
        let strategy = Arc::clone(&self.strategy);
        let committed = if self.ctx.has_changes() {
            Some(strategy.finish(&mut self.ctx).await?)
        } else {
            if self.ctx.token().is_some() {
                strategy.finish(&mut self.ctx).await?;
            }
            None
        };
        self.ctx.release_locks();

        if let Some(tid) = committed {
            let keys = self.invalidation_keys();
            for record in &self.ctx.written {
                self.cache.store_object(record);
            }
            self.cache.close(Some(tid), keys, true, true).await;
            for object in self
                .ctx
                .added
                .values_mut()
                .chain(self.ctx.modified.values_mut())
            {
                object.mark_stored(tid);
            }
            debug!(tid = %tid, "committed");
        }
        self.ctx.written.clear();
        self.status = TransactionStatus::Committed;
        self.stats.record_commit();
        Ok(committed)
    }

    /// Stores, votes and finishes.
    ///
    /// On a conflict the backend transaction is aborted without touching
    /// the cache, except after a `TidConflict`, which still invalidates
    /// (without publishing) every key this transaction touched. Any other
    /// failure aborts normally. The error is returned either way.
    pub async fn commit(&mut self) -> CoreResult<Option<Tid>> {
        if self.status.is_terminal() {
            return Err(CoreError::TransactionClosed {
                status: self.status,
            });
        }
        let result = match self.vote().await {
            Ok(()) => self.finish().await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.fail(err).await;
        }
        result
    }

    async fn fail(&mut self, err: &CoreError) {
        if self.status.is_terminal() {
            return;
        }
        if err.is_conflict() {
            self.ctx.abort_backend().await;
            let invalidate = err.is_tid_conflict();
            let keys = if invalidate {
                self.invalidation_keys()
            } else {
                Vec::new()
            };
            self.cache.close(None, keys, invalidate, false).await;
            self.cleanup();
        } else if let Err(abort_err) = self.abort().await {
            warn!(error = %abort_err, "error aborting failed transaction");
        }
    }

    /// Discards everything. Safe to call more than once.
    pub async fn abort(&mut self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Aborted => return Ok(()),
            TransactionStatus::Committed => {
                return Err(CoreError::TransactionClosed {
                    status: TransactionStatus::Committed,
                })
            }
            _ => {}
        }
        self.ctx.abort_backend().await;
        self.cache.close(None, Vec::new(), false, false).await;
        self.cleanup();
        Ok(())
    }

    fn cleanup(&mut self) {
        self.ctx.release_locks();
        self.ctx.clear();
        self.status = TransactionStatus::Aborted;
        self.stats.record_abort();
        debug!(tid = ?self.ctx.tid(), "aborted");
    }
}

/// Re-applies `object`'s recorded changes onto a fresher stored version.
fn rebase(object: PersistentObject, mut fresh: PersistentObject) -> CoreResult<PersistentObject> {
    for key in object.changes().keys() {
        fresh.apply_change(key, object.change_value(key))?;
    }
    let location = fresh.location().clone();
    let mut rebased = object;
    rebased.refresh_from(fresh);
    rebased.place(location);
    Ok(rebased)
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("status", &self.status)
            .field("strategy", &self.strategy.name())
            .field("ctx", &self.ctx)
            .finish()
    }
}

/// Dropping an unfinished transaction aborts its backend transaction on
/// the current runtime. Locks go with their guards.
impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let Some(token) = self.ctx.token.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let storage = Arc::clone(&self.ctx.storage);
                debug!(token = %token, "aborting backend transaction of dropped transaction");
                handle.spawn(async move {
                    if let Err(e) = storage.abort(token).await {
                        warn!(token = %token, error = %e, "error aborting dropped transaction");
                    }
                });
            }
            Err(_) => warn!(
                token = %token,
                "transaction dropped outside a runtime with an open backend transaction"
            ),
        }
    }
}
