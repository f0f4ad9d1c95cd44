//! Transaction state shared with strategies.

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockTable, ObjectLock};
use crate::object::PersistentObject;
use crate::registry::KindRegistry;
use canopy_storage::{Oid, Record, StorageBackend, Tid, TxnToken};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The part of a transaction a [`TransactionStrategy`](crate::TransactionStrategy)
/// may read and drive.
///
/// Registered objects live here keyed by oid; callers always re-resolve by
/// id rather than holding references across calls.
pub struct StrategyContext {
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) registry: Arc<KindRegistry>,
    pub(crate) locks: Arc<LockTable>,
    pub(crate) lock_timeout: Duration,
    pub(crate) read_only: bool,
    pub(crate) base_tid: Tid,
    pub(crate) tid: Option<Tid>,
    pub(crate) token: Option<TxnToken>,
    pub(crate) added: HashMap<Oid, PersistentObject>,
    pub(crate) added_order: Vec<Oid>,
    pub(crate) added_children: HashMap<(Oid, String), Oid>,
    pub(crate) modified: HashMap<Oid, PersistentObject>,
    pub(crate) deleted: HashMap<Oid, PersistentObject>,
    pub(crate) written: Vec<Record>,
    pub(crate) held: Vec<ObjectLock>,
}

impl StrategyContext {
    pub(crate) fn new(
        storage: Arc<dyn StorageBackend>,
        registry: Arc<KindRegistry>,
        locks: Arc<LockTable>,
        lock_timeout: Duration,
        read_only: bool,
        base_tid: Tid,
    ) -> Self {
        Self {
            storage,
            registry,
            locks,
            lock_timeout,
            read_only,
            base_tid,
            tid: None,
            token: None,
            added: HashMap::new(),
            added_order: Vec::new(),
            added_children: HashMap::new(),
            modified: HashMap::new(),
            deleted: HashMap::new(),
            written: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Storage backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Writer, reader and resolver tables.
    #[must_use]
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// Highest committed tid when the transaction began.
    #[must_use]
    pub fn base_tid(&self) -> Tid {
        self.base_tid
    }

    /// Tid taken for this transaction, if any yet.
    #[must_use]
    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    /// Backend transaction, if opened.
    #[must_use]
    pub fn token(&self) -> Option<TxnToken> {
        self.token
    }

    /// Returns true if the transaction may write.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        !self.read_only
    }

    /// Returns true if any object is added, modified or deleted.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }

    /// Objects registered as modified.
    #[must_use]
    pub fn modified(&self) -> &HashMap<Oid, PersistentObject> {
        &self.modified
    }

    /// Replaces a modified object with a resolved version.
    ///
    /// The replacement keeps the change set recorded so far.
    pub fn replace_modified(&mut self, mut object: PersistentObject) {
        if let Some(previous) = self.modified.remove(object.oid()) {
            object.adopt_changes(previous.changes().clone());
        }
        self.modified.insert(object.oid().clone(), object);
    }

    /// Takes a tid from the backend unless one is already held.
    pub async fn take_tid(&mut self) -> CoreResult<Tid> {
        if let Some(tid) = self.tid {
            return Ok(tid);
        }
        let tid = self.storage.next_tid().await?;
        self.tid = Some(tid);
        Ok(tid)
    }

    /// Opens the backend transaction unless one is already open.
    pub async fn open_backend(&mut self, verify_serials: bool) -> CoreResult<TxnToken> {
        if let Some(token) = self.token {
            return Ok(token);
        }
        let token = self.storage.start_transaction(verify_serials).await?;
        self.token = Some(token);
        Ok(token)
    }

    fn open(&self) -> CoreResult<(TxnToken, Tid)> {
        match (self.token, self.tid) {
            (Some(token), Some(tid)) => Ok((token, tid)),
            _ => Err(CoreError::invalid_operation(
                "store phase has not opened a backend transaction",
            )),
        }
    }

    /// Buffers `object` in the backend transaction, based on `old_serial`.
    pub async fn write(
        &mut self,
        object: &PersistentObject,
        old_serial: Option<Tid>,
    ) -> CoreResult<Record> {
        let (token, tid) = self.open()?;
        let record = self.registry.encode(object)?.with_old_serial(old_serial);
        let (stamped, _size) = self.storage.store(token, tid, record.clone()).await?;
        let record = Record {
            tid: stamped,
            ..record
        };
        match self.written.iter_mut().find(|r| r.oid == record.oid) {
            Some(existing) => *existing = record.clone(),
            None => self.written.push(record.clone()),
        }
        Ok(record)
    }

    /// Buffers a deletion in the backend transaction.
    pub async fn remove(&mut self, oid: &Oid) -> CoreResult<()> {
        let (token, _) = self.open()?;
        self.storage.delete(token, oid).await?;
        Ok(())
    }

    /// Commits the backend transaction and returns the visible tid.
    pub async fn commit_backend(&mut self) -> CoreResult<Tid> {
        let (token, tid) = self.open()?;
        let committed = self.storage.commit(token, tid).await?;
        self.token = None;
        Ok(committed)
    }

    /// Drops the backend transaction, if any. Failures are logged.
    pub async fn abort_backend(&mut self) {
        if let Some(token) = self.token.take() {
            if let Err(e) = self.storage.abort(token).await {
                warn!(token = %token, error = %e, "error aborting backend transaction");
            }
        }
    }

    /// Returns true if this transaction holds the lock on `oid`.
    #[must_use]
    pub fn holds_lock(&self, oid: &Oid) -> bool {
        self.held.iter().any(|lock| lock.oid() == oid)
    }

    /// Waits for the lock on `oid` and keeps it until the transaction ends.
    pub async fn lock(&mut self, oid: &Oid) -> CoreResult<()> {
        if self.holds_lock(oid) {
            return Ok(());
        }
        let lock = self.locks.acquire(oid, self.lock_timeout).await?;
        self.held.push(lock);
        Ok(())
    }

    /// Releases every held lock.
    pub fn release_locks(&mut self) {
        self.held.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.added.clear();
        self.added_order.clear();
        self.added_children.clear();
        self.modified.clear();
        self.deleted.clear();
        self.written.clear();
    }
}

impl std::fmt::Debug for StrategyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyContext")
            .field("base_tid", &self.base_tid)
            .field("tid", &self.tid)
            .field("token", &self.token)
            .field("added", &self.added.len())
            .field("modified", &self.modified.len())
            .field("deleted", &self.deleted.len())
            .field("locks", &self.held.len())
            .finish()
    }
}
