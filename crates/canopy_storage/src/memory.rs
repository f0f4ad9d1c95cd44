//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::record::Record;
use crate::types::{BlobId, Oid, Tid, TxnToken};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// Commits kept in the conflict log. Older conflict queries scan every
/// record instead.
const LOG_RETENTION: usize = 1024;

/// An in-memory storage backend.
///
/// This is the reference implementation of [`StorageBackend`] and is
/// suitable for:
/// - Unit and integration tests
/// - Ephemeral repositories that don't need persistence
/// - The engine behind [`FileBackend`](crate::FileBackend)
///
/// # Thread Safety
///
/// All state sits behind a single `RwLock`; every call is atomic with
/// respect to every other call.
///
/// # Example
///
/// ```rust
/// use canopy_storage::{InMemoryBackend, Oid, Record, StorageBackend};
///
/// # tokio_test_block(async {
/// let backend = InMemoryBackend::new();
/// let token = backend.start_transaction(true).await.unwrap();
/// let tid = backend.next_tid().await.unwrap();
/// let rec = Record::new(Oid::new("a"), "item").with_parent(Oid::root(), "a");
/// backend.store(token, tid, rec).await.unwrap();
/// let committed = backend.commit(token, tid).await.unwrap();
/// assert_eq!(backend.current_tid().await.unwrap(), committed);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryBackend {
    state: RwLock<State>,
    available: AtomicBool,
    failing_commits: AtomicUsize,
}

/// Serializable image of a backend, used by file persistence.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) last_tid: u64,
    pub(crate) committed: Tid,
    pub(crate) records: Vec<Record>,
    pub(crate) blobs: Vec<StoredBlob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredBlob {
    id: BlobId,
    oid: Oid,
    chunks: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct Pending {
    verify: bool,
    writes: BTreeMap<Oid, Record>,
    deletes: BTreeSet<Oid>,
}

#[derive(Debug, Default)]
struct State {
    last_tid: u64,
    committed: Tid,
    next_token: u64,
    records: HashMap<Oid, Record>,
    children: HashMap<Oid, BTreeMap<String, Oid>>,
    annotations: HashMap<Oid, BTreeMap<String, Oid>>,
    log: BTreeMap<Tid, Vec<Oid>>,
    log_floor: Tid,
    blobs: HashMap<BlobId, StoredBlob>,
    pending: HashMap<TxnToken, Pending>,
}

/// What a commit replaced, so it can be taken back.
#[derive(Debug)]
struct Undo {
    committed: Tid,
    tid: Tid,
    previous: Vec<(Oid, Option<Record>)>,
}

impl State {
    fn slot_map(&self, record: &Record) -> &HashMap<Oid, BTreeMap<String, Oid>> {
        if record.owner_id.is_some() {
            &self.annotations
        } else {
            &self.children
        }
    }

    fn slot_map_mut(&mut self, record: &Record) -> &mut HashMap<Oid, BTreeMap<String, Oid>> {
        if record.owner_id.is_some() {
            &mut self.annotations
        } else {
            &mut self.children
        }
    }

    /// Committed occupant of the slot `record` wants to use.
    fn occupant(&self, record: &Record) -> Option<&Oid> {
        let (container, name) = record.slot()?;
        self.slot_map(record).get(container)?.get(name)
    }

    fn unindex(&mut self, record: &Record) {
        let Some((container, name)) = record.slot() else {
            return;
        };
        let map = self.slot_map_mut(record);
        if let Some(names) = map.get_mut(container) {
            if names.get(name) == Some(&record.oid) {
                names.remove(name);
            }
            if names.is_empty() {
                map.remove(container);
            }
        }
    }

    fn index(&mut self, record: &Record) {
        let Some((container, name)) = record.slot() else {
            return;
        };
        let (container, name) = (container.clone(), name.to_string());
        let oid = record.oid.clone();
        self.slot_map_mut(record)
            .entry(container)
            .or_default()
            .insert(name, oid);
    }

    fn apply(&mut self, record: Record) {
        if let Some(old) = self.records.remove(&record.oid) {
            self.unindex(&old);
        }
        self.index(&record);
        self.records.insert(record.oid.clone(), record);
    }

    fn check_duplicate(&self, record: &Record) -> StorageResult<()> {
        match (self.occupant(record), record.slot()) {
            (Some(existing), Some((container, name))) if existing != &record.oid => {
                Err(StorageError::DuplicateName {
                    parent: container.clone(),
                    name: name.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn verify_serials(&self, pending: &Pending) -> StorageResult<()> {
        for record in pending.writes.values() {
            let found = self.records.get(&record.oid).map(|r| r.tid);
            match record.old_serial {
                Some(expected) if found != Some(expected) => {
                    return Err(StorageError::TidConflict {
                        oid: record.oid.clone(),
                        expected: Some(expected),
                        found,
                    });
                }
                None if found.is_some() => {
                    return Err(StorageError::integrity(format!(
                        "object {} already exists",
                        record.oid
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn verify_slots(&self, pending: &Pending) -> StorageResult<()> {
        let mut claimed: HashSet<(bool, &Oid, &str)> = HashSet::new();
        for record in pending.writes.values() {
            let Some((container, name)) = record.slot() else {
                continue;
            };
            let key = (record.owner_id.is_some(), container, name);
            let duplicate = StorageError::DuplicateName {
                parent: container.clone(),
                name: name.to_string(),
            };
            if !claimed.insert(key) {
                return Err(duplicate);
            }
            if let Some(existing) = self.occupant(record) {
                let vacating = pending.deletes.contains(existing)
                    || pending
                        .writes
                        .get(existing)
                        .is_some_and(|moved| moved.slot() != record.slot());
                if existing != &record.oid && !vacating {
                    return Err(duplicate);
                }
            }
        }
        Ok(())
    }

    fn commit(&mut self, token: TxnToken, tid: Tid) -> StorageResult<(Tid, Option<Undo>)> {
        let pending = self
            .pending
            .remove(&token)
            .ok_or(StorageError::UnknownTransaction(token))?;

        if pending.writes.is_empty() && pending.deletes.is_empty() {
            return Ok((tid, None));
        }
        if pending.verify {
            self.verify_serials(&pending)?;
        }
        self.verify_slots(&pending)?;

        let final_tid = if tid <= self.committed {
            self.last_tid += 1;
            Tid(self.last_tid)
        } else {
            self.last_tid = self.last_tid.max(tid.0);
            tid
        };

        let mut touched = Vec::with_capacity(pending.writes.len() + pending.deletes.len());
        let mut previous = Vec::with_capacity(touched.capacity());
        for (oid, mut record) in pending.writes {
            record.tid = final_tid;
            previous.push((oid.clone(), self.records.get(&oid).cloned()));
            touched.push(oid);
            self.apply(record);
        }
        for oid in pending.deletes {
            if let Some(mut record) = self.records.get(&oid).cloned() {
                previous.push((oid.clone(), Some(record.clone())));
                record.parent_id = Some(Oid::trashed());
                record.tid = final_tid;
                touched.push(oid);
                self.apply(record);
            }
        }

        debug!(
            token = %token,
            requested = %tid,
            committed = %final_tid,
            objects = touched.len(),
            "committed"
        );
        let undo = Undo {
            committed: self.committed,
            tid: final_tid,
            previous,
        };
        self.log.insert(final_tid, touched);
        self.prune_log();
        self.committed = final_tid;
        Ok((final_tid, Some(undo)))
    }

    /// Takes a commit back. The tid it used stays spent.
    fn rollback(&mut self, undo: Undo) {
        for (oid, old) in undo.previous.into_iter().rev() {
            if let Some(current) = self.records.remove(&oid) {
                self.unindex(&current);
            }
            if let Some(old) = old {
                self.apply(old);
            }
        }
        self.log.remove(&undo.tid);
        self.committed = undo.committed;
    }

    fn prune_log(&mut self) {
        while self.log.len() > LOG_RETENTION {
            match self.log.pop_first() {
                Some((tid, _)) => self.log_floor = tid,
                None => break,
            }
        }
    }

    fn conflicts(&self, since: Tid, own: Option<Tid>) -> Vec<Record> {
        if since < self.log_floor {
            let mut out: Vec<Record> = self
                .records
                .values()
                .filter(|r| r.tid > since && Some(r.tid) != own)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.tid.cmp(&b.tid).then_with(|| a.oid.cmp(&b.oid)));
            return out;
        }
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for oids in self
            .log
            .range((Bound::Excluded(since), Bound::Unbounded))
            .map(|(_, oids)| oids)
        {
            for oid in oids {
                if !seen.insert(oid) {
                    continue;
                }
                if let Some(record) = self.records.get(oid) {
                    if Some(record.tid) != own && record.tid > since {
                        out.push(record.clone());
                    }
                }
            }
        }
        out
    }

    fn lookup(
        &self,
        map: &HashMap<Oid, BTreeMap<String, Oid>>,
        container: &Oid,
        name: &str,
    ) -> Option<Record> {
        map.get(container)
            .and_then(|names| names.get(name))
            .and_then(|oid| self.records.get(oid))
            .cloned()
    }

    fn snapshot(&self) -> Snapshot {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.tid.cmp(&b.tid).then_with(|| a.oid.cmp(&b.oid)));
        let mut blobs: Vec<_> = self.blobs.values().cloned().collect();
        blobs.sort_by(|a, b| a.id.cmp(&b.id));
        Snapshot {
            last_tid: self.last_tid,
            committed: self.committed,
            records,
            blobs,
        }
    }

    fn vacuum(&mut self) -> usize {
        let mut queue: Vec<Oid> = self
            .records
            .values()
            .filter(|r| r.is_trashed())
            .map(|r| r.oid.clone())
            .collect();
        let mut purged = HashSet::new();

        while let Some(oid) = queue.pop() {
            if !purged.insert(oid.clone()) {
                continue;
            }
            for map in [&self.children, &self.annotations] {
                if let Some(names) = map.get(&oid) {
                    queue.extend(names.values().cloned());
                }
            }
        }

        for oid in &purged {
            if let Some(record) = self.records.remove(oid) {
                self.unindex(&record);
            }
            self.children.remove(oid);
            self.annotations.remove(oid);
        }
        self.blobs.retain(|_, blob| !purged.contains(&blob.oid));
        for oids in self.log.values_mut() {
            oids.retain(|oid| !purged.contains(oid));
        }
        self.log.retain(|_, oids| !oids.is_empty());
        purged.len()
    }
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
            failing_commits: AtomicUsize::new(0),
        }
    }

    /// Rebuilds a backend from a snapshot.
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State {
            last_tid: snapshot.last_tid.max(snapshot.committed.0),
            committed: snapshot.committed,
            ..State::default()
        };
        for record in snapshot.records {
            state
                .log
                .entry(record.tid)
                .or_default()
                .push(record.oid.clone());
            state.apply(record);
        }
        state.prune_log();
        for blob in snapshot.blobs {
            state.blobs.insert(blob.id.clone(), blob);
        }
        Self {
            state: RwLock::new(state),
            available: AtomicBool::new(true),
            failing_commits: AtomicUsize::new(0),
        }
    }

    /// Captures committed state. Open write buffers are not included.
    pub(crate) fn snapshot(&self) -> Snapshot {
        self.state.read().snapshot()
    }

    /// Commits and hands the resulting snapshot to `persist` before
    /// releasing the store. If `persist` fails the commit is taken back
    /// and never becomes visible.
    pub(crate) fn commit_persisted<F>(
        &self,
        token: TxnToken,
        tid: Tid,
        persist: F,
    ) -> StorageResult<Tid>
    where
        F: FnOnce(Snapshot) -> StorageResult<()>,
    {
        self.check_commit()?;
        let mut state = self.state.write();
        let (committed, undo) = state.commit(token, tid)?;
        if let Some(undo) = undo {
            if let Err(err) = persist(state.snapshot()) {
                state.rollback(undo);
                return Err(err);
            }
        }
        Ok(committed)
    }

    /// Simulates losing (or regaining) the connection to the store.
    ///
    /// While unavailable every operation fails with
    /// [`StorageError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `n` commits fail with [`StorageError::Unavailable`],
    /// leaving their write buffers open.
    pub fn fail_next_commits(&self, n: usize) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn check_commit(&self) -> StorageResult<()> {
        self.check()?;
        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StorageError::unavailable("injected commit failure"))
        } else {
            Ok(())
        }
    }

    /// Number of write buffers still open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.state.read().pending.len()
    }

    /// Number of committed records currently under [`Oid::trashed`].
    ///
    /// Their descendants are not counted; `vacuum` purges those too.
    #[must_use]
    pub fn trashed_count(&self) -> usize {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.is_trashed())
            .count()
    }

    fn check(&self) -> StorageResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::unavailable("in-memory backend marked unavailable"))
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn next_tid(&self) -> StorageResult<Tid> {
        self.check()?;
        let mut state = self.state.write();
        state.last_tid += 1;
        Ok(Tid(state.last_tid))
    }

    async fn current_tid(&self) -> StorageResult<Tid> {
        self.check()?;
        Ok(self.state.read().committed)
    }

    async fn start_transaction(&self, verify_serials: bool) -> StorageResult<TxnToken> {
        self.check()?;
        let mut state = self.state.write();
        state.next_token += 1;
        let token = TxnToken(state.next_token);
        state.pending.insert(
            token,
            Pending {
                verify: verify_serials,
                ..Pending::default()
            },
        );
        Ok(token)
    }

    async fn load(&self, oid: &Oid) -> StorageResult<Option<Record>> {
        self.check()?;
        Ok(self.state.read().records.get(oid).cloned())
    }

    async fn store(
        &self,
        token: TxnToken,
        tid: Tid,
        mut record: Record,
    ) -> StorageResult<(Tid, usize)> {
        self.check()?;
        let mut state = self.state.write();
        let vacated = match (state.pending.get(&token), state.occupant(&record)) {
            (Some(pending), Some(occupant)) => pending.deletes.contains(occupant),
            _ => false,
        };
        if !vacated {
            state.check_duplicate(&record)?;
        }
        let pending = state
            .pending
            .get_mut(&token)
            .ok_or(StorageError::UnknownTransaction(token))?;
        record.tid = tid;
        let size = record.size();
        pending.deletes.remove(&record.oid);
        pending.writes.insert(record.oid.clone(), record);
        Ok((tid, size))
    }

    async fn delete(&self, token: TxnToken, oid: &Oid) -> StorageResult<()> {
        self.check()?;
        let mut state = self.state.write();
        let pending = state
            .pending
            .get_mut(&token)
            .ok_or(StorageError::UnknownTransaction(token))?;
        pending.writes.remove(oid);
        pending.deletes.insert(oid.clone());
        Ok(())
    }

    async fn commit(&self, token: TxnToken, tid: Tid) -> StorageResult<Tid> {
        self.check_commit()?;
        self.state.write().commit(token, tid).map(|(tid, _)| tid)
    }

    async fn abort(&self, token: TxnToken) -> StorageResult<()> {
        // Aborting must succeed even while the store is unreachable.
        self.state.write().pending.remove(&token);
        Ok(())
    }

    async fn get_conflicts(&self, since: Tid, own: Option<Tid>) -> StorageResult<Vec<Record>> {
        self.check()?;
        Ok(self.state.read().conflicts(since, own))
    }

    async fn children(&self, parent: &Oid) -> StorageResult<Vec<Record>> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .children
            .get(parent)
            .map(|names| {
                names
                    .values()
                    .filter_map(|oid| state.records.get(oid).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn child_keys(&self, parent: &Oid) -> StorageResult<Vec<String>> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .children
            .get(parent)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_child(&self, parent: &Oid, name: &str) -> StorageResult<Option<Record>> {
        self.check()?;
        let state = self.state.read();
        Ok(state.lookup(&state.children, parent, name))
    }

    async fn get_children(&self, parent: &Oid, names: &[String]) -> StorageResult<Vec<Record>> {
        self.check()?;
        let state = self.state.read();
        Ok(names
            .iter()
            .filter_map(|name| state.lookup(&state.children, parent, name))
            .collect())
    }

    async fn has_child(&self, parent: &Oid, name: &str) -> StorageResult<bool> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .children
            .get(parent)
            .is_some_and(|names| names.contains_key(name)))
    }

    async fn child_count(&self, parent: &Oid) -> StorageResult<usize> {
        self.check()?;
        let state = self.state.read();
        Ok(state.children.get(parent).map_or(0, BTreeMap::len))
    }

    async fn get_annotation(&self, owner: &Oid, name: &str) -> StorageResult<Option<Record>> {
        self.check()?;
        let state = self.state.read();
        Ok(state.lookup(&state.annotations, owner, name))
    }

    async fn annotation_keys(&self, owner: &Oid) -> StorageResult<Vec<String>> {
        self.check()?;
        let state = self.state.read();
        Ok(state
            .annotations
            .get(owner)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn write_blob_chunk(
        &self,
        blob: &BlobId,
        oid: &Oid,
        index: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        self.check()?;
        let mut state = self.state.write();
        let entry = state
            .blobs
            .entry(blob.clone())
            .or_insert_with(|| StoredBlob {
                id: blob.clone(),
                oid: oid.clone(),
                chunks: BTreeMap::new(),
            });
        if &entry.oid != oid {
            return Err(StorageError::integrity(format!(
                "{blob} belongs to {}, not {oid}",
                entry.oid
            )));
        }
        entry.chunks.insert(index, data);
        Ok(())
    }

    async fn read_blob_chunk(&self, blob: &BlobId, index: u32) -> StorageResult<Option<Bytes>> {
        self.check()?;
        Ok(self
            .state
            .read()
            .blobs
            .get(blob)
            .and_then(|b| b.chunks.get(&index).cloned()))
    }

    async fn read_blob_chunks(&self, blob: &BlobId) -> StorageResult<Vec<Bytes>> {
        self.check()?;
        self.state
            .read()
            .blobs
            .get(blob)
            .map(|b| b.chunks.values().cloned().collect())
            .ok_or_else(|| StorageError::BlobNotFound(blob.clone()))
    }

    async fn delete_blob(&self, blob: &BlobId) -> StorageResult<()> {
        self.check()?;
        self.state.write().blobs.remove(blob);
        Ok(())
    }

    async fn total_objects(&self) -> StorageResult<usize> {
        self.check()?;
        Ok(self.state.read().records.len())
    }

    async fn vacuum(&self) -> StorageResult<usize> {
        self.check()?;
        let purged = self.state.write().vacuum();
        debug!(purged, "vacuumed");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(oid: &str, parent: &Oid, name: &str) -> Record {
        Record::new(Oid::new(oid), "item")
            .with_parent(parent.clone(), name)
            .with_state("cbor", vec![oid.len() as u8])
    }

    async fn commit_one(backend: &InMemoryBackend, record: Record) -> Tid {
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend.store(token, tid, record).await.unwrap();
        backend.commit(token, tid).await.unwrap()
    }

    #[tokio::test]
    async fn memory_next_tid_is_strictly_increasing() {
        let backend = InMemoryBackend::new();
        let a = backend.next_tid().await.unwrap();
        let b = backend.next_tid().await.unwrap();
        assert!(a < b);
        assert_eq!(backend.current_tid().await.unwrap(), Tid::ZERO);
    }

    #[tokio::test]
    async fn memory_store_is_invisible_until_commit() {
        let backend = InMemoryBackend::new();
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        let (stamped, size) = backend
            .store(token, tid, item("a", &Oid::root(), "a"))
            .await
            .unwrap();
        assert_eq!(stamped, tid);
        assert_eq!(size, 1);
        assert!(backend.load(&Oid::new("a")).await.unwrap().is_none());

        let committed = backend.commit(token, tid).await.unwrap();
        let loaded = backend.load(&Oid::new("a")).await.unwrap().unwrap();
        assert_eq!(loaded.tid, committed);
        assert_eq!(backend.current_tid().await.unwrap(), committed);
        assert_eq!(backend.open_transactions(), 0);
    }

    #[tokio::test]
    async fn memory_abort_discards_writes() {
        let backend = InMemoryBackend::new();
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend
            .store(token, tid, item("a", &Oid::root(), "a"))
            .await
            .unwrap();
        backend.abort(token).await.unwrap();

        assert!(backend.load(&Oid::new("a")).await.unwrap().is_none());
        assert!(matches!(
            backend.commit(token, tid).await,
            Err(StorageError::UnknownTransaction(_))
        ));
    }

    #[tokio::test]
    async fn memory_commit_restamps_stale_tid() {
        let backend = InMemoryBackend::new();
        let early = backend.next_tid().await.unwrap();
        let late_commit = commit_one(&backend, item("b", &Oid::root(), "b")).await;
        assert!(late_commit > early);

        let token = backend.start_transaction(false).await.unwrap();
        backend
            .store(token, early, item("a", &Oid::root(), "a"))
            .await
            .unwrap();
        let committed = backend.commit(token, early).await.unwrap();

        assert!(committed > late_commit);
        assert_eq!(backend.load(&Oid::new("a")).await.unwrap().unwrap().tid, committed);
    }

    #[tokio::test]
    async fn memory_verify_serials_detects_stale_base() {
        let backend = InMemoryBackend::new();
        let first = commit_one(&backend, item("a", &Oid::root(), "a")).await;

        let stale = item("a", &Oid::root(), "a").with_old_serial(Some(first));
        let token1 = backend.start_transaction(true).await.unwrap();
        let tid1 = backend.next_tid().await.unwrap();
        backend.store(token1, tid1, stale.clone()).await.unwrap();
        backend.commit(token1, tid1).await.unwrap();

        let token2 = backend.start_transaction(true).await.unwrap();
        let tid2 = backend.next_tid().await.unwrap();
        backend.store(token2, tid2, stale).await.unwrap();
        let err = backend.commit(token2, tid2).await.unwrap_err();
        assert!(matches!(err, StorageError::TidConflict { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn memory_duplicate_name_rejected_at_store() {
        let backend = InMemoryBackend::new();
        commit_one(&backend, item("a", &Oid::root(), "same")).await;

        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        let err = backend
            .store(token, tid, item("b", &Oid::root(), "same"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateName { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn memory_duplicate_name_rejected_within_one_commit() {
        let backend = InMemoryBackend::new();
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend
            .store(token, tid, item("a", &Oid::root(), "same"))
            .await
            .unwrap();
        backend
            .store(token, tid, item("b", &Oid::root(), "same"))
            .await
            .unwrap();
        assert!(matches!(
            backend.commit(token, tid).await,
            Err(StorageError::DuplicateName { .. })
        ));
    }

    #[tokio::test]
    async fn memory_get_conflicts_excludes_old_and_own() {
        let backend = InMemoryBackend::new();
        let base = commit_one(&backend, item("a", &Oid::root(), "a")).await;
        let newer = commit_one(&backend, item("b", &Oid::root(), "b")).await;

        let conflicts = backend.get_conflicts(base, None).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].oid, Oid::new("b"));

        assert!(backend.get_conflicts(base, Some(newer)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_injected_commit_failure_keeps_the_buffer() {
        let backend = InMemoryBackend::new();
        backend.fail_next_commits(1);
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend
            .store(token, tid, item("a", &Oid::root(), "a"))
            .await
            .unwrap();

        let err = backend.commit(token, tid).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.open_transactions(), 1);

        let committed = backend.commit(token, tid).await.unwrap();
        assert_eq!(backend.current_tid().await.unwrap(), committed);
        assert_eq!(backend.open_transactions(), 0);
    }

    #[tokio::test]
    async fn memory_conflict_log_is_bounded() {
        let backend = InMemoryBackend::new();
        let base = commit_one(&backend, item("a", &Oid::root(), "a")).await;
        let mut serial = base;
        for _ in 0..LOG_RETENTION + 10 {
            let token = backend.start_transaction(true).await.unwrap();
            let tid = backend.next_tid().await.unwrap();
            let rec = item("b", &Oid::root(), "b").with_old_serial(
                (serial != base).then_some(serial),
            );
            backend.store(token, tid, rec).await.unwrap();
            serial = backend.commit(token, tid).await.unwrap();
        }
        assert_eq!(backend.state.read().log.len(), LOG_RETENTION);

        // Queries older than the retained log still see every newer record.
        let conflicts = backend.get_conflicts(base, None).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].oid, Oid::new("b"));
        assert_eq!(conflicts[0].tid, serial);
        let others = backend.get_conflicts(Tid::ZERO, Some(serial)).await.unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].oid, Oid::new("a"));
    }

    #[tokio::test]
    async fn memory_failed_persist_takes_the_commit_back() {
        let backend = InMemoryBackend::new();
        let first = commit_one(&backend, item("a", &Oid::root(), "a")).await;

        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        let moved = item("a", &Oid::root(), "renamed").with_old_serial(Some(first));
        backend.store(token, tid, moved).await.unwrap();
        backend
            .store(token, tid, item("c", &Oid::root(), "c"))
            .await
            .unwrap();
        let result = backend.commit_persisted(token, tid, |_| {
            Err(StorageError::Serialization("disk full".into()))
        });
        assert!(matches!(result, Err(StorageError::Serialization(_))));

        assert_eq!(backend.current_tid().await.unwrap(), first);
        assert!(backend.load(&Oid::new("c")).await.unwrap().is_none());
        let a = backend.load(&Oid::new("a")).await.unwrap().unwrap();
        assert_eq!(a.tid, first);
        assert!(backend.has_child(&Oid::root(), "a").await.unwrap());
        assert!(!backend.has_child(&Oid::root(), "renamed").await.unwrap());
        assert!(backend.get_conflicts(first, None).await.unwrap().is_empty());
        assert!(backend.next_tid().await.unwrap() > tid);
    }

    #[tokio::test]
    async fn memory_tree_lookups() {
        let backend = InMemoryBackend::new();
        let root = Oid::root();
        commit_one(&backend, item("a", &root, "alpha")).await;
        commit_one(&backend, item("b", &root, "beta")).await;

        assert_eq!(backend.child_count(&root).await.unwrap(), 2);
        assert_eq!(backend.child_keys(&root).await.unwrap(), vec!["alpha", "beta"]);
        assert!(backend.has_child(&root, "alpha").await.unwrap());
        assert!(!backend.has_child(&root, "gamma").await.unwrap());
        assert_eq!(
            backend.get_child(&root, "beta").await.unwrap().unwrap().oid,
            Oid::new("b")
        );
        let batch = backend
            .get_children(&root, &["beta".into(), "missing".into()])
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(backend.children(&root).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn memory_annotations_are_separate_from_children() {
        let backend = InMemoryBackend::new();
        let owner = Oid::new("a");
        commit_one(&backend, item("a", &Oid::root(), "a")).await;
        let note = Record::new(Oid::new("n"), "annotation").with_owner(owner.clone(), "notes");
        commit_one(&backend, note).await;

        assert_eq!(backend.child_count(&owner).await.unwrap(), 0);
        assert_eq!(backend.annotation_keys(&owner).await.unwrap(), vec!["notes"]);
        assert!(backend.get_annotation(&owner, "notes").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_delete_moves_to_trash_and_vacuum_purges() {
        let backend = InMemoryBackend::new();
        let root = Oid::root();
        commit_one(&backend, item("a", &root, "a")).await;
        commit_one(&backend, item("c", &Oid::new("a"), "child")).await;
        backend
            .write_blob_chunk(&BlobId::new("blob"), &Oid::new("c"), 0, Bytes::from_static(b"x"))
            .await
            .unwrap();

        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend.delete(token, &Oid::new("a")).await.unwrap();
        backend.commit(token, tid).await.unwrap();

        let trashed = backend.load(&Oid::new("a")).await.unwrap().unwrap();
        assert!(trashed.is_trashed());
        assert!(!backend.has_child(&root, "a").await.unwrap());
        assert_eq!(backend.total_objects().await.unwrap(), 2);
        assert_eq!(backend.trashed_count(), 1);

        assert_eq!(backend.vacuum().await.unwrap(), 2);
        assert_eq!(backend.total_objects().await.unwrap(), 0);
        assert!(backend
            .read_blob_chunks(&BlobId::new("blob"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn memory_blob_chunks_in_order() {
        let backend = InMemoryBackend::new();
        let blob = BlobId::generate();
        let oid = Oid::new("a");
        backend
            .write_blob_chunk(&blob, &oid, 1, Bytes::from_static(b"world"))
            .await
            .unwrap();
        backend
            .write_blob_chunk(&blob, &oid, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let chunks = backend.read_blob_chunks(&blob).await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")]);
        assert!(backend.read_blob_chunk(&blob, 7).await.unwrap().is_none());

        backend.delete_blob(&blob).await.unwrap();
        assert!(matches!(
            backend.read_blob_chunks(&blob).await,
            Err(StorageError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_unavailable_is_retryable() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);
        let err = backend.current_tid().await.unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(err.is_retryable());

        backend.set_available(true);
        assert!(backend.current_tid().await.is_ok());
    }

    #[tokio::test]
    async fn memory_move_within_commit_frees_old_name() {
        let backend = InMemoryBackend::new();
        let root = Oid::root();
        let first = commit_one(&backend, item("a", &root, "x")).await;

        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        backend
            .store(token, tid, item("a", &root, "y").with_old_serial(Some(first)))
            .await
            .unwrap();
        backend.commit(token, tid).await.unwrap();

        assert_eq!(backend.child_keys(&root).await.unwrap(), vec!["y"]);
    }
}
