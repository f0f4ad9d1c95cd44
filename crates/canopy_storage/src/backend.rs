//! Storage backend trait definition.

use crate::error::StorageResult;
use crate::record::Record;
use crate::types::{BlobId, Oid, Tid, TxnToken};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// A transactional, tree-shaped record store.
///
/// Backends persist [`Record`]s without interpreting their state. Writes go
/// through a write buffer opened with [`start_transaction`] and become
/// visible atomically on [`commit`].
///
/// # Invariants
///
/// - `next_tid` is strictly increasing and never reuses an id
/// - `current_tid` is the highest committed tid
/// - `(parent_id, local_name)` is unique among live tree records and
///   `(owner_id, local_name)` among live annotations
/// - trashed records are invisible to tree and annotation lookups
///
/// # Errors
///
/// Every operation may fail with a transient
/// [`StorageError::Unavailable`](crate::StorageError::Unavailable). Missing
/// records are reported as `None` or empty collections, not errors.
///
/// [`start_transaction`]: StorageBackend::start_transaction
/// [`commit`]: StorageBackend::commit
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Allocates a new transaction id.
    async fn next_tid(&self) -> StorageResult<Tid>;

    /// Highest committed transaction id.
    async fn current_tid(&self) -> StorageResult<Tid>;

    /// Opens a write buffer.
    ///
    /// With `verify_serials`, commit re-checks that every buffered write's
    /// `old_serial` still matches the committed record and fails with
    /// `TidConflict` otherwise.
    async fn start_transaction(&self, verify_serials: bool) -> StorageResult<TxnToken>;

    /// Loads the latest committed version of a record, trashed or not.
    async fn load(&self, oid: &Oid) -> StorageResult<Option<Record>>;

    /// Buffers a write. Returns the tid stamped on the record and its size.
    async fn store(&self, token: TxnToken, tid: Tid, record: Record)
        -> StorageResult<(Tid, usize)>;

    /// Buffers a removal; the record moves under the trashed sentinel on commit.
    async fn delete(&self, token: TxnToken, oid: &Oid) -> StorageResult<()>;

    /// Makes buffered writes visible. Returns the tid they were committed under.
    ///
    /// If a newer tid committed since `tid` was allocated, the writes are
    /// re-stamped with a fresh tid so commit order and tid order agree.
    async fn commit(&self, token: TxnToken, tid: Tid) -> StorageResult<Tid>;

    /// Discards buffered writes.
    async fn abort(&self, token: TxnToken) -> StorageResult<()>;

    /// Records committed after `since`, excluding those written by `own`.
    async fn get_conflicts(&self, since: Tid, own: Option<Tid>) -> StorageResult<Vec<Record>>;

    /// Live child records of `parent`, ordered by name.
    async fn children(&self, parent: &Oid) -> StorageResult<Vec<Record>>;

    /// Names of the live children of `parent`, sorted.
    async fn child_keys(&self, parent: &Oid) -> StorageResult<Vec<String>>;

    /// Looks up a child by name.
    async fn get_child(&self, parent: &Oid, name: &str) -> StorageResult<Option<Record>>;

    /// Looks up several children at once; missing names are skipped.
    async fn get_children(&self, parent: &Oid, names: &[String]) -> StorageResult<Vec<Record>>;

    /// Returns true if `parent` has a live child called `name`.
    async fn has_child(&self, parent: &Oid, name: &str) -> StorageResult<bool>;

    /// Number of live children of `parent`.
    async fn child_count(&self, parent: &Oid) -> StorageResult<usize>;

    /// Looks up an annotation by owner and name.
    async fn get_annotation(&self, owner: &Oid, name: &str) -> StorageResult<Option<Record>>;

    /// Names of the live annotations of `owner`, sorted.
    async fn annotation_keys(&self, owner: &Oid) -> StorageResult<Vec<String>>;

    /// Writes one chunk of a blob belonging to `oid`.
    async fn write_blob_chunk(
        &self,
        blob: &BlobId,
        oid: &Oid,
        index: u32,
        data: Bytes,
    ) -> StorageResult<()>;

    /// Reads one chunk of a blob.
    async fn read_blob_chunk(&self, blob: &BlobId, index: u32) -> StorageResult<Option<Bytes>>;

    /// Reads every chunk of a blob in index order.
    async fn read_blob_chunks(&self, blob: &BlobId) -> StorageResult<Vec<Bytes>>;

    /// Removes a blob and all of its chunks.
    async fn delete_blob(&self, blob: &BlobId) -> StorageResult<()>;

    /// Number of stored records, trashed ones included.
    async fn total_objects(&self) -> StorageResult<usize>;

    /// Purges trashed records, their descendants, annotations and blobs.
    /// Returns the number of records removed.
    async fn vacuum(&self) -> StorageResult<usize>;
}
