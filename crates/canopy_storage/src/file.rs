//! File-based storage backend for persistent storage.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::{InMemoryBackend, Snapshot};
use crate::record::Record;
use crate::types::{BlobId, Oid, Tid, TxnToken};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tids reserved on disk at a time by [`FileBackend::next_tid`].
const TID_RESERVATION: u64 = 64;

/// A file-based storage backend.
///
/// Committed state is held in an [`InMemoryBackend`] and written to a
/// single CBOR snapshot file on every commit, blob write and vacuum.
/// A commit becomes visible only once its snapshot is on disk.
///
/// Tids are reserved in blocks: before handing out a tid past the
/// reserved mark, the end of a new block is written to the snapshot.
/// Reopening resumes after the reserved mark, so no tid is handed out
/// twice, even one that was never committed.
///
/// # Durability
///
/// Snapshots are written to a sibling temporary file, synced, and renamed
/// over the previous snapshot. A crash leaves either the old or the new
/// snapshot, never a torn one.
///
/// # Example
///
/// ```no_run
/// use canopy_storage::FileBackend;
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("repo.canopy")).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: InMemoryBackend,
    reserved: Mutex<u64>,
}

impl FileBackend {
    /// Opens the snapshot at `path`, or starts an empty store if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let (inner, reserved) = if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            let snapshot: Snapshot = ciborium::de::from_reader(reader)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            debug!(
                path = %path.display(),
                records = snapshot.records.len(),
                committed = %snapshot.committed,
                "loaded snapshot"
            );
            let reserved = snapshot.last_tid;
            (InMemoryBackend::from_snapshot(snapshot), reserved)
        } else {
            (InMemoryBackend::new(), 0)
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner,
            reserved: Mutex::new(reserved),
        })
    }

    /// Opens a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file
    /// cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the snapshot path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// See [`InMemoryBackend::set_available`].
    pub fn set_available(&self, available: bool) {
        self.inner.set_available(available);
    }

    /// See [`InMemoryBackend::open_transactions`].
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.inner.open_transactions()
    }

    /// See [`InMemoryBackend::trashed_count`].
    #[must_use]
    pub fn trashed_count(&self) -> usize {
        self.inner.trashed_count()
    }

    fn persist(&self) -> StorageResult<()> {
        let reserved = self.reserved.lock();
        self.write_snapshot(self.inner.snapshot(), *reserved)
    }

    // Callers hold the `reserved` lock, which serializes snapshot writes.
    fn write_snapshot(&self, mut snapshot: Snapshot, reserved: u64) -> StorageResult<()> {
        snapshot.last_tid = snapshot.last_tid.max(reserved);
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            ciborium::ser::into_writer(&snapshot, &mut writer)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn next_tid(&self) -> StorageResult<Tid> {
        let tid = self.inner.next_tid().await?;
        let mut reserved = self.reserved.lock();
        if tid.as_u64() > *reserved {
            let end = tid.as_u64() + TID_RESERVATION - 1;
            self.write_snapshot(self.inner.snapshot(), end)?;
            debug!(path = %self.path.display(), reserved = end, "reserved tids");
            *reserved = end;
        }
        Ok(tid)
    }

    async fn current_tid(&self) -> StorageResult<Tid> {
        self.inner.current_tid().await
    }

    async fn start_transaction(&self, verify_serials: bool) -> StorageResult<TxnToken> {
        self.inner.start_transaction(verify_serials).await
    }

    async fn load(&self, oid: &Oid) -> StorageResult<Option<Record>> {
        self.inner.load(oid).await
    }

    async fn store(&self, token: TxnToken, tid: Tid, record: Record) -> StorageResult<(Tid, usize)> {
        self.inner.store(token, tid, record).await
    }

    async fn delete(&self, token: TxnToken, oid: &Oid) -> StorageResult<()> {
        self.inner.delete(token, oid).await
    }

    async fn commit(&self, token: TxnToken, tid: Tid) -> StorageResult<Tid> {
        let reserved = self.reserved.lock();
        self.inner
            .commit_persisted(token, tid, |snapshot| self.write_snapshot(snapshot, *reserved))
    }

    async fn abort(&self, token: TxnToken) -> StorageResult<()> {
        self.inner.abort(token).await
    }

    async fn get_conflicts(&self, since: Tid, own: Option<Tid>) -> StorageResult<Vec<Record>> {
        self.inner.get_conflicts(since, own).await
    }

    async fn children(&self, parent: &Oid) -> StorageResult<Vec<Record>> {
        self.inner.children(parent).await
    }

    async fn child_keys(&self, parent: &Oid) -> StorageResult<Vec<String>> {
        self.inner.child_keys(parent).await
    }

    async fn get_child(&self, parent: &Oid, name: &str) -> StorageResult<Option<Record>> {
        self.inner.get_child(parent, name).await
    }

    async fn get_children(&self, parent: &Oid, names: &[String]) -> StorageResult<Vec<Record>> {
        self.inner.get_children(parent, names).await
    }

    async fn has_child(&self, parent: &Oid, name: &str) -> StorageResult<bool> {
        self.inner.has_child(parent, name).await
    }

    async fn child_count(&self, parent: &Oid) -> StorageResult<usize> {
        self.inner.child_count(parent).await
    }

    async fn get_annotation(&self, owner: &Oid, name: &str) -> StorageResult<Option<Record>> {
        self.inner.get_annotation(owner, name).await
    }

    async fn annotation_keys(&self, owner: &Oid) -> StorageResult<Vec<String>> {
        self.inner.annotation_keys(owner).await
    }

    async fn write_blob_chunk(
        &self,
        blob: &BlobId,
        oid: &Oid,
        index: u32,
        data: Bytes,
    ) -> StorageResult<()> {
        self.inner.write_blob_chunk(blob, oid, index, data).await?;
        self.persist()
    }

    async fn read_blob_chunk(&self, blob: &BlobId, index: u32) -> StorageResult<Option<Bytes>> {
        self.inner.read_blob_chunk(blob, index).await
    }

    async fn read_blob_chunks(&self, blob: &BlobId) -> StorageResult<Vec<Bytes>> {
        self.inner.read_blob_chunks(blob).await
    }

    async fn delete_blob(&self, blob: &BlobId) -> StorageResult<()> {
        self.inner.delete_blob(blob).await?;
        self.persist()
    }

    async fn total_objects(&self) -> StorageResult<usize> {
        self.inner.total_objects().await
    }

    async fn vacuum(&self) -> StorageResult<usize> {
        let purged = self.inner.vacuum().await?;
        self.persist()?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn commit_item(backend: &FileBackend, oid: &str, name: &str) -> Tid {
        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        let rec = Record::new(Oid::new(oid), "item")
            .with_parent(Oid::root(), name)
            .with_state("cbor", vec![1u8, 2, 3]);
        backend.store(token, tid, rec).await.unwrap();
        backend.commit(token, tid).await.unwrap()
    }

    #[tokio::test]
    async fn file_open_missing_starts_empty() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(&dir.path().join("repo.canopy")).unwrap();
        assert_eq!(backend.total_objects().await.unwrap(), 0);
        assert_eq!(backend.current_tid().await.unwrap(), Tid::ZERO);
    }

    #[tokio::test]
    async fn file_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");

        let committed = {
            let backend = FileBackend::open(&path).unwrap();
            commit_item(&backend, "a", "alpha").await
        };

        let backend = FileBackend::open(&path).unwrap();
        let rec = backend.load(&Oid::new("a")).await.unwrap().unwrap();
        assert_eq!(rec.tid, committed);
        assert_eq!(rec.state, Bytes::from_static(&[1, 2, 3]));
        assert!(backend.has_child(&Oid::root(), "alpha").await.unwrap());
        assert_eq!(backend.current_tid().await.unwrap(), committed);
    }

    #[tokio::test]
    async fn file_tids_not_reused_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");

        let first = {
            let backend = FileBackend::open(&path).unwrap();
            commit_item(&backend, "a", "alpha").await
        };

        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.next_tid().await.unwrap() > first);
    }

    #[tokio::test]
    async fn file_uncommitted_tids_not_reused_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");

        let handed_out = {
            let backend = FileBackend::open(&path).unwrap();
            commit_item(&backend, "a", "alpha").await;
            let token = backend.start_transaction(true).await.unwrap();
            let tid = backend.next_tid().await.unwrap();
            backend.abort(token).await.unwrap();
            tid
        };

        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.next_tid().await.unwrap() > handed_out);
    }

    #[tokio::test]
    async fn file_tid_reservation_spans_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");

        let last = {
            let backend = FileBackend::open(&path).unwrap();
            let mut last = Tid::ZERO;
            for _ in 0..TID_RESERVATION + 3 {
                last = backend.next_tid().await.unwrap();
            }
            last
        };

        let backend = FileBackend::open(&path).unwrap();
        assert!(backend.next_tid().await.unwrap() > last);
        assert_eq!(backend.current_tid().await.unwrap(), Tid::ZERO);
    }

    #[tokio::test]
    async fn file_failed_snapshot_write_hides_the_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");
        let backend = FileBackend::open(&path).unwrap();

        let token = backend.start_transaction(true).await.unwrap();
        let tid = backend.next_tid().await.unwrap();
        let rec = Record::new(Oid::new("a"), "item").with_parent(Oid::root(), "a");
        backend.store(token, tid, rec).await.unwrap();

        // A directory in place of the snapshot makes the final rename fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert!(backend.commit(token, tid).await.is_err());

        assert!(backend.load(&Oid::new("a")).await.unwrap().is_none());
        assert_eq!(backend.current_tid().await.unwrap(), Tid::ZERO);
        assert_eq!(backend.open_transactions(), 0);
    }

    #[tokio::test]
    async fn file_blobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");
        let blob = BlobId::new("b1");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend
                .write_blob_chunk(&blob, &Oid::new("a"), 0, Bytes::from_static(b"data"))
                .await
                .unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(
            backend.read_blob_chunk(&blob, 0).await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
    }

    #[tokio::test]
    async fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deep").join("repo.canopy");
        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        commit_item(&backend, "a", "alpha").await;
        assert!(path.exists());
        assert_eq!(backend.path(), path.as_path());
    }

    #[test]
    fn file_corrupt_snapshot_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repo.canopy");
        fs::write(&path, b"\xff\xff not cbor").unwrap();
        assert!(matches!(
            FileBackend::open(&path),
            Err(StorageError::Serialization(_))
        ));
    }
}
