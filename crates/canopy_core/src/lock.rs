//! Process-wide object locks for the lock strategy.

use crate::error::{CoreError, CoreResult};
use canopy_storage::Oid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Table of per-object mutexes.
///
/// Waiters are queued fairly, so a released lock goes to the transaction
/// that asked first.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<Oid, Arc<AsyncMutex<()>>>>,
}

/// A held object lock; released on drop.
#[derive(Debug)]
pub struct ObjectLock {
    oid: Oid,
    _guard: OwnedMutexGuard<()>,
}

impl ObjectLock {
    /// Locked object.
    #[must_use]
    pub fn oid(&self) -> &Oid {
        &self.oid
    }
}

impl LockTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the lock on `oid`.
    pub async fn acquire(&self, oid: &Oid, timeout: Duration) -> CoreResult<ObjectLock> {
        let mutex = {
            let mut locks = self.locks.lock();
            Self::prune(&mut locks);
            Arc::clone(locks.entry(oid.clone()).or_default())
        };
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!(oid = %oid, "locked");
                Ok(ObjectLock {
                    oid: oid.clone(),
                    _guard: guard,
                })
            }
            Err(_) => Err(CoreError::LockTimeout { oid: oid.clone() }),
        }
    }

    /// Returns true if some transaction currently holds the lock on `oid`.
    #[must_use]
    pub fn is_locked(&self, oid: &Oid) -> bool {
        self.locks
            .lock()
            .get(oid)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Number of tracked objects, held or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns true if no object is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Drops entries nobody holds or waits for.
    fn prune(locks: &mut HashMap<Oid, Arc<AsyncMutex<()>>>) {
        locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_acquire_and_release() {
        let table = LockTable::new();
        let oid = Oid::new("a");
        let lock = table.acquire(&oid, Duration::from_millis(10)).await.unwrap();
        assert!(table.is_locked(&oid));
        assert_eq!(lock.oid(), &oid);
        drop(lock);
        assert!(!table.is_locked(&oid));
    }

    #[tokio::test]
    async fn lock_times_out_while_held() {
        let table = LockTable::new();
        let oid = Oid::new("a");
        let _held = table.acquire(&oid, Duration::from_millis(10)).await.unwrap();
        let err = table
            .acquire(&oid, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn lock_waiter_proceeds_after_release() {
        let table = Arc::new(LockTable::new());
        let oid = Oid::new("a");
        let held = table.acquire(&oid, Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            let oid = oid.clone();
            tokio::spawn(async move { table.acquire(&oid, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn lock_distinct_objects_do_not_block() {
        let table = LockTable::new();
        let _a = table
            .acquire(&Oid::new("a"), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(table
            .acquire(&Oid::new("b"), Duration::from_millis(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn lock_released_entries_are_pruned() {
        let table = LockTable::new();
        for name in ["a", "b", "c"] {
            let lock = table
                .acquire(&Oid::new(name), Duration::from_millis(10))
                .await
                .unwrap();
            drop(lock);
        }
        let _d = table
            .acquire(&Oid::new("d"), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(table.len(), 1);
    }
}
