//! Shared (network) cache tier SPI.

use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A key/value cache shared by every process, such as memcached or Redis.
#[async_trait]
pub trait SharedCache: Send + Sync + fmt::Debug {
    /// Returns the stored bytes, if any.
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Stores bytes, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()>;

    /// Removes every listed key.
    async fn delete_all(&self, keys: &[String]) -> CacheResult<()>;

    /// Removes everything.
    async fn flush_all(&self) -> CacheResult<()>;
}

/// In-process [`SharedCache`] used by tests and single-host deployments.
///
/// Several [`CacheUtility`](crate::CacheUtility) instances sharing one
/// `Arc<MemorySharedCache>` behave like processes sharing one server.
#[derive(Debug)]
pub struct MemorySharedCache {
    entries: Mutex<HashMap<String, (Bytes, Option<Instant>)>>,
    available: AtomicBool,
}

impl MemorySharedCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the cache server going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored (possibly expired) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `key` is stored and not expired.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|(_, expires)| !is_expired(*expires))
    }

    fn check(&self) -> CacheResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::unavailable("shared cache unreachable"))
        }
    }
}

impl Default for MemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(expires: Option<Instant>) -> bool {
    expires.is_some_and(|at| at <= Instant::now())
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.check()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((_, expires)) if is_expired(*expires) => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> CacheResult<()> {
        self.check()?;
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(key.to_string(), (value, expires));
        Ok(())
    }

    async fn delete_all(&self, keys: &[String]) -> CacheResult<()> {
        self.check()?;
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn flush_all(&self) -> CacheResult<()> {
        self.check()?;
        self.entries.lock().clear();
        Ok(())
    }
}
