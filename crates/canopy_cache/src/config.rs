//! Object cache configuration.

use std::time::Duration;

/// Configuration of a [`CacheUtility`](crate::CacheUtility).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Capacity of the in-process tier in bytes.
    pub memory_capacity: usize,

    /// Expiry of entries written to the shared tier (`None` = never).
    pub ttl: Option<Duration>,

    /// Pub/sub channel for invalidation messages (`None` = don't publish).
    pub updates_channel: Option<String>,

    /// Whether commits push fresh values instead of only invalidating.
    pub push: bool,

    /// Maximum number of objects pushed per commit.
    pub max_publish_objects: usize,

    /// Records with larger state are neither cached nor pushed.
    pub max_cache_record_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 200 * 1024 * 1024, // 200 MB
            ttl: Some(Duration::from_secs(3600)),
            updates_channel: Some("canopy".to_string()),
            push: true,
            max_publish_objects: 20,
            max_cache_record_size: 5 * 1024 * 1024, // 5 MB
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the in-process capacity in bytes.
    #[must_use]
    pub const fn memory_capacity(mut self, bytes: usize) -> Self {
        self.memory_capacity = bytes;
        self
    }

    /// Sets the shared-tier expiry.
    #[must_use]
    pub const fn ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the invalidation channel.
    #[must_use]
    pub fn updates_channel(mut self, channel: Option<&str>) -> Self {
        self.updates_channel = channel.map(str::to_string);
        self
    }

    /// Enables or disables push-on-commit.
    #[must_use]
    pub const fn push(mut self, value: bool) -> Self {
        self.push = value;
        self
    }

    /// Sets the per-commit push limit.
    #[must_use]
    pub const fn max_publish_objects(mut self, n: usize) -> Self {
        self.max_publish_objects = n;
        self
    }

    /// Sets the largest cacheable record size.
    #[must_use]
    pub const fn max_cache_record_size(mut self, bytes: usize) -> Self {
        self.max_cache_record_size = bytes;
        self
    }
}
