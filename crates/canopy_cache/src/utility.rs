//! The per-process, two-tier object cache.

use crate::config::CacheConfig;
use crate::lru::{CacheStats, EvictionCache};
use crate::message::InvalidationMessage;
use crate::pubsub::{PubSub, Subscriber};
use crate::shared::SharedCache;
use crate::value::CacheValue;
use async_trait::async_trait;
use bytes::Bytes;
use canopy_codec::{Codec, Decode, Encode};
use canopy_storage::Tid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Number of own tids remembered for self-suppression.
pub const MAX_IGNORED_TIDS: usize = 100;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheUtilityStats {
    /// Entries in the in-process tier.
    pub entries: usize,
    /// Bytes used by the in-process tier.
    pub memory: usize,
    /// In-process hit, miss and eviction counters.
    pub lru: CacheStats,
}

/// Process-wide object cache.
///
/// Lookups try the in-process [`EvictionCache`] first and fall back to the
/// optional shared tier, copying shared hits into memory. Writes go to both
/// tiers. Invalidation messages from the pub/sub channel only touch the
/// in-process tier; the publisher has already updated the shared one.
///
/// Cache failures never propagate: every tier error is logged and the call
/// behaves as if the tier were absent.
#[derive(Debug)]
pub struct CacheUtility {
    id: String,
    config: CacheConfig,
    codec: Arc<dyn Codec>,
    memory: EvictionCache<CacheValue>,
    shared: Option<Arc<dyn SharedCache>>,
    pubsub: Option<Arc<dyn PubSub>>,
    ignored_tids: Mutex<VecDeque<Tid>>,
}

impl CacheUtility {
    /// Creates a memory-only cache. Values are encoded with `codec`.
    #[must_use]
    pub fn new(config: CacheConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            memory: EvictionCache::new(config.memory_capacity),
            config,
            codec,
            shared: None,
            pubsub: None,
            ignored_tids: Mutex::new(VecDeque::new()),
        }
    }

    /// Adds a shared tier.
    #[must_use]
    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Adds a pub/sub channel for invalidations.
    #[must_use]
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Subscribes to the invalidation channel, if one is configured.
    pub async fn initialize(self: &Arc<Self>) -> crate::CacheResult<()> {
        if let (Some(pubsub), Some(channel)) = (&self.pubsub, &self.config.updates_channel) {
            let listener = Arc::new(InvalidationListener {
                utility: Arc::downgrade(self),
            });
            pubsub.subscribe(channel, &self.id, listener).await?;
            debug!(id = %self.id, channel = %channel, "subscribed to invalidations");
        }
        Ok(())
    }

    /// Unsubscribes from the invalidation channel.
    pub async fn finalize(&self) {
        if let (Some(pubsub), Some(channel)) = (&self.pubsub, &self.config.updates_channel) {
            if let Err(e) = pubsub.unsubscribe(channel, &self.id).await {
                warn!(error = %e, "failed to unsubscribe from invalidations");
            }
        }
    }

    /// Subscriber id of this process.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns true if commits can be published to peers.
    #[must_use]
    pub fn can_publish(&self) -> bool {
        self.pubsub.is_some() && self.config.updates_channel.is_some()
    }

    /// The in-process tier.
    #[must_use]
    pub fn memory(&self) -> &EvictionCache<CacheValue> {
        &self.memory
    }

    /// Looks a key up in memory, then in the shared tier.
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        if let Some(value) = self.memory.get(key) {
            debug!(key, "memory cache hit");
            return Some(value);
        }
        let shared = self.shared.as_ref()?;
        match shared.get(key).await {
            Ok(Some(bytes)) => match CacheValue::decode(self.codec.as_ref(), &bytes) {
                Ok(value) => {
                    debug!(key, "shared cache hit");
                    self.memory.set(key, value.clone(), value.weight());
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "undecodable shared cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "error getting cache value");
                None
            }
        }
    }

    /// Stores `value` under every key in both tiers.
    ///
    /// Only the first key is charged against memory capacity; the others
    /// are aliases of the same value.
    pub async fn set(&self, keys: &[String], value: CacheValue) {
        let weight = value.weight();
        if weight > self.config.max_cache_record_size {
            debug!(weight, "value too large to cache");
            return;
        }
        let encoded = match value.encode(self.codec.as_ref()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "error encoding cache value");
                return;
            }
        };
        for (i, key) in keys.iter().enumerate() {
            let size = if i == 0 { weight } else { 0 };
            self.memory.set(key.as_str(), value.clone(), size);
            if let Some(shared) = &self.shared {
                if let Err(e) = shared.set(key, encoded.clone(), self.config.ttl).await {
                    warn!(key = %key, error = %e, "error setting cache value");
                }
            }
            debug!(key = %key, "set in cache");
        }
    }

    /// Removes keys from both tiers.
    pub async fn delete_all(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        for key in keys {
            self.memory.delete(key);
        }
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.delete_all(keys).await {
                warn!(count = keys.len(), error = %e, "error deleting cache values");
            }
        }
    }

    /// Empties both tiers.
    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.flush_all().await {
                warn!(error = %e, "error clearing cache");
            }
        }
        debug!("cleared cache");
    }

    /// Marks `tid` so its own invalidation echo is dropped once.
    pub fn ignore_tid(&self, tid: Tid) {
        let mut ignored = self.ignored_tids.lock();
        ignored.push_back(tid);
        while ignored.len() > MAX_IGNORED_TIDS {
            ignored.pop_front();
        }
    }

    /// Returns true if an echo of `tid` would currently be dropped.
    #[must_use]
    pub fn is_ignored(&self, tid: Tid) -> bool {
        self.ignored_tids.lock().contains(&tid)
    }

    fn forget_tid(&self, tid: Tid) -> bool {
        let mut ignored = self.ignored_tids.lock();
        match ignored.iter().position(|t| *t == tid) {
            Some(pos) => {
                ignored.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Applies an invalidation message to the in-process tier.
    ///
    /// Returns false if the message was this process's own echo and was
    /// dropped. The suppression entry is consumed, so a duplicate delivery
    /// is applied normally.
    pub fn invalidate(&self, message: &InvalidationMessage) -> bool {
        if self.forget_tid(message.tid) {
            debug!(tid = %message.tid, "ignoring own invalidation");
            return false;
        }
        for key in &message.keys {
            self.memory.delete(key);
        }
        for (key, value) in &message.pushed {
            self.memory.set(key.as_str(), value.clone(), value.weight());
        }
        debug!(
            tid = %message.tid,
            keys = message.keys.len(),
            pushed = message.pushed.len(),
            "applied invalidation"
        );
        true
    }

    /// Decodes and applies a raw message from the channel.
    pub fn on_payload(&self, payload: &[u8]) {
        match InvalidationMessage::decode(self.codec.as_ref(), payload) {
            Ok(message) => {
                self.invalidate(&message);
            }
            Err(e) => warn!(error = %e, "invalid invalidation message"),
        }
    }

    /// Publishes a commit's invalidation message to peers.
    ///
    /// The message's tid is marked as ignored first so the echo is dropped.
    /// Returns true if the message was handed to the channel.
    pub async fn publish(&self, message: &InvalidationMessage) -> bool {
        let (Some(pubsub), Some(channel)) = (&self.pubsub, &self.config.updates_channel) else {
            return false;
        };
        let payload = match message.encode(self.codec.as_ref()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "error encoding invalidation message");
                return false;
            }
        };
        self.ignore_tid(message.tid);
        match pubsub.publish(channel, payload).await {
            Ok(()) => true,
            Err(e) => {
                self.forget_tid(message.tid);
                warn!(tid = %message.tid, error = %e, "error publishing invalidation");
                false
            }
        }
    }

    /// Current counters.
    #[must_use]
    pub fn get_stats(&self) -> CacheUtilityStats {
        CacheUtilityStats {
            entries: self.memory.len(),
            memory: self.memory.get_memory(),
            lru: self.memory.get_stats(),
        }
    }
}

/// Forwards channel messages to a cache utility without keeping it alive.
struct InvalidationListener {
    utility: Weak<CacheUtility>,
}

#[async_trait]
impl Subscriber for InvalidationListener {
    async fn on_message(&self, _channel: &str, payload: Bytes) {
        if let Some(utility) = self.utility.upgrade() {
            utility.on_payload(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryPubSub;
    use crate::shared::MemorySharedCache;
    use crate::value::CachedRecord;
    use canopy_codec::CborCodec;
    use canopy_storage::{Oid, Record};

    fn value(oid: &str, tid: u64) -> CacheValue {
        let record = Record::new(Oid::new(oid), "item").with_state("cbor", vec![1u8, 2]);
        let mut cached = CachedRecord::from(&record);
        cached.tid = Tid::new(tid);
        CacheValue::Record(cached)
    }

    fn utility(shared: &Arc<MemorySharedCache>, bus: &Arc<MemoryPubSub>) -> Arc<CacheUtility> {
        Arc::new(
            CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec))
                .with_shared(shared.clone())
                .with_pubsub(bus.clone()),
        )
    }

    #[tokio::test]
    async fn utility_get_falls_back_to_shared_and_fills_memory() {
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let a = utility(&shared, &bus);
        let b = utility(&shared, &bus);

        a.set(&["k".to_string()], value("x", 1)).await;
        assert!(!b.memory().contains("k"));

        assert_eq!(b.get("k").await, Some(value("x", 1)));
        assert!(b.memory().contains("k"));
    }

    #[tokio::test]
    async fn utility_aliases_are_free() {
        let cache = CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec));
        cache
            .set(&["a".to_string(), "b".to_string()], value("x", 1))
            .await;
        assert_eq!(cache.memory().len(), 2);
        assert_eq!(cache.memory().get_memory(), 2);
    }

    #[tokio::test]
    async fn utility_skips_oversized_values() {
        let cache = CacheUtility::new(
            CacheConfig::default().max_cache_record_size(1),
            Arc::new(CborCodec),
        );
        cache.set(&["a".to_string()], value("x", 1)).await;
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn utility_shared_failure_degrades_to_memory() {
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let cache = utility(&shared, &bus);
        shared.set_available(false);

        cache.set(&["k".to_string()], value("x", 1)).await;
        assert_eq!(cache.get("k").await, Some(value("x", 1)));
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn utility_publish_invalidates_peers_but_not_self() {
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let a = utility(&shared, &bus);
        let b = utility(&shared, &bus);
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        a.memory().set("k", value("x", 1), 2);
        b.memory().set("k", value("x", 1), 2);

        let mut msg = InvalidationMessage::new(Tid::new(5), vec!["k".into()]);
        msg.pushed.insert("p".into(), value("y", 5));
        assert!(a.publish(&msg).await);

        assert!(a.memory().contains("k"));
        assert!(!a.is_ignored(Tid::new(5)));
        assert!(!b.memory().contains("k"));
        assert_eq!(b.memory().get("p"), Some(value("y", 5)));
    }

    #[tokio::test]
    async fn utility_self_suppression_consumed_once() {
        let cache = CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec));
        cache.memory().set("k", value("x", 1), 2);
        cache.ignore_tid(Tid::new(9));

        let msg = InvalidationMessage::new(Tid::new(9), vec!["k".into()]);
        assert!(!cache.invalidate(&msg));
        assert!(cache.memory().contains("k"));

        assert!(cache.invalidate(&msg));
        assert!(!cache.memory().contains("k"));
    }

    #[tokio::test]
    async fn utility_ignored_tids_are_bounded() {
        let cache = CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec));
        for tid in 0..150 {
            cache.ignore_tid(Tid::new(tid));
        }
        assert!(!cache.is_ignored(Tid::new(0)));
        assert!(!cache.is_ignored(Tid::new(49)));
        assert!(cache.is_ignored(Tid::new(50)));
        assert!(cache.is_ignored(Tid::new(149)));
    }

    #[tokio::test]
    async fn utility_failed_publish_forgets_tid() {
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let cache = utility(&shared, &bus);
        cache.initialize().await.unwrap();
        bus.set_available(false);

        let msg = InvalidationMessage::new(Tid::new(3), vec![]);
        assert!(!cache.publish(&msg).await);
        assert!(!cache.is_ignored(Tid::new(3)));
    }

    #[tokio::test]
    async fn utility_finalize_unsubscribes() {
        let shared = Arc::new(MemorySharedCache::new());
        let bus = Arc::new(MemoryPubSub::new());
        let cache = utility(&shared, &bus);
        cache.initialize().await.unwrap();
        assert_eq!(bus.subscriber_count("canopy"), 1);
        cache.finalize().await;
        assert_eq!(bus.subscriber_count("canopy"), 0);
    }

    #[tokio::test]
    async fn utility_garbage_payload_is_ignored() {
        let cache = CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec));
        cache.memory().set("k", value("x", 1), 2);
        cache.on_payload(b"\xff\xff");
        assert!(cache.memory().contains("k"));
    }

    #[tokio::test]
    async fn utility_stats_report_memory_tier() {
        let cache = CacheUtility::new(CacheConfig::default(), Arc::new(CborCodec));
        cache.set(&["a".to_string()], value("x", 1)).await;
        cache.get("a").await;
        cache.get("b").await;
        let stats = cache.get_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.memory, 2);
        assert_eq!(stats.lru.hits, 1);
        assert_eq!(stats.lru.misses, 1);
    }
}
