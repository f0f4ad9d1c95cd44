//! Per-transaction façade over the process-wide object cache.
//!
//! Reads go through [`TransactionCache::get`] and fill the cache on miss.
//! Written records are staged during the store phase; on a successful
//! commit [`TransactionCache::close`] deletes every stale key, writes the
//! staged records into both tiers and publishes one invalidation message.

use crate::object::{Location, PersistentObject, LOCATION_KEY};
use canopy_cache::{CacheUtility, CacheValue, InvalidationMessage};
use canopy_storage::{Oid, Record, Tid};
use std::sync::Arc;
use tracing::debug;

/// How an object took part in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created.
    Added,
    /// Updated in place (possibly moved).
    Modified,
    /// Removed.
    Deleted,
}

/// Cache traffic of one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionCacheStats {
    /// Lookups answered by the cache.
    pub hits: u64,
    /// Lookups that fell through to storage.
    pub misses: u64,
    /// Records staged for pushing.
    pub stored: usize,
}

/// Cache façade owned by one transaction.
#[derive(Debug)]
pub struct TransactionCache {
    utility: Option<Arc<CacheUtility>>,
    db_id: String,
    stored: Vec<Record>,
    keys_to_publish: Vec<String>,
    hits: u64,
    misses: u64,
}

impl TransactionCache {
    /// Creates a façade; `None` disables caching.
    pub fn new(utility: Option<Arc<CacheUtility>>, db_id: impl Into<String>) -> Self {
        Self {
            utility,
            db_id: db_id.into(),
            stored: Vec::new(),
            keys_to_publish: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Returns true if a cache utility is attached.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.utility.is_some()
    }

    /// Key of an object by id.
    #[must_use]
    pub fn oid_key(&self, oid: &Oid) -> String {
        format!("{}-{}", self.db_id, oid)
    }

    /// Key of a child by parent and name.
    #[must_use]
    pub fn child_key(&self, parent: &Oid, name: &str) -> String {
        format!("{}-{}/{}", self.db_id, parent, name)
    }

    /// Key of a parent's child-name list.
    #[must_use]
    pub fn keys_key(&self, parent: &Oid) -> String {
        format!("{}-{}-keys", self.db_id, parent)
    }

    /// Key of a parent's child count.
    #[must_use]
    pub fn len_key(&self, parent: &Oid) -> String {
        format!("{}-{}-len", self.db_id, parent)
    }

    /// Key of an annotation by owner and name.
    #[must_use]
    pub fn annotation_key(&self, owner: &Oid, name: &str) -> String {
        format!("{}-{}/{}-annotation", self.db_id, owner, name)
    }

    /// Key of an owner's annotation-name list.
    #[must_use]
    pub fn annotation_keys_key(&self, owner: &Oid) -> String {
        format!("{}-{}-annotation-keys", self.db_id, owner)
    }

    /// Looks a key up.
    pub async fn get(&mut self, key: &str) -> Option<CacheValue> {
        let utility = self.utility.as_ref()?;
        let value = utility.get(key).await;
        if value.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        value
    }

    /// Stores a value under every key.
    pub async fn set(&self, keys: &[String], value: CacheValue) {
        if let Some(utility) = &self.utility {
            utility.set(keys, value).await;
        }
    }

    /// Stores a loaded record under its lookup keys.
    pub async fn set_record(&self, record: &Record) {
        if self.utility.is_some() {
            self.set(&self.record_keys(record), CacheValue::from(record))
                .await;
        }
    }

    /// Keys a committed record can be found under, id key included.
    #[must_use]
    pub fn record_keys(&self, record: &Record) -> Vec<String> {
        let oid_key = self.oid_key(&record.oid);
        match Location::from_record(record) {
            Location::Annotation { owner, name } => {
                vec![self.annotation_key(&owner, &name), oid_key]
            }
            Location::Tree { parent, name } if !parent.is_trashed() => {
                vec![oid_key, self.child_key(&parent, &name)]
            }
            _ => vec![oid_key],
        }
    }

    /// The single key a pushed record is sent under.
    #[must_use]
    pub fn push_key(&self, record: &Record) -> String {
        match Location::from_record(record) {
            Location::Annotation { owner, name } => self.annotation_key(&owner, &name),
            Location::Tree { parent, name } if !parent.is_trashed() => {
                self.child_key(&parent, &name)
            }
            _ => self.oid_key(&record.oid),
        }
    }

    fn location_keys(&self, location: &Location, structural: bool, keys: &mut Vec<String>) {
        match location {
            Location::Annotation { owner, name } => {
                keys.push(self.annotation_key(owner, name));
                if structural {
                    keys.push(self.annotation_keys_key(owner));
                }
            }
            Location::Tree { parent, name } if !parent.is_trashed() => {
                keys.push(self.child_key(parent, name));
                if structural {
                    keys.push(self.keys_key(parent));
                    keys.push(self.len_key(parent));
                }
            }
            _ => {}
        }
    }

    /// Keys made stale by `change` of `object`.
    #[must_use]
    pub fn keys_for(&self, object: &PersistentObject, change: ChangeKind) -> Vec<String> {
        let mut keys = vec![self.oid_key(object.oid())];
        let moved_from = object
            .changes()
            .get(LOCATION_KEY)
            .and_then(Option::as_ref)
            .and_then(|value| Location::from_value(value).ok())
            .filter(|from| from != object.location());
        let structural = change != ChangeKind::Modified || moved_from.is_some();
        self.location_keys(object.location(), structural, &mut keys);
        if let Some(from) = moved_from {
            self.location_keys(&from, true, &mut keys);
        }
        keys
    }

    /// Stages a written record for filling and pushing at commit.
    ///
    /// Records above `max_cache_record_size` are skipped; past
    /// `max_publish_objects` the rest fall back to invalidation only.
    pub fn store_object(&mut self, record: &Record) {
        let Some(utility) = &self.utility else {
            return;
        };
        let config = utility.config();
        if record.size() > config.max_cache_record_size {
            return;
        }
        if let Some(existing) = self.stored.iter_mut().find(|r| r.oid == record.oid) {
            *existing = record.clone();
        } else if self.stored.len() < config.max_publish_objects {
            self.stored.push(record.clone());
        }
    }

    /// Ends the transaction's cache work.
    ///
    /// With `invalidate`, `keys` are deleted from both tiers. With
    /// `publish` as well, staged records are written under `tid` and the
    /// invalidation message is sent to peers. Staging is always cleared.
    pub async fn close(
        &mut self,
        tid: Option<Tid>,
        keys: Vec<String>,
        invalidate: bool,
        publish: bool,
    ) {
        let stored = std::mem::take(&mut self.stored);
        let Some(utility) = self.utility.clone() else {
            return;
        };
        if invalidate {
            utility.delete_all(&keys).await;
            self.keys_to_publish.extend(keys);
            if let (true, Some(tid)) = (publish, tid) {
                let stored: Vec<Record> = stored
                    .into_iter()
                    .map(|mut record| {
                        record.tid = tid;
                        record
                    })
                    .collect();
                for record in &stored {
                    self.set_record(record).await;
                }
                self.synchronize(&utility, tid, &stored).await;
            }
        }
        self.keys_to_publish.clear();
    }

    async fn synchronize(&self, utility: &CacheUtility, tid: Tid, stored: &[Record]) {
        if self.keys_to_publish.is_empty() || !utility.can_publish() {
            return;
        }
        let mut message = InvalidationMessage::new(tid, self.keys_to_publish.clone());
        if utility.config().push {
            for record in stored {
                message
                    .pushed
                    .insert(self.push_key(record), CacheValue::from(record));
            }
        }
        debug!(
            tid = %tid,
            keys = message.keys.len(),
            pushed = message.pushed.len(),
            "publishing invalidation"
        );
        utility.publish(&message).await;
    }

    /// Counters of this transaction.
    #[must_use]
    pub fn stats(&self) -> TransactionCacheStats {
        TransactionCacheStats {
            hits: self.hits,
            misses: self.misses,
            stored: self.stored.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cache::{CacheConfig, MemoryPubSub, MemorySharedCache};
    use canopy_codec::{CborCodec, Value};
    use std::collections::BTreeMap;

    fn utility(config: CacheConfig, bus: &Arc<MemoryPubSub>) -> Arc<CacheUtility> {
        Arc::new(
            CacheUtility::new(config, Arc::new(CborCodec))
                .with_shared(Arc::new(MemorySharedCache::new()))
                .with_pubsub(bus.clone()),
        )
    }

    fn child(name: &str) -> PersistentObject {
        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), Value::from(1i64));
        PersistentObject::from_parts(
            Oid::new(name),
            Tid::new(1),
            Location::child(Oid::new("p"), name),
            "item",
            fields,
        )
    }

    fn record(name: &str, size: usize) -> Record {
        Record::new(Oid::new(name), "item")
            .with_parent(Oid::new("p"), name)
            .with_state("cbor", vec![0u8; size])
    }

    #[test]
    fn key_derivation() {
        let cache = TransactionCache::new(None, "db");
        let oid = Oid::new("abc");
        assert_eq!(cache.oid_key(&oid), "db-abc");
        assert_eq!(cache.child_key(&oid, "x"), "db-abc/x");
        assert_eq!(cache.keys_key(&oid), "db-abc-keys");
        assert_eq!(cache.len_key(&oid), "db-abc-len");
        assert_eq!(cache.annotation_key(&oid, "m"), "db-abc/m-annotation");
        assert_eq!(cache.annotation_keys_key(&oid), "db-abc-annotation-keys");
    }

    #[test]
    fn modified_object_keeps_listing_keys() {
        let cache = TransactionCache::new(None, "db");
        let keys = cache.keys_for(&child("a"), ChangeKind::Modified);
        assert_eq!(keys, vec!["db-a", "db-p/a"]);
    }

    #[test]
    fn added_object_invalidates_listing() {
        let cache = TransactionCache::new(None, "db");
        let keys = cache.keys_for(&child("a"), ChangeKind::Added);
        assert_eq!(keys, vec!["db-a", "db-p/a", "db-p-keys", "db-p-len"]);
    }

    #[test]
    fn moved_object_invalidates_both_locations() {
        let cache = TransactionCache::new(None, "db");
        let mut obj = child("a");
        obj.move_to(Location::child(Oid::new("q"), "b"));
        let keys = cache.keys_for(&obj, ChangeKind::Modified);
        for key in ["db-a", "db-q/b", "db-q-keys", "db-p/a", "db-p-keys", "db-p-len"] {
            assert!(keys.contains(&key.to_string()), "missing {key}");
        }
    }

    #[test]
    fn annotation_keys() {
        let cache = TransactionCache::new(None, "db");
        let obj = PersistentObject::from_parts(
            Oid::new("n"),
            Tid::new(1),
            Location::annotation(Oid::new("o"), "meta"),
            "annotation",
            BTreeMap::new(),
        );
        let keys = cache.keys_for(&obj, ChangeKind::Deleted);
        assert_eq!(
            keys,
            vec!["db-n", "db-o/meta-annotation", "db-o-annotation-keys"]
        );
    }

    #[tokio::test]
    async fn store_object_respects_limits() {
        let bus = Arc::new(MemoryPubSub::new());
        let config = CacheConfig::default()
            .max_publish_objects(2)
            .max_cache_record_size(10);
        let mut cache = TransactionCache::new(Some(utility(config, &bus)), "db");

        cache.store_object(&record("big", 11));
        cache.store_object(&record("a", 1));
        cache.store_object(&record("b", 1));
        cache.store_object(&record("c", 1));
        cache.store_object(&record("a", 2));
        assert_eq!(cache.stats().stored, 2);
    }

    #[tokio::test]
    async fn close_fills_and_publishes() {
        let bus = Arc::new(MemoryPubSub::new());
        let util = utility(CacheConfig::default(), &bus);
        let peer = utility(CacheConfig::default(), &bus);
        peer.initialize().await.unwrap();
        peer.memory().set("db-p/a", CacheValue::Empty, 1);

        let mut cache = TransactionCache::new(Some(util.clone()), "db");
        cache.store_object(&record("a", 1));
        let keys = vec!["db-a".to_string(), "db-p/a".to_string()];
        cache.close(Some(Tid::new(8)), keys, true, true).await;

        let own = util.memory().get("db-a").unwrap();
        assert_eq!(own.as_record().unwrap().tid, Tid::new(8));
        let pushed = peer.memory().get("db-p/a").unwrap();
        assert_eq!(pushed.as_record().unwrap().tid, Tid::new(8));
        assert_eq!(bus.published(), 1);
        assert_eq!(cache.stats().stored, 0);
    }

    #[tokio::test]
    async fn close_without_publish_only_invalidates() {
        let bus = Arc::new(MemoryPubSub::new());
        let util = utility(CacheConfig::default(), &bus);
        util.memory().set("db-a", CacheValue::Empty, 1);

        let mut cache = TransactionCache::new(Some(util.clone()), "db");
        cache.store_object(&record("a", 1));
        cache
            .close(Some(Tid::new(8)), vec!["db-a".to_string()], true, false)
            .await;

        assert!(!util.memory().contains("db-a"));
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn close_without_invalidate_touches_nothing() {
        let bus = Arc::new(MemoryPubSub::new());
        let util = utility(CacheConfig::default(), &bus);
        util.memory().set("db-a", CacheValue::Empty, 1);

        let mut cache = TransactionCache::new(Some(util.clone()), "db");
        cache.store_object(&record("a", 1));
        cache
            .close(None, vec!["db-a".to_string()], false, false)
            .await;

        assert!(util.memory().contains("db-a"));
        assert_eq!(bus.published(), 0);
    }

    #[tokio::test]
    async fn push_disabled_sends_keys_only() {
        let bus = Arc::new(MemoryPubSub::new());
        let util = utility(CacheConfig::default().push(false), &bus);
        let peer = utility(CacheConfig::default(), &bus);
        peer.initialize().await.unwrap();

        let mut cache = TransactionCache::new(Some(util), "db");
        cache.store_object(&record("a", 1));
        cache
            .close(Some(Tid::new(3)), vec!["db-p/a".to_string()], true, true)
            .await;

        assert_eq!(bus.published(), 1);
        assert!(!peer.memory().contains("db-p/a"));
    }
}
