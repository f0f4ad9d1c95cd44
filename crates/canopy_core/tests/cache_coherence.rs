//! Cache behaviour across simulated processes.

use canopy_cache::{CacheConfig, CacheValue};
use canopy_core::{Config, PersistentObject, StrategyKind, Value, ANNOTATION_KIND};
use canopy_storage::Oid;
use canopy_testkit::prelude::*;
use canopy_testkit::read_field;

fn oid_key(oid: &Oid) -> String {
    format!("db-{oid}")
}

fn child_key(parent: &Oid, name: &str) -> String {
    format!("db-{parent}/{name}")
}

async fn edit_title(node: &ClusterNode, oid: &Oid, title: &str) -> canopy_core::Tid {
    let mut txn = node.begin().await.unwrap();
    txn.edit(oid).await.unwrap().set("title", title);
    txn.commit().await.unwrap().unwrap()
}

#[tokio::test]
async fn reads_fill_the_cache() {
    let cluster = CacheCluster::with_defaults(1).await;
    let node = cluster.node(0);
    let oid = seed_child(node, "page", &[("title", "v1".into())]).await;
    node.cache.clear().await;

    let mut txn = node.begin().await.unwrap();
    txn.get(&oid).await.unwrap().unwrap();
    assert_eq!(txn.cache_stats().misses, 1);
    txn.get_child(&Oid::root(), "page").await.unwrap().unwrap();
    assert_eq!(txn.cache_stats().hits, 1);
    assert!(node.cache.memory().get(&oid_key(&oid)).is_some());
    assert!(cluster.shared.contains(&child_key(&Oid::root(), "page")));
}

#[tokio::test]
async fn peers_see_pushed_values() {
    let cluster = CacheCluster::with_defaults(2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;
    assert_eq!(read_field(b, &oid, "title").await, Some(Value::from("v1")));

    let published = cluster.bus.published();
    let tid = edit_title(a, &oid, "v2").await;
    assert_eq!(cluster.bus.published(), published + 1);

    // The pushed value replaced b's copy in its own memory tier.
    match b.cache.memory().get(&child_key(&Oid::root(), "page")) {
        Some(CacheValue::Record(record)) => assert_eq!(record.tid, tid),
        other => panic!("expected pushed record, found {other:?}"),
    }
    assert_eq!(read_field(b, &oid, "title").await, Some(Value::from("v2")));
}

#[tokio::test]
async fn peers_drop_stale_values_without_push() {
    let cluster = CacheCluster::new(2, Config::default(), CacheConfig::new().push(false)).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;
    assert_eq!(read_field(b, &oid, "title").await, Some(Value::from("v1")));
    assert!(b.cache.memory().get(&oid_key(&oid)).is_some());

    edit_title(a, &oid, "v2").await;
    assert!(b.cache.memory().get(&oid_key(&oid)).is_none());
    assert!(b
        .cache
        .memory()
        .get(&child_key(&Oid::root(), "page"))
        .is_none());
    assert_eq!(read_field(b, &oid, "title").await, Some(Value::from("v2")));
}

#[tokio::test]
async fn publisher_ignores_its_own_echo() {
    let cluster = CacheCluster::with_defaults(2).await;
    let a = cluster.node(0);
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;

    let tid = edit_title(a, &oid, "v2").await;
    // The echo consumed the suppression entry without touching a's copy.
    assert!(!a.cache.is_ignored(tid));
    match a.cache.memory().get(&oid_key(&oid)) {
        Some(CacheValue::Record(record)) => assert_eq!(record.tid, tid),
        other => panic!("expected filled record, found {other:?}"),
    }
}

#[tokio::test]
async fn listing_keys_are_invalidated_on_add() {
    let cluster = CacheCluster::with_defaults(2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    seed_child(a, "one", &[]).await;

    let mut txn = b.begin().await.unwrap();
    assert_eq!(txn.keys(&Oid::root()).await.unwrap(), vec!["one".to_string()]);
    assert_eq!(txn.len(&Oid::root()).await.unwrap(), 1);
    txn.abort().await.unwrap();

    seed_child(a, "two", &[]).await;

    let mut txn = b.begin().await.unwrap();
    assert_eq!(
        txn.keys(&Oid::root()).await.unwrap(),
        vec!["one".to_string(), "two".to_string()]
    );
    assert_eq!(txn.len(&Oid::root()).await.unwrap(), 2);
}

#[tokio::test]
async fn missing_annotation_is_remembered_until_added() {
    let cluster = CacheCluster::with_defaults(2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let owner = seed_child(a, "page", &[]).await;
    let key = format!("db-{owner}/acl-annotation");

    let mut txn = b.begin().await.unwrap();
    assert!(txn.get_annotation(&owner, "acl").await.unwrap().is_none());
    txn.abort().await.unwrap();
    assert!(matches!(
        b.cache.memory().get(&key),
        Some(CacheValue::Empty)
    ));

    let mut txn = a.begin().await.unwrap();
    txn.add_annotation(
        &owner,
        "acl",
        PersistentObject::new(ANNOTATION_KIND).with_field("read", "all"),
    )
    .await
    .unwrap();
    txn.commit().await.unwrap();

    let mut txn = b.begin().await.unwrap();
    let acl = txn.get_annotation(&owner, "acl").await.unwrap().unwrap();
    assert_eq!(acl.get("read"), Some(&Value::from("all")));
}

#[tokio::test]
async fn abort_leaves_the_cache_alone() {
    let cluster = CacheCluster::with_defaults(2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;
    read_field(b, &oid, "title").await;
    let published = cluster.bus.published();

    let mut txn = a.begin().await.unwrap();
    txn.edit(&oid).await.unwrap().set("title", "v2");
    txn.abort().await.unwrap();

    assert_eq!(cluster.bus.published(), published);
    assert!(b.cache.memory().get(&oid_key(&oid)).is_some());
    assert!(cluster.shared.contains(&oid_key(&oid)));
}

#[tokio::test]
async fn tid_conflict_invalidates_without_publishing() {
    let cluster = CacheCluster::new(
        2,
        Config::default().strategy(StrategyKind::Serializable),
        CacheConfig::default(),
    )
    .await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;

    let mut loser = b.begin().await.unwrap();
    loser.edit(&oid).await.unwrap().set("title", "lost");
    edit_title(a, &oid, "v2").await;
    assert!(cluster.shared.contains(&oid_key(&oid)));
    let published = cluster.bus.published();

    let err = loser.commit().await.unwrap_err();
    assert!(err.is_tid_conflict());
    assert_eq!(cluster.bus.published(), published);
    assert!(!cluster.shared.contains(&oid_key(&oid)));
    assert_eq!(read_field(b, &oid, "title").await, Some(Value::from("v2")));
}

#[tokio::test]
async fn vote_conflict_leaves_the_cache_alone() {
    let cluster = CacheCluster::with_defaults(2).await;
    let (a, b) = (cluster.node(0), cluster.node(1));
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;

    let mut loser = b.begin().await.unwrap();
    loser.edit(&oid).await.unwrap().set("title", "lost");
    edit_title(a, &oid, "v2").await;
    let published = cluster.bus.published();

    assert!(loser.commit().await.is_err());
    assert_eq!(cluster.bus.published(), published);
    assert!(cluster.shared.contains(&oid_key(&oid)));
}

#[tokio::test]
async fn push_is_capped_per_commit() {
    let cluster = CacheCluster::new(
        2,
        Config::default(),
        CacheConfig::new().max_publish_objects(2),
    )
    .await;
    let (a, b) = (cluster.node(0), cluster.node(1));

    let mut txn = a.begin().await.unwrap();
    for i in 0..5 {
        txn.add_child(&Oid::root(), &format!("c{i}"), PersistentObject::new("item"))
            .await
            .unwrap();
    }
    txn.commit().await.unwrap();

    let pushed = (0..5)
        .filter(|i| {
            b.cache
                .memory()
                .get(&child_key(&Oid::root(), &format!("c{i}")))
                .is_some()
        })
        .count();
    assert_eq!(pushed, 2);
}

#[tokio::test]
async fn unreachable_bus_does_not_fail_commits() {
    let cluster = CacheCluster::with_defaults(2).await;
    let a = cluster.node(0);
    let oid = seed_child(a, "page", &[("title", "v1".into())]).await;

    cluster.bus.set_available(false);
    edit_title(a, &oid, "v2").await;
    cluster.bus.set_available(true);
    assert_eq!(read_field(a, &oid, "title").await, Some(Value::from("v2")));
}
