#![allow(dead_code)]

use bson::{Bson, Document, doc};
use tessera_cluster::{Cluster, ClusterConfig, RequestOptions};
use tessera_routing::{ChunkRange, KeyPattern, Namespace, ShardId, ShardKey};
use tessera_shard::Selector;

pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        background_maintenance: false,
        orphan_cleanup_delay_ms: 0,
        critical_section_timeout_ms: 200,
        prepared_wait_timeout_ms: 200,
        ..ClusterConfig::default()
    }
}

pub fn cluster() -> Cluster {
    Cluster::start(test_config()).unwrap()
}

pub fn orders() -> Namespace {
    Namespace::parse("shop.orders").unwrap()
}

pub fn s0() -> ShardId {
    ShardId::from("shard0")
}

pub fn s1() -> ShardId {
    ShardId::from("shard1")
}

pub fn key(n: i32) -> ShardKey {
    ShardKey::from_bson(&[Bson::Int32(n)]).unwrap()
}

pub fn text_key(s: &str) -> ShardKey {
    ShardKey::from_bson(&[Bson::String(s.into())]).unwrap()
}

pub fn by_id() -> KeyPattern {
    KeyPattern::new(["_id"]).unwrap()
}

/// `[n, MaxKey)` under `{_id}`.
pub fn from(n: i32) -> ChunkRange {
    ChunkRange::new(key(n), by_id().max_key()).unwrap()
}

pub fn docs(ids: std::ops::Range<i32>) -> Vec<Document> {
    ids.map(|i| doc! { "_id": i, "qty": 1 }).collect()
}

/// Insert `{_id: 0..n, qty: 1}` into `ns` through the default router.
pub fn seed(cluster: &Cluster, ns: &Namespace, n: i32) {
    let res = cluster
        .router()
        .insert(ns, docs(0..n), &RequestOptions::default())
        .unwrap();
    assert_eq!(res.inserted, n as u64);
}

/// The orders scenario: `shop.orders` holds `_id` 0..10, sharded on `_id`
/// with `[5, MaxKey)` moved to shard1.
pub fn split_orders(cluster: &Cluster) {
    seed(cluster, &orders(), 10);
    cluster
        .shard_collection(&orders(), by_id(), false, &[key(5)])
        .unwrap();
    cluster.move_range(&orders(), &from(5), &s1()).unwrap();
}

pub fn count(cluster: &Cluster, ns: &Namespace) -> u64 {
    cluster
        .router()
        .count(ns, &Selector::All, &RequestOptions::default())
        .unwrap()
}

pub fn get(cluster: &Cluster, ns: &Namespace, id: i32) -> Option<Document> {
    cluster
        .router()
        .find(ns, &Selector::Id(id.into()), &RequestOptions::default())
        .unwrap()
        .into_iter()
        .next()
}
