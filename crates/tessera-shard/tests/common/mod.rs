#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bson::{Bson, Document, doc};
use tessera_routing::{
    Chunk, ChunkRange, ChunkVersion, CollectionEntry, CollectionMetadata, CollectionUuid, Epoch,
    KeyPattern, Namespace, RoutingError, RoutingSource, ShardId, ShardKey, ShardVersion,
};
use tessera_shard::{FailPoints, LogicalClock, OpContext, Shard, ShardConfig};

/// Routing metadata held in memory and edited by the test directly.
#[derive(Default)]
pub struct StaticSource {
    entries: Mutex<HashMap<Namespace, (CollectionEntry, Vec<Chunk>)>>,
}

impl StaticSource {
    pub fn set_unsharded(&self, ns: &Namespace, uuid: CollectionUuid, primary: &str) {
        self.entries.lock().unwrap().insert(
            ns.clone(),
            (
                CollectionEntry::Unsharded {
                    uuid,
                    primary: ShardId::from(primary),
                },
                Vec::new(),
            ),
        );
    }

    pub fn set_sharded(&self, meta: CollectionMetadata, chunks: Vec<Chunk>) {
        self.entries.lock().unwrap().insert(
            meta.namespace.clone(),
            (CollectionEntry::Sharded(meta), chunks),
        );
    }
}

impl RoutingSource for StaticSource {
    fn fetch_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>, RoutingError> {
        Ok(self.entries.lock().unwrap().get(ns).map(|(e, _)| e.clone()))
    }

    fn fetch_chunks(
        &self,
        ns: &Namespace,
        epoch: Epoch,
        since: Option<ChunkVersion>,
    ) -> Result<Vec<Chunk>, RoutingError> {
        let entries = self.entries.lock().unwrap();
        let Some((CollectionEntry::Sharded(meta), chunks)) = entries.get(ns) else {
            return Err(RoutingError::NamespaceNotFound(ns.to_string()));
        };
        if meta.epoch != epoch {
            return Err(RoutingError::StaleEpoch {
                ns: ns.to_string(),
                cached: epoch,
                current: meta.epoch,
            });
        }
        Ok(chunks
            .iter()
            .filter(|c| since.is_none_or(|s| c.version.is_newer_than(&s)))
            .cloned()
            .collect())
    }
}

pub fn ns() -> Namespace {
    Namespace::parse("shop.orders").unwrap()
}

pub fn key(n: i32) -> ShardKey {
    ShardKey::from_bson(&[Bson::Int32(n)]).unwrap()
}

pub fn fast_config() -> ShardConfig {
    ShardConfig {
        critical_section_timeout: Duration::from_millis(50),
        prepared_wait_timeout: Duration::from_millis(50),
        orphan_cleanup_delay: Duration::ZERO,
        ..ShardConfig::default()
    }
}

pub fn shard(id: &str, source: &Arc<StaticSource>, config: ShardConfig) -> Shard {
    Shard::new(
        ShardId::from(id),
        config,
        Arc::new(LogicalClock::new()),
        source.clone(),
        Arc::new(FailPoints::new()),
    )
    .unwrap()
}

/// `shop.orders` sharded on `_id`, one chunk per `(min, max, shard)` triple
/// where `None` bounds are MinKey/MaxKey.
pub struct Sharded {
    pub meta: CollectionMetadata,
    pub version: ChunkVersion,
}

impl Sharded {
    pub fn new() -> Self {
        let epoch = Epoch::new();
        Self {
            meta: CollectionMetadata {
                namespace: ns(),
                uuid: CollectionUuid::new(),
                epoch,
                key_pattern: KeyPattern::new(["_id"]).unwrap(),
                unique: false,
                allow_migrations: true,
            },
            version: ChunkVersion::initial(epoch),
        }
    }

    fn bound(&self, b: Option<i32>, max: bool) -> ShardKey {
        match (b, max) {
            (Some(n), _) => key(n),
            (None, false) => self.meta.key_pattern.min_key(),
            (None, true) => self.meta.key_pattern.max_key(),
        }
    }

    /// Publish a new layout with every chunk at a fresh major version.
    pub fn publish(&mut self, source: &StaticSource, layout: &[(Option<i32>, Option<i32>, &str)]) {
        self.version = self.version.bump_major();
        let chunks = layout
            .iter()
            .map(|(min, max, shard)| {
                Chunk::new(
                    ChunkRange::new(self.bound(*min, false), self.bound(*max, true)).unwrap(),
                    ShardId::from(*shard),
                    self.version,
                )
            })
            .collect();
        source.set_sharded(self.meta.clone(), chunks);
    }

    pub fn range(&self, min: Option<i32>, max: Option<i32>) -> ChunkRange {
        ChunkRange::new(self.bound(min, false), self.bound(max, true)).unwrap()
    }

    pub fn ctx(&self) -> OpContext {
        OpContext::versioned(ShardVersion::Sharded(self.version))
    }
}

pub fn docs(ids: std::ops::Range<i32>) -> Vec<Document> {
    ids.map(|i| doc! { "_id": i, "qty": 1 }).collect()
}
