//! Authoritative catalog: databases, collections, chunks and placement
//! history.
//!
//! Every catalog transaction is written ahead to a durable log from the
//! store's commit hook, so a reopened config server replays exactly the
//! committed writes. Concurrent writers touching the same collection
//! conflict on its record and the loser retries against fresh state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_log::SharedLog;
use tessera_routing::{
    Chunk, ChunkRange, ChunkVersion, CollectionEntry, CollectionMetadata, CollectionUuid, Epoch,
    KeyPattern, Namespace, RoutingError, RoutingSource, ShardId, ShardKey, validate_partition,
};
use tessera_shard::{LogicalClock, Timestamp};
use tessera_store::{MemoryStore, MemoryTransaction, Store, Transaction};
use tracing::{debug, info, warn};

use crate::error::ClusterError;

const DATABASES: &str = "config.databases";
const COLLECTIONS: &str = "config.collections";
const CHUNKS: &str = "config.chunks";
const PLACEMENT: &str = "config.placementHistory";
const TABLES: &[&str] = &[DATABASES, COLLECTIONS, CHUNKS, PLACEMENT];

const MAX_CONFLICT_RETRIES: usize = 16;

// ── Records ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub primary: ShardId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub primary: ShardId,
    pub sharding: Option<CollectionMetadata>,
    /// Bumped by every chunk change so concurrent chunk writers conflict.
    pub revision: u64,
}

impl CollectionRecord {
    fn entry(&self) -> CollectionEntry {
        match &self.sharding {
            Some(meta) => CollectionEntry::Sharded(meta.clone()),
            None => CollectionEntry::Unsharded {
                uuid: self.uuid,
                primary: self.primary.clone(),
            },
        }
    }
}

/// Shards that may hold user data of a namespace from `ts` on. An empty
/// list marks a drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementEntry {
    pub ts: Timestamp,
    pub uuid: Option<CollectionUuid>,
    pub shards: Vec<ShardId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogOp {
    table: String,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

/// One committed catalog transaction, as written ahead to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogWrite {
    ops: Vec<CatalogOp>,
}

fn chunk_prefix(ns: &Namespace) -> Vec<u8> {
    let mut key = ns.to_string().into_bytes();
    key.push(0);
    key
}

fn chunk_key(ns: &Namespace, min: &ShardKey) -> Vec<u8> {
    let mut key = chunk_prefix(ns);
    key.extend_from_slice(min.encoded());
    key
}

fn placement_key(ns: &Namespace, ts: Timestamp) -> Vec<u8> {
    let mut key = chunk_prefix(ns);
    key.extend_from_slice(&ts.as_u64().to_be_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ClusterError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ClusterError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

// ── Catalog transaction ─────────────────────────────────────

/// A store transaction that remembers its writes for the log.
struct CatalogTxn<'a> {
    txn: MemoryTransaction<'a>,
    ops: Vec<CatalogOp>,
}

impl CatalogTxn<'_> {
    fn get<T: DeserializeOwned>(&self, table: &str, key: &[u8]) -> Result<Option<T>, ClusterError> {
        self.txn.get(table, key)?.map(|b| decode(&b)).transpose()
    }

    fn scan_prefix<T: DeserializeOwned>(&self, table: &str, prefix: &[u8]) -> Result<Vec<T>, ClusterError> {
        let mut out = Vec::new();
        for item in self.txn.scan_prefix(table, prefix)? {
            let (_, value) = item?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    fn put<T: Serialize>(&mut self, table: &str, key: Vec<u8>, value: &T) -> Result<(), ClusterError> {
        let value = encode(value)?;
        self.txn.put(table, &key, &value)?;
        self.ops.push(CatalogOp {
            table: table.to_string(),
            key,
            value: Some(value),
        });
        Ok(())
    }

    fn delete(&mut self, table: &str, key: Vec<u8>) -> Result<(), ClusterError> {
        self.txn.delete(table, &key)?;
        self.ops.push(CatalogOp {
            table: table.to_string(),
            key,
            value: None,
        });
        Ok(())
    }

    fn collection(&self, ns: &Namespace) -> Result<Option<CollectionRecord>, ClusterError> {
        self.get(COLLECTIONS, ns.to_string().as_bytes())
    }

    fn require_sharded(&self, ns: &Namespace) -> Result<(CollectionRecord, CollectionMetadata), ClusterError> {
        let record = self
            .collection(ns)?
            .ok_or_else(|| ClusterError::NamespaceNotFound(ns.to_string()))?;
        let meta = record
            .sharding
            .clone()
            .ok_or_else(|| ClusterError::NotSharded(ns.to_string()))?;
        Ok((record, meta))
    }

    fn save_collection(&mut self, mut record: CollectionRecord) -> Result<(), ClusterError> {
        record.revision += 1;
        let key = record.ns.to_string().into_bytes();
        self.put(COLLECTIONS, key, &record)
    }

    fn chunks(&self, ns: &Namespace) -> Result<Vec<Chunk>, ClusterError> {
        self.scan_prefix(CHUNKS, &chunk_prefix(ns))
    }

    fn put_chunk(&mut self, ns: &Namespace, chunk: &Chunk) -> Result<(), ClusterError> {
        self.put(CHUNKS, chunk_key(ns, &chunk.range.min), chunk)
    }

    fn delete_chunks(&mut self, ns: &Namespace) -> Result<(), ClusterError> {
        for chunk in self.chunks(ns)? {
            self.delete(CHUNKS, chunk_key(ns, &chunk.range.min))?;
        }
        Ok(())
    }

    fn placement(&self, ns: &Namespace) -> Result<Vec<PlacementEntry>, ClusterError> {
        self.scan_prefix(PLACEMENT, &chunk_prefix(ns))
    }

    /// Append a placement entry unless the shard set is unchanged.
    fn record_placement(
        &mut self,
        ns: &Namespace,
        ts: Timestamp,
        uuid: Option<CollectionUuid>,
        shards: Vec<ShardId>,
    ) -> Result<(), ClusterError> {
        let last = self.placement(ns)?.pop();
        if last.is_some_and(|l| l.shards == shards && l.uuid == uuid) {
            return Ok(());
        }
        let entry = PlacementEntry { ts, uuid, shards };
        self.put(PLACEMENT, placement_key(ns, ts), &entry)
    }
}

fn collection_version(chunks: &[Chunk], epoch: Epoch) -> ChunkVersion {
    chunks
        .iter()
        .map(|c| c.version)
        .max_by_key(|v| (v.major, v.minor))
        .unwrap_or_else(|| ChunkVersion::zero(epoch))
}

fn shard_set(chunks: &[Chunk]) -> Vec<ShardId> {
    chunks
        .iter()
        .map(|c| c.shard.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// ── ConfigServer ─────────────────────────────────────────────

pub struct ConfigServer {
    store: MemoryStore,
    log: SharedLog<CatalogWrite>,
    shards: Vec<ShardId>,
    clock: Arc<LogicalClock>,
}

impl ConfigServer {
    /// Open the catalog, replaying every write recorded in `log`.
    pub fn open(
        shards: Vec<ShardId>,
        clock: Arc<LogicalClock>,
        log: SharedLog<CatalogWrite>,
    ) -> Result<Self, ClusterError> {
        let store = MemoryStore::new();
        for table in TABLES {
            store.create_table(table)?;
        }
        let writes = log.replay()?;
        if !writes.is_empty() {
            let txn = store.begin(false)?;
            for write in &writes {
                for op in &write.ops {
                    match &op.value {
                        Some(value) => txn.put(&op.table, &op.key, value)?,
                        None => txn.delete(&op.table, &op.key)?,
                    }
                }
            }
            txn.commit()?;
            info!(writes = writes.len(), "replayed config catalog");
        }
        Ok(Self {
            store,
            log,
            shards,
            clock,
        })
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    fn read(&self) -> Result<CatalogTxn<'_>, ClusterError> {
        Ok(CatalogTxn {
            txn: self.store.begin(true)?,
            ops: Vec::new(),
        })
    }

    /// Run `f` as one catalog transaction, retrying when it loses a race.
    fn write<R, F>(&self, what: &str, f: F) -> Result<R, ClusterError>
    where
        F: Fn(&mut CatalogTxn<'_>) -> Result<R, ClusterError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut txn = CatalogTxn {
                txn: self.store.begin(false)?,
                ops: Vec::new(),
            };
            let out = f(&mut txn)?;
            if txn.ops.is_empty() {
                txn.txn.rollback()?;
                return Ok(out);
            }
            let record = CatalogWrite { ops: txn.ops };
            let log = &self.log;
            match txn
                .txn
                .commit_with(|| log.append(&record).map(|_| ()).map_err(|e| e.to_string()))
            {
                Ok(()) => return Ok(out),
                Err(e) if e.is_write_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    warn!(op = what, attempt, "catalog write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Databases ───────────────────────────────────────────

    pub fn database(&self, db: &str) -> Result<Option<DatabaseRecord>, ClusterError> {
        self.read()?.get(DATABASES, db.as_bytes())
    }

    /// The database's primary shard, choosing the shard with the fewest
    /// primaries for a new database.
    pub fn ensure_database(&self, db: &str) -> Result<ShardId, ClusterError> {
        if let Some(existing) = self.database(db)? {
            return Ok(existing.primary);
        }
        self.write("createDatabase", |txn| {
            if let Some(existing) = txn.get::<DatabaseRecord>(DATABASES, db.as_bytes())? {
                return Ok(existing.primary);
            }
            let mut load: BTreeMap<&ShardId, usize> = self.shards.iter().map(|s| (s, 0)).collect();
            for record in txn.scan_prefix::<DatabaseRecord>(DATABASES, b"")? {
                if let Some(n) = load.get_mut(&record.primary) {
                    *n += 1;
                }
            }
            let primary = load
                .into_iter()
                .min_by_key(|(id, n)| (*n, (*id).clone()))
                .map(|(id, _)| id.clone())
                .ok_or_else(|| ClusterError::Internal("no shards registered".into()))?;
            let record = DatabaseRecord {
                name: db.to_string(),
                primary: primary.clone(),
            };
            txn.put(DATABASES, db.as_bytes().to_vec(), &record)?;
            info!(db, primary = %primary, "created database");
            Ok(primary)
        })
    }

    // ── Collections ─────────────────────────────────────────

    pub fn collection(&self, ns: &Namespace) -> Result<Option<CollectionRecord>, ClusterError> {
        self.read()?.collection(ns)
    }

    pub fn collections(&self) -> Result<Vec<CollectionRecord>, ClusterError> {
        self.read()?.scan_prefix(COLLECTIONS, b"")
    }

    /// Register an unsharded collection on its database primary. Returns
    /// the existing record when it is already known.
    pub fn create_unsharded(&self, ns: &Namespace) -> Result<CollectionRecord, ClusterError> {
        if let Some(existing) = self.collection(ns)? {
            return Ok(existing);
        }
        let primary = self.ensure_database(ns.db())?;
        self.write("createCollection", |txn| {
            if let Some(existing) = txn.collection(ns)? {
                return Ok(existing);
            }
            let record = CollectionRecord {
                ns: ns.clone(),
                uuid: CollectionUuid::new(),
                primary: primary.clone(),
                sharding: None,
                revision: 0,
            };
            txn.save_collection(record.clone())?;
            txn.record_placement(ns, self.clock.tick(), Some(record.uuid), vec![primary.clone()])?;
            info!(ns = %ns, uuid = %record.uuid, primary = %primary, "created collection");
            Ok(record)
        })
    }

    /// Turn an unsharded collection into a sharded one. Every initial chunk
    /// lives on the primary; `split_points` pre-split the key space.
    pub fn shard_collection(
        &self,
        ns: &Namespace,
        pattern: KeyPattern,
        unique: bool,
        split_points: &[ShardKey],
    ) -> Result<CollectionMetadata, ClusterError> {
        let mut bounds: Vec<ShardKey> = split_points.to_vec();
        bounds.sort();
        bounds.dedup();
        if bounds.iter().any(|k| k.arity() != pattern.arity() || k.is_min() || k.is_max()) {
            return Err(ClusterError::BadValue(
                "split points must be interior keys matching the shard key".into(),
            ));
        }
        self.write("shardCollection", |txn| {
            let record = txn
                .collection(ns)?
                .ok_or_else(|| ClusterError::NamespaceNotFound(ns.to_string()))?;
            if let Some(meta) = &record.sharding {
                if meta.key_pattern == pattern {
                    return Ok(meta.clone());
                }
                return Err(ClusterError::IllegalOperation(format!(
                    "{ns} is already sharded on {}",
                    meta.key_pattern
                )));
            }
            let meta = CollectionMetadata {
                namespace: ns.clone(),
                uuid: record.uuid,
                epoch: Epoch::new(),
                key_pattern: pattern.clone(),
                unique,
                allow_migrations: true,
            };
            let mut edges = vec![pattern.min_key()];
            edges.extend(bounds.iter().cloned());
            edges.push(pattern.max_key());
            let mut chunks = Vec::new();
            for (i, pair) in edges.windows(2).enumerate() {
                let range = ChunkRange::new(pair[0].clone(), pair[1].clone())?;
                let version = ChunkVersion::new(meta.epoch, 1, i as u32);
                chunks.push(Chunk::new(range, record.primary.clone(), version));
            }
            validate_partition(ns, &pattern, meta.epoch, &chunks.iter().collect::<Vec<_>>())?;
            for chunk in &chunks {
                txn.put_chunk(ns, chunk)?;
            }
            txn.record_placement(ns, self.clock.tick(), Some(record.uuid), vec![record.primary.clone()])?;
            txn.save_collection(CollectionRecord {
                sharding: Some(meta.clone()),
                ..record
            })?;
            info!(ns = %ns, pattern = %pattern, chunks = chunks.len(), epoch = %meta.epoch,
                "sharded collection");
            Ok(meta)
        })
    }

    pub fn set_allow_migrations(&self, ns: &Namespace, allow: bool) -> Result<(), ClusterError> {
        self.write("setAllowMigrations", |txn| {
            let (record, mut meta) = txn.require_sharded(ns)?;
            if meta.allow_migrations == allow {
                return Ok(());
            }
            meta.allow_migrations = allow;
            txn.save_collection(CollectionRecord {
                sharding: Some(meta),
                ..record
            })
        })
    }

    /// Remove `ns`. Returns whether it existed.
    pub fn drop_collection(&self, ns: &Namespace) -> Result<bool, ClusterError> {
        self.write("dropCollection", |txn| {
            let Some(record) = txn.collection(ns)? else {
                return Ok(false);
            };
            txn.delete_chunks(ns)?;
            txn.delete(COLLECTIONS, ns.to_string().into_bytes())?;
            txn.record_placement(ns, self.clock.tick(), None, Vec::new())?;
            info!(ns = %ns, uuid = %record.uuid, "dropped collection from catalog");
            Ok(true)
        })
    }

    // ── Chunks ──────────────────────────────────────────────

    pub fn chunks(&self, ns: &Namespace) -> Result<Vec<Chunk>, ClusterError> {
        self.read()?.chunks(ns)
    }

    /// Split the chunk containing `at` into `[min, at)` and `[at, max)`.
    pub fn split_chunk(&self, ns: &Namespace, at: &ShardKey) -> Result<(Chunk, Chunk), ClusterError> {
        self.write("splitChunk", |txn| {
            let (record, meta) = txn.require_sharded(ns)?;
            if at.arity() != meta.key_pattern.arity() {
                return Err(ClusterError::BadValue(format!(
                    "split key {at} does not match shard key {}",
                    meta.key_pattern
                )));
            }
            let chunks = txn.chunks(ns)?;
            let chunk = chunks
                .iter()
                .find(|c| c.range.contains(at))
                .ok_or_else(|| ClusterError::Internal(format!("no chunk of {ns} contains {at}")))?
                .clone();
            if &chunk.range.min == at {
                return Err(ClusterError::BadValue(format!(
                    "split key {at} is already a chunk boundary"
                )));
            }
            let cv = collection_version(&chunks, meta.epoch);
            let left = Chunk::new(
                ChunkRange::new(chunk.range.min.clone(), at.clone())?,
                chunk.shard.clone(),
                ChunkVersion::new(meta.epoch, cv.major, cv.minor + 1),
            );
            let right = Chunk::new(
                ChunkRange::new(at.clone(), chunk.range.max.clone())?,
                chunk.shard.clone(),
                ChunkVersion::new(meta.epoch, cv.major, cv.minor + 2),
            );
            txn.put_chunk(ns, &left)?;
            txn.put_chunk(ns, &right)?;
            txn.save_collection(record)?;
            debug!(ns = %ns, at = %at, shard = %chunk.shard, "split chunk");
            Ok((left, right))
        })
    }

    /// Merge the contiguous chunks exactly covering `range`, all owned by one
    /// shard, into a single chunk.
    pub fn merge_chunks(&self, ns: &Namespace, range: &ChunkRange) -> Result<Chunk, ClusterError> {
        self.write("mergeChunks", |txn| {
            let (record, meta) = txn.require_sharded(ns)?;
            let chunks = txn.chunks(ns)?;
            let covered: Vec<&Chunk> = chunks.iter().filter(|c| range.overlaps(&c.range)).collect();
            let (Some(first), Some(last)) = (covered.first(), covered.last()) else {
                return Err(ClusterError::BadValue(format!("no chunks of {ns} in {range}")));
            };
            if first.range.min != range.min || last.range.max != range.max {
                return Err(ClusterError::BadValue(format!(
                    "{range} does not start and end on chunk boundaries"
                )));
            }
            if covered.len() < 2 {
                return Err(ClusterError::IllegalOperation(format!(
                    "{range} is a single chunk; nothing to merge"
                )));
            }
            if covered.iter().any(|c| c.shard != first.shard) {
                return Err(ClusterError::IllegalOperation(format!(
                    "chunks in {range} are owned by more than one shard"
                )));
            }
            let cv = collection_version(&chunks, meta.epoch);
            let merged = Chunk::new(range.clone(), first.shard.clone(), cv.bump_minor());
            for chunk in &covered {
                txn.delete(CHUNKS, chunk_key(ns, &chunk.range.min))?;
            }
            txn.put_chunk(ns, &merged)?;
            txn.save_collection(record)?;
            debug!(ns = %ns, range = %range, merged = covered.len(), "merged chunks");
            Ok(merged)
        })
    }

    /// Reassign the chunk `range` from `from` to `to`: the commit point of a
    /// migration. The moved chunk gets a new major version; the donor's
    /// remaining chunk with the lowest bound gets the same major with minor
    /// 1 so the donor's shard version moves too.
    pub fn commit_migration(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        from: &ShardId,
        to: &ShardId,
        epoch: Epoch,
    ) -> Result<ChunkVersion, ClusterError> {
        self.write("commitMigration", |txn| {
            let (record, meta) = txn.require_sharded(ns)?;
            if meta.epoch != epoch {
                return Err(ClusterError::ConflictingOperation(format!(
                    "{ns} changed generation during migration"
                )));
            }
            let chunks = txn.chunks(ns)?;
            let moved = chunks
                .iter()
                .find(|c| &c.range == range)
                .ok_or_else(|| ClusterError::ConflictingOperation(format!(
                    "{range} is no longer a chunk of {ns}"
                )))?;
            if &moved.shard == to {
                return Ok(moved.version);
            }
            if &moved.shard != from {
                return Err(ClusterError::ConflictingOperation(format!(
                    "{range} of {ns} is owned by {}, not {from}",
                    moved.shard
                )));
            }
            let new_major = collection_version(&chunks, meta.epoch).bump_major();
            let migrated = Chunk::new(range.clone(), to.clone(), new_major);
            txn.put_chunk(ns, &migrated)?;
            if let Some(control) = chunks.iter().find(|c| &c.shard == from && &c.range != range) {
                let bumped = Chunk::new(
                    control.range.clone(),
                    from.clone(),
                    ChunkVersion::new(meta.epoch, new_major.major, 1),
                );
                txn.put_chunk(ns, &bumped)?;
            }
            let after = txn.chunks(ns)?;
            txn.record_placement(ns, self.clock.tick(), Some(record.uuid), shard_set(&after))?;
            txn.save_collection(record)?;
            info!(ns = %ns, range = %range, from = %from, to = %to, version = %new_major,
                "committed chunk migration");
            Ok(new_major)
        })
    }

    /// Swap `ns` to a new shard key: new epoch, the resharded collection's
    /// uuid and the given chunk assignment.
    pub fn commit_resharding(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        pattern: KeyPattern,
        assignment: &[(ChunkRange, ShardId)],
    ) -> Result<CollectionMetadata, ClusterError> {
        self.write("commitResharding", |txn| {
            let (record, old) = txn.require_sharded(ns)?;
            if record.uuid == uuid {
                return Ok(old);
            }
            let meta = CollectionMetadata {
                namespace: ns.clone(),
                uuid,
                epoch: Epoch::new(),
                key_pattern: pattern.clone(),
                unique: old.unique,
                allow_migrations: true,
            };
            let chunks: Vec<Chunk> = assignment
                .iter()
                .enumerate()
                .map(|(i, (range, shard))| {
                    Chunk::new(range.clone(), shard.clone(), ChunkVersion::new(meta.epoch, 1, i as u32))
                })
                .collect();
            validate_partition(ns, &pattern, meta.epoch, &chunks.iter().collect::<Vec<_>>())?;
            txn.delete_chunks(ns)?;
            for chunk in &chunks {
                txn.put_chunk(ns, chunk)?;
            }
            txn.record_placement(ns, self.clock.tick(), Some(uuid), shard_set(&chunks))?;
            txn.save_collection(CollectionRecord {
                uuid,
                sharding: Some(meta.clone()),
                ..record
            })?;
            info!(ns = %ns, pattern = %pattern, epoch = %meta.epoch, uuid = %uuid,
                "committed resharding");
            Ok(meta)
        })
    }

    // ── Placement history ───────────────────────────────────

    pub fn placement_history(&self, ns: &Namespace) -> Result<Vec<PlacementEntry>, ClusterError> {
        self.read()?.placement(ns)
    }

    /// Every shard that may hold user data of `ns` at or after `since`.
    pub fn shards_since(&self, ns: &Namespace, since: Timestamp) -> Result<Vec<ShardId>, ClusterError> {
        let history = self.placement_history(ns)?;
        let start = history
            .iter()
            .rposition(|e| e.ts <= since)
            .unwrap_or(0);
        let shards: BTreeSet<ShardId> = history[start.min(history.len())..]
            .iter()
            .flat_map(|e| e.shards.iter().cloned())
            .collect();
        Ok(shards.into_iter().collect())
    }
}

impl RoutingSource for ConfigServer {
    fn fetch_collection(&self, ns: &Namespace) -> Result<Option<CollectionEntry>, RoutingError> {
        let record = self.collection(ns).map_err(source_error)?;
        Ok(record.map(|r| r.entry()))
    }

    fn fetch_chunks(
        &self,
        ns: &Namespace,
        epoch: Epoch,
        since: Option<ChunkVersion>,
    ) -> Result<Vec<Chunk>, RoutingError> {
        let txn = self.read().map_err(source_error)?;
        let record = txn
            .collection(ns)
            .map_err(source_error)?
            .ok_or_else(|| RoutingError::NamespaceNotFound(ns.to_string()))?;
        let meta = record
            .sharding
            .ok_or_else(|| RoutingError::NotSharded(ns.to_string()))?;
        if meta.epoch != epoch {
            return Err(RoutingError::StaleEpoch {
                ns: ns.to_string(),
                cached: epoch,
                current: meta.epoch,
            });
        }
        let chunks = txn.chunks(ns).map_err(source_error)?;
        Ok(match since {
            Some(since) => chunks.into_iter().filter(|c| c.version.is_newer_than(&since)).collect(),
            None => chunks,
        })
    }
}

fn source_error(e: ClusterError) -> RoutingError {
    RoutingError::Source {
        code: e.code(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use bson::Bson;
    use tessera_log::MemoryLog;
    use tessera_routing::RoutingTable;

    use super::*;

    fn k(n: i32) -> ShardKey {
        ShardKey::from_bson(&[Bson::Int32(n)]).unwrap()
    }

    fn server(log: &Arc<MemoryLog>) -> ConfigServer {
        ConfigServer::open(
            vec![ShardId::from("shard0"), ShardId::from("shard1")],
            Arc::new(LogicalClock::new()),
            log.clone(),
        )
        .unwrap()
    }

    fn sharded(config: &ConfigServer) -> (Namespace, CollectionMetadata) {
        let ns = Namespace::parse("shop.orders").unwrap();
        config.create_unsharded(&ns).unwrap();
        let meta = config
            .shard_collection(&ns, KeyPattern::new(["_id"]).unwrap(), false, &[k(5)])
            .unwrap();
        (ns, meta)
    }

    #[test]
    fn primaries_spread_across_shards() {
        let config = server(&Arc::new(MemoryLog::new()));
        let a = config.ensure_database("a").unwrap();
        let b = config.ensure_database("b").unwrap();
        assert_ne!(a, b);
        assert_eq!(config.ensure_database("a").unwrap(), a);
    }

    #[test]
    fn shard_collection_keeps_uuid_and_partitions() {
        let config = server(&Arc::new(MemoryLog::new()));
        let ns = Namespace::parse("shop.orders").unwrap();
        let before = config.create_unsharded(&ns).unwrap();
        let (_, meta) = sharded(&config);
        assert_eq!(meta.uuid, before.uuid);
        let chunks = config.chunks(&ns).unwrap();
        assert_eq!(chunks.len(), 2);
        RoutingTable::new(meta, chunks).unwrap();
    }

    #[test]
    fn migration_bumps_major_on_both_sides() {
        let config = server(&Arc::new(MemoryLog::new()));
        let (ns, meta) = sharded(&config);
        let primary = config.collection(&ns).unwrap().unwrap().primary;
        let other = config.shards().iter().find(|s| **s != primary).unwrap().clone();
        let range = ChunkRange::new(k(5), meta.key_pattern.max_key()).unwrap();
        let v = config.commit_migration(&ns, &range, &primary, &other, meta.epoch).unwrap();
        assert_eq!((v.major, v.minor), (2, 0));
        let table = RoutingTable::new(meta.clone(), config.chunks(&ns).unwrap()).unwrap();
        assert_eq!(table.shard_version(&primary).major, 2);
        assert_eq!(table.find_chunk(&k(7)).unwrap().shard, other);

        // Replaying the commit is a no-op; a donor that no longer owns the
        // range is refused.
        assert_eq!(config.commit_migration(&ns, &range, &primary, &other, meta.epoch).unwrap(), v);
        let err = config
            .commit_migration(&ns, &range, &ShardId::from("shard9"), &primary, meta.epoch)
            .unwrap_err();
        assert!(matches!(err, ClusterError::ConflictingOperation(_)));
        assert_eq!(config.shards_since(&ns, Timestamp::ZERO).unwrap().len(), 2);
    }

    #[test]
    fn split_and_merge_round_trip() {
        let config = server(&Arc::new(MemoryLog::new()));
        let (ns, meta) = sharded(&config);
        config.split_chunk(&ns, &k(2)).unwrap();
        assert_eq!(config.chunks(&ns).unwrap().len(), 3);
        assert!(config.split_chunk(&ns, &k(2)).is_err());
        let low = ChunkRange::new(meta.key_pattern.min_key(), k(5)).unwrap();
        let merged = config.merge_chunks(&ns, &low).unwrap();
        assert_eq!(merged.range, low);
        let chunks = config.chunks(&ns).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(collection_version(&chunks, meta.epoch), merged.version);
    }

    #[test]
    fn catalog_survives_reopen() {
        let log = Arc::new(MemoryLog::new());
        let (ns, meta) = sharded(&server(&log));
        let reopened = server(&log);
        let record = reopened.collection(&ns).unwrap().unwrap();
        assert_eq!(record.sharding.unwrap().epoch, meta.epoch);
        assert_eq!(reopened.chunks(&ns).unwrap().len(), 2);
    }

    #[test]
    fn failed_log_append_aborts_the_write() {
        let log = Arc::new(MemoryLog::new());
        let config = server(&log);
        log.set_unavailable(true);
        assert!(config.ensure_database("shop").is_err());
        log.set_unavailable(false);
        assert!(config.database("shop").unwrap().is_none());
    }

    #[test]
    fn stale_epoch_is_reported_to_caches() {
        let config = server(&Arc::new(MemoryLog::new()));
        let (ns, _) = sharded(&config);
        let err = config.fetch_chunks(&ns, Epoch::new(), None).unwrap_err();
        assert!(matches!(err, RoutingError::StaleEpoch { .. }));
    }
}
