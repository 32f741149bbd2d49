use std::collections::BTreeMap;
use std::ops::Bound;

use crate::chunk::{Chunk, ChunkRange, CollectionMetadata};
use crate::error::RoutingError;
use crate::key::{KeyPattern, ShardKey};
use crate::namespace::{CollectionUuid, Namespace, ShardId};
use crate::version::{ChunkVersion, Epoch, ShardVersion};

/// Check that `chunks` partition the key space of `pattern`: sorted by `min`
/// they start at MinKey, end at MaxKey and each chunk's `max` is the next
/// chunk's `min`. All chunks must carry `epoch`.
pub fn validate_partition(
    ns: &Namespace,
    pattern: &KeyPattern,
    epoch: Epoch,
    chunks: &[&Chunk],
) -> Result<(), RoutingError> {
    let invalid = |reason: String| RoutingError::InvalidPartition {
        ns: ns.to_string(),
        reason,
    };
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        return Err(invalid("no chunks".into()));
    };
    if first.range.min != pattern.min_key() {
        return Err(invalid(format!("first chunk starts at {}", first.range.min)));
    }
    if last.range.max != pattern.max_key() {
        return Err(invalid(format!("last chunk ends at {}", last.range.max)));
    }
    for chunk in chunks {
        if chunk.range.min.arity() != pattern.arity() {
            return Err(invalid(format!("chunk {} has wrong arity", chunk.range)));
        }
        if chunk.version.epoch != epoch {
            return Err(invalid(format!(
                "chunk {} has epoch {}",
                chunk.range, chunk.version.epoch
            )));
        }
    }
    for pair in chunks.windows(2) {
        if pair[0].range.max != pair[1].range.min {
            return Err(invalid(format!(
                "{} is not followed by a chunk starting at its max (next is {})",
                pair[0].range, pair[1].range
            )));
        }
    }
    Ok(())
}

/// Immutable snapshot of a sharded collection's chunk map.
///
/// Chunks are keyed by their `min` bound; lookups find the greatest `min`
/// not above the key. Updating produces a new table, the old one is never
/// mutated.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    metadata: CollectionMetadata,
    chunks: BTreeMap<ShardKey, Chunk>,
    version: ChunkVersion,
    shard_versions: BTreeMap<ShardId, ChunkVersion>,
}

impl RoutingTable {
    pub fn new(metadata: CollectionMetadata, chunks: Vec<Chunk>) -> Result<Self, RoutingError> {
        let chunks: BTreeMap<ShardKey, Chunk> = chunks
            .into_iter()
            .map(|c| (c.range.min.clone(), c))
            .collect();
        Self::from_map(metadata, chunks)
    }

    fn from_map(
        metadata: CollectionMetadata,
        chunks: BTreeMap<ShardKey, Chunk>,
    ) -> Result<Self, RoutingError> {
        let ordered: Vec<&Chunk> = chunks.values().collect();
        validate_partition(
            &metadata.namespace,
            &metadata.key_pattern,
            metadata.epoch,
            &ordered,
        )?;

        let mut version = ChunkVersion::zero(metadata.epoch);
        let mut shard_versions: BTreeMap<ShardId, ChunkVersion> = BTreeMap::new();
        for chunk in chunks.values() {
            if chunk.version.is_newer_than(&version) {
                version = chunk.version;
            }
            let entry = shard_versions
                .entry(chunk.shard.clone())
                .or_insert(chunk.version);
            if chunk.version.is_newer_than(entry) {
                *entry = chunk.version;
            }
        }
        Ok(Self {
            metadata,
            chunks,
            version,
            shard_versions,
        })
    }

    pub fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }

    pub fn namespace(&self) -> &Namespace {
        &self.metadata.namespace
    }

    pub fn uuid(&self) -> CollectionUuid {
        self.metadata.uuid
    }

    pub fn epoch(&self) -> Epoch {
        self.metadata.epoch
    }

    pub fn key_pattern(&self) -> &KeyPattern {
        &self.metadata.key_pattern
    }

    /// Collection version: the highest chunk version.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    /// Placement version of `shard`, `0|0` when it owns nothing.
    pub fn shard_version(&self, shard: &ShardId) -> ChunkVersion {
        self.shard_versions
            .get(shard)
            .copied()
            .unwrap_or_else(|| ChunkVersion::zero(self.metadata.epoch))
    }

    pub fn shards(&self) -> Vec<ShardId> {
        self.shard_versions.keys().cloned().collect()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn chunks_for_shard<'a>(&'a self, shard: &'a ShardId) -> impl Iterator<Item = &'a Chunk> {
        self.chunks.values().filter(move |c| &c.shard == shard)
    }

    pub fn find_chunk(&self, key: &ShardKey) -> Option<&Chunk> {
        self.chunks
            .range((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, c)| c)
            .filter(|c| c.range.contains(key))
    }

    pub fn chunks_overlapping(&self, range: &ChunkRange) -> Vec<&Chunk> {
        let start = match self.find_chunk(&range.min) {
            Some(c) => c.range.min.clone(),
            None => range.min.clone(),
        };
        self.chunks
            .range((Bound::Included(start), Bound::Excluded(range.max.clone())))
            .map(|(_, c)| c)
            .filter(|c| c.range.overlaps(range))
            .collect()
    }

    pub fn owns(&self, shard: &ShardId, key: &ShardKey) -> bool {
        self.find_chunk(key).is_some_and(|c| &c.shard == shard)
    }

    /// Whether every chunk overlapping `range` belongs to `shard`.
    pub fn owns_range(&self, shard: &ShardId, range: &ChunkRange) -> bool {
        let overlapping = self.chunks_overlapping(range);
        !overlapping.is_empty() && overlapping.iter().all(|c| &c.shard == shard)
    }

    /// Whether any chunk overlapping `range` belongs to `shard`.
    pub fn owns_any(&self, shard: &ShardId, range: &ChunkRange) -> bool {
        self.chunks_overlapping(range)
            .iter()
            .any(|c| &c.shard == shard)
    }

    /// Build the next snapshot from chunks changed since this one.
    ///
    /// Each changed chunk replaces every chunk it overlaps. A change from a
    /// different epoch is refused: the caller must reload from scratch rather
    /// than mix generations.
    pub fn apply_changes(
        &self,
        metadata: CollectionMetadata,
        changes: Vec<Chunk>,
    ) -> Result<RoutingTable, RoutingError> {
        let stale = |current: Epoch| RoutingError::StaleEpoch {
            ns: self.metadata.namespace.to_string(),
            cached: self.metadata.epoch,
            current,
        };
        if metadata.epoch != self.metadata.epoch {
            return Err(stale(metadata.epoch));
        }
        if let Some(c) = changes.iter().find(|c| c.version.epoch != self.metadata.epoch) {
            return Err(stale(c.version.epoch));
        }

        let mut changes = changes;
        changes.sort_by_key(|c| (c.version.major, c.version.minor));

        let mut chunks = self.chunks.clone();
        for change in changes {
            let replaced: Vec<ShardKey> = chunks
                .values()
                .filter(|c| c.range.overlaps(&change.range))
                .map(|c| c.range.min.clone())
                .collect();
            for min in replaced {
                chunks.remove(&min);
            }
            chunks.insert(change.range.min.clone(), change);
        }
        Self::from_map(metadata, chunks)
    }

    pub fn shard_version_for(&self, shard: &ShardId) -> ShardVersion {
        ShardVersion::Sharded(self.shard_version(shard))
    }
}
