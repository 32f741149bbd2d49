use std::fmt;

use bson::{Document, doc};
use serde::{Deserialize, Serialize};

use crate::error::RoutingError;
use crate::key::{KeyPattern, ShardKey};
use crate::namespace::{CollectionUuid, Namespace, ShardId};
use crate::version::{ChunkVersion, Epoch};

/// Half-open range `[min, max)` of shard-key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: ShardKey,
    pub max: ShardKey,
}

impl ChunkRange {
    pub fn new(min: ShardKey, max: ShardKey) -> Result<Self, RoutingError> {
        if min >= max {
            return Err(RoutingError::InvalidRange(format!(
                "min {min} must sort before max {max}"
            )));
        }
        if min.arity() != max.arity() {
            return Err(RoutingError::InvalidRange(format!(
                "bounds {min} and {max} have different arity"
            )));
        }
        Ok(Self { min, max })
    }

    /// The entire key space of a pattern.
    pub fn full(pattern: &KeyPattern) -> Self {
        Self {
            min: pattern.min_key(),
            max: pattern.max_key(),
        }
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// True if `other` lies entirely within `self`.
    pub fn covers(&self, other: &ChunkRange) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn to_document(&self, pattern: &KeyPattern) -> Document {
        doc! {
            "min": self.min.to_document(pattern),
            "max": self.max.to_document(pattern),
        }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub range: ChunkRange,
    pub shard: ShardId,
    pub version: ChunkVersion,
}

impl Chunk {
    pub fn new(range: ChunkRange, shard: ShardId, version: ChunkVersion) -> Self {
        Self {
            range,
            shard,
            version,
        }
    }

    /// The document shape returned by `config.chunks` listings.
    pub fn to_document(&self, ns: &Namespace, pattern: &KeyPattern) -> Document {
        doc! {
            "ns": ns.to_string(),
            "min": self.range.min.to_document(pattern),
            "max": self.range.max.to_document(pattern),
            "shard": self.shard.as_str(),
            "lastmod": format!("{}|{}", self.version.major, self.version.minor),
            "lastmodEpoch": self.version.epoch.to_object_id(),
        }
    }
}

/// Authoritative description of a sharded collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub namespace: Namespace,
    pub uuid: CollectionUuid,
    pub epoch: Epoch,
    pub key_pattern: KeyPattern,
    pub unique: bool,
    /// Cleared while the collection is being resharded.
    pub allow_migrations: bool,
}

#[cfg(test)]
mod tests {
    use bson::Bson;

    use super::*;

    fn k(n: i32) -> ShardKey {
        ShardKey::from_bson(&[Bson::Int32(n)]).unwrap()
    }

    #[test]
    fn range_is_half_open() {
        let r = ChunkRange::new(k(0), k(10)).unwrap();
        assert!(r.contains(&k(0)));
        assert!(r.contains(&k(9)));
        assert!(!r.contains(&k(10)));
    }

    #[test]
    fn empty_or_inverted_ranges_are_rejected() {
        assert!(ChunkRange::new(k(5), k(5)).is_err());
        assert!(ChunkRange::new(k(6), k(5)).is_err());
    }

    #[test]
    fn overlap_and_cover() {
        let a = ChunkRange::new(k(0), k(10)).unwrap();
        let b = ChunkRange::new(k(10), k(20)).unwrap();
        let c = ChunkRange::new(k(5), k(15)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c) && b.overlaps(&c));
        assert!(a.covers(&ChunkRange::new(k(2), k(10)).unwrap()));
        assert!(!a.covers(&c));
    }
}
