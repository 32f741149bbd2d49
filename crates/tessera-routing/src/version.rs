use std::cmp::Ordering;
use std::fmt;

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// Generation of a collection's routing metadata. A new epoch is minted when
/// the collection is sharded, dropped/recreated or resharded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch([u8; 12]);

impl Epoch {
    pub fn new() -> Self {
        Self(ObjectId::new().bytes())
    }

    pub fn to_object_id(&self) -> ObjectId {
        ObjectId::from_bytes(self.0)
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_object_id().to_hex())
    }
}

/// `major|minor||epoch`. Major bumps when ownership moves between shards,
/// minor bumps on splits and merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Epoch,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub fn new(epoch: Epoch, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// Version of the first chunk(s) of a freshly sharded collection.
    pub fn initial(epoch: Epoch) -> Self {
        Self::new(epoch, 1, 0)
    }

    /// Placement version of a shard that owns no chunks.
    pub fn zero(epoch: Epoch) -> Self {
        Self::new(epoch, 0, 0)
    }

    pub fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0
    }

    pub fn bump_major(self) -> Self {
        Self::new(self.epoch, self.major + 1, 0)
    }

    pub fn bump_minor(self) -> Self {
        Self::new(self.epoch, self.major, self.minor + 1)
    }

    /// Order within one epoch; versions from different epochs are unordered.
    pub fn compare(&self, other: &ChunkVersion) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }

    pub fn is_newer_than(&self, other: &ChunkVersion) -> bool {
        self.compare(other) == Some(Ordering::Greater)
    }
}

impl fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

/// Routing version attached to every versioned data operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardVersion {
    Unsharded,
    Sharded(ChunkVersion),
}

impl ShardVersion {
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            ShardVersion::Unsharded => None,
            ShardVersion::Sharded(v) => Some(v.epoch),
        }
    }

    /// True when `self` reflects strictly newer routing than `other`.
    pub fn is_newer_than(&self, other: &ShardVersion) -> bool {
        match (self, other) {
            (ShardVersion::Sharded(a), ShardVersion::Sharded(b)) => {
                a.epoch != b.epoch || a.is_newer_than(b)
            }
            (ShardVersion::Sharded(_), ShardVersion::Unsharded) => true,
            (ShardVersion::Unsharded, ShardVersion::Sharded(_)) => true,
            (ShardVersion::Unsharded, ShardVersion::Unsharded) => false,
        }
    }
}

impl fmt::Display for ShardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardVersion::Unsharded => f.write_str("UNSHARDED"),
            ShardVersion::Sharded(v) => write!(f, "{v}"),
        }
    }
}
