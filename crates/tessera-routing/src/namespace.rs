use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RoutingError;

/// A fully qualified collection name, `db.coll`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    coll: String,
}

const RESHARDING_PREFIX: &str = "system.resharding.";

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Result<Self, RoutingError> {
        let db = db.into();
        let coll = coll.into();
        if db.is_empty() || db.contains('.') || db.contains('\0') {
            return Err(RoutingError::InvalidNamespace(format!("{db}.{coll}")));
        }
        if coll.is_empty() || coll.contains('\0') {
            return Err(RoutingError::InvalidNamespace(format!("{db}.{coll}")));
        }
        Ok(Self { db, coll })
    }

    pub fn parse(full: &str) -> Result<Self, RoutingError> {
        let (db, coll) = full
            .split_once('.')
            .ok_or_else(|| RoutingError::InvalidNamespace(full.to_string()))?;
        Self::new(db, coll)
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Temporary collection that receives documents while this namespace is
    /// being resharded.
    pub fn resharding_temp(&self, source_uuid: &CollectionUuid) -> Namespace {
        Namespace {
            db: self.db.clone(),
            coll: format!("{RESHARDING_PREFIX}{source_uuid}"),
        }
    }

    pub fn is_resharding_temp(&self) -> bool {
        self.coll.starts_with(RESHARDING_PREFIX)
    }

    /// Internal namespaces never produce user-visible change events.
    pub fn is_internal(&self) -> bool {
        self.coll.starts_with("system.") || self.db == "config" || self.db == "admin"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl TryFrom<String> for Namespace {
    type Error = RoutingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::parse(&value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

// ── ShardId ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ShardId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── CollectionUuid ────────────────────────────────────────────

/// Identity of one incarnation of a collection. Survives renames, changes on
/// drop/recreate and resharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionUuid([u8; 16]);

impl CollectionUuid {
    pub fn new() -> Self {
        Self(bson::Uuid::new().bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 16] {
        self.0
    }

    pub fn to_bson(&self) -> bson::Bson {
        bson::Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Uuid,
            bytes: self.0.to_vec(),
        })
    }
}

impl Default for CollectionUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CollectionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bson::Uuid::from_bytes(self.0))
    }
}
