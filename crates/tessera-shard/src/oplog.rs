use std::fmt;

use bson::Document;
use serde::{Deserialize, Serialize};
use tessera_routing::{CollectionUuid, Namespace};

use crate::clock::Timestamp;
use crate::error::ShardError;
use crate::ops::SessionInfo;
use crate::record;

/// Position of one entry in a shard's oplog. Entries written by the same
/// commit share a timestamp and are ordered by `index`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    pub ts: Timestamp,
    pub index: u32,
}

impl OpTime {
    pub const ZERO: OpTime = OpTime {
        ts: Timestamp::ZERO,
        index: 0,
    };

    pub fn new(ts: Timestamp, index: u32) -> Self {
        Self { ts, index }
    }

    /// Last position at `ts`: everything at or before `ts` sorts at or below it.
    pub fn end_of(ts: Timestamp) -> Self {
        Self { ts, index: u32::MAX }
    }

    pub(crate) fn to_key(self) -> Vec<u8> {
        let mut key = Vec::with_capacity(12);
        key.extend_from_slice(&self.ts.as_u64().to_be_bytes());
        key.extend_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ts, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Replace => "replace",
            OpKind::Delete => "delete",
            OpKind::Drop => "drop",
        }
    }
}

/// One committed write. Documents are kept as raw BSON so replaying an entry
/// reproduces the original bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub optime: OpTime,
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub kind: OpKind,
    pub document_key: Option<Vec<u8>>,
    /// Post-image for inserts, updates and replacements.
    pub document: Option<Vec<u8>>,
    /// Written by migration, resharding or orphan cleanup rather than a user.
    pub from_migrate: bool,
    pub txn: Option<SessionInfo>,
}

impl OplogEntry {
    pub fn document_key(&self) -> Result<Option<Document>, ShardError> {
        self.document_key
            .as_deref()
            .map(record::decode_document)
            .transpose()
    }

    pub fn document(&self) -> Result<Option<Document>, ShardError> {
        self.document
            .as_deref()
            .map(record::decode_document)
            .transpose()
    }
}

/// An entry staged by a write batch before its commit timestamp is known.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub kind: OpKind,
    pub document_key: Option<Vec<u8>>,
    pub document: Option<Vec<u8>>,
    pub from_migrate: bool,
    pub txn: Option<SessionInfo>,
}

impl PendingEntry {
    pub fn stamp(self, optime: OpTime) -> OplogEntry {
        OplogEntry {
            optime,
            ns: self.ns,
            uuid: self.uuid,
            kind: self.kind,
            document_key: self.document_key,
            document: self.document,
            from_migrate: self.from_migrate,
            txn: self.txn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_by_timestamp_then_index() {
        let a = OpTime::new(Timestamp::new(5, 1), 3).to_key();
        let b = OpTime::new(Timestamp::new(5, 2), 0).to_key();
        let c = OpTime::new(Timestamp::new(6, 0), 0).to_key();
        assert!(a < b && b < c);
        assert!(OpTime::new(Timestamp::new(5, 1), 9) < OpTime::end_of(Timestamp::new(5, 1)));
    }
}
