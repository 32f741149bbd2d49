//! Donor and recipient data primitives shared by range migration and
//! resharding: session registration, snapshot clone, oplog catch-up.

use bson::{Bson, Document};
use tessera_routing::{ChunkRange, KeyPattern, Namespace};
use tessera_store::Store;
use tracing::debug;

use crate::crud::ReadDocuments;
use crate::error::ShardError;
use crate::oplog::{OpKind, OpTime, OplogEntry};
use crate::record;
use crate::shard::Shard;
use crate::write::WriteBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationRole {
    Donor,
    Recipient,
}

/// A data movement this shard takes part in. A session without a range
/// covers the whole namespace (resharding).
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationSession {
    pub id: [u8; 16],
    pub ns: Namespace,
    pub range: Option<ChunkRange>,
    pub role: MigrationRole,
}

impl MigrationSession {
    fn overlaps(&self, other: &MigrationSession) -> bool {
        self.ns == other.ns
            && match (&self.range, &other.range) {
                (Some(a), Some(b)) => a.overlaps(b),
                _ => true,
            }
    }
}

/// One change replayed on a recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum MigratedOp {
    /// Full post-image; inserted or replacing the current version.
    Upsert(Document),
    /// Removal by `_id`; `key` carries `_id` plus the old shard-key fields.
    Delete { id: Bson, key: Document },
}

impl MigratedOp {
    /// Document the op is about, for range filtering.
    pub fn subject(&self) -> &Document {
        match self {
            MigratedOp::Upsert(doc) => doc,
            MigratedOp::Delete { key, .. } => key,
        }
    }

    /// Whether the op's shard key under `pattern` lies in `range`. Ops that
    /// do not carry the key are kept.
    pub fn within(&self, pattern: &KeyPattern, range: &ChunkRange) -> bool {
        match pattern.extract(self.subject()) {
            Ok(key) => range.contains(&key),
            Err(_) => matches!(self, MigratedOp::Delete { .. }),
        }
    }
}

/// User changes to `ns` in `entries`, in oplog order. A drop of the
/// namespace ends any migration of it.
pub fn ops_from_oplog(entries: &[OplogEntry], ns: &Namespace) -> Result<Vec<MigratedOp>, ShardError> {
    let mut ops = Vec::new();
    for entry in entries.iter().filter(|e| &e.ns == ns && !e.from_migrate) {
        match entry.kind {
            OpKind::Insert | OpKind::Update | OpKind::Replace => {
                let doc = entry.document()?.ok_or_else(|| {
                    ShardError::Internal(format!("oplog entry {} has no post-image", entry.optime))
                })?;
                ops.push(MigratedOp::Upsert(doc));
            }
            OpKind::Delete => {
                let key = entry.document_key()?.unwrap_or_default();
                let id = key.get("_id").cloned().ok_or_else(|| {
                    ShardError::Internal(format!("oplog delete {} has no _id", entry.optime))
                })?;
                ops.push(MigratedOp::Delete { id, key });
            }
            OpKind::Drop => {
                return Err(ShardError::ConflictingOperation(format!(
                    "{ns} was dropped at {}",
                    entry.optime
                )));
            }
        }
    }
    Ok(ops)
}

impl Shard {
    pub fn register_migration(&self, session: MigrationSession) -> Result<(), ShardError> {
        let mut active = self.migrations.lock().unwrap_or_else(|e| e.into_inner());
        if active.iter().any(|m| m.id == session.id) {
            return Ok(());
        }
        if let Some(existing) = active.iter().find(|m| m.overlaps(&session)) {
            return Err(ShardError::ConflictingOperation(format!(
                "{} already has a {:?} migration of {} in progress",
                self.id(),
                existing.role,
                existing.ns
            )));
        }
        debug!(shard = %self.id(), ns = %session.ns, role = ?session.role, "registered migration");
        active.push(session);
        Ok(())
    }

    pub fn unregister_migration(&self, id: &[u8; 16]) {
        let mut active = self.migrations.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|m| &m.id != id);
    }

    pub fn active_migrations(&self) -> Vec<MigrationSession> {
        self.migrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Owned documents of `ns` (within `range`, if given) and the oplog
    /// position the copy is consistent with. Catch-up resumes after it.
    pub fn snapshot_range(
        &self,
        ns: &Namespace,
        range: Option<&ChunkRange>,
    ) -> Result<(Vec<Document>, OpTime), ShardError> {
        let _guard = self.lock_writes();
        let position = OpTime::end_of(self.watermark_locked());
        let placement = self.current_placement(ns)?;
        let Some(coll) = self.collection_for_read(ns, &placement)? else {
            return Ok((Vec::new(), position));
        };
        let table = placement.table();
        let txn = self.store().begin(true)?;
        let mut docs = Vec::new();
        for doc in txn.all_docs(&coll)? {
            let key = match table {
                Some(t) => Some(t.key_pattern().extract(&doc)?),
                None => None,
            };
            let owned = match (table, &key) {
                (Some(t), Some(k)) => t.owns(self.id(), k),
                _ => true,
            };
            let in_range = match (range, &key) {
                (Some(r), Some(k)) => r.contains(k),
                (Some(_), None) => false,
                (None, _) => true,
            };
            if owned && in_range {
                docs.push(doc);
            }
        }
        debug!(shard = %self.id(), ns = %ns, docs = docs.len(), at = %position, "snapshot for migration");
        Ok((docs, position))
    }

    /// Apply cloned or caught-up changes to the local copy of `ns`, marked as
    /// migration writes so change streams skip them.
    pub fn apply_migrated(&self, ns: &Namespace, ops: &[MigratedOp]) -> Result<usize, ShardError> {
        if ops.is_empty() {
            return Ok(0);
        }
        let _guard = self.lock_writes();
        let coll = self
            .collection(ns)?
            .ok_or_else(|| ShardError::NamespaceNotFound(ns.to_string()))?;
        let mut batch = WriteBatch::new(self.store())?.from_migrate();
        let mut applied = 0;
        for op in ops {
            match op {
                MigratedOp::Upsert(doc) => {
                    let id_key = record::id_key(record::document_id(doc)?)?;
                    let existing = batch.get_document(&coll, &id_key)?;
                    if existing.as_ref() == Some(doc) {
                        continue;
                    }
                    let kind = if existing.is_some() { OpKind::Replace } else { OpKind::Insert };
                    batch.put_document(&coll, doc, existing.as_ref(), kind)?;
                    applied += 1;
                }
                MigratedOp::Delete { id, .. } => {
                    if let Some(existing) = batch.get_document(&coll, &record::id_key(id)?)? {
                        batch.delete_document(&coll, &existing)?;
                        applied += 1;
                    }
                }
            }
        }
        if batch.is_empty() {
            batch.rollback()?;
        } else {
            batch.commit(self.clock().tick())?;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use tessera_routing::{CollectionUuid, ShardKey};

    use super::*;
    use crate::clock::Timestamp;

    fn entry(kind: OpKind, doc: Option<Document>, key: Document, from_migrate: bool) -> OplogEntry {
        OplogEntry {
            optime: OpTime::new(Timestamp::new(1, 1), 0),
            ns: Namespace::parse("shop.orders").unwrap(),
            uuid: CollectionUuid::new(),
            kind,
            document_key: Some(record::encode_document(&key).unwrap()),
            document: doc.map(|d| record::encode_document(&d).unwrap()),
            from_migrate,
            txn: None,
        }
    }

    #[test]
    fn ops_skip_migration_writes_and_other_namespaces() {
        let ns = Namespace::parse("shop.orders").unwrap();
        let mut other = entry(OpKind::Insert, Some(doc! { "_id": 9 }), doc! { "_id": 9 }, false);
        other.ns = Namespace::parse("shop.users").unwrap();
        let entries = vec![
            entry(OpKind::Insert, Some(doc! { "_id": 1 }), doc! { "_id": 1 }, false),
            entry(OpKind::Insert, Some(doc! { "_id": 2 }), doc! { "_id": 2 }, true),
            other,
            entry(OpKind::Delete, None, doc! { "_id": 1 }, false),
        ];
        let ops = ops_from_oplog(&entries, &ns).unwrap();
        assert_eq!(
            ops,
            vec![
                MigratedOp::Upsert(doc! { "_id": 1 }),
                MigratedOp::Delete {
                    id: Bson::Int32(1),
                    key: doc! { "_id": 1 }
                },
            ]
        );
    }

    #[test]
    fn drop_aborts_catch_up() {
        let ns = Namespace::parse("shop.orders").unwrap();
        let entries = vec![entry(OpKind::Drop, None, doc! {}, false)];
        let err = ops_from_oplog(&entries, &ns).unwrap_err();
        assert!(matches!(err, ShardError::ConflictingOperation(_)));
    }

    #[test]
    fn ops_filter_by_range() {
        let pattern = KeyPattern::new(["_id"]).unwrap();
        let range = ChunkRange::new(
            ShardKey::from_bson(&[Bson::Int32(5)]).unwrap(),
            pattern.max_key(),
        )
        .unwrap();
        assert!(MigratedOp::Upsert(doc! { "_id": 7 }).within(&pattern, &range));
        assert!(!MigratedOp::Upsert(doc! { "_id": 3 }).within(&pattern, &range));
    }

    #[test]
    fn sessions_conflict_only_on_overlap() {
        let pattern = KeyPattern::new(["_id"]).unwrap();
        let ns = Namespace::parse("shop.orders").unwrap();
        let mid = ShardKey::from_bson(&[Bson::Int32(5)]).unwrap();
        let low = MigrationSession {
            id: [1; 16],
            ns: ns.clone(),
            range: Some(ChunkRange::new(pattern.min_key(), mid.clone()).unwrap()),
            role: MigrationRole::Donor,
        };
        let high = MigrationSession {
            id: [2; 16],
            ns: ns.clone(),
            range: Some(ChunkRange::new(mid, pattern.max_key()).unwrap()),
            role: MigrationRole::Donor,
        };
        let whole = MigrationSession {
            id: [3; 16],
            ns,
            range: None,
            role: MigrationRole::Recipient,
        };
        assert!(!low.overlaps(&high));
        assert!(whole.overlaps(&low));
    }
}
