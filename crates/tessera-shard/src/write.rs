use bson::Document;
use tessera_store::{MemoryStore, MemoryTransaction, Store, Transaction};

use crate::catalog::LocalCollection;
use crate::clock::Timestamp;
use crate::error::ShardError;
use crate::oplog::{OpKind, OpTime, OplogEntry, PendingEntry};
use crate::ops::SessionInfo;
use crate::record::{self, OPLOG_TABLE};

/// Store transaction plus the oplog entries describing it. Every document
/// write on a shard goes through one, so data, shard-key index and oplog
/// always commit together.
pub(crate) struct WriteBatch<'a> {
    txn: MemoryTransaction<'a>,
    entries: Vec<PendingEntry>,
    touched: Vec<(String, Vec<u8>)>,
    txn_info: Option<SessionInfo>,
    from_migrate: bool,
}

impl<'a> WriteBatch<'a> {
    pub fn new(store: &'a MemoryStore) -> Result<Self, ShardError> {
        Ok(Self {
            txn: store.begin(false)?,
            entries: Vec::new(),
            touched: Vec::new(),
            txn_info: None,
            from_migrate: false,
        })
    }

    pub fn from_migrate(mut self) -> Self {
        self.from_migrate = true;
        self
    }

    pub fn in_transaction(mut self, session: SessionInfo) -> Self {
        self.txn_info = Some(session);
        self
    }

    pub fn txn(&self) -> &MemoryTransaction<'a> {
        &self.txn
    }

    /// `(table, key)` of every data record written so far.
    pub fn touched(&self) -> &[(String, Vec<u8>)] {
        &self.touched
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.txn.pending_writes() == 0
    }

    pub fn get_document(
        &self,
        coll: &LocalCollection,
        id_key: &[u8],
    ) -> Result<Option<Document>, ShardError> {
        self.txn
            .get(&coll.data_table(), id_key)?
            .map(|b| record::decode_document(&b))
            .transpose()
    }

    /// Write `doc` over `previous` (None for an insert), keeping the
    /// shard-key index in step.
    pub fn put_document(
        &mut self,
        coll: &LocalCollection,
        doc: &Document,
        previous: Option<&Document>,
        kind: OpKind,
    ) -> Result<(), ShardError> {
        let id_key = record::id_key(record::document_id(doc)?)?;
        if let Some(pattern) = &coll.key_pattern {
            let new_key = pattern
                .extract(doc)
                .map_err(|e| ShardError::BadValue(e.to_string()))?;
            let old_key = previous.map(|p| pattern.extract(p)).transpose()?;
            if old_key.as_ref() != Some(&new_key) {
                if let Some(old) = old_key {
                    self.txn
                        .delete(&coll.index_table(), &record::shard_key_entry(&old, &id_key))?;
                }
                self.txn.put(
                    &coll.index_table(),
                    &record::shard_key_entry(&new_key, &id_key),
                    &id_key,
                )?;
            }
        }
        let bytes = record::encode_document(doc)?;
        self.txn.put(&coll.data_table(), &id_key, &bytes)?;
        self.touched.push((coll.data_table(), id_key));
        self.stage(coll, kind, Some(doc), Some(bytes));
        Ok(())
    }

    pub fn delete_document(&mut self, coll: &LocalCollection, doc: &Document) -> Result<(), ShardError> {
        let id_key = record::id_key(record::document_id(doc)?)?;
        if let Some(pattern) = &coll.key_pattern {
            let key = pattern.extract(doc)?;
            self.txn
                .delete(&coll.index_table(), &record::shard_key_entry(&key, &id_key))?;
        }
        self.txn.delete(&coll.data_table(), &id_key)?;
        self.touched.push((coll.data_table(), id_key));
        self.stage(coll, OpKind::Delete, Some(doc), None);
        Ok(())
    }

    pub fn log_drop(&mut self, coll: &LocalCollection) {
        self.stage(coll, OpKind::Drop, None, None);
    }

    fn stage(&mut self, coll: &LocalCollection, kind: OpKind, doc: Option<&Document>, post: Option<Vec<u8>>) {
        let document_key = doc
            .map(|d| record::document_key(d, coll.key_pattern.as_ref()))
            .and_then(|k| record::encode_document(&k).ok());
        self.entries.push(PendingEntry {
            ns: coll.ns.clone(),
            uuid: coll.uuid,
            kind,
            document_key,
            document: post,
            from_migrate: self.from_migrate,
            txn: self.txn_info,
        });
    }

    /// Stamp the staged entries with `ts` and commit. The caller holds the
    /// shard write lock, which keeps oplog order equal to commit order.
    pub fn commit(self, ts: Timestamp) -> Result<Vec<OplogEntry>, ShardError> {
        let mut written = Vec::with_capacity(self.entries.len());
        for (index, pending) in self.entries.into_iter().enumerate() {
            let entry = pending.stamp(OpTime::new(ts, index as u32));
            self.txn
                .put(OPLOG_TABLE, &entry.optime.to_key(), &record::encode_meta(&entry)?)?;
            written.push(entry);
        }
        self.txn.commit()?;
        Ok(written)
    }

    pub fn rollback(self) -> Result<(), ShardError> {
        self.txn.rollback()?;
        Ok(())
    }
}
