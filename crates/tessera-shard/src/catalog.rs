//! Collections this shard holds data for.

use serde::{Deserialize, Serialize};
use tessera_routing::{CollectionUuid, KeyPattern, Namespace};
use tessera_store::{MemoryTransaction, Transaction};

use crate::error::ShardError;
use crate::record::{self, CATALOG_TABLE};

/// Local catalog entry. The data lives in `data.<uuid>`; sharded
/// collections additionally keep a shard-key index in `skidx.<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCollection {
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub key_pattern: Option<KeyPattern>,
}

impl LocalCollection {
    pub fn data_table(&self) -> String {
        record::data_table(&self.uuid)
    }

    pub fn index_table(&self) -> String {
        record::shard_key_table(&self.uuid)
    }
}

pub(crate) fn load(txn: &MemoryTransaction<'_>, ns: &Namespace) -> Result<Option<LocalCollection>, ShardError> {
    match txn.get(CATALOG_TABLE, ns.to_string().as_bytes())? {
        Some(bytes) => Ok(Some(record::decode_meta(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn list(txn: &MemoryTransaction<'_>) -> Result<Vec<LocalCollection>, ShardError> {
    let mut out = Vec::new();
    for item in txn.scan(CATALOG_TABLE, ..)? {
        let (_, value) = item?;
        out.push(record::decode_meta(&value)?);
    }
    Ok(out)
}

pub(crate) fn save(txn: &MemoryTransaction<'_>, coll: &LocalCollection) -> Result<(), ShardError> {
    txn.put(
        CATALOG_TABLE,
        coll.ns.to_string().as_bytes(),
        &record::encode_meta(coll)?,
    )?;
    Ok(())
}

pub(crate) fn remove(txn: &MemoryTransaction<'_>, ns: &Namespace) -> Result<(), ShardError> {
    txn.delete(CATALOG_TABLE, ns.to_string().as_bytes())?;
    Ok(())
}
