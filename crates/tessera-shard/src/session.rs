//! Retryable-write history: the response of every retryable statement,
//! keyed by session, transaction number and statement id.

use serde::{Deserialize, Serialize};
use tessera_routing::{ChunkRange, KeyPattern, Namespace};
use tessera_store::{MemoryTransaction, Store, Transaction};
use tracing::debug;

use crate::error::ShardError;
use crate::ops::SessionInfo;
use crate::record::{self, SESSION_HIGHWATER_TABLE, SESSIONS_TABLE};
use crate::shard::Shard;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: SessionInfo,
    pub stmt_id: i32,
    pub ns: Namespace,
    /// Raw BSON of the documents the statement wrote, used to decide which
    /// records follow a migrated range.
    pub affected: Vec<Vec<u8>>,
    /// Raw BSON response returned to the client.
    pub response: Vec<u8>,
}

impl SessionRecord {
    /// Whether any document this statement wrote has its shard key in `range`.
    pub fn touches_range(&self, pattern: &KeyPattern, range: &ChunkRange) -> bool {
        self.affected.iter().any(|bytes| {
            record::decode_document(bytes)
                .ok()
                .and_then(|doc| pattern.extract(&doc).ok())
                .is_some_and(|key| range.contains(&key))
        })
    }
}

fn record_key(session: &SessionInfo, stmt_id: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(&session.lsid);
    key.extend_from_slice(&((session.txn_number as u64) ^ (1 << 63)).to_be_bytes());
    key.extend_from_slice(&((stmt_id as u32) ^ (1 << 31)).to_be_bytes());
    key
}

fn highest_txn_number(txn: &MemoryTransaction<'_>, lsid: &[u8; 16]) -> Result<Option<i64>, ShardError> {
    Ok(txn
        .get(SESSION_HIGHWATER_TABLE, lsid)?
        .map(|b| record::decode_meta::<i64>(&b))
        .transpose()?)
}

/// Refuse statements from a transaction number older than one already seen.
pub(crate) fn check_txn_number(txn: &MemoryTransaction<'_>, session: &SessionInfo) -> Result<(), ShardError> {
    if let Some(highest) = highest_txn_number(txn, &session.lsid)?
        && session.txn_number < highest
    {
        return Err(ShardError::TransactionTooOld {
            lsid: session.lsid_string(),
            txn_number: session.txn_number,
            highest,
        });
    }
    Ok(())
}

pub(crate) fn lookup(
    txn: &MemoryTransaction<'_>,
    session: &SessionInfo,
    stmt_id: i32,
) -> Result<Option<SessionRecord>, ShardError> {
    txn.get(SESSIONS_TABLE, &record_key(session, stmt_id))?
        .map(|b| record::decode_meta(&b))
        .transpose()
}

pub(crate) fn save(txn: &MemoryTransaction<'_>, rec: &SessionRecord) -> Result<(), ShardError> {
    txn.put(
        SESSIONS_TABLE,
        &record_key(&rec.session, rec.stmt_id),
        &record::encode_meta(rec)?,
    )?;
    let highest = highest_txn_number(txn, &rec.session.lsid)?;
    if highest.is_none_or(|h| h < rec.session.txn_number) {
        txn.put(
            SESSION_HIGHWATER_TABLE,
            &rec.session.lsid,
            &record::encode_meta(&rec.session.txn_number)?,
        )?;
    }
    Ok(())
}

// ── History migration ─────────────────────────────────────────

impl Shard {
    /// Session records for `ns`; with a range, only those whose writes fall
    /// inside it under `pattern`.
    pub fn export_sessions(
        &self,
        ns: &Namespace,
        filter: Option<(&KeyPattern, &ChunkRange)>,
    ) -> Result<Vec<SessionRecord>, ShardError> {
        let txn = self.store().begin(true)?;
        let mut out = Vec::new();
        for item in txn.scan(SESSIONS_TABLE, ..)? {
            let (_, value) = item?;
            let rec: SessionRecord = record::decode_meta(&value)?;
            if &rec.ns != ns {
                continue;
            }
            if let Some((pattern, range)) = filter
                && !rec.touches_range(pattern, range)
            {
                continue;
            }
            out.push(rec);
        }
        Ok(out)
    }

    /// Install records cloned from another shard. Existing records win.
    pub fn import_sessions(&self, records: &[SessionRecord]) -> Result<usize, ShardError> {
        let _guard = self.lock_writes();
        let txn = self.store().begin(false)?;
        let mut imported = 0;
        for rec in records {
            if lookup(&txn, &rec.session, rec.stmt_id)?.is_none() {
                save(&txn, rec)?;
                imported += 1;
            }
        }
        txn.commit()?;
        debug!(shard = %self.id(), imported, "imported session history");
        Ok(imported)
    }
}
