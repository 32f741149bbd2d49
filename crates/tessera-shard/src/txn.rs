//! Transaction participant: buffered multi-statement writes, prepare,
//! commit and abort.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bson::Document;
use serde::{Deserialize, Serialize};
use tessera_routing::{Namespace, ShardVersion};
use tessera_store::{MemoryTransaction, Store, Transaction};
use tracing::{debug, info, warn};

use crate::catalog::LocalCollection;
use crate::clock::Timestamp;
use crate::critical_section::WaitOutcome;
use crate::crud::{ReadDocuments, WriteDocuments};
use crate::error::ShardError;
use crate::oplog::OpKind;
use crate::ops::{OpContext, SessionInfo};
use crate::record;
use crate::session;
use crate::shard::{Placement, Shard};
use crate::write::WriteBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Active,
    Prepared { prepare_ts: Timestamp },
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Requested,
    Expired,
    Pressure,
    Failed,
}

#[derive(Debug, Clone)]
struct TxnWrite {
    coll: LocalCollection,
    key: Vec<u8>,
    /// Committed bytes when the transaction first touched the key.
    base: Option<Vec<u8>>,
    current: Option<Document>,
    replaced: bool,
}

#[derive(Debug)]
pub(crate) struct Participant {
    session: SessionInfo,
    state: TxnState,
    abort_reason: Option<AbortReason>,
    started: Instant,
    writes: Vec<TxnWrite>,
    index: HashMap<(String, Vec<u8>), usize>,
    /// Version each namespace was first accessed with; must still hold at
    /// prepare time.
    versions: BTreeMap<Namespace, Option<ShardVersion>>,
}

impl Participant {
    fn new(session: SessionInfo) -> Self {
        Self {
            session,
            state: TxnState::Active,
            abort_reason: None,
            started: Instant::now(),
            writes: Vec::new(),
            index: HashMap::new(),
            versions: BTreeMap::new(),
        }
    }

    fn abort(&mut self, reason: AbortReason) {
        self.state = TxnState::Aborted;
        self.abort_reason = Some(reason);
        self.writes.clear();
        self.index.clear();
    }

    fn keys(&self) -> Vec<(String, Vec<u8>)> {
        self.writes
            .iter()
            .map(|w| (w.coll.data_table(), w.key.clone()))
            .collect()
    }

    fn namespaces(&self) -> Vec<Namespace> {
        self.versions.keys().cloned().collect()
    }

    fn aborted_error(&self) -> ShardError {
        match self.abort_reason {
            Some(AbortReason::Pressure) => ShardError::TemporarilyUnavailable(format!(
                "transaction {} was aborted to relieve cache pressure",
                self.session.txn_number
            )),
            _ => ShardError::NoSuchTransaction {
                lsid: self.session.lsid_string(),
                txn_number: self.session.txn_number,
            },
        }
    }
}

// ── Prepared key locks ────────────────────────────────────────

#[derive(Debug, Default)]
struct PreparedInner {
    keys: HashMap<(String, Vec<u8>), [u8; 16]>,
    prepare_ts: HashMap<[u8; 16], Timestamp>,
    namespaces: HashMap<[u8; 16], Vec<Namespace>>,
}

/// Keys held by prepared transactions. Other writers to those keys wait
/// until the coordinator's decision releases them.
#[derive(Debug, Default)]
pub(crate) struct PreparedKeys {
    inner: Mutex<PreparedInner>,
    released: Condvar,
}

impl PreparedKeys {
    fn guard(&self) -> MutexGuard<'_, PreparedInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn hold(&self, lsid: [u8; 16], ts: Timestamp, keys: Vec<(String, Vec<u8>)>, namespaces: Vec<Namespace>) {
        let mut inner = self.guard();
        for key in keys {
            inner.keys.insert(key, lsid);
        }
        inner.prepare_ts.insert(lsid, ts);
        inner.namespaces.insert(lsid, namespaces);
    }

    fn release(&self, lsid: &[u8; 16]) {
        let mut inner = self.guard();
        inner.keys.retain(|_, owner| owner != lsid);
        inner.prepare_ts.remove(lsid);
        inner.namespaces.remove(lsid);
        self.released.notify_all();
    }

    /// Whether any key is held by a prepared transaction other than `except`.
    pub fn conflicts(&self, keys: &[(String, Vec<u8>)], except: Option<&[u8; 16]>) -> bool {
        let inner = self.guard();
        keys.iter().any(|k| {
            inner
                .keys
                .get(k)
                .is_some_and(|owner| except.is_none_or(|e| e != owner))
        })
    }

    pub fn wait(&self, deadline: Instant) {
        let guard = self.guard();
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let guard = self
            .released
            .wait_timeout(guard, deadline - now)
            .map(|(g, _)| g)
            .unwrap_or_else(|e| e.into_inner().0);
        drop(guard);
    }

    pub fn min_prepare_ts(&self) -> Option<Timestamp> {
        self.guard().prepare_ts.values().min().copied()
    }

    pub fn has_namespace(&self, ns: &Namespace) -> bool {
        self.guard()
            .namespaces
            .values()
            .any(|list| list.contains(ns))
    }
}

// ── Statement execution ───────────────────────────────────────

/// Document view of a transaction: committed data overlaid with the
/// transaction's own buffered writes.
pub(crate) struct TxnDocuments<'a, 'b> {
    snapshot: &'a MemoryTransaction<'b>,
    participant: &'a mut Participant,
    prepared: &'a PreparedKeys,
}

impl TxnDocuments<'_, '_> {
    fn record(
        &mut self,
        coll: &LocalCollection,
        doc: &Document,
        current: Option<Document>,
        replaced: bool,
    ) -> Result<(), ShardError> {
        let key = record::id_key(record::document_id(doc)?)?;
        let table = coll.data_table();
        let slot = (table.clone(), key.clone());
        if let Some(&i) = self.participant.index.get(&slot) {
            let write = &mut self.participant.writes[i];
            write.current = current;
            write.replaced |= replaced;
            return Ok(());
        }
        if self
            .prepared
            .conflicts(std::slice::from_ref(&slot), Some(&self.participant.session.lsid))
        {
            return Err(ShardError::WriteConflict(format!(
                "{} is held by a prepared transaction",
                coll.ns
            )));
        }
        let base = self.snapshot.get(&table, &key)?;
        self.participant.index.insert(slot, self.participant.writes.len());
        self.participant.writes.push(TxnWrite {
            coll: coll.clone(),
            key,
            base,
            current,
            replaced,
        });
        Ok(())
    }
}

impl ReadDocuments for TxnDocuments<'_, '_> {
    fn get_doc(&self, coll: &LocalCollection, id_key: &[u8]) -> Result<Option<Document>, ShardError> {
        if let Some(&i) = self
            .participant
            .index
            .get(&(coll.data_table(), id_key.to_vec()))
        {
            return Ok(self.participant.writes[i].current.clone());
        }
        self.snapshot.get_doc(coll, id_key)
    }

    fn all_docs(&self, coll: &LocalCollection) -> Result<Vec<Document>, ShardError> {
        let table = coll.data_table();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in self.snapshot.scan(&table, ..)? {
            let (key, bytes) = item?;
            match self.participant.index.get(&(table.clone(), key.clone())) {
                Some(&i) => {
                    seen.insert(key);
                    if let Some(doc) = &self.participant.writes[i].current {
                        out.push(doc.clone());
                    }
                }
                None => out.push(record::decode_document(&bytes)?),
            }
        }
        for write in &self.participant.writes {
            if write.coll.data_table() == table
                && !seen.contains(&write.key)
                && let Some(doc) = &write.current
            {
                out.push(doc.clone());
            }
        }
        Ok(out)
    }
}

impl WriteDocuments for TxnDocuments<'_, '_> {
    fn put_doc(
        &mut self,
        coll: &LocalCollection,
        doc: &Document,
        _previous: Option<&Document>,
        kind: OpKind,
    ) -> Result<(), ShardError> {
        self.record(coll, doc, Some(doc.clone()), kind == OpKind::Replace)
    }

    fn delete_doc(&mut self, coll: &LocalCollection, doc: &Document) -> Result<(), ShardError> {
        self.record(coll, doc, None, false)
    }
}

impl Shard {
    fn participants(&self) -> MutexGuard<'_, HashMap<[u8; 16], Participant>> {
        self.participants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one statement of a multi-statement transaction.
    pub(crate) fn run_txn_statement<R, F>(
        &self,
        ns: &Namespace,
        ctx: &OpContext,
        write: bool,
        exec: F,
    ) -> Result<R, ShardError>
    where
        F: FnOnce(&mut TxnDocuments<'_, '_>, Option<&LocalCollection>, &Placement) -> Result<R, ShardError>,
    {
        let session = self.session_of(ctx)?;
        let placement = self.placement_for(ns, ctx)?;
        if !self.critical_sections().active(ns).is_empty() {
            let wanted = self.refresh_filtering(ns)?.unwrap_or(ShardVersion::Unsharded);
            return Err(ShardError::StaleConfig {
                ns: ns.clone(),
                shard: self.id().clone(),
                received: ctx.shard_version.unwrap_or(ShardVersion::Unsharded),
                wanted,
            });
        }

        let _guard = self.lock_writes();
        let snapshot = self.store().begin(true)?;
        session::check_txn_number(&snapshot, &session)?;
        let coll = if write {
            Some(self.collection_for_write(ns, &placement)?)
        } else {
            self.collection_for_read(ns, &placement)?
        };
        // The collection may have just been created; see it.
        let snapshot = if write { self.store().begin(true)? } else { snapshot };

        let mut participants = self.participants();
        let participant = participant_for(&mut participants, session, ctx.start_transaction)?;
        participant
            .versions
            .entry(ns.clone())
            .or_insert(ctx.shard_version);
        let mut docs = TxnDocuments {
            snapshot: &snapshot,
            participant,
            prepared: &self.prepared,
        };
        exec(&mut docs, coll.as_ref(), &placement)
    }

    /// Vote to commit: validate the buffered writes against committed data,
    /// lock their keys and return the prepare timestamp. Idempotent.
    pub fn prepare_transaction(&self, session: SessionInfo) -> Result<Timestamp, ShardError> {
        if self.failpoints().should_fail("failPrepareVote") {
            self.abort_failed(session);
            return Err(ShardError::FailPoint("failPrepareVote".into()));
        }
        let _guard = self.lock_writes();
        let mut participants = self.participants();
        let participant = existing(&mut participants, &session)?;
        match participant.state {
            TxnState::Prepared { prepare_ts } => return Ok(prepare_ts),
            TxnState::Aborted => return Err(participant.aborted_error()),
            TxnState::Committed => {
                return Err(ShardError::IllegalOperation(
                    "cannot prepare a committed transaction".into(),
                ));
            }
            TxnState::Active => {}
        }
        if let Err(e) = self.validate(participant) {
            warn!(shard = %self.id(), txn = session.txn_number, error = %e, "prepare failed, aborting");
            participant.abort(AbortReason::Failed);
            return Err(e);
        }
        if let Err(e) = self.check_sections(participant) {
            participant.abort(AbortReason::Failed);
            return Err(e);
        }
        let keys = participant.keys();
        if self.prepared.conflicts(&keys, Some(&session.lsid)) {
            participant.abort(AbortReason::Failed);
            return Err(ShardError::WriteConflict(
                "keys held by another prepared transaction".into(),
            ));
        }
        let prepare_ts = self.clock().tick();
        self.prepared
            .hold(session.lsid, prepare_ts, keys, participant.namespaces());
        participant.state = TxnState::Prepared { prepare_ts };
        info!(shard = %self.id(), txn = session.txn_number, %prepare_ts, writes = participant.writes.len(),
            "prepared transaction");
        Ok(prepare_ts)
    }

    /// Commit. A prepared transaction commits at the coordinator's
    /// timestamp; an unprepared one (single participant) commits directly.
    /// Committing twice is a no-op.
    pub fn commit_transaction(
        &self,
        session: SessionInfo,
        commit_ts: Option<Timestamp>,
    ) -> Result<(), ShardError> {
        let _guard = self.lock_writes();
        let mut participants = self.participants();
        let participant = existing(&mut participants, &session)?;
        let ts = match participant.state {
            TxnState::Committed => return Ok(()),
            TxnState::Aborted => return Err(participant.aborted_error()),
            TxnState::Active => {
                let checked = self.validate(participant).and_then(|()| {
                    if self.prepared.conflicts(&participant.keys(), Some(&session.lsid)) {
                        return Err(ShardError::WriteConflict(
                            "keys held by another prepared transaction".into(),
                        ));
                    }
                    self.check_sections(participant)
                });
                if let Err(e) = checked {
                    warn!(shard = %self.id(), txn = session.txn_number, error = %e, "commit failed, aborting");
                    participant.abort(AbortReason::Failed);
                    return Err(e);
                }
                self.clock().tick()
            }
            TxnState::Prepared { prepare_ts } => {
                let ts = commit_ts.ok_or_else(|| {
                    ShardError::BadValue("a prepared transaction commits at a given timestamp".into())
                })?;
                if ts < prepare_ts {
                    return Err(ShardError::BadValue(format!(
                        "commit timestamp {ts} precedes prepare timestamp {prepare_ts}"
                    )));
                }
                self.clock().advance(ts);
                ts
            }
        };

        let mut batch = WriteBatch::new(self.store())?.in_transaction(session);
        for write in &participant.writes {
            let previous = write
                .base
                .as_deref()
                .map(record::decode_document)
                .transpose()?;
            match (&write.current, &previous) {
                (Some(doc), None) => batch.put_document(&write.coll, doc, None, OpKind::Insert)?,
                (Some(doc), Some(prev)) => {
                    let kind = if write.replaced {
                        OpKind::Replace
                    } else {
                        OpKind::Update
                    };
                    batch.put_document(&write.coll, doc, Some(prev), kind)?
                }
                (None, Some(prev)) => batch.delete_document(&write.coll, prev)?,
                (None, None) => {}
            }
        }
        batch.commit(ts)?;
        self.prepared.release(&session.lsid);
        participant.state = TxnState::Committed;
        participant.writes.clear();
        participant.index.clear();
        info!(shard = %self.id(), txn = session.txn_number, commit_ts = %ts, "committed transaction");
        Ok(())
    }

    /// Abort. Only the coordinator may abort a prepared transaction.
    pub fn abort_transaction(&self, session: SessionInfo, from_coordinator: bool) -> Result<(), ShardError> {
        let mut participants = self.participants();
        let Some(participant) = participants
            .get_mut(&session.lsid)
            .filter(|p| p.session.txn_number == session.txn_number)
        else {
            return Ok(());
        };
        match participant.state {
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(ShardError::IllegalOperation(
                "cannot abort a committed transaction".into(),
            )),
            TxnState::Prepared { .. } if !from_coordinator => {
                Err(ShardError::PreparedTransactionInProgress)
            }
            TxnState::Prepared { .. } | TxnState::Active => {
                participant.abort(AbortReason::Requested);
                self.prepared.release(&session.lsid);
                info!(shard = %self.id(), txn = session.txn_number, "aborted transaction");
                Ok(())
            }
        }
    }

    pub fn transaction_state(&self, session: &SessionInfo) -> Option<TxnState> {
        self.participants()
            .get(&session.lsid)
            .filter(|p| p.session.txn_number == session.txn_number)
            .map(|p| p.state)
    }

    /// Abort unprepared transactions older than the lifetime limit.
    pub fn expire_transactions(&self) -> usize {
        let limit = self.config().transaction_lifetime_limit;
        let mut expired = 0;
        for participant in self.participants().values_mut() {
            if participant.state == TxnState::Active && participant.started.elapsed() > limit {
                participant.abort(AbortReason::Expired);
                expired += 1;
            }
        }
        if expired > 0 {
            info!(shard = %self.id(), expired, "aborted expired transactions");
        }
        expired
    }

    /// Abort every unprepared transaction to free resources. Prepared
    /// transactions wait for their coordinator.
    pub fn relieve_pressure(&self) -> usize {
        let mut aborted = 0;
        for participant in self.participants().values_mut() {
            if participant.state == TxnState::Active {
                participant.abort(AbortReason::Pressure);
                aborted += 1;
            }
        }
        warn!(shard = %self.id(), aborted, "aborted transactions under cache pressure");
        aborted
    }

    /// Whether a prepared transaction holds keys in `ns`. Waits for writes
    /// already past their critical-section check to land first, so a caller
    /// that entered a section before asking sees every prepare and commit
    /// that could still touch the range.
    pub fn has_prepared_transactions(&self, ns: &Namespace) -> bool {
        let _guard = self.lock_writes();
        self.prepared.has_namespace(ns)
    }

    /// Refuse to prepare or commit directly while a migration or resharding
    /// blocks writes to any buffered key. Both sides of an update count, so
    /// a document moving into a blocked range is refused too.
    fn check_sections(&self, participant: &Participant) -> Result<(), ShardError> {
        for write in &participant.writes {
            let base = write.base.as_deref().map(record::decode_document).transpose()?;
            for doc in write.current.iter().chain(base.iter()) {
                let key = write
                    .coll
                    .key_pattern
                    .as_ref()
                    .and_then(|p| p.extract(doc).ok());
                let ns = &write.coll.ns;
                if self.critical_sections().wait(ns, key.as_ref(), Duration::ZERO) != WaitOutcome::Clear {
                    let received = participant
                        .versions
                        .get(ns)
                        .copied()
                        .flatten()
                        .unwrap_or(ShardVersion::Unsharded);
                    return Err(ShardError::StaleConfig {
                        ns: ns.clone(),
                        shard: self.id().clone(),
                        received,
                        wanted: self.filtering_version(ns).unwrap_or(ShardVersion::Unsharded),
                    });
                }
            }
        }
        Ok(())
    }

    fn abort_failed(&self, session: SessionInfo) {
        if let Some(p) = self
            .participants()
            .get_mut(&session.lsid)
            .filter(|p| p.session.txn_number == session.txn_number && p.state == TxnState::Active)
        {
            p.abort(AbortReason::Failed);
        }
    }

    /// Buffered writes still apply: routing has not moved and no key changed
    /// since the transaction read it.
    fn validate(&self, participant: &Participant) -> Result<(), ShardError> {
        for (ns, version) in &participant.versions {
            if let Some(received) = version {
                let wanted = self
                    .filtering_version(ns)
                    .unwrap_or(ShardVersion::Unsharded);
                if wanted != *received {
                    return Err(ShardError::StaleConfig {
                        ns: ns.clone(),
                        shard: self.id().clone(),
                        received: *received,
                        wanted,
                    });
                }
            }
        }
        let txn = self.store().begin(true)?;
        for write in &participant.writes {
            let current = match txn.get(&write.coll.data_table(), &write.key) {
                Ok(v) => v,
                Err(e) => return Err(ShardError::WriteConflict(e.to_string())),
            };
            if current != write.base {
                debug!(shard = %self.id(), ns = %write.coll.ns, "transaction write conflict");
                return Err(ShardError::WriteConflict(format!(
                    "document in {} changed since the transaction read it",
                    write.coll.ns
                )));
            }
        }
        Ok(())
    }
}

fn existing<'a>(
    participants: &'a mut HashMap<[u8; 16], Participant>,
    session: &SessionInfo,
) -> Result<&'a mut Participant, ShardError> {
    participants
        .get_mut(&session.lsid)
        .filter(|p| p.session.txn_number == session.txn_number)
        .ok_or_else(|| ShardError::NoSuchTransaction {
            lsid: session.lsid_string(),
            txn_number: session.txn_number,
        })
}

fn participant_for<'a>(
    participants: &'a mut HashMap<[u8; 16], Participant>,
    session: SessionInfo,
    start: bool,
) -> Result<&'a mut Participant, ShardError> {
    let no_such = || ShardError::NoSuchTransaction {
        lsid: session.lsid_string(),
        txn_number: session.txn_number,
    };
    if let Some(current) = participants.get(&session.lsid) {
        let active = current.session.txn_number;
        if session.txn_number < active {
            return Err(ShardError::TransactionTooOld {
                lsid: session.lsid_string(),
                txn_number: session.txn_number,
                highest: active,
            });
        }
        if session.txn_number > active && matches!(current.state, TxnState::Prepared { .. }) {
            return Err(ShardError::PreparedTransactionInProgress);
        }
    }
    let replace = participants
        .get(&session.lsid)
        .is_none_or(|p| p.session.txn_number < session.txn_number);
    if replace {
        if !start {
            return Err(no_such());
        }
        participants.insert(session.lsid, Participant::new(session));
    }
    let participant = participants.get_mut(&session.lsid).ok_or_else(no_such)?;
    match participant.state {
        TxnState::Active => Ok(participant),
        TxnState::Aborted => Err(participant.aborted_error()),
        TxnState::Prepared { .. } => Err(ShardError::PreparedTransactionInProgress),
        TxnState::Committed => Err(ShardError::IllegalOperation(format!(
            "transaction {} already committed",
            session.txn_number
        ))),
    }
}
