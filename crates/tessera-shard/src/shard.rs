use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tessera_routing::{
    CatalogCache, CollectionUuid, KeyPattern, Namespace, RoutingError, RoutingInfo, RoutingSource,
    RoutingTable, ShardId, ShardKey, ShardVersion,
};
use tessera_store::{MemoryStore, Store, Transaction};
use tracing::{debug, info, warn};

use crate::catalog::{self, LocalCollection};
use crate::clock::{LogicalClock, Timestamp};
use crate::config::ShardConfig;
use crate::critical_section::{CriticalSections, WaitOutcome};
use crate::error::ShardError;
use crate::failpoint::FailPoints;
use crate::migration::MigrationSession;
use crate::oplog::{OpTime, OplogEntry};
use crate::ops::{OpContext, SessionInfo, WriteResponse};
use crate::record::{
    self, CATALOG_TABLE, OPLOG_TABLE, RANGE_DELETIONS_TABLE, SESSION_HIGHWATER_TABLE,
    SESSIONS_TABLE,
};
use crate::session::{self, SessionRecord};
use crate::txn::{Participant, PreparedKeys};
use crate::write::WriteBatch;

const SYSTEM_TABLES: &[&str] = &[
    CATALOG_TABLE,
    OPLOG_TABLE,
    RANGE_DELETIONS_TABLE,
    SESSIONS_TABLE,
    SESSION_HIGHWATER_TABLE,
];

/// Where the config server places a namespace, as seen by this shard.
#[derive(Debug, Clone)]
pub(crate) enum Placement {
    /// Unknown to the config server: a collection created by direct writes.
    Untracked,
    Unsharded {
        uuid: CollectionUuid,
        primary: ShardId,
    },
    Sharded(Arc<RoutingTable>),
}

impl Placement {
    fn from_info(info: RoutingInfo) -> Self {
        match info {
            RoutingInfo::Unsharded { uuid, primary, .. } => Placement::Unsharded { uuid, primary },
            RoutingInfo::Sharded(table) => Placement::Sharded(table),
        }
    }

    pub fn uuid(&self) -> Option<CollectionUuid> {
        match self {
            Placement::Untracked => None,
            Placement::Unsharded { uuid, .. } => Some(*uuid),
            Placement::Sharded(t) => Some(t.uuid()),
        }
    }

    pub fn table(&self) -> Option<&Arc<RoutingTable>> {
        match self {
            Placement::Sharded(t) => Some(t),
            _ => None,
        }
    }
}

/// One shard: a store, its oplog and every per-shard protocol participant.
pub struct Shard {
    id: ShardId,
    config: ShardConfig,
    store: MemoryStore,
    clock: Arc<LogicalClock>,
    write_lock: Mutex<()>,
    filtering: CatalogCache,
    sections: CriticalSections,
    failpoints: Arc<FailPoints>,
    pub(crate) participants: Mutex<HashMap<[u8; 16], Participant>>,
    pub(crate) prepared: PreparedKeys,
    pub(crate) migrations: Mutex<Vec<MigrationSession>>,
    oplog_trimmed: Mutex<Option<OpTime>>,
}

impl Shard {
    pub fn new(
        id: ShardId,
        config: ShardConfig,
        clock: Arc<LogicalClock>,
        source: Arc<dyn RoutingSource>,
        failpoints: Arc<FailPoints>,
    ) -> Result<Self, ShardError> {
        let store = MemoryStore::new();
        for table in SYSTEM_TABLES {
            store.create_table(table)?;
        }
        info!(shard = %id, "shard started");
        Ok(Self {
            id,
            config,
            store,
            clock,
            write_lock: Mutex::new(()),
            filtering: CatalogCache::new(source),
            sections: CriticalSections::new(),
            failpoints,
            participants: Mutex::new(HashMap::new()),
            prepared: PreparedKeys::default(),
            migrations: Mutex::new(Vec::new()),
            oplog_trimmed: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &ShardId {
        &self.id
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    pub fn failpoints(&self) -> &Arc<FailPoints> {
        &self.failpoints
    }

    pub fn critical_sections(&self) -> &CriticalSections {
        &self.sections
    }

    pub(crate) fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Local catalog ───────────────────────────────────────────

    pub fn collection(&self, ns: &Namespace) -> Result<Option<LocalCollection>, ShardError> {
        let txn = self.store.begin(true)?;
        catalog::load(&txn, ns)
    }

    pub fn collections(&self) -> Result<Vec<LocalCollection>, ShardError> {
        let txn = self.store.begin(true)?;
        catalog::list(&txn)
    }

    /// Make sure `ns` exists locally with `uuid`. A local collection of an
    /// older generation is dropped first.
    pub fn ensure_collection(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        key_pattern: Option<KeyPattern>,
    ) -> Result<LocalCollection, ShardError> {
        let _guard = self.lock_writes();
        self.ensure_collection_locked(ns, uuid, key_pattern)
    }

    pub(crate) fn ensure_collection_locked(
        &self,
        ns: &Namespace,
        uuid: CollectionUuid,
        key_pattern: Option<KeyPattern>,
    ) -> Result<LocalCollection, ShardError> {
        if let Some(existing) = self.collection(ns)? {
            if existing.uuid == uuid {
                if existing.key_pattern.is_none()
                    && let Some(pattern) = key_pattern
                {
                    return self.build_shard_key_index(existing, pattern);
                }
                return Ok(existing);
            }
            warn!(shard = %self.id, ns = %ns, stale = %existing.uuid, current = %uuid,
                "dropping local collection of an older generation");
            self.drop_collection_locked(ns, true)?;
        }
        let coll = LocalCollection {
            ns: ns.clone(),
            uuid,
            key_pattern,
        };
        self.store.create_table(&coll.data_table())?;
        if coll.key_pattern.is_some() {
            self.store.create_table(&coll.index_table())?;
        }
        let txn = self.store.begin(false)?;
        catalog::save(&txn, &coll)?;
        txn.commit()?;
        debug!(shard = %self.id, ns = %ns, uuid = %uuid, "created local collection");
        Ok(coll)
    }

    /// Index an existing collection by `pattern`; part of shardCollection on
    /// the primary. Fails without changes if any document has an array in a
    /// shard-key field.
    pub fn set_shard_key(&self, ns: &Namespace, pattern: KeyPattern) -> Result<LocalCollection, ShardError> {
        let _guard = self.lock_writes();
        let coll = self
            .collection(ns)?
            .ok_or_else(|| ShardError::NamespaceNotFound(ns.to_string()))?;
        if coll.key_pattern.as_ref() == Some(&pattern) {
            return Ok(coll);
        }
        self.build_shard_key_index(coll, pattern)
    }

    fn build_shard_key_index(
        &self,
        coll: LocalCollection,
        pattern: KeyPattern,
    ) -> Result<LocalCollection, ShardError> {
        let coll = LocalCollection {
            key_pattern: Some(pattern.clone()),
            ..coll
        };
        self.store.create_table(&coll.index_table())?;
        let txn = self.store.begin(false)?;
        let mut entries = Vec::new();
        for item in txn.scan(&coll.data_table(), ..)? {
            let (id_key, bytes) = item?;
            let doc = record::decode_document(&bytes)?;
            let key = pattern
                .extract(&doc)
                .map_err(|e| ShardError::BadValue(e.to_string()))?;
            entries.push((record::shard_key_entry(&key, &id_key), id_key));
        }
        for (entry, id_key) in &entries {
            txn.put(&coll.index_table(), entry, id_key)?;
        }
        catalog::save(&txn, &coll)?;
        txn.commit()?;
        info!(shard = %self.id, ns = %coll.ns, pattern = %pattern, indexed = entries.len(),
            "built shard key index");
        Ok(coll)
    }

    /// Drop `ns` locally. User drops are logged for change streams; drops
    /// performed by resharding cleanup are not.
    pub fn drop_collection(&self, ns: &Namespace, internal: bool) -> Result<bool, ShardError> {
        let _guard = self.lock_writes();
        self.drop_collection_locked(ns, internal)
    }

    pub(crate) fn drop_collection_locked(&self, ns: &Namespace, internal: bool) -> Result<bool, ShardError> {
        let Some(coll) = self.collection(ns)? else {
            return Ok(false);
        };
        let mut batch = WriteBatch::new(&self.store)?;
        if internal {
            batch = batch.from_migrate();
        }
        batch.log_drop(&coll);
        catalog::remove(batch.txn(), ns)?;
        self.remove_range_deletions_for(batch.txn(), &coll.uuid)?;
        batch.commit(self.clock.tick())?;
        self.store.drop_table(&coll.data_table())?;
        self.store.drop_table(&coll.index_table())?;
        self.filtering.invalidate(ns);
        info!(shard = %self.id, ns = %ns, uuid = %coll.uuid, internal, "dropped local collection");
        Ok(true)
    }

    /// Replace `to` with `from`, keeping `from`'s data and uuid. Used when
    /// resharding swaps its temporary collection in.
    pub fn rename_collection(&self, from: &Namespace, to: &Namespace) -> Result<(), ShardError> {
        let _guard = self.lock_writes();
        let coll = self
            .collection(from)?
            .ok_or_else(|| ShardError::NamespaceNotFound(from.to_string()))?;
        if self.collection(to)?.is_some() {
            self.drop_collection_locked(to, true)?;
        }
        let renamed = LocalCollection {
            ns: to.clone(),
            ..coll
        };
        let txn = self.store.begin(false)?;
        catalog::remove(&txn, from)?;
        catalog::save(&txn, &renamed)?;
        txn.commit()?;
        self.filtering.invalidate(to);
        info!(shard = %self.id, from = %from, to = %to, uuid = %renamed.uuid, "renamed collection");
        Ok(())
    }

    // ── Filtering metadata ──────────────────────────────────────

    /// Reload routing for `ns` from the config server.
    pub fn refresh_filtering(&self, ns: &Namespace) -> Result<Option<ShardVersion>, ShardError> {
        match self.filtering.refresh(ns) {
            Ok(info) => Ok(Some(info.shard_version(&self.id))),
            Err(RoutingError::NamespaceNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The version this shard currently expects for `ns`, if known.
    pub fn filtering_version(&self, ns: &Namespace) -> Option<ShardVersion> {
        self.filtering.cached(ns).map(|i| i.shard_version(&self.id))
    }

    /// Shard key pattern of `ns` as last seen, used to narrow critical
    /// section waits to one key.
    pub(crate) fn cached_key_pattern(&self, ns: &Namespace) -> Option<KeyPattern> {
        self.filtering
            .cached(ns)
            .and_then(|info| info.table().map(|t| t.key_pattern().clone()))
    }

    pub(crate) fn current_placement(&self, ns: &Namespace) -> Result<Placement, ShardError> {
        match self.filtering.get(ns) {
            Ok(info) => Ok(Placement::from_info(info)),
            Err(RoutingError::NamespaceNotFound(_)) => Ok(Placement::Untracked),
            Err(e) => Err(e.into()),
        }
    }

    fn stale(&self, ns: &Namespace, received: ShardVersion, wanted: ShardVersion) -> ShardError {
        ShardError::StaleConfig {
            ns: ns.clone(),
            shard: self.id.clone(),
            received,
            wanted,
        }
    }

    /// Compare a request's version with ours, refreshing once on mismatch.
    fn check_version(&self, ns: &Namespace, received: ShardVersion) -> Result<Placement, ShardError> {
        if let Some(info) = self.filtering.cached(ns)
            && info.shard_version(&self.id) == received
        {
            return Ok(Placement::from_info(info));
        }
        match self.filtering.refresh(ns) {
            Ok(info) => {
                let wanted = info.shard_version(&self.id);
                if wanted == received {
                    Ok(Placement::from_info(info))
                } else {
                    debug!(shard = %self.id, ns = %ns, %received, %wanted, "stale shard version");
                    Err(self.stale(ns, received, wanted))
                }
            }
            Err(RoutingError::NamespaceNotFound(_)) => {
                Err(self.stale(ns, received, ShardVersion::Unsharded))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Placement for an operation, checking its version and expected uuid.
    pub(crate) fn placement_for(&self, ns: &Namespace, ctx: &OpContext) -> Result<Placement, ShardError> {
        let placement = match ctx.shard_version {
            Some(received) => self.check_version(ns, received)?,
            None => self.current_placement(ns)?,
        };
        if let Some(expected) = ctx.expected_uuid {
            let actual = match placement.uuid() {
                Some(uuid) => Some(uuid),
                None => self.collection(ns)?.map(|c| c.uuid),
            };
            if actual != Some(expected) {
                return Err(ShardError::UuidMismatch {
                    ns: ns.clone(),
                    expected,
                    actual: actual.map(|u| u.to_string()).unwrap_or_else(|| "none".into()),
                });
            }
        }
        Ok(placement)
    }

    /// The local collection reads should see, if any.
    pub(crate) fn collection_for_read(
        &self,
        ns: &Namespace,
        placement: &Placement,
    ) -> Result<Option<LocalCollection>, ShardError> {
        let local = self.collection(ns)?;
        Ok(match placement.uuid() {
            Some(uuid) => local.filter(|c| c.uuid == uuid),
            None => local,
        })
    }

    /// The local collection a write lands in, created on first use. Caller
    /// holds the write lock.
    pub(crate) fn collection_for_write(
        &self,
        ns: &Namespace,
        placement: &Placement,
    ) -> Result<LocalCollection, ShardError> {
        match placement {
            Placement::Untracked => match self.collection(ns)? {
                Some(coll) => Ok(coll),
                None => self.ensure_collection_locked(ns, CollectionUuid::new(), None),
            },
            Placement::Unsharded { uuid, primary } => {
                if primary != &self.id {
                    return Err(ShardError::IllegalOperation(format!(
                        "{ns} is unsharded and lives on {primary}, not {}",
                        self.id
                    )));
                }
                self.ensure_collection_locked(ns, *uuid, None)
            }
            Placement::Sharded(table) => self.ensure_collection_locked(
                ns,
                table.uuid(),
                Some(table.key_pattern().clone()),
            ),
        }
    }

    /// Run `exec` as one atomic write to `ns`.
    ///
    /// The write waits out critical sections covering `key` (any section on
    /// the namespace when the key is unknown) and prepared transactions
    /// holding the keys it touches. A versioned write that had to wait for a
    /// section is rejected as stale: ownership may have moved meanwhile.
    /// Retryable writes return the recorded response instead of executing
    /// twice.
    pub(crate) fn run_write<R, F>(
        &self,
        ns: &Namespace,
        ctx: &OpContext,
        key: Option<&ShardKey>,
        exec: F,
    ) -> Result<R, ShardError>
    where
        R: WriteResponse,
        F: Fn(&mut WriteBatch<'_>, &LocalCollection, &Placement) -> Result<(R, Vec<bson::Document>), ShardError>,
    {
        let prepared_deadline = Instant::now() + self.config.prepared_wait_timeout;
        let mut placement = self.placement_for(ns, ctx)?;
        loop {
            match self.sections.wait(ns, key, self.config.critical_section_timeout) {
                WaitOutcome::Clear => {}
                outcome => {
                    if let Some(received) = ctx.shard_version {
                        let wanted = self
                            .refresh_filtering(ns)?
                            .unwrap_or(ShardVersion::Unsharded);
                        return Err(self.stale(ns, received, wanted));
                    }
                    if outcome == WaitOutcome::TimedOut {
                        return Err(ShardError::ConflictingOperation(format!(
                            "{ns} is in a critical section: {:?}",
                            self.sections.active(ns)
                        )));
                    }
                    placement = self.current_placement(ns)?;
                    continue;
                }
            }

            let guard = self.lock_writes();
            // A section may have been entered between the wait and the lock.
            if self.sections.wait(ns, key, Duration::ZERO) != WaitOutcome::Clear {
                drop(guard);
                continue;
            }
            let coll = self.collection_for_write(ns, &placement)?;
            let mut batch = WriteBatch::new(&self.store)?;

            let retryable = ctx.retryable();
            if let Some((session, stmt_id)) = retryable {
                session::check_txn_number(batch.txn(), &session)?;
                if let Some(rec) = session::lookup(batch.txn(), &session, stmt_id)? {
                    debug!(shard = %self.id, ns = %ns, stmt_id, "replaying retryable write response");
                    batch.rollback()?;
                    return R::from_document(&record::decode_document(&rec.response)?);
                }
            }

            let (response, affected) = exec(&mut batch, &coll, &placement)?;

            if self.prepared.conflicts(batch.touched(), None) {
                batch.rollback()?;
                drop(guard);
                if Instant::now() >= prepared_deadline {
                    return Err(ShardError::WriteConflict(format!(
                        "write to {ns} blocked by a prepared transaction"
                    )));
                }
                self.prepared.wait(prepared_deadline);
                continue;
            }

            if let Some((session, stmt_id)) = retryable {
                let rec = SessionRecord {
                    session,
                    stmt_id,
                    ns: ns.clone(),
                    affected: affected
                        .iter()
                        .map(record::encode_document)
                        .collect::<Result<_, _>>()?,
                    response: record::encode_document(&response.to_document())?,
                };
                session::save(batch.txn(), &rec)?;
            }

            if !batch.is_empty() {
                batch.commit(self.clock.tick())?;
                self.trim_oplog_locked()?;
            } else {
                batch.rollback()?;
            }
            return Ok(response);
        }
    }

    // ── Oplog ───────────────────────────────────────────────────

    /// Entries after `after` up to and including `upto`, optionally for one
    /// namespace only.
    pub fn read_oplog(
        &self,
        after: OpTime,
        upto: Timestamp,
        ns: Option<&Namespace>,
    ) -> Result<Vec<OplogEntry>, ShardError> {
        if let Some(trimmed) = *self.oplog_trimmed.lock().unwrap_or_else(|e| e.into_inner())
            && after < trimmed
        {
            return Err(ShardError::HistoryLost(format!(
                "{} no longer holds entries after {after}; oldest kept is after {trimmed}",
                self.id
            )));
        }
        if OpTime::end_of(upto) <= after {
            return Ok(Vec::new());
        }
        let txn = self.store.begin(true)?;
        let mut out = Vec::new();
        let start = after.to_key();
        for item in txn.scan(OPLOG_TABLE, start.clone()..=OpTime::end_of(upto).to_key())? {
            let (key, value) = item?;
            if key == start {
                continue;
            }
            let entry: OplogEntry = record::decode_meta(&value)?;
            if ns.is_none_or(|n| &entry.ns == n) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Position of the newest entry, or zero on an empty oplog.
    pub fn last_optime(&self) -> Result<OpTime, ShardError> {
        let txn = self.store.begin(true)?;
        let last = txn.scan(OPLOG_TABLE, ..)?.last().transpose()?;
        match last {
            Some((_, value)) => Ok(record::decode_meta::<OplogEntry>(&value)?.optime),
            None => Ok(OpTime::ZERO),
        }
    }

    /// Every entry at or before the returned time is committed, and no entry
    /// at or before it will ever be added.
    pub fn watermark(&self) -> Timestamp {
        let _guard = self.lock_writes();
        self.watermark_locked()
    }

    pub(crate) fn watermark_locked(&self) -> Timestamp {
        let now = self.clock.now();
        match self.prepared.min_prepare_ts() {
            Some(ts) if ts <= now => ts.prev(),
            _ => now,
        }
    }

    fn trim_oplog_locked(&self) -> Result<(), ShardError> {
        let len = self.store.table_len(OPLOG_TABLE).unwrap_or(0);
        if len <= self.config.oplog_max_entries {
            return Ok(());
        }
        let excess = len - self.config.oplog_max_entries;
        let txn = self.store.begin(false)?;
        let mut last = None;
        let doomed: Vec<Vec<u8>> = txn
            .scan(OPLOG_TABLE, ..)?
            .take(excess)
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for key in &doomed {
            if let Some(bytes) = txn.get(OPLOG_TABLE, key)? {
                last = Some(record::decode_meta::<OplogEntry>(&bytes)?.optime);
            }
            txn.delete(OPLOG_TABLE, key)?;
        }
        txn.commit()?;
        if let Some(optime) = last {
            debug!(shard = %self.id, trimmed = doomed.len(), through = %optime, "trimmed oplog");
            *self.oplog_trimmed.lock().unwrap_or_else(|e| e.into_inner()) = Some(optime);
        }
        Ok(())
    }

    /// Trim the oplog down to its retention limit.
    pub fn trim_oplog(&self) -> Result<(), ShardError> {
        let _guard = self.lock_writes();
        self.trim_oplog_locked()
    }

    pub(crate) fn session_of(&self, ctx: &OpContext) -> Result<SessionInfo, ShardError> {
        ctx.session
            .ok_or_else(|| ShardError::BadValue("transaction statement without a session".into()))
    }
}
