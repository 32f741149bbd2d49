//! Request routing: targets shards from a cached routing table, attaches
//! shard versions and retries stale-routing errors after a refresh.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use bson::Document;
use tessera_routing::{
    CatalogCache, CollectionUuid, Namespace, RoutingError, RoutingInfo, ShardId, ShardKey,
};
use tessera_shard::{
    DeleteResult, FindAndModify, FindAndModifyResult, InsertResult, OpContext, Selector,
    SessionInfo, Shard, ShardError, UpdateResult, UpdateSpec, with_id,
};
use tracing::{debug, warn};

use crate::config_server::ConfigServer;
use crate::error::ClusterError;
use crate::registry::ShardRegistry;
use crate::transaction_coordinator::{CommitDecision, TransactionCoordinator};

/// Per-request session and transaction options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub session: Option<SessionInfo>,
    pub stmt_id: Option<i32>,
    /// Part of the multi-statement transaction identified by `session`.
    pub in_transaction: bool,
    pub expected_uuid: Option<CollectionUuid>,
}

impl RequestOptions {
    pub fn retryable(session: SessionInfo, stmt_id: i32) -> Self {
        Self {
            session: Some(session),
            stmt_id: Some(stmt_id),
            ..Self::default()
        }
    }

    pub fn transaction(session: SessionInfo) -> Self {
        Self {
            session: Some(session),
            in_transaction: true,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct RouterTxn {
    session: SessionInfo,
    participants: BTreeSet<ShardId>,
}

/// Where a request goes.
enum Target {
    One(ShardId),
    Many(Vec<ShardId>),
}

pub struct Router {
    config: Arc<ConfigServer>,
    registry: Arc<ShardRegistry>,
    coordinator: Arc<ArcSwap<TransactionCoordinator>>,
    cache: CatalogCache,
    max_stale_retries: usize,
    txns: Mutex<HashMap<[u8; 16], RouterTxn>>,
}

impl Router {
    pub fn new(
        config: Arc<ConfigServer>,
        registry: Arc<ShardRegistry>,
        coordinator: Arc<ArcSwap<TransactionCoordinator>>,
        max_stale_retries: usize,
    ) -> Self {
        let cache = CatalogCache::new(config.clone());
        Self {
            config,
            registry,
            coordinator,
            cache,
            max_stale_retries,
            txns: Mutex::new(HashMap::new()),
        }
    }

    /// Routing as this router currently sees it.
    pub fn routing_info(&self, ns: &Namespace) -> Result<RoutingInfo, ClusterError> {
        Ok(self.cache.get(ns)?)
    }

    pub fn refresh_count(&self) -> u64 {
        self.cache.refresh_count()
    }

    // ── Targeting ───────────────────────────────────────────

    /// Routing for `ns`; writes create a missing collection on its
    /// database primary.
    fn routing(&self, ns: &Namespace, create: bool) -> Result<Option<RoutingInfo>, ClusterError> {
        match self.cache.get(ns) {
            Ok(info) => Ok(Some(info)),
            Err(RoutingError::NamespaceNotFound(_)) if create => {
                self.config.create_unsharded(ns)?;
                Ok(Some(self.cache.refresh(ns)?))
            }
            Err(RoutingError::NamespaceNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn target_filter(info: &RoutingInfo, selector: &Selector) -> Result<Target, ClusterError> {
        match info {
            RoutingInfo::Unsharded { primary, .. } => Ok(Target::One(primary.clone())),
            RoutingInfo::Sharded(table) => {
                let key = table.key_pattern().extract_from_filter(&selector.as_filter())?;
                Ok(match key.and_then(|k| table.find_chunk(&k).map(|c| c.shard.clone())) {
                    Some(shard) => Target::One(shard),
                    None => Target::Many(table.shards()),
                })
            }
        }
    }

    fn owner_of(info: &RoutingInfo, doc: &Document) -> Result<ShardId, ClusterError> {
        match info {
            RoutingInfo::Unsharded { primary, .. } => Ok(primary.clone()),
            RoutingInfo::Sharded(table) => {
                let key = table
                    .key_pattern()
                    .extract(doc)
                    .map_err(|e| ClusterError::BadValue(e.to_string()))?;
                Self::chunk_owner(info, &key)
            }
        }
    }

    fn chunk_owner(info: &RoutingInfo, key: &ShardKey) -> Result<ShardId, ClusterError> {
        match info {
            RoutingInfo::Unsharded { primary, .. } => Ok(primary.clone()),
            RoutingInfo::Sharded(table) => table
                .find_chunk(key)
                .map(|c| c.shard.clone())
                .ok_or_else(|| ClusterError::Internal(format!("no chunk owns {key}"))),
        }
    }

    fn context(
        &self,
        info: &RoutingInfo,
        shard: &ShardId,
        opts: &RequestOptions,
    ) -> Result<OpContext, ClusterError> {
        let mut ctx = OpContext {
            shard_version: Some(info.shard_version(shard)),
            session: opts.session,
            stmt_id: opts.stmt_id,
            in_transaction: opts.in_transaction,
            start_transaction: false,
            expected_uuid: opts.expected_uuid,
        };
        if opts.in_transaction {
            let session = opts.session.ok_or_else(|| {
                ClusterError::BadValue("a transaction statement needs a session".into())
            })?;
            let mut txns = self.txns.lock().unwrap_or_else(|e| e.into_inner());
            let txn = txns.entry(session.lsid).or_insert_with(|| RouterTxn {
                session,
                participants: BTreeSet::new(),
            });
            if txn.session.txn_number < session.txn_number {
                debug!(lsid = %session.lsid_string(), txn = session.txn_number,
                    "newer transaction replaces the open one");
                *txn = RouterTxn {
                    session,
                    participants: BTreeSet::new(),
                };
            } else if txn.session.txn_number > session.txn_number {
                return Err(ShardError::TransactionTooOld {
                    lsid: session.lsid_string(),
                    txn_number: session.txn_number,
                    highest: txn.session.txn_number,
                }
                .into());
            }
            ctx.start_transaction = txn.participants.insert(shard.clone());
        }
        Ok(ctx)
    }

    fn shard(&self, id: &ShardId) -> Result<Arc<Shard>, ClusterError> {
        self.registry.get(id)
    }

    /// Run `op` against fresh routing until it stops failing as stale.
    /// Inside a transaction any error aborts the transaction instead.
    fn with_retries<R, F>(
        &self,
        ns: &Namespace,
        create: bool,
        opts: &RequestOptions,
        mut op: F,
    ) -> Result<Option<R>, ClusterError>
    where
        F: FnMut(&RoutingInfo) -> Result<R, ClusterError>,
    {
        let mut last = None;
        for attempt in 0..=self.max_stale_retries {
            let Some(info) = self.routing(ns, create)? else {
                return Ok(None);
            };
            match op(&info) {
                // Any failed statement ends its transaction.
                Err(e) if opts.in_transaction => {
                    if let Some(session) = opts.session {
                        self.abort_participants(session);
                    }
                    return Err(e);
                }
                Err(e) if e.is_stale() => {
                    debug!(ns = %ns, attempt, error = %e, "stale routing, refreshing");
                    match self.cache.refresh_if_stale(ns, &info.version()) {
                        Ok(_) | Err(RoutingError::NamespaceNotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                    last = Some(e);
                }
                other => return other.map(Some),
            }
        }
        let last = match last {
            Some(ClusterError::Shard(e)) => e,
            Some(e) => ShardError::Internal(e.to_string()),
            None => ShardError::Internal("no attempt made".into()),
        };
        warn!(ns = %ns, attempts = self.max_stale_retries + 1, "giving up on stale routing");
        Err(ClusterError::StaleRetriesExhausted {
            ns: ns.clone(),
            attempts: self.max_stale_retries + 1,
            last: Box::new(last),
        })
    }

    // ── Writes ──────────────────────────────────────────────

    pub fn insert(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        opts: &RequestOptions,
    ) -> Result<InsertResult, ClusterError> {
        let mut remaining: Vec<Document> = docs.into_iter().map(with_id).collect();
        let mut inserted = 0;
        self.with_retries(ns, true, opts, |info| {
            let mut groups: BTreeMap<ShardId, Vec<usize>> = BTreeMap::new();
            for (i, doc) in remaining.iter().enumerate() {
                groups.entry(Self::owner_of(info, doc)?).or_default().push(i);
            }
            let mut done: Vec<usize> = Vec::new();
            let mut outcome = Ok(());
            for (shard, idxs) in &groups {
                let batch: Vec<Document> = idxs.iter().map(|&i| remaining[i].clone()).collect();
                let ctx = self.context(info, shard, opts)?;
                match self.shard(shard)?.insert(ns, batch, &ctx) {
                    Ok(r) => {
                        inserted += r.inserted;
                        done.extend(idxs);
                    }
                    Err(e) => {
                        outcome = Err(ClusterError::from(e));
                        break;
                    }
                }
            }
            done.sort_unstable();
            for i in done.into_iter().rev() {
                remaining.remove(i);
            }
            outcome
        })?;
        Ok(InsertResult { inserted })
    }

    pub fn update(
        &self,
        ns: &Namespace,
        selector: &Selector,
        spec: &UpdateSpec,
        multi: bool,
        upsert: bool,
        opts: &RequestOptions,
    ) -> Result<UpdateResult, ClusterError> {
        let mut total = UpdateResult::default();
        let mut finished: BTreeSet<ShardId> = BTreeSet::new();
        self.with_retries(ns, true, opts, |info| {
            let shards = match Self::target_filter(info, selector)? {
                Target::One(shard) => vec![shard],
                Target::Many(_) if upsert => {
                    return Err(ClusterError::ShardKeyNotFound(format!(
                        "upsert on {ns} must target a single shard by shard key"
                    )));
                }
                Target::Many(shards) => shards,
            };
            for shard in &shards {
                if finished.contains(shard) {
                    continue;
                }
                let ctx = self.context(info, shard, opts)?;
                let r = self.shard(shard)?.update(ns, selector, spec, multi, upsert, &ctx)?;
                total.matched += r.matched;
                total.modified += r.modified;
                if r.upserted_id.is_some() {
                    total.upserted_id = r.upserted_id;
                }
                finished.insert(shard.clone());
                if !multi && r.matched > 0 {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(total)
    }

    pub fn delete(
        &self,
        ns: &Namespace,
        selector: &Selector,
        multi: bool,
        opts: &RequestOptions,
    ) -> Result<DeleteResult, ClusterError> {
        let mut total = DeleteResult::default();
        let mut finished: BTreeSet<ShardId> = BTreeSet::new();
        self.with_retries(ns, false, opts, |info| {
            let shards = match Self::target_filter(info, selector)? {
                Target::One(shard) => vec![shard],
                Target::Many(shards) => shards,
            };
            for shard in &shards {
                if finished.contains(shard) {
                    continue;
                }
                let ctx = self.context(info, shard, opts)?;
                let r = self.shard(shard)?.delete(ns, selector, multi, &ctx)?;
                total.deleted += r.deleted;
                finished.insert(shard.clone());
                if !multi && r.deleted > 0 {
                    break;
                }
            }
            Ok(())
        })?;
        Ok(total)
    }

    pub fn find_and_modify(
        &self,
        ns: &Namespace,
        request: &FindAndModify,
        opts: &RequestOptions,
    ) -> Result<FindAndModifyResult, ClusterError> {
        let mut finished: BTreeSet<ShardId> = BTreeSet::new();
        let result = self.with_retries(ns, true, opts, |info| {
            let shards = match Self::target_filter(info, &request.selector)? {
                Target::One(shard) => vec![shard],
                Target::Many(_) if request.upsert => {
                    return Err(ClusterError::ShardKeyNotFound(format!(
                        "findAndModify upsert on {ns} must target a single shard by shard key"
                    )));
                }
                Target::Many(shards) => shards,
            };
            let mut last = FindAndModifyResult::default();
            for shard in &shards {
                if finished.contains(shard) {
                    continue;
                }
                let ctx = self.context(info, shard, opts)?;
                last = self.shard(shard)?.find_and_modify(ns, request, &ctx)?;
                finished.insert(shard.clone());
                if last.last_error_object.n > 0 {
                    break;
                }
            }
            Ok(last)
        })?;
        Ok(result.unwrap_or_default())
    }

    // ── Reads ───────────────────────────────────────────────

    pub fn find(
        &self,
        ns: &Namespace,
        selector: &Selector,
        opts: &RequestOptions,
    ) -> Result<Vec<Document>, ClusterError> {
        let docs = self.with_retries(ns, false, opts, |info| {
            let shards = match Self::target_filter(info, selector)? {
                Target::One(shard) => vec![shard],
                Target::Many(shards) => shards,
            };
            let mut out = Vec::new();
            for shard in &shards {
                let ctx = self.context(info, shard, opts)?;
                out.extend(self.shard(shard)?.find(ns, selector, &ctx)?);
            }
            Ok(out)
        })?;
        Ok(docs.unwrap_or_default())
    }

    pub fn count(
        &self,
        ns: &Namespace,
        selector: &Selector,
        opts: &RequestOptions,
    ) -> Result<u64, ClusterError> {
        Ok(self.find(ns, selector, opts)?.len() as u64)
    }

    // ── Transactions ────────────────────────────────────────

    /// Sessions with a transaction this router still tracks.
    pub fn open_transactions(&self) -> usize {
        self.txns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn take_txn(&self, session: SessionInfo) -> Option<RouterTxn> {
        let mut txns = self.txns.lock().unwrap_or_else(|e| e.into_inner());
        match txns.get(&session.lsid) {
            Some(t) if t.session == session => txns.remove(&session.lsid),
            _ => None,
        }
    }

    /// Commit the transaction of `session`: directly on a single
    /// participant, through the coordinator otherwise.
    pub fn commit_transaction(&self, session: SessionInfo) -> Result<(), ClusterError> {
        let Some(txn) = self.take_txn(session) else {
            return Ok(());
        };
        let participants: Vec<ShardId> = txn.participants.into_iter().collect();
        match participants.as_slice() {
            [] => Ok(()),
            [only] => Ok(self.shard(only)?.commit_transaction(session, None)?),
            _ => match self.coordinator.load().coordinate(session, &participants)? {
                CommitDecision::Commit { .. } => Ok(()),
                CommitDecision::Abort { reason } => Err(ClusterError::TransactionAborted {
                    lsid: session.lsid_string(),
                    txn_number: session.txn_number,
                    reason,
                }),
            },
        }
    }

    pub fn abort_transaction(&self, session: SessionInfo) -> Result<(), ClusterError> {
        let Some(txn) = self.take_txn(session) else {
            return Ok(());
        };
        for id in &txn.participants {
            self.shard(id)?.abort_transaction(session, false)?;
        }
        Ok(())
    }

    fn abort_participants(&self, session: SessionInfo) {
        if let Some(txn) = self.take_txn(session) {
            for id in &txn.participants {
                if let Ok(shard) = self.shard(id)
                    && let Err(e) = shard.abort_transaction(session, false)
                {
                    warn!(shard = %id, error = %e, "abort after failed statement failed");
                }
            }
        }
    }
}
