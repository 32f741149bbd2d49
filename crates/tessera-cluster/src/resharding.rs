//! Resharding: rebuild a sharded collection under a new shard key.
//!
//! Recipients fill a temporary collection from every donor's snapshot and
//! then tail the donors' oplogs. Once the remaining delta is small, writes
//! to the namespace are blocked on every involved shard, the last changes
//! are applied and the config server switches the collection to the new
//! key, epoch and uuid in one write. Recipients then rename the temporary
//! collection into place. Every phase change is logged so a restarted
//! coordinator resumes where the previous one stopped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bson::doc;
use serde::{Deserialize, Serialize};
use tessera_log::SharedLog;
use tessera_routing::{
    ChunkRange, CollectionMetadata, CollectionUuid, KeyPattern, Namespace, ShardId, ShardKey,
};
use tessera_shard::{
    FailPoints, MigratedOp, MigrationRole, MigrationSession, OpTime, SectionScope, Shard,
    ops_from_oplog,
};
use tracing::{debug, info, warn};

use crate::config_server::ConfigServer;
use crate::error::ClusterError;
use crate::hex;
use crate::registry::ShardRegistry;

pub const CRASH_AFTER_CLONING: &str = "reshardingCrashAfterCloning";
pub const FAIL_BEFORE_COMMIT: &str = "reshardingFailBeforeCommit";

const PREPARED_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReshardingPhase {
    Initializing,
    Cloning,
    Applying,
    CriticalSection,
    Committing,
    Done,
    Aborting,
    Aborted,
}

impl ReshardingPhase {
    fn can_transition(self, to: ReshardingPhase) -> bool {
        use ReshardingPhase::*;
        matches!(
            (self, to),
            (Initializing, Cloning)
                | (Cloning, Applying)
                | (Applying, CriticalSection)
                | (CriticalSection, Committing)
                | (Committing, Done)
                | (Initializing | Cloning | Applying | CriticalSection, Aborting)
                | (Aborting, Aborted)
        )
    }

    /// Past the point of no return.
    pub fn is_committed(self) -> bool {
        matches!(self, ReshardingPhase::Committing | ReshardingPhase::Done)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, ReshardingPhase::Done | ReshardingPhase::Aborted)
    }
}

impl fmt::Display for ReshardingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Durable state of one resharding operation; the log holds one copy per
/// phase change and the last one wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReshardingJob {
    pub id: [u8; 16],
    pub ns: Namespace,
    pub source_uuid: CollectionUuid,
    pub temp_ns: Namespace,
    pub temp_uuid: CollectionUuid,
    pub key_pattern: KeyPattern,
    pub assignment: Vec<(ChunkRange, ShardId)>,
    pub donors: Vec<ShardId>,
    pub recipients: Vec<ShardId>,
    pub phase: ReshardingPhase,
    /// Oplog position each donor has been applied through.
    pub positions: BTreeMap<ShardId, OpTime>,
    pub abort_reason: Option<String>,
}

impl ReshardingJob {
    fn reason(&self) -> String {
        format!("reshard {}", hex(&self.id))
    }

    fn owner_of(&self, key: &ShardKey) -> Result<&ShardId, ClusterError> {
        self.assignment
            .iter()
            .find(|(range, _)| range.contains(key))
            .map(|(_, shard)| shard)
            .ok_or_else(|| ClusterError::Internal(format!("no new chunk of {} holds {key}", self.ns)))
    }

    fn involved(&self) -> BTreeSet<ShardId> {
        self.donors.iter().chain(&self.recipients).cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReshardingSettings {
    pub catchup_threshold: usize,
    pub max_catchup_rounds: usize,
    pub critical_section_timeout: Duration,
}

pub struct ReshardingCoordinator {
    config: Arc<ConfigServer>,
    registry: Arc<ShardRegistry>,
    failpoints: Arc<FailPoints>,
    log: SharedLog<ReshardingJob>,
    settings: ReshardingSettings,
    running: Mutex<HashMap<Namespace, Arc<AtomicBool>>>,
}

/// Clears the running flag when a job's driver returns.
struct RunningGuard<'a> {
    coordinator: &'a ReshardingCoordinator,
    ns: Namespace,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.ns);
    }
}

impl ReshardingCoordinator {
    pub fn new(
        config: Arc<ConfigServer>,
        registry: Arc<ShardRegistry>,
        failpoints: Arc<FailPoints>,
        log: SharedLog<ReshardingJob>,
        settings: ReshardingSettings,
    ) -> Self {
        Self {
            config,
            registry,
            failpoints,
            log,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Latest state of every job in the log.
    fn jobs(&self) -> Result<Vec<ReshardingJob>, ClusterError> {
        let mut latest: BTreeMap<[u8; 16], ReshardingJob> = BTreeMap::new();
        for job in self.log.replay()? {
            latest.insert(job.id, job);
        }
        Ok(latest.into_values().collect())
    }

    fn unfinished(&self, ns: &Namespace) -> Result<Option<ReshardingJob>, ClusterError> {
        Ok(self
            .jobs()?
            .into_iter()
            .find(|j| &j.ns == ns && !j.phase.is_finished()))
    }

    /// Phase of the unfinished resharding of `ns`, if one exists.
    pub fn phase(&self, ns: &Namespace) -> Result<Option<ReshardingPhase>, ClusterError> {
        Ok(self.unfinished(ns)?.map(|j| j.phase))
    }

    fn claim(&self, ns: &Namespace) -> Result<(Arc<AtomicBool>, RunningGuard<'_>), ClusterError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.contains_key(ns) {
            return Err(ClusterError::ConflictingOperation(format!(
                "{ns} is already being resharded"
            )));
        }
        let flag = Arc::new(AtomicBool::new(false));
        running.insert(ns.clone(), flag.clone());
        Ok((
            flag,
            RunningGuard {
                coordinator: self,
                ns: ns.clone(),
            },
        ))
    }

    /// Reshard `ns` onto `key_pattern`, with new chunk boundaries at
    /// `split_points` spread round-robin over all shards. Blocks until the
    /// operation commits or aborts.
    pub fn reshard_collection(
        &self,
        ns: &Namespace,
        key_pattern: KeyPattern,
        split_points: &[ShardKey],
    ) -> Result<CollectionMetadata, ClusterError> {
        let record = self
            .config
            .collection(ns)?
            .ok_or_else(|| ClusterError::NamespaceNotFound(ns.to_string()))?;
        let meta = record
            .sharding
            .clone()
            .ok_or_else(|| ClusterError::NotSharded(ns.to_string()))?;
        if meta.key_pattern == key_pattern {
            return Ok(meta);
        }
        if self.unfinished(ns)?.is_some() {
            return Err(ClusterError::ConflictingOperation(format!(
                "an earlier resharding of {ns} has not finished"
            )));
        }

        let mut bounds = Vec::with_capacity(split_points.len() + 2);
        bounds.push(key_pattern.min_key());
        for point in split_points {
            if point.arity() != key_pattern.arity() {
                return Err(ClusterError::BadValue(format!(
                    "split point {point} does not match shard key {key_pattern}"
                )));
            }
            bounds.push(point.clone());
        }
        bounds.push(key_pattern.max_key());
        let assignment = assign_round_robin(&bounds, self.config.shards())?;
        let donors: BTreeSet<ShardId> = self.config.chunks(ns)?.into_iter().map(|c| c.shard).collect();
        let recipients: BTreeSet<ShardId> = assignment.iter().map(|(_, s)| s.clone()).collect();

        let (flag, _guard) = self.claim(ns)?;
        let job = ReshardingJob {
            id: CollectionUuid::new().bytes(),
            ns: ns.clone(),
            source_uuid: record.uuid,
            temp_ns: ns.resharding_temp(&record.uuid),
            temp_uuid: CollectionUuid::new(),
            key_pattern,
            assignment,
            donors: donors.into_iter().collect(),
            recipients: recipients.into_iter().collect(),
            phase: ReshardingPhase::Initializing,
            positions: BTreeMap::new(),
            abort_reason: None,
        };
        self.log.append(&job)?;
        info!(ns = %ns, key = %job.key_pattern, donors = job.donors.len(),
            recipients = job.recipients.len(), id = %hex(&job.id), "starting resharding");
        self.run(job, &flag)
    }

    /// Ask a running resharding of `ns` to stop, or abort one a previous
    /// coordinator left behind.
    pub fn abort_reshard_collection(&self, ns: &Namespace) -> Result<(), ClusterError> {
        let job = self.unfinished(ns)?;
        if let Some(job) = &job
            && job.phase.is_committed()
        {
            return Err(ClusterError::IllegalOperation(format!(
                "resharding of {ns} has already committed"
            )));
        }
        let flag = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(ns)
            .cloned();
        match (flag, job) {
            (Some(flag), _) => {
                info!(ns = %ns, "abort requested for running resharding");
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
            (None, Some(job)) => {
                let (_flag, _guard) = self.claim(ns)?;
                self.abort(job, "aborted by user".into())
            }
            (None, None) => Err(ClusterError::NoSuchReshardCollection(ns.to_string())),
        }
    }

    /// Resume every job the log shows unfinished. Returns each job's
    /// namespace and the phase it ended in.
    pub fn recover(&self) -> Result<Vec<(Namespace, ReshardingPhase)>, ClusterError> {
        let mut out = Vec::new();
        for job in self.jobs()?.into_iter().filter(|j| !j.phase.is_finished()) {
            let ns = job.ns.clone();
            info!(ns = %ns, phase = %job.phase, "resuming resharding after restart");
            let (flag, _guard) = self.claim(&ns)?;
            let phase = if job.phase == ReshardingPhase::Aborting {
                let reason = job.abort_reason.clone().unwrap_or_default();
                self.abort(job, reason)?;
                ReshardingPhase::Aborted
            } else {
                match self.run(job, &flag) {
                    Ok(_) => ReshardingPhase::Done,
                    Err(ClusterError::ReshardingAborted { .. }) => ReshardingPhase::Aborted,
                    Err(e) => return Err(e),
                }
            };
            out.push((ns, phase));
        }
        self.compact()?;
        Ok(out)
    }

    fn advance(&self, job: &mut ReshardingJob, to: ReshardingPhase) -> Result<(), ClusterError> {
        if !job.phase.can_transition(to) {
            return Err(ClusterError::IllegalStateTransition {
                machine: "resharding",
                from: job.phase.to_string(),
                to: to.to_string(),
            });
        }
        job.phase = to;
        self.log.append(job)?;
        debug!(ns = %job.ns, phase = %to, "resharding phase");
        Ok(())
    }

    fn run(&self, mut job: ReshardingJob, abort: &AtomicBool) -> Result<CollectionMetadata, ClusterError> {
        loop {
            if !job.phase.is_committed() && abort.load(Ordering::SeqCst) {
                let reason = "aborted by user".to_string();
                let ns = job.ns.clone();
                self.abort(job, reason.clone())?;
                return Err(ClusterError::ReshardingAborted { ns, reason });
            }
            match self.step(&mut job) {
                Ok(Some(meta)) => return Ok(meta),
                Ok(None) => {}
                Err(ClusterError::FailPoint(name)) if name == CRASH_AFTER_CLONING => {
                    return Err(ClusterError::FailPoint(name));
                }
                Err(e) if !job.phase.is_committed() => {
                    warn!(ns = %job.ns, phase = %job.phase, error = %e, "resharding failed, aborting");
                    let ns = job.ns.clone();
                    let reason = e.to_string();
                    self.abort(job, reason.clone())?;
                    return Err(ClusterError::ReshardingAborted { ns, reason });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Perform the current phase and move to the next one.
    fn step(&self, job: &mut ReshardingJob) -> Result<Option<CollectionMetadata>, ClusterError> {
        match job.phase {
            ReshardingPhase::Initializing => {
                self.config.set_allow_migrations(&job.ns, false)?;
                for id in &job.donors {
                    self.registry.get(id)?.register_migration(MigrationSession {
                        id: job.id,
                        ns: job.ns.clone(),
                        range: None,
                        role: MigrationRole::Donor,
                    })?;
                }
                for id in &job.recipients {
                    self.registry.get(id)?.register_migration(MigrationSession {
                        id: job.id,
                        ns: job.temp_ns.clone(),
                        range: None,
                        role: MigrationRole::Recipient,
                    })?;
                }
                self.advance(job, ReshardingPhase::Cloning)?;
            }
            ReshardingPhase::Cloning => {
                self.clone_documents(job)?;
                self.advance(job, ReshardingPhase::Applying)?;
                if self.failpoints.should_fail(CRASH_AFTER_CLONING) {
                    return Err(ClusterError::FailPoint(CRASH_AFTER_CLONING.into()));
                }
            }
            ReshardingPhase::Applying => {
                for round in 0..self.settings.max_catchup_rounds {
                    let applied = self.catch_up(job)?;
                    debug!(ns = %job.ns, round, applied, "resharding catch-up round");
                    if applied < self.settings.catchup_threshold {
                        break;
                    }
                }
                self.advance(job, ReshardingPhase::CriticalSection)?;
            }
            ReshardingPhase::CriticalSection => {
                let reason = job.reason();
                for id in job.involved() {
                    self.registry
                        .get(&id)?
                        .critical_sections()
                        .enter(&job.ns, SectionScope::Namespace, &reason);
                }
                self.drain_prepared(job)?;
                self.catch_up(job)?;
                for id in &job.donors {
                    let sessions = self.registry.get(id)?.export_sessions(&job.ns, None)?;
                    for recipient in &job.recipients {
                        self.registry.get(recipient)?.import_sessions(&sessions)?;
                    }
                }
                if self.failpoints.should_fail(FAIL_BEFORE_COMMIT) {
                    return Err(ClusterError::FailPoint(FAIL_BEFORE_COMMIT.into()));
                }
                self.advance(job, ReshardingPhase::Committing)?;
            }
            ReshardingPhase::Committing => {
                let meta = self.commit(job)?;
                self.advance(job, ReshardingPhase::Done)?;
                self.compact()?;
                info!(ns = %job.ns, key = %job.key_pattern, epoch = %meta.epoch, "resharding done");
                return Ok(Some(meta));
            }
            ReshardingPhase::Done => {
                let record = self
                    .config
                    .collection(&job.ns)?
                    .ok_or_else(|| ClusterError::NamespaceNotFound(job.ns.to_string()))?;
                return record
                    .sharding
                    .map(Some)
                    .ok_or_else(|| ClusterError::NotSharded(job.ns.to_string()));
            }
            ReshardingPhase::Aborting | ReshardingPhase::Aborted => {
                return Err(ClusterError::ReshardingAborted {
                    ns: job.ns.clone(),
                    reason: job.abort_reason.clone().unwrap_or_default(),
                });
            }
        }
        Ok(None)
    }

    /// Fresh copy of every donor's documents into the recipients' temporary
    /// collections.
    fn clone_documents(&self, job: &mut ReshardingJob) -> Result<(), ClusterError> {
        let recipients = self.shards(&job.recipients)?;
        for shard in recipients.values() {
            shard.drop_collection(&job.temp_ns, true)?;
            shard.ensure_collection(&job.temp_ns, job.temp_uuid, Some(job.key_pattern.clone()))?;
        }
        job.positions.clear();
        for id in &job.donors {
            let donor = self.registry.get(id)?;
            let (docs, position) = donor.snapshot_range(&job.ns, None)?;
            let mut routed: BTreeMap<ShardId, Vec<MigratedOp>> = BTreeMap::new();
            for doc in docs {
                let key = job.key_pattern.extract(&doc)?;
                routed
                    .entry(job.owner_of(&key)?.clone())
                    .or_default()
                    .push(MigratedOp::Upsert(doc));
            }
            for (owner, ops) in &routed {
                if let Some(shard) = recipients.get(owner) {
                    shard.apply_migrated(&job.temp_ns, ops)?;
                }
            }
            debug!(ns = %job.ns, donor = %id, docs = routed.values().map(Vec::len).sum::<usize>(),
                "cloned donor");
            job.positions.insert(id.clone(), position);
        }
        Ok(())
    }

    /// Apply each donor's changes since its recorded position. A changed
    /// document goes to its new owner and is removed from every other
    /// recipient, since its new-key fields may have moved it.
    fn catch_up(&self, job: &mut ReshardingJob) -> Result<usize, ClusterError> {
        let recipients = self.shards(&job.recipients)?;
        let mut total = 0;
        for id in job.donors.clone() {
            let donor = self.registry.get(&id)?;
            let upto = donor.watermark();
            let after = job.positions.get(&id).copied().unwrap_or(OpTime::ZERO);
            let entries = donor.read_oplog(after, upto, Some(&job.ns))?;
            let ops = ops_from_oplog(&entries, &job.ns)?;
            total += ops.len();
            let mut routed: BTreeMap<&ShardId, Vec<MigratedOp>> = BTreeMap::new();
            for op in ops {
                match &op {
                    MigratedOp::Upsert(doc) => {
                        let owner = job.owner_of(&job.key_pattern.extract(doc)?)?;
                        let id_value = doc.get("_id").cloned().ok_or_else(|| {
                            ClusterError::Internal(format!("document of {} without _id", job.ns))
                        })?;
                        for recipient in recipients.keys().filter(|r| *r != owner) {
                            routed.entry(recipient).or_default().push(MigratedOp::Delete {
                                id: id_value.clone(),
                                key: doc! { "_id": id_value.clone() },
                            });
                        }
                        routed.entry(owner).or_default().push(op.clone());
                    }
                    MigratedOp::Delete { .. } => {
                        for recipient in recipients.keys() {
                            routed.entry(recipient).or_default().push(op.clone());
                        }
                    }
                }
            }
            for (owner, ops) in routed {
                if let Some(shard) = recipients.get(owner) {
                    shard.apply_migrated(&job.temp_ns, &ops)?;
                }
            }
            job.positions.insert(id, OpTime::end_of(upto));
        }
        Ok(total)
    }

    fn drain_prepared(&self, job: &ReshardingJob) -> Result<(), ClusterError> {
        let deadline = Instant::now() + self.settings.critical_section_timeout;
        for id in &job.donors {
            let donor = self.registry.get(id)?;
            while donor.has_prepared_transactions(&job.ns) {
                if Instant::now() >= deadline {
                    return Err(ClusterError::ConflictingOperation(format!(
                        "prepared transactions on {id} kept {} busy",
                        job.ns
                    )));
                }
                thread::sleep(PREPARED_POLL);
            }
        }
        Ok(())
    }

    fn commit(&self, job: &ReshardingJob) -> Result<CollectionMetadata, ClusterError> {
        let meta = self.config.commit_resharding(
            &job.ns,
            job.temp_uuid,
            job.key_pattern.clone(),
            &job.assignment,
        )?;
        for shard in self.registry.all() {
            if job.recipients.contains(shard.id()) {
                let installed = shard.collection(&job.ns)?.is_some_and(|c| c.uuid == job.temp_uuid);
                if !installed {
                    shard.rename_collection(&job.temp_ns, &job.ns)?;
                }
            } else {
                shard.drop_collection(&job.ns, true)?;
            }
        }
        self.finish(job)?;
        Ok(meta)
    }

    /// Release everything the job holds on the shards.
    fn finish(&self, job: &ReshardingJob) -> Result<(), ClusterError> {
        let reason = job.reason();
        for shard in self.registry.all() {
            shard.refresh_filtering(&job.ns)?;
            shard.critical_sections().exit_reason(&job.ns, &reason);
            shard.unregister_migration(&job.id);
        }
        Ok(())
    }

    fn abort(&self, mut job: ReshardingJob, reason: String) -> Result<(), ClusterError> {
        if job.phase != ReshardingPhase::Aborting {
            job.abort_reason = Some(reason.clone());
            self.advance(&mut job, ReshardingPhase::Aborting)?;
        }
        for id in &job.recipients {
            self.registry.get(id)?.drop_collection(&job.temp_ns, true)?;
        }
        self.finish(&job)?;
        let still_source = self
            .config
            .collection(&job.ns)?
            .is_some_and(|r| r.uuid == job.source_uuid && r.sharding.is_some());
        if still_source {
            self.config.set_allow_migrations(&job.ns, true)?;
        }
        self.advance(&mut job, ReshardingPhase::Aborted)?;
        self.compact()?;
        info!(ns = %job.ns, reason = %reason, "resharding aborted");
        Ok(())
    }

    fn compact(&self) -> Result<(), ClusterError> {
        let jobs = self.jobs()?;
        if jobs.iter().all(|j| !j.phase.is_finished()) {
            return Ok(());
        }
        let live: Vec<ReshardingJob> = jobs.into_iter().filter(|j| !j.phase.is_finished()).collect();
        self.log.rewrite(&live)?;
        Ok(())
    }

    fn shards(&self, ids: &[ShardId]) -> Result<BTreeMap<ShardId, Arc<Shard>>, ClusterError> {
        ids.iter()
            .map(|id| Ok((id.clone(), self.registry.get(id)?)))
            .collect()
    }
}

/// Chunks between consecutive `bounds`, dealt to `shards` in turn.
fn assign_round_robin(
    bounds: &[ShardKey],
    shards: &[ShardId],
) -> Result<Vec<(ChunkRange, ShardId)>, ClusterError> {
    if shards.is_empty() {
        return Err(ClusterError::IllegalOperation(
            "resharding needs at least one recipient shard".into(),
        ));
    }
    bounds
        .windows(2)
        .zip(shards.iter().cycle())
        .map(|(w, shard)| Ok((ChunkRange::new(w[0].clone(), w[1].clone())?, shard.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_dealt_across_shards_in_turn() {
        let pattern = KeyPattern::new(["region"]).unwrap();
        let split = |s: &str| ShardKey::from_bson(&[bson::Bson::String(s.into())]).unwrap();
        let bounds = [pattern.min_key(), split("f"), split("m"), pattern.max_key()];
        let shards = [ShardId::from("shard0"), ShardId::from("shard1")];

        let assignment = assign_round_robin(&bounds, &shards).unwrap();
        let owners: Vec<&str> = assignment.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(owners, vec!["shard0", "shard1", "shard0"]);

        let err = assign_round_robin(&bounds, &[]).unwrap_err();
        assert!(matches!(err, ClusterError::IllegalOperation(_)));
    }

    #[test]
    fn phases_only_move_forward_or_abort_before_commit() {
        use ReshardingPhase::*;
        assert!(Initializing.can_transition(Cloning));
        assert!(CriticalSection.can_transition(Committing));
        assert!(Applying.can_transition(Aborting));
        assert!(!Committing.can_transition(Aborting));
        assert!(!Cloning.can_transition(CriticalSection));
        assert!(!Done.can_transition(Cloning));
    }
}
