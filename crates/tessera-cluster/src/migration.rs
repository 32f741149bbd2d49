//! Range migration: clone a chunk from its donor to a recipient, catch up
//! on concurrent writes, then switch ownership at a single commit point.
//!
//! Nothing is visible to routers before `commit_migration` lands on the
//! config server. A failure before that point undoes the recipient's copy
//! and the donor's pending deletion; after it the migration only moves
//! forward.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tessera_log::{LogError, SharedLog};
use tessera_routing::{
    ChunkRange, ChunkVersion, CollectionUuid, Epoch, KeyPattern, Namespace, ShardId,
};
use tessera_shard::{
    FailPoints, MigratedOp, MigrationRole, MigrationSession, OpTime, RangeDeletionTask,
    SectionScope, Shard, ShardError, ops_from_oplog,
};
use tracing::{debug, info, warn};

use crate::config_server::ConfigServer;
use crate::error::ClusterError;
use crate::hex;
use crate::registry::ShardRegistry;

pub const FAIL_BEFORE_COMMIT: &str = "migrationFailBeforeCommit";
pub const CRASH_AFTER_COMMIT: &str = "migrationCrashAfterCommit";

const PREPARED_POLL: Duration = Duration::from_millis(5);

/// Tunables for the migration engine.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    pub catchup_threshold: usize,
    pub max_catchup_rounds: usize,
    pub orphan_cleanup_delay: Duration,
    pub critical_section_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDescriptor {
    pub id: [u8; 16],
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub epoch: Epoch,
    pub key_pattern: KeyPattern,
    pub range: ChunkRange,
    pub from: ShardId,
    pub to: ShardId,
}

impl MigrationDescriptor {
    fn reason(&self) -> String {
        format!("moveRange {}", hex(&self.id))
    }

    fn session(&self, role: MigrationRole) -> MigrationSession {
        MigrationSession {
            id: self.id,
            ns: self.ns.clone(),
            range: Some(self.range.clone()),
            role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MigrationRecord {
    Started(MigrationDescriptor),
    Committed { id: [u8; 16] },
    Aborted { id: [u8; 16] },
    Finished { id: [u8; 16] },
}

impl MigrationRecord {
    fn id(&self) -> [u8; 16] {
        match self {
            MigrationRecord::Started(d) => d.id,
            MigrationRecord::Committed { id }
            | MigrationRecord::Aborted { id }
            | MigrationRecord::Finished { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveRangeOutcome {
    pub id: [u8; 16],
    pub from: ShardId,
    pub to: ShardId,
    pub version: ChunkVersion,
    pub cloned: usize,
    pub caught_up: usize,
}

/// Where a failed migration stopped.
enum Failure {
    BeforeCommit(ClusterError),
    AfterCommit(ClusterError),
}

impl From<ClusterError> for Failure {
    fn from(e: ClusterError) -> Self {
        Failure::BeforeCommit(e)
    }
}

impl From<ShardError> for Failure {
    fn from(e: ShardError) -> Self {
        Failure::BeforeCommit(e.into())
    }
}

impl From<LogError> for Failure {
    fn from(e: LogError) -> Self {
        Failure::BeforeCommit(e.into())
    }
}

pub struct MigrationManager {
    config: Arc<ConfigServer>,
    registry: Arc<ShardRegistry>,
    failpoints: Arc<FailPoints>,
    log: SharedLog<MigrationRecord>,
    settings: MigrationSettings,
}

impl MigrationManager {
    pub fn new(
        config: Arc<ConfigServer>,
        registry: Arc<ShardRegistry>,
        failpoints: Arc<FailPoints>,
        log: SharedLog<MigrationRecord>,
        settings: MigrationSettings,
    ) -> Self {
        Self {
            config,
            registry,
            failpoints,
            log,
            settings,
        }
    }

    /// Move the documents of `range` to `to`. The range must lie inside one
    /// chunk; it is split out of that chunk first when smaller.
    pub fn move_range(
        &self,
        ns: &Namespace,
        range: &ChunkRange,
        to: &ShardId,
    ) -> Result<MoveRangeOutcome, ClusterError> {
        self.registry.get(to)?;
        let record = self
            .config
            .collection(ns)?
            .ok_or_else(|| ClusterError::NamespaceNotFound(ns.to_string()))?;
        let meta = record
            .sharding
            .ok_or_else(|| ClusterError::NotSharded(ns.to_string()))?;
        if !meta.allow_migrations {
            return Err(ClusterError::ConflictingOperation(format!(
                "migrations of {ns} are disabled"
            )));
        }

        let chunks = self.config.chunks(ns)?;
        let chunk = chunks
            .iter()
            .find(|c| c.range.covers(range))
            .ok_or_else(|| ClusterError::BadValue(format!("{range} does not lie inside one chunk of {ns}")))?
            .clone();
        if chunk.range.min != range.min {
            self.config.split_chunk(ns, &range.min)?;
        }
        if chunk.range.max != range.max {
            self.config.split_chunk(ns, &range.max)?;
        }
        let from = chunk.shard.clone();
        if &from == to {
            return Ok(MoveRangeOutcome {
                id: [0; 16],
                from,
                to: to.clone(),
                version: chunk.version,
                cloned: 0,
                caught_up: 0,
            });
        }

        let desc = MigrationDescriptor {
            id: CollectionUuid::new().bytes(),
            ns: ns.clone(),
            uuid: meta.uuid,
            epoch: meta.epoch,
            key_pattern: meta.key_pattern.clone(),
            range: range.clone(),
            from,
            to: to.clone(),
        };
        self.log.append(&MigrationRecord::Started(desc.clone()))?;
        info!(ns = %ns, range = %range, from = %desc.from, to = %to, id = %hex(&desc.id),
            "starting migration");

        match self.run(&desc) {
            Ok(outcome) => Ok(outcome),
            Err(Failure::BeforeCommit(e)) => {
                warn!(ns = %ns, range = %range, error = %e, "migration failed before commit, aborting");
                if let Err(cleanup) = self.abort(&desc) {
                    warn!(ns = %ns, error = %cleanup, "migration abort cleanup failed");
                }
                Err(e)
            }
            Err(Failure::AfterCommit(e)) => Err(e),
        }
    }

    fn run(&self, desc: &MigrationDescriptor) -> Result<MoveRangeOutcome, Failure> {
        let donor = self.registry.get(&desc.from)?;
        let recipient = self.registry.get(&desc.to)?;

        donor.register_migration(desc.session(MigrationRole::Donor))?;
        recipient.register_migration(desc.session(MigrationRole::Recipient))?;
        recipient.ensure_range_clean(&desc.ns, &desc.range)?;
        donor.schedule_range_deletion(RangeDeletionTask {
            id: desc.id,
            ns: desc.ns.clone(),
            uuid: desc.uuid,
            range: desc.range.clone(),
            key_pattern: desc.key_pattern.clone(),
            pending: true,
            ready_at_ms: 0,
        })?;
        recipient.ensure_collection(&desc.ns, desc.uuid, Some(desc.key_pattern.clone()))?;

        // Clone.
        let (docs, mut position) = donor.snapshot_range(&desc.ns, Some(&desc.range))?;
        let cloned = docs.len();
        let ops: Vec<MigratedOp> = docs.into_iter().map(MigratedOp::Upsert).collect();
        recipient.apply_migrated(&desc.ns, &ops)?;
        debug!(ns = %desc.ns, cloned, "cloned range");

        // Catch up until the remaining delta is small.
        let mut caught_up = 0;
        for round in 0..self.settings.max_catchup_rounds {
            let applied = self.catch_up(desc, &donor, &recipient, &mut position)?;
            caught_up += applied;
            debug!(ns = %desc.ns, round, applied, "migration catch-up round");
            if applied < self.settings.catchup_threshold {
                break;
            }
        }
        recipient.import_sessions(
            &donor.export_sessions(&desc.ns, Some((&desc.key_pattern, &desc.range)))?,
        )?;

        if self.failpoints.should_fail(FAIL_BEFORE_COMMIT) {
            return Err(Failure::BeforeCommit(ClusterError::FailPoint(FAIL_BEFORE_COMMIT.into())));
        }

        // Commit point.
        let section = donor.critical_sections().enter(
            &desc.ns,
            SectionScope::Range(desc.range.clone()),
            &desc.reason(),
        );
        let committed = self.commit(desc, &donor, &recipient, &mut position);
        let (version, final_ops) = match committed {
            Ok(v) => v,
            Err(e) => {
                donor.critical_sections().exit(&desc.ns, section);
                return Err(Failure::BeforeCommit(e));
            }
        };
        caught_up += final_ops;

        self.log
            .append(&MigrationRecord::Committed { id: desc.id })
            .map_err(|e| Failure::AfterCommit(e.into()))?;
        if self.failpoints.should_fail(CRASH_AFTER_COMMIT) {
            return Err(Failure::AfterCommit(ClusterError::FailPoint(CRASH_AFTER_COMMIT.into())));
        }
        self.finish(desc, &donor, &recipient)
            .map_err(Failure::AfterCommit)?;
        info!(ns = %desc.ns, range = %desc.range, to = %desc.to, %version, cloned, caught_up,
            "migration committed");
        Ok(MoveRangeOutcome {
            id: desc.id,
            from: desc.from.clone(),
            to: desc.to.clone(),
            version,
            cloned,
            caught_up,
        })
    }

    /// Replay the donor's changes to the range after `position`.
    fn catch_up(
        &self,
        desc: &MigrationDescriptor,
        donor: &Shard,
        recipient: &Shard,
        position: &mut OpTime,
    ) -> Result<usize, ClusterError> {
        let upto = donor.watermark();
        let entries = donor.read_oplog(*position, upto, Some(&desc.ns))?;
        let ops: Vec<MigratedOp> = ops_from_oplog(&entries, &desc.ns)?
            .into_iter()
            .filter(|op| op.within(&desc.key_pattern, &desc.range))
            .collect();
        recipient.apply_migrated(&desc.ns, &ops)?;
        *position = OpTime::end_of(upto);
        Ok(ops.len())
    }

    /// Inside the critical section: drain prepared transactions, move the
    /// last changes and sessions, then switch ownership.
    fn commit(
        &self,
        desc: &MigrationDescriptor,
        donor: &Shard,
        recipient: &Shard,
        position: &mut OpTime,
    ) -> Result<(ChunkVersion, usize), ClusterError> {
        let deadline = Instant::now() + self.settings.critical_section_timeout;
        while donor.has_prepared_transactions(&desc.ns) {
            if Instant::now() >= deadline {
                return Err(ClusterError::ConflictingOperation(format!(
                    "prepared transactions on {} kept {} busy",
                    desc.from, desc.ns
                )));
            }
            thread::sleep(PREPARED_POLL);
        }
        let applied = self.catch_up(desc, donor, recipient, position)?;
        recipient.import_sessions(
            &donor.export_sessions(&desc.ns, Some((&desc.key_pattern, &desc.range)))?,
        )?;
        let version =
            self.config
                .commit_migration(&desc.ns, &desc.range, &desc.from, &desc.to, desc.epoch)?;
        Ok((version, applied))
    }

    /// Post-commit work: publish the new routing to both shards, lift the
    /// section and release the donor's copy to the range deleter.
    fn finish(&self, desc: &MigrationDescriptor, donor: &Shard, recipient: &Shard) -> Result<(), ClusterError> {
        donor.refresh_filtering(&desc.ns)?;
        recipient.refresh_filtering(&desc.ns)?;
        donor.critical_sections().exit_reason(&desc.ns, &desc.reason());
        donor.mark_range_deletion_ready(&desc.id, self.settings.orphan_cleanup_delay)?;
        donor.unregister_migration(&desc.id);
        recipient.unregister_migration(&desc.id);
        self.log.append(&MigrationRecord::Finished { id: desc.id })?;
        self.compact()?;
        Ok(())
    }

    fn abort(&self, desc: &MigrationDescriptor) -> Result<(), ClusterError> {
        let donor = self.registry.get(&desc.from)?;
        let recipient = self.registry.get(&desc.to)?;
        donor.critical_sections().exit_reason(&desc.ns, &desc.reason());
        donor.remove_range_deletion(&desc.id)?;
        // The recipient's partial copy is an orphan of its own.
        if recipient.collection(&desc.ns)?.is_some_and(|c| c.uuid == desc.uuid) {
            recipient.schedule_range_deletion(RangeDeletionTask {
                id: desc.id,
                ns: desc.ns.clone(),
                uuid: desc.uuid,
                range: desc.range.clone(),
                key_pattern: desc.key_pattern.clone(),
                pending: false,
                ready_at_ms: 0,
            })?;
            recipient.ensure_range_clean(&desc.ns, &desc.range)?;
        }
        donor.unregister_migration(&desc.id);
        recipient.unregister_migration(&desc.id);
        self.log.append(&MigrationRecord::Aborted { id: desc.id })?;
        self.compact()?;
        info!(ns = %desc.ns, range = %desc.range, id = %hex(&desc.id), "migration aborted");
        Ok(())
    }

    fn compact(&self) -> Result<(), ClusterError> {
        let records = self.log.replay()?;
        let closed: Vec<[u8; 16]> = records
            .iter()
            .filter_map(|r| match r {
                MigrationRecord::Aborted { id } | MigrationRecord::Finished { id } => Some(*id),
                _ => None,
            })
            .collect();
        if closed.is_empty() {
            return Ok(());
        }
        let live: Vec<MigrationRecord> = records
            .into_iter()
            .filter(|r| !closed.contains(&r.id()))
            .collect();
        self.log.rewrite(&live)?;
        Ok(())
    }

    /// Settle migrations a previous manager left unfinished: those whose
    /// commit reached the config server are finished, the rest aborted.
    /// Returns how many were settled.
    pub fn recover(&self) -> Result<usize, ClusterError> {
        let records = self.log.replay()?;
        let mut settled = 0;
        for record in &records {
            let MigrationRecord::Started(desc) = record else {
                continue;
            };
            let closed = records.iter().any(|r| {
                matches!(r, MigrationRecord::Aborted { id } | MigrationRecord::Finished { id } if *id == desc.id)
            });
            if closed {
                continue;
            }
            let committed = records
                .iter()
                .any(|r| matches!(r, MigrationRecord::Committed { id } if *id == desc.id))
                || self
                    .config
                    .chunks(&desc.ns)?
                    .iter()
                    .any(|c| c.range == desc.range && c.shard == desc.to && c.version.epoch == desc.epoch);
            if committed {
                info!(ns = %desc.ns, range = %desc.range, "finishing committed migration after restart");
                let donor = self.registry.get(&desc.from)?;
                let recipient = self.registry.get(&desc.to)?;
                self.finish(desc, &donor, &recipient)?;
            } else {
                info!(ns = %desc.ns, range = %desc.range, "aborting unfinished migration after restart");
                self.abort(desc)?;
            }
            settled += 1;
        }
        self.compact()?;
        Ok(settled)
    }
}
