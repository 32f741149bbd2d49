//! Orphaned ranges: durable deletion tasks and the executor that
//! physically removes their documents off the commit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tessera_routing::{ChunkRange, CollectionUuid, KeyPattern, Namespace};
use tessera_store::{MemoryTransaction, Store, Transaction};
use tracing::{debug, info, warn};

use crate::error::ShardError;
use crate::record::{self, RANGE_DELETIONS_TABLE};
use crate::shard::Shard;
use crate::write::WriteBatch;

/// A range whose documents this shard holds but no longer owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeDeletionTask {
    /// Id of the migration that orphaned the range.
    pub id: [u8; 16],
    pub ns: Namespace,
    pub uuid: CollectionUuid,
    pub range: ChunkRange,
    pub key_pattern: KeyPattern,
    /// Set while the migration outcome is undecided; the deleter skips it.
    pub pending: bool,
    /// Unix millis after which the background deleter may process the task.
    pub ready_at_ms: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn load_tasks(txn: &MemoryTransaction<'_>) -> Result<Vec<RangeDeletionTask>, ShardError> {
    let mut out = Vec::new();
    for item in txn.scan(RANGE_DELETIONS_TABLE, ..)? {
        let (_, value) = item?;
        out.push(record::decode_meta(&value)?);
    }
    Ok(out)
}

/// Outcome of working one task.
enum Progress {
    Deleted(u64),
    Done,
}

impl Shard {
    /// Record a range about to be donated. The task stays pending until the
    /// migration commits (then it becomes ready) or aborts (then it goes).
    pub fn schedule_range_deletion(&self, task: RangeDeletionTask) -> Result<(), ShardError> {
        let _guard = self.lock_writes();
        let txn = self.store().begin(false)?;
        txn.put(RANGE_DELETIONS_TABLE, &task.id, &record::encode_meta(&task)?)?;
        txn.commit()?;
        debug!(shard = %self.id(), ns = %task.ns, range = %task.range, pending = task.pending,
            "scheduled range deletion");
        Ok(())
    }

    /// Release a pending task to the deleter once `delay` has passed.
    pub fn mark_range_deletion_ready(&self, id: &[u8; 16], delay: Duration) -> Result<bool, ShardError> {
        let _guard = self.lock_writes();
        let txn = self.store().begin(false)?;
        let Some(bytes) = txn.get(RANGE_DELETIONS_TABLE, id)? else {
            return Ok(false);
        };
        let mut task: RangeDeletionTask = record::decode_meta(&bytes)?;
        task.pending = false;
        task.ready_at_ms = now_ms() + delay.as_millis() as u64;
        txn.put(RANGE_DELETIONS_TABLE, id, &record::encode_meta(&task)?)?;
        txn.commit()?;
        info!(shard = %self.id(), ns = %task.ns, range = %task.range, "range deletion ready");
        Ok(true)
    }

    pub fn remove_range_deletion(&self, id: &[u8; 16]) -> Result<bool, ShardError> {
        let _guard = self.lock_writes();
        let txn = self.store().begin(false)?;
        let existed = txn.get(RANGE_DELETIONS_TABLE, id)?.is_some();
        txn.delete(RANGE_DELETIONS_TABLE, id)?;
        txn.commit()?;
        Ok(existed)
    }

    /// Outstanding tasks, optionally for one namespace.
    pub fn range_deletion_tasks(&self, ns: Option<&Namespace>) -> Result<Vec<RangeDeletionTask>, ShardError> {
        let txn = self.store().begin(true)?;
        Ok(load_tasks(&txn)?
            .into_iter()
            .filter(|t| ns.is_none_or(|n| &t.ns == n))
            .collect())
    }

    /// Drop every task of a collection generation, inside `txn`.
    pub(crate) fn remove_range_deletions_for(
        &self,
        txn: &MemoryTransaction<'_>,
        uuid: &CollectionUuid,
    ) -> Result<(), ShardError> {
        for task in load_tasks(txn)? {
            if &task.uuid == uuid {
                txn.delete(RANGE_DELETIONS_TABLE, &task.id)?;
            }
        }
        Ok(())
    }

    /// Work every ready task whose delay has passed (all ready tasks when
    /// `ignore_delay`). Returns the number of documents deleted.
    pub fn run_range_deletions(&self, ignore_delay: bool) -> Result<u64, ShardError> {
        let now = now_ms();
        let due: Vec<RangeDeletionTask> = self
            .range_deletion_tasks(None)?
            .into_iter()
            .filter(|t| !t.pending && (ignore_delay || t.ready_at_ms <= now))
            .collect();
        let mut deleted = 0;
        for task in &due {
            deleted += self.delete_range(task)?;
        }
        Ok(deleted)
    }

    /// Delete the orphaned documents of `ns` now, regardless of the cleanup
    /// delay. Fails while a migration that may orphan more of `ns` is
    /// still undecided.
    pub fn cleanup_orphaned(&self, ns: &Namespace) -> Result<u64, ShardError> {
        let tasks = self.range_deletion_tasks(Some(ns))?;
        let mut deleted = 0;
        for task in tasks.iter().filter(|t| !t.pending) {
            deleted += self.delete_range(task)?;
        }
        if let Some(pending) = tasks.iter().find(|t| t.pending) {
            return Err(ShardError::ConflictingOperation(format!(
                "range {} of {ns} is pending deletion behind an undecided migration",
                pending.range
            )));
        }
        info!(shard = %self.id(), ns = %ns, deleted, "cleaned up orphans");
        Ok(deleted)
    }

    /// Make sure no deletion task overlaps `range` before this shard receives
    /// it back; ready tasks are run on the spot.
    pub fn ensure_range_clean(&self, ns: &Namespace, range: &ChunkRange) -> Result<(), ShardError> {
        for task in self.range_deletion_tasks(Some(ns))? {
            if !task.range.overlaps(range) {
                continue;
            }
            if task.pending {
                return Err(ShardError::ConflictingOperation(format!(
                    "range {} of {ns} overlaps a deletion still pending on {}",
                    task.range,
                    self.id()
                )));
            }
            self.delete_range(&task)?;
        }
        Ok(())
    }

    fn delete_range(&self, task: &RangeDeletionTask) -> Result<u64, ShardError> {
        let mut deleted = 0;
        loop {
            match self.delete_range_batch(task)? {
                Progress::Deleted(n) => deleted += n,
                Progress::Done => break,
            }
        }
        self.remove_range_deletion(&task.id)?;
        debug!(shard = %self.id(), ns = %task.ns, range = %task.range, deleted, "range deletion finished");
        Ok(deleted)
    }

    fn delete_range_batch(&self, task: &RangeDeletionTask) -> Result<Progress, ShardError> {
        let _guard = self.lock_writes();
        let Some(coll) = self.collection(&task.ns)?.filter(|c| c.uuid == task.uuid) else {
            return Ok(Progress::Done);
        };
        let placement = self.current_placement(&task.ns)?;
        if let Some(table) = placement.table()
            && table.uuid() == task.uuid
            && table.owns_any(self.id(), &task.range)
        {
            warn!(shard = %self.id(), ns = %task.ns, range = %task.range,
                "refusing to delete a range this shard owns");
            return Ok(Progress::Done);
        }

        let mut batch = WriteBatch::new(self.store())?.from_migrate();
        let ids: Vec<Vec<u8>> = batch
            .txn()
            .scan(
                &coll.index_table(),
                task.range.min.encoded().to_vec()..task.range.max.encoded().to_vec(),
            )?
            .take(self.config().range_deleter_batch_size.max(1))
            .map(|item| item.map(|(_, id_key)| id_key))
            .collect::<Result<_, _>>()?;
        if ids.is_empty() {
            batch.rollback()?;
            return Ok(Progress::Done);
        }
        let mut n = 0;
        for id_key in &ids {
            if let Some(doc) = batch.get_document(&coll, id_key)? {
                batch.delete_document(&coll, &doc)?;
                n += 1;
            }
        }
        batch.commit(self.clock().tick())?;
        Ok(Progress::Deleted(n))
    }
}

// ── Background maintenance ────────────────────────────────────

/// Periodic shard housekeeping: ready range deletions, expired
/// transactions and oplog retention. Stops when dropped.
pub struct MaintenanceHandle {
    shutdown: Arc<AtomicBool>,
    notify: Arc<(Mutex<()>, Condvar)>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn start(shard: &Arc<Shard>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new((Mutex::new(()), Condvar::new()));
        let weak: Weak<Shard> = Arc::downgrade(shard);
        let flag = Arc::clone(&shutdown);
        let wake = Arc::clone(&notify);
        let interval = shard.config().maintenance_interval;
        let handle = thread::spawn(move || {
            loop {
                {
                    let (lock, cvar) = &*wake;
                    let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                    if !flag.load(Ordering::Relaxed) {
                        let _ = cvar.wait_timeout(guard, interval);
                    }
                }
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let Some(shard) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = shard.run_range_deletions(false) {
                    warn!(shard = %shard.id(), error = %e, "range deletion pass failed");
                }
                shard.expire_transactions();
                if let Err(e) = shard.trim_oplog() {
                    warn!(shard = %shard.id(), error = %e, "oplog trim failed");
                }
            }
        });
        Self {
            shutdown,
            notify,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        {
            let _guard = self.notify.0.lock().unwrap_or_else(|e| e.into_inner());
            self.notify.1.notify_one();
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
