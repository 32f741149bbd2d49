use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tessera_routing::{RoutingSource, ShardId};
use tessera_shard::{FailPoints, LogicalClock, MaintenanceHandle, Shard, ShardConfig};
use tracing::info;

use crate::error::ClusterError;

/// Every shard of the cluster by id.
pub struct ShardRegistry {
    shards: BTreeMap<ShardId, Arc<Shard>>,
    maintenance: Mutex<Vec<MaintenanceHandle>>,
}

impl ShardRegistry {
    pub fn start(
        ids: &[ShardId],
        config: &ShardConfig,
        clock: &Arc<LogicalClock>,
        source: Arc<dyn RoutingSource>,
        failpoints: &Arc<FailPoints>,
    ) -> Result<Self, ClusterError> {
        if ids.is_empty() {
            return Err(ClusterError::BadValue("a cluster needs at least one shard".into()));
        }
        let mut shards = BTreeMap::new();
        for id in ids {
            let shard = Shard::new(
                id.clone(),
                config.clone(),
                clock.clone(),
                source.clone(),
                failpoints.clone(),
            )?;
            shards.insert(id.clone(), Arc::new(shard));
        }
        info!(shards = shards.len(), "shard registry started");
        Ok(Self {
            shards,
            maintenance: Mutex::new(Vec::new()),
        })
    }

    pub fn get(&self, id: &ShardId) -> Result<Arc<Shard>, ClusterError> {
        self.shards
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::ShardNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<ShardId> {
        self.shards.keys().cloned().collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.values()
    }

    pub fn start_maintenance(&self) {
        let mut handles = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        if !handles.is_empty() {
            return;
        }
        for shard in self.shards.values() {
            handles.push(MaintenanceHandle::start(shard));
        }
    }

    pub fn stop_maintenance(&self) {
        let mut handles = self.maintenance.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.iter_mut() {
            handle.stop();
        }
        handles.clear();
    }
}
