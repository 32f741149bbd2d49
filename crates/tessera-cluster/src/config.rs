use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_routing::ShardId;
use tessera_shard::ShardConfig;

/// Cluster-wide settings. Every field has a default, so a partial document
/// deserializes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub shards: Vec<String>,
    /// Directory for durable coordinator and catalog logs. Logs stay in
    /// memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Times a router refreshes and retries after a stale routing error.
    pub max_stale_retries: usize,
    pub critical_section_timeout_ms: u64,
    pub orphan_cleanup_delay_ms: u64,
    pub range_deleter_batch_size: usize,
    pub maintenance_interval_ms: u64,
    /// Run range deletion, transaction expiry and oplog trimming in
    /// background threads.
    pub background_maintenance: bool,
    /// A migration enters its critical section once a catch-up round moves
    /// fewer changes than this.
    pub migration_catchup_threshold: usize,
    pub migration_max_catchup_rounds: usize,
    pub resharding_catchup_threshold: usize,
    pub prepared_wait_timeout_ms: u64,
    pub transaction_lifetime_limit_ms: u64,
    pub oplog_max_entries: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            shards: vec!["shard0".into(), "shard1".into()],
            data_dir: None,
            max_stale_retries: 10,
            critical_section_timeout_ms: 5_000,
            orphan_cleanup_delay_ms: 900_000,
            range_deleter_batch_size: 128,
            maintenance_interval_ms: 1_000,
            background_maintenance: true,
            migration_catchup_threshold: 16,
            migration_max_catchup_rounds: 8,
            resharding_catchup_threshold: 16,
            prepared_wait_timeout_ms: 5_000,
            transaction_lifetime_limit_ms: 60_000,
            oplog_max_entries: 100_000,
        }
    }
}

impl ClusterConfig {
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| ShardId::from(s.as_str())).collect()
    }

    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            critical_section_timeout: Duration::from_millis(self.critical_section_timeout_ms),
            orphan_cleanup_delay: self.orphan_cleanup_delay(),
            range_deleter_batch_size: self.range_deleter_batch_size,
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms),
            prepared_wait_timeout: Duration::from_millis(self.prepared_wait_timeout_ms),
            transaction_lifetime_limit: Duration::from_millis(self.transaction_lifetime_limit_ms),
            oplog_max_entries: self.oplog_max_entries,
        }
    }

    pub fn orphan_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.orphan_cleanup_delay_ms)
    }

    pub fn critical_section_timeout(&self) -> Duration {
        Duration::from_millis(self.critical_section_timeout_ms)
    }
}
