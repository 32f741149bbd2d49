use std::time::Duration;

/// Per-shard tunables. Built by the cluster from its own configuration.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// How long a write waits on a critical section before reporting stale.
    pub critical_section_timeout: Duration,
    /// Delay between a range becoming orphaned and its deletion.
    pub orphan_cleanup_delay: Duration,
    pub range_deleter_batch_size: usize,
    pub maintenance_interval: Duration,
    /// How long a write waits for a prepared transaction holding its key.
    pub prepared_wait_timeout: Duration,
    /// Unprepared transactions older than this are aborted.
    pub transaction_lifetime_limit: Duration,
    pub oplog_max_entries: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            critical_section_timeout: Duration::from_secs(5),
            orphan_cleanup_delay: Duration::from_secs(900),
            range_deleter_batch_size: 128,
            maintenance_interval: Duration::from_secs(1),
            prepared_wait_timeout: Duration::from_secs(5),
            transaction_lifetime_limit: Duration::from_secs(60),
            oplog_max_entries: 100_000,
        }
    }
}
