//! The cluster layer: config server, routers and the coordinators that move
//! data between shards.
//!
//! [`Cluster`] wires every component into one process. Routers target
//! shards from cached routing tables; the migration manager, resharding
//! coordinator and transaction coordinator each keep a durable log and can
//! be restarted from it.

mod change_stream;
mod cluster;
mod config;
mod config_server;
mod error;
mod logs;
mod migration;
mod registry;
mod resharding;
mod router;
mod transaction_coordinator;

pub use change_stream::{ChangeEvent, ChangeStream, OperationType, ResumeToken};
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use config_server::{CollectionRecord, ConfigServer, DatabaseRecord, PlacementEntry};
pub use error::ClusterError;
pub use logs::LogFactory;
pub use migration::{MigrationManager, MigrationSettings, MoveRangeOutcome};
pub use registry::ShardRegistry;
pub use resharding::{ReshardingCoordinator, ReshardingJob, ReshardingPhase};
pub use router::{RequestOptions, Router};
pub use transaction_coordinator::{CommitDecision, CoordinatorState, TransactionCoordinator};

/// Failpoint names understood by the coordinators.
pub mod failpoints {
    pub use crate::migration::{
        CRASH_AFTER_COMMIT as MIGRATION_CRASH_AFTER_COMMIT,
        FAIL_BEFORE_COMMIT as MIGRATION_FAIL_BEFORE_COMMIT,
    };
    pub use crate::resharding::{
        CRASH_AFTER_CLONING as RESHARDING_CRASH_AFTER_CLONING,
        FAIL_BEFORE_COMMIT as RESHARDING_FAIL_BEFORE_COMMIT,
    };
    pub use crate::transaction_coordinator::{
        FAIL_BEFORE_DECISION as COORDINATOR_FAIL_BEFORE_DECISION,
        FAIL_BEFORE_DELIVERY as COORDINATOR_FAIL_BEFORE_DELIVERY,
    };
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
