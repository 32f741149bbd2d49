mod catalog;
mod clock;
mod config;
mod critical_section;
mod crud;
mod error;
mod failpoint;
mod migration;
mod ops;
mod oplog;
mod range_deleter;
mod record;
mod session;
mod shard;
mod txn;
mod write;

pub use catalog::LocalCollection;
pub use clock::{LogicalClock, Timestamp};
pub use config::ShardConfig;
pub use critical_section::{CriticalSections, SectionScope, WaitOutcome};
pub use crud::with_id;
pub use error::ShardError;
pub use failpoint::{FailPointMode, FailPoints};
pub use migration::{MigratedOp, MigrationRole, MigrationSession, ops_from_oplog};
pub use ops::{
    DeleteResult, FindAndModify, FindAndModifyResult, InsertResult, LastErrorObject, OpContext,
    Selector, SessionInfo, UpdateResult, UpdateSpec, WriteResponse, values_equal,
};
pub use oplog::{OpKind, OpTime, OplogEntry};
pub use range_deleter::{MaintenanceHandle, RangeDeletionTask};
pub use record::{decode_document, document_key, encode_document};
pub use session::SessionRecord;
pub use shard::Shard;
pub use txn::TxnState;
