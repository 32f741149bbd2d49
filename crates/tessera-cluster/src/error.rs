use tessera_log::LogError;
use tessera_routing::{ErrorCode, Namespace, RoutingError};
use tessera_shard::ShardError;
use tessera_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Shard(#[from] ShardError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("durable log: {0}")]
    Log(String),

    #[error("catalog store: {0}")]
    Store(String),

    #[error("catalog write conflict: {0}")]
    CatalogConflict(String),

    #[error("shard {0} not found")]
    ShardNotFound(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("namespace {0} is not sharded")]
    NotSharded(String),

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("shard key not found: {0}")]
    ShardKeyNotFound(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperation(String),

    #[error("illegal {machine} transition from {from} to {to}")]
    IllegalStateTransition {
        machine: &'static str,
        from: String,
        to: String,
    },

    #[error("resharding of {ns} aborted: {reason}")]
    ReshardingAborted { ns: Namespace, reason: String },

    #[error("no resharding operation in progress for {0}")]
    NoSuchReshardCollection(String),

    #[error("transaction {txn_number} of session {lsid} aborted: {reason}")]
    TransactionAborted {
        lsid: String,
        txn_number: i64,
        reason: String,
    },

    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("stale routing for {ns} persisted after {attempts} attempts: {last}")]
    StaleRetriesExhausted {
        ns: Namespace,
        attempts: usize,
        last: Box<ShardError>,
    },

    #[error("failpoint {0} triggered")]
    FailPoint(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ClusterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClusterError::Shard(e) => e.code(),
            ClusterError::Routing(e) => e.code(),
            ClusterError::Log(_) | ClusterError::Store(_) | ClusterError::Internal(_) => {
                ErrorCode::InternalError
            }
            ClusterError::CatalogConflict(_) => ErrorCode::WriteConflict,
            ClusterError::ShardNotFound(_) => ErrorCode::ShardNotFound,
            ClusterError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            ClusterError::NotSharded(_) => ErrorCode::NamespaceNotSharded,
            ClusterError::IllegalOperation(_) => ErrorCode::IllegalOperation,
            ClusterError::BadValue(_) => ErrorCode::BadValue,
            ClusterError::ShardKeyNotFound(_) => ErrorCode::ShardKeyNotFound,
            ClusterError::ConflictingOperation(_) => ErrorCode::ConflictingOperationInProgress,
            ClusterError::IllegalStateTransition { .. } => ErrorCode::IllegalStateTransition,
            ClusterError::ReshardingAborted { .. } => ErrorCode::ReshardCollectionAborted,
            ClusterError::NoSuchReshardCollection(_) => ErrorCode::NoSuchReshardCollection,
            ClusterError::TransactionAborted { .. } => ErrorCode::NoSuchTransaction,
            ClusterError::InvalidResumeToken(_) => ErrorCode::InvalidResumeToken,
            ClusterError::StaleRetriesExhausted { .. } => ErrorCode::StaleConfig,
            ClusterError::FailPoint(_) => ErrorCode::Interrupted,
        }
    }

    pub fn is_stale(&self) -> bool {
        match self {
            ClusterError::Shard(e) => e.is_stale(),
            ClusterError::Routing(RoutingError::StaleEpoch { .. }) => true,
            _ => false,
        }
    }
}

impl From<LogError> for ClusterError {
    fn from(e: LogError) -> Self {
        ClusterError::Log(e.to_string())
    }
}

impl From<StoreError> for ClusterError {
    fn from(e: StoreError) -> Self {
        if e.is_write_conflict() {
            ClusterError::CatalogConflict(e.to_string())
        } else {
            ClusterError::Store(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ClusterError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ClusterError::Internal(format!("encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for ClusterError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ClusterError::Internal(format!("decode: {e}"))
    }
}

impl From<tessera_routing::KeyError> for ClusterError {
    fn from(e: tessera_routing::KeyError) -> Self {
        ClusterError::Routing(RoutingError::Key(e))
    }
}
