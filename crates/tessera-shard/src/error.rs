use tessera_routing::{
    CollectionUuid, ErrorCode, KeyError, Namespace, RoutingError, ShardId, ShardVersion,
};
use tessera_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ShardError {
    #[error("store: {0}")]
    Store(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("encoding: {0}")]
    Encoding(String),

    /// The request's routing version does not match this shard's.
    #[error("stale config for {ns} on {shard}: received {received}, wanted {wanted}")]
    StaleConfig {
        ns: Namespace,
        shard: ShardId,
        received: ShardVersion,
        wanted: ShardVersion,
    },

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("collection uuid mismatch on {ns}: expected {expected}, actual {actual}")]
    UuidMismatch {
        ns: Namespace,
        expected: CollectionUuid,
        actual: String,
    },

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("shard key not found: {0}")]
    ShardKeyNotFound(String),

    #[error("field {0} is part of the shard key or _id and cannot change")]
    ImmutableField(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("transaction {txn_number} for session {lsid} not found or aborted")]
    NoSuchTransaction { lsid: String, txn_number: i64 },

    #[error("txnNumber {txn_number} is older than {highest} for session {lsid}")]
    TransactionTooOld {
        lsid: String,
        txn_number: i64,
        highest: i64,
    },

    #[error("transaction is prepared; only its coordinator may decide it")]
    PreparedTransactionInProgress,

    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    #[error("conflicting operation in progress: {0}")]
    ConflictingOperation(String),

    #[error("oplog history lost: {0}")]
    HistoryLost(String),

    #[error("failpoint {0} triggered")]
    FailPoint(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ShardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ShardError::Store(_) | ShardError::Encoding(_) | ShardError::Internal(_) => {
                ErrorCode::InternalError
            }
            ShardError::FailPoint(_) => ErrorCode::Interrupted,
            ShardError::Routing(e) => e.code(),
            ShardError::StaleConfig { .. } => ErrorCode::StaleConfig,
            ShardError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            ShardError::UuidMismatch { .. } => ErrorCode::CollectionUUIDMismatch,
            ShardError::IllegalOperation(_) => ErrorCode::IllegalOperation,
            ShardError::BadValue(_) => ErrorCode::BadValue,
            ShardError::ShardKeyNotFound(_) => ErrorCode::ShardKeyNotFound,
            ShardError::ImmutableField(_) => ErrorCode::ImmutableField,
            ShardError::DuplicateKey(_) => ErrorCode::DuplicateKey,
            ShardError::WriteConflict(_) => ErrorCode::WriteConflict,
            ShardError::NoSuchTransaction { .. } => ErrorCode::NoSuchTransaction,
            ShardError::TransactionTooOld { .. } => ErrorCode::TransactionTooOld,
            ShardError::PreparedTransactionInProgress => ErrorCode::PreparedTransactionInProgress,
            ShardError::TemporarilyUnavailable(_) => ErrorCode::TemporarilyUnavailable,
            ShardError::ConflictingOperation(_) => ErrorCode::ConflictingOperationInProgress,
            ShardError::HistoryLost(_) => ErrorCode::ChangeStreamHistoryLost,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::StaleConfig | ErrorCode::StaleEpoch
        )
    }
}

impl From<StoreError> for ShardError {
    fn from(e: StoreError) -> Self {
        if e.is_write_conflict() {
            ShardError::WriteConflict(e.to_string())
        } else {
            ShardError::Store(e.to_string())
        }
    }
}

impl From<KeyError> for ShardError {
    fn from(e: KeyError) -> Self {
        ShardError::Routing(RoutingError::Key(e))
    }
}

impl From<rmp_serde::encode::Error> for ShardError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ShardError::Encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ShardError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ShardError::Encoding(e.to_string())
    }
}
