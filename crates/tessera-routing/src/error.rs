use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::namespace::CollectionUuid;
use crate::version::Epoch;

// ── ErrorCode ─────────────────────────────────────────────────

/// Typed error codes surfaced to clients. Numeric values follow the wire
/// protocol of the document store this cluster speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    IllegalOperation,
    NamespaceNotFound,
    ShardKeyNotFound,
    ImmutableField,
    ShardNotFound,
    InvalidOptions,
    WriteConflict,
    ConflictingOperationInProgress,
    NamespaceNotSharded,
    StaleEpoch,
    TransactionTooOld,
    NoSuchTransaction,
    InvalidResumeToken,
    PreparedTransactionInProgress,
    ChangeStreamHistoryLost,
    NoSuchReshardCollection,
    ReshardCollectionAborted,
    CollectionUUIDMismatch,
    TemporarilyUnavailable,
    IllegalStateTransition,
    DuplicateKey,
    Interrupted,
    StaleConfig,
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Routing information is out of date: refresh, then retry.
    Stale,
    /// The caller's assumption about the target no longer holds.
    Mismatch,
    /// Lost a race with a concurrent writer; safe to retry as-is.
    Conflict,
    /// A distributed commit decided to abort.
    Commit,
    /// The server shed load; retry later.
    ResourcePressure,
    Permanent,
}

const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::InternalError,
    ErrorCode::BadValue,
    ErrorCode::IllegalOperation,
    ErrorCode::NamespaceNotFound,
    ErrorCode::ShardKeyNotFound,
    ErrorCode::ImmutableField,
    ErrorCode::ShardNotFound,
    ErrorCode::InvalidOptions,
    ErrorCode::WriteConflict,
    ErrorCode::ConflictingOperationInProgress,
    ErrorCode::NamespaceNotSharded,
    ErrorCode::StaleEpoch,
    ErrorCode::TransactionTooOld,
    ErrorCode::NoSuchTransaction,
    ErrorCode::InvalidResumeToken,
    ErrorCode::PreparedTransactionInProgress,
    ErrorCode::ChangeStreamHistoryLost,
    ErrorCode::NoSuchReshardCollection,
    ErrorCode::ReshardCollectionAborted,
    ErrorCode::CollectionUUIDMismatch,
    ErrorCode::TemporarilyUnavailable,
    ErrorCode::IllegalStateTransition,
    ErrorCode::DuplicateKey,
    ErrorCode::Interrupted,
    ErrorCode::StaleConfig,
];

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::IllegalOperation => 20,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::ShardKeyNotFound => 61,
            ErrorCode::ImmutableField => 66,
            ErrorCode::ShardNotFound => 70,
            ErrorCode::InvalidOptions => 72,
            ErrorCode::WriteConflict => 112,
            ErrorCode::ConflictingOperationInProgress => 117,
            ErrorCode::NamespaceNotSharded => 118,
            ErrorCode::StaleEpoch => 150,
            ErrorCode::TransactionTooOld => 225,
            ErrorCode::NoSuchTransaction => 251,
            ErrorCode::InvalidResumeToken => 260,
            ErrorCode::PreparedTransactionInProgress => 267,
            ErrorCode::ChangeStreamHistoryLost => 286,
            ErrorCode::NoSuchReshardCollection => 312,
            ErrorCode::ReshardCollectionAborted => 341,
            ErrorCode::CollectionUUIDMismatch => 361,
            ErrorCode::TemporarilyUnavailable => 365,
            ErrorCode::IllegalStateTransition => 9001,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::Interrupted => 11601,
            ErrorCode::StaleConfig => 13388,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        ALL_CODES.iter().copied().find(|c| c.as_i32() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::IllegalOperation => "IllegalOperation",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::ShardKeyNotFound => "ShardKeyNotFound",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::ShardNotFound => "ShardNotFound",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::WriteConflict => "WriteConflict",
            ErrorCode::ConflictingOperationInProgress => "ConflictingOperationInProgress",
            ErrorCode::NamespaceNotSharded => "NamespaceNotSharded",
            ErrorCode::StaleEpoch => "StaleEpoch",
            ErrorCode::TransactionTooOld => "TransactionTooOld",
            ErrorCode::NoSuchTransaction => "NoSuchTransaction",
            ErrorCode::InvalidResumeToken => "InvalidResumeToken",
            ErrorCode::PreparedTransactionInProgress => "PreparedTransactionInProgress",
            ErrorCode::ChangeStreamHistoryLost => "ChangeStreamHistoryLost",
            ErrorCode::NoSuchReshardCollection => "NoSuchReshardCollection",
            ErrorCode::ReshardCollectionAborted => "ReshardCollectionAborted",
            ErrorCode::CollectionUUIDMismatch => "CollectionUUIDMismatch",
            ErrorCode::TemporarilyUnavailable => "TemporarilyUnavailable",
            ErrorCode::IllegalStateTransition => "IllegalStateTransition",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::StaleConfig => "StaleConfig",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::StaleConfig | ErrorCode::StaleEpoch => ErrorCategory::Stale,
            ErrorCode::CollectionUUIDMismatch => ErrorCategory::Mismatch,
            ErrorCode::WriteConflict
            | ErrorCode::ConflictingOperationInProgress
            | ErrorCode::PreparedTransactionInProgress => ErrorCategory::Conflict,
            ErrorCode::NoSuchTransaction | ErrorCode::TransactionTooOld => ErrorCategory::Commit,
            ErrorCode::TemporarilyUnavailable | ErrorCode::Interrupted => {
                ErrorCategory::ResourcePressure
            }
            _ => ErrorCategory::Permanent,
        }
    }

    /// Whether a client may resend the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Stale | ErrorCategory::Conflict | ErrorCategory::ResourcePressure
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_i32())
    }
}

// ── KeyError ──────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum KeyError {
    #[error("shard key pattern must name at least one field")]
    EmptyPattern,

    #[error("invalid shard key pattern: {0}")]
    InvalidPattern(String),

    #[error("shard key field {field} cannot be an array")]
    ArrayValue { field: String },

    #[error("value of type {kind} cannot be part of a shard key (field {field})")]
    UnsupportedType { field: String, kind: String },

    #[error("shard key has {actual} values, pattern has {expected} fields")]
    Arity { expected: usize, actual: usize },
}

// ── RoutingError ──────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("namespace {0} not found")]
    NamespaceNotFound(String),

    #[error("namespace {0} is not sharded")]
    NotSharded(String),

    #[error("epoch of {ns} changed from {cached} to {current}")]
    StaleEpoch {
        ns: String,
        cached: Epoch,
        current: Epoch,
    },

    #[error("chunks of {ns} do not partition the key space: {reason}")]
    InvalidPartition { ns: String, reason: String },

    #[error("invalid chunk range: {0}")]
    InvalidRange(String),

    #[error("collection uuid mismatch on {ns}: expected {expected}, actual {actual}")]
    UuidMismatch {
        ns: String,
        expected: CollectionUuid,
        actual: CollectionUuid,
    },

    #[error(transparent)]
    Key(#[from] KeyError),

    /// Failure reported by the routing source while fetching metadata.
    #[error("{code}: {message}")]
    Source { code: ErrorCode, message: String },
}

impl RoutingError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoutingError::InvalidNamespace(_) => ErrorCode::InvalidOptions,
            RoutingError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            RoutingError::NotSharded(_) => ErrorCode::NamespaceNotSharded,
            RoutingError::StaleEpoch { .. } => ErrorCode::StaleEpoch,
            RoutingError::InvalidPartition { .. } => ErrorCode::InternalError,
            RoutingError::InvalidRange(_) => ErrorCode::BadValue,
            RoutingError::UuidMismatch { .. } => ErrorCode::CollectionUUIDMismatch,
            RoutingError::Key(KeyError::ArrayValue { .. } | KeyError::UnsupportedType { .. }) => {
                ErrorCode::BadValue
            }
            RoutingError::Key(_) => ErrorCode::InvalidOptions,
            RoutingError::Source { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_numbers() {
        for code in ALL_CODES {
            assert_eq!(ErrorCode::from_i32(code.as_i32()), Some(*code));
        }
        assert_eq!(ErrorCode::from_i32(-7), None);
    }

    #[test]
    fn categories_drive_retryability() {
        assert!(ErrorCode::StaleConfig.is_retryable());
        assert!(ErrorCode::WriteConflict.is_retryable());
        assert!(ErrorCode::TemporarilyUnavailable.is_retryable());
        assert!(!ErrorCode::CollectionUUIDMismatch.is_retryable());
        assert!(!ErrorCode::NoSuchTransaction.is_retryable());
        assert_eq!(
            ErrorCode::CollectionUUIDMismatch.category(),
            ErrorCategory::Mismatch
        );
    }
}
