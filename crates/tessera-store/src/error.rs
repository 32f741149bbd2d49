use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction already consumed")]
    TransactionConsumed,

    #[error("cannot write in a read-only transaction")]
    ReadOnly,

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Another transaction committed a write to a key this transaction also
    /// wrote after our snapshot was taken.
    #[error("write conflict on table {table}")]
    WriteConflict { table: String },

    /// The pre-apply commit hook refused the commit.
    #[error("commit aborted: {0}")]
    CommitAborted(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, StoreError::WriteConflict { .. })
    }
}
