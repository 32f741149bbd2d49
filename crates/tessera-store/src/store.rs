use std::ops::RangeBounds;

use crate::error::StoreError;

/// Boxed iterator over `(key, value)` pairs returned by scans.
pub type ScanIter<'a> = Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>> + 'a>;

pub trait Store {
    type Txn<'a>: Transaction
    where
        Self: 'a;

    /// Start a transaction over a consistent snapshot of every table.
    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError>;
    fn create_table(&self, name: &str) -> Result<(), StoreError>;
    fn drop_table(&self, name: &str) -> Result<(), StoreError>;
    fn table_exists(&self, name: &str) -> bool;
}

pub trait Transaction {
    // Reads
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn scan<'a>(&'a self, table: &str, range: impl RangeBounds<Vec<u8>>)
    -> Result<ScanIter<'a>, StoreError>;
    fn scan_prefix<'a>(&'a self, table: &str, prefix: &[u8]) -> Result<ScanIter<'a>, StoreError>;

    // Writes
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, table: &str, key: &[u8]) -> Result<(), StoreError>;

    /// Number of buffered writes.
    fn pending_writes(&self) -> usize;

    // Lifecycle
    fn commit(self) -> Result<(), StoreError>;

    /// Commit, running `hook` after conflict validation and before the writes
    /// become visible. Validation, hook and apply happen under the store's
    /// commit lock, so a successful hook is always followed by a successful
    /// apply. An `Err` from the hook aborts the commit.
    fn commit_with<F>(self, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce() -> Result<(), String>;

    fn rollback(self) -> Result<(), StoreError>;
}
