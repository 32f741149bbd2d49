use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::{ScanIter, Transaction};

use super::store::{MemoryStore, Table};

type WriteSet = BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>;

struct State {
    /// Tables as of `begin`, used to detect conflicting commits.
    base: HashMap<String, Arc<Table>>,
    /// Working copies: `base` plus this transaction's own writes.
    working: HashMap<String, Arc<Table>>,
    writes: WriteSet,
}

pub struct MemoryTransaction<'a> {
    state: RefCell<Option<State>>,
    store: &'a MemoryStore,
    read_only: bool,
}

impl<'a> MemoryTransaction<'a> {
    pub(crate) fn new(
        store: &'a MemoryStore,
        snapshot: HashMap<String, Arc<Table>>,
        read_only: bool,
    ) -> Self {
        Self {
            state: RefCell::new(Some(State {
                base: snapshot.clone(),
                working: snapshot,
                writes: BTreeMap::new(),
            })),
            store,
            read_only,
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    fn collect_range(
        &self,
        table: &str,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(StoreError::TransactionConsumed)?;
        let data = state
            .working
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(data
            .range(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, table: &str, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.borrow_mut();
        let state = state.as_mut().ok_or(StoreError::TransactionConsumed)?;
        let data = state
            .working
            .get_mut(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let data = Arc::make_mut(data);
        match value {
            Some(v) => {
                data.insert(key.to_vec(), v.to_vec());
            }
            None => {
                data.remove(key);
            }
        }
        state
            .writes
            .insert((table.to_string(), key.to_vec()), value.map(|v| v.to_vec()));
        Ok(())
    }

    fn finish<F>(self, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce() -> Result<(), String>,
    {
        let store = self.store;
        let state = self
            .state
            .into_inner()
            .ok_or(StoreError::TransactionConsumed)?;
        if state.writes.is_empty() {
            return hook().map_err(StoreError::CommitAborted);
        }

        let _guard = store.lock_commit();
        validate(store, &state)?;
        hook().map_err(StoreError::CommitAborted)?;
        apply(store, state);
        Ok(())
    }
}

/// First committer wins: every key we wrote must still hold the value our
/// snapshot saw.
fn validate(store: &MemoryStore, state: &State) -> Result<(), StoreError> {
    for (table, key) in state.writes.keys() {
        let current = store
            .current(table)
            .ok_or_else(|| StoreError::WriteConflict {
                table: table.clone(),
            })?;
        let seen = state.base.get(table).and_then(|t| t.get(key));
        if current.get(key) != seen {
            return Err(StoreError::WriteConflict {
                table: table.clone(),
            });
        }
    }
    Ok(())
}

fn apply(store: &MemoryStore, state: State) {
    let mut by_table: BTreeMap<String, Vec<(Vec<u8>, Option<Vec<u8>>)>> = BTreeMap::new();
    for ((table, key), value) in state.writes {
        by_table.entry(table).or_default().push((key, value));
    }
    for (table, writes) in by_table {
        let Some(current) = store.current(&table) else {
            continue;
        };
        let mut data = (*current).clone();
        for (key, value) in writes {
            match value {
                Some(v) => {
                    data.insert(key, v);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        store.install(&table, data);
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(StoreError::TransactionConsumed)?;
        let data = state
            .working
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn scan<'b>(
        &'b self,
        table: &str,
        range: impl RangeBounds<Vec<u8>>,
    ) -> Result<ScanIter<'b>, StoreError> {
        let bounds = (range.start_bound().cloned(), range.end_bound().cloned());
        let entries = self.collect_range(table, bounds)?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn scan_prefix<'b>(&'b self, table: &str, prefix: &[u8]) -> Result<ScanIter<'b>, StoreError> {
        let prefix_vec = prefix.to_vec();
        let entries: Vec<_> = self
            .collect_range(table, (Bound::Included(prefix_vec.clone()), Bound::Unbounded))?
            .into_iter()
            .take_while(|(k, _)| k.starts_with(&prefix_vec))
            .collect();
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.write(table, key, Some(value))
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<(), StoreError> {
        self.write(table, key, None)
    }

    fn pending_writes(&self) -> usize {
        self.state
            .borrow()
            .as_ref()
            .map(|s| s.writes.len())
            .unwrap_or(0)
    }

    fn commit(self) -> Result<(), StoreError> {
        self.finish(|| Ok(()))
    }

    fn commit_with<F>(self, hook: F) -> Result<(), StoreError>
    where
        F: FnOnce() -> Result<(), String>,
    {
        self.finish(hook)
    }

    fn rollback(self) -> Result<(), StoreError> {
        if self.state.into_inner().is_none() {
            return Err(StoreError::TransactionConsumed);
        }
        Ok(())
    }
}
