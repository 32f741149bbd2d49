use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arc_swap::ArcSwap;
use imbl::OrdMap;

use crate::error::StoreError;
use crate::store::Store;

use super::transaction::MemoryTransaction;

pub(crate) type Table = OrdMap<Vec<u8>, Vec<u8>>;

/// In-memory store built from persistent ordered maps.
///
/// Readers never block: a snapshot is a clone of the per-table `Arc`s, which
/// is cheap thanks to imbl structural sharing. Writers are optimistic; the
/// only serialization point is the short commit section.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Arc<ArcSwap<Table>>>>,
    commit_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        }
    }

    /// Snapshot every table.
    pub(crate) fn snapshot_tables(&self) -> HashMap<String, Arc<Table>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .iter()
            .map(|(name, arc)| (name.clone(), arc.load_full()))
            .collect()
    }

    pub(crate) fn current(&self, name: &str) -> Option<Arc<Table>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(name).map(|arc| arc.load_full())
    }

    pub(crate) fn install(&self, name: &str, data: Table) {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        if let Some(arc) = tables.get(name) {
            arc.store(Arc::new(data));
        }
    }

    pub(crate) fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live keys in a table, or `None` if it does not exist.
    pub fn table_len(&self, name: &str) -> Option<usize> {
        self.current(name).map(|t| t.len())
    }
}

impl Store for MemoryStore {
    type Txn<'a> = MemoryTransaction<'a>;

    fn begin(&self, read_only: bool) -> Result<Self::Txn<'_>, StoreError> {
        Ok(MemoryTransaction::new(self, self.snapshot_tables(), read_only))
    }

    fn create_table(&self, name: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ArcSwap::new(Arc::new(OrdMap::new()))));
        Ok(())
    }

    fn drop_table(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.lock_commit();
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.remove(name);
        Ok(())
    }

    fn table_exists(&self, name: &str) -> bool {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.contains_key(name)
    }
}
