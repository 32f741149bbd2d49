//! Durable logs for the catalog and the coordinators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_log::{FileLog, MemoryLog, SharedLog};
use tracing::debug;

use crate::error::ClusterError;

/// Hands out named logs. In-memory logs live as long as the factory, so a
/// component rebuilt from the same factory replays what its predecessor
/// wrote.
pub struct LogFactory {
    data_dir: Option<PathBuf>,
    memory: Mutex<HashMap<String, Arc<MemoryLog>>>,
}

impl LogFactory {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn open<T>(&self, name: &str) -> Result<SharedLog<T>, ClusterError>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        match &self.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| ClusterError::Log(format!("create {}: {e}", dir.display())))?;
                let path = dir.join(format!("{name}.log"));
                debug!(log = name, path = %path.display(), "opening file log");
                Ok(Arc::new(FileLog::open(path)?))
            }
            None => Ok(self.memory_log(name)),
        }
    }

    /// The in-memory backing of `name`, for tests that need to inject
    /// failures.
    pub fn memory_log(&self, name: &str) -> Arc<MemoryLog> {
        let mut logs = self.memory.lock().unwrap_or_else(|e| e.into_inner());
        logs.entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryLog::new()))
            .clone()
    }
}
