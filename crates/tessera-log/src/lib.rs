//! Append-only, crash-safe state logs.
//!
//! Coordinators write their decisions here before acting on them and replay
//! the log on restart. Each entry is a MessagePack payload framed as
//! `[len u32 BE][crc32 u32 BE][payload]`.

mod error;
mod file;
mod frame;
mod memory;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use error::LogError;
pub use file::FileLog;
pub use memory::MemoryLog;

pub trait StateLog<T>: Send + Sync
where
    T: Serialize + DeserializeOwned,
{
    /// Durably append `entry`. Returns its position. Once this returns, a
    /// replay after a crash includes the entry.
    fn append(&self, entry: &T) -> Result<u64, LogError>;

    /// All entries in append order.
    fn replay(&self) -> Result<Vec<T>, LogError>;

    /// Atomically replace the whole log, used to drop finished work.
    fn rewrite(&self, entries: &[T]) -> Result<(), LogError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type SharedLog<T> = Arc<dyn StateLog<T>>;

pub(crate) fn encode_entry<T: Serialize>(entry: &T) -> Result<Vec<u8>, LogError> {
    Ok(rmp_serde::to_vec_named(entry)?)
}

pub(crate) fn decode_entry<T: DeserializeOwned>(payload: &[u8]) -> Result<T, LogError> {
    Ok(rmp_serde::from_slice(payload)?)
}
