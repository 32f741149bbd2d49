use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LogError;
use crate::{StateLog, decode_entry, encode_entry};

/// In-process log. Entries are kept encoded so a value that would not
/// survive a round trip through the file log fails here too.
///
/// Shared via `Arc`, it outlives the component that writes it, which is how
/// tests simulate a coordinator restart.
#[derive(Default)]
pub struct MemoryLog {
    payloads: Mutex<Vec<Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail, as a full or unreachable disk would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.payloads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> StateLog<T> for MemoryLog
where
    T: Serialize + DeserializeOwned,
{
    fn append(&self, entry: &T) -> Result<u64, LogError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("log marked unavailable".into()));
        }
        let payload = encode_entry(entry)?;
        let mut payloads = self.lock();
        payloads.push(payload);
        Ok(payloads.len() as u64 - 1)
    }

    fn replay(&self) -> Result<Vec<T>, LogError> {
        self.lock().iter().map(|p| decode_entry(p)).collect()
    }

    fn rewrite(&self, entries: &[T]) -> Result<(), LogError> {
        let encoded = entries
            .iter()
            .map(encode_entry)
            .collect::<Result<Vec<_>, _>>()?;
        *self.lock() = encoded;
        Ok(())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_log_refuses_appends() {
        let log = MemoryLog::new();
        StateLog::<u32>::append(&log, &1).unwrap();
        log.set_unavailable(true);
        assert!(StateLog::<u32>::append(&log, &2).is_err());
        log.set_unavailable(false);
        let entries: Vec<u32> = log.replay().unwrap();
        assert_eq!(entries, vec![1]);
    }
}
