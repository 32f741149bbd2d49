use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::LogError;
use crate::frame::{encode_frame, scan_frames};
use crate::{StateLog, decode_entry, encode_entry};

/// State log backed by a single file. Every append is followed by
/// `sync_data`, so an acknowledged entry survives a crash.
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
    entries: AtomicUsize,
}

impl FileLog {
    /// Open or create the log at `path`, cutting off a torn final frame left
    /// by a crash mid-append.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)?;
        let scan = scan_frames(&image)?;
        let entries = scan.payloads.len();
        if scan.is_torn(image.len()) {
            warn!(
                path = %path.display(),
                kept = scan.valid_len,
                dropped = image.len() - scan.valid_len,
                "truncating torn log tail"
            );
            file.set_len(scan.valid_len as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            entries: AtomicUsize::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> StateLog<T> for FileLog
where
    T: Serialize + DeserializeOwned,
{
    fn append(&self, entry: &T) -> Result<u64, LogError> {
        let frame = encode_frame(&encode_entry(entry)?);
        let mut file = self.lock();
        file.write_all(&frame)?;
        file.sync_data()?;
        Ok(self.entries.fetch_add(1, Ordering::SeqCst) as u64)
    }

    fn replay(&self) -> Result<Vec<T>, LogError> {
        let _file = self.lock();
        let image = fs::read(&self.path)?;
        let scan = scan_frames(&image)?;
        scan.payloads.into_iter().map(decode_entry).collect()
    }

    fn rewrite(&self, entries: &[T]) -> Result<(), LogError> {
        let mut image = Vec::new();
        for entry in entries {
            image.extend(encode_frame(&encode_entry(entry)?));
        }

        let mut file = self.lock();
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)?;
            out.write_all(&image)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.entries.store(entries.len(), Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }
}
