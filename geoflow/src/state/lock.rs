//! Advisory lock rejecting concurrent runs against one data directory.

use super::DataDir;
use crate::errors::GeoflowError;
use fs2::FileExt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive lock on `<data_dir>/.geoflow/lock`, released on drop.
#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    // Held for its lock; closing the file releases it.
    _file: File,
}

impl DataDirLock {
    /// Acquires the lock, recording this process id in the lock file.
    ///
    /// # Errors
    ///
    /// Returns [`GeoflowError::Locked`] if another run holds the lock.
    pub fn acquire(data_dir: &DataDir) -> Result<Self, GeoflowError> {
        data_dir.ensure()?;
        let path = data_dir.lock_path();

        // Do not truncate before holding the lock: the pid belongs to the holder.
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(GeoflowError::Locked {
                holder: read_pid(&mut file),
                path,
            });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        debug!(path = %path.display(), "acquired data directory lock");

        Ok(Self { path, _file: file })
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}
