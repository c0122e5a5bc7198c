/// Advisory Updater Lock
///
/// One exclusive file lock per (currency, keyspace) prevents two updaters
/// from interleaving batches. The lock is advisory: it guards our own
/// processes, not arbitrary writers.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::UpdateError;

pub struct UpdaterLock {
    file: File,
    path: PathBuf,
}

impl UpdaterLock {
    /// Acquire the lock, failing immediately with `LockHeld` if another
    /// updater owns it. Never blocks.
    pub fn acquire(path: &Path) -> Result<Self, UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| UpdateError::LockHeld {
            path: path.display().to_string(),
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UpdaterLock {
    fn drop(&mut self) {
        // Unlock errors on drop are unreportable; the OS releases the lock
        // at process exit anyway.
        let _ = self.file.unlock();
    }
}
