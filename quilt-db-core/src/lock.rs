//! Storage directory lock
//!
//! One process owns a clone's data directory at a time. The lock is an
//! exclusively-created marker file held for the clone's lifetime; a second
//! acquisition fails startup with `StorageLocked`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const LOCK_FILE: &str = "LOCK";

/// Exclusive lock over a storage directory
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Acquire the lock, creating the directory if needed
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => Error::storage_locked(format!(
                    "data directory {} is owned by another process",
                    dir.display()
                )),
                _ => Error::Io(e.to_string()),
            })?;
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }

    /// Release the lock explicitly (also happens on drop)
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove store lock");
        }
    }
}
