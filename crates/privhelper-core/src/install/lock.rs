//! Cross-process lifecycle lock.
//!
//! An exclusive advisory lock on `<state_dir>/<label>.lock` keeps two CLI
//! processes from installing and uninstalling the same helper at once. The
//! in-process half of the exclusion is [`super::InstallStateCell`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LifecycleLock {
    file: File,
    path: PathBuf,
}

impl LifecycleLock {
    /// Block (on a blocking thread) until the lock at `path` is held.
    ///
    /// Creates the lock file and its parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from creating or locking the file.
    pub async fn acquire(path: &Path) -> io::Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|e| io::Error::other(format!("lock task failed: {e}")))?
    }

    fn acquire_blocking(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Acquired lifecycle lock");
        Ok(Self { file, path })
    }

    /// Try to take the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns `WouldBlock` if another holder has it, or any other I/O error.
    pub fn try_acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for LifecycleLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "Failed to release lifecycle lock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("com.example.helper.lock");

        let held = LifecycleLock::acquire(&path).await.unwrap();
        assert!(path.exists());
        assert!(LifecycleLock::try_acquire(&path).is_err());

        drop(held);
        assert!(LifecycleLock::try_acquire(&path).is_ok());
    }
}
