//! File-based locking to prevent concurrent backup runs on one host

use fd_lock::RwLock;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lock file shared by every backup run on the host
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/dockervolumebackup.lock";

/// Interval between attempts while waiting for the lock
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock {path:?} after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("failed to open lock file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive lock held for the duration of a backup run
///
/// The underlying `flock` is bound to the open file; it is released when the
/// file is closed on drop.
pub struct BackupLock {
    _lock: RwLock<File>,
    lock_path: PathBuf,
    waited: Duration,
}

impl BackupLock {
    /// Try once to acquire the lock, returning `None` if it is held elsewhere
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, LockError> {
        let io_err = |source| LockError::Io {
            path: lock_path.to_path_buf(),
            source,
        };

        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(io_err)?;

        let mut lock = RwLock::new(file);
        let acquired = match lock.try_write() {
            Ok(guard) => {
                // Keep the flock until the file itself is closed
                std::mem::forget(guard);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => return Err(io_err(e)),
        };

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Self {
            _lock: lock,
            lock_path: lock_path.to_path_buf(),
            waited: Duration::ZERO,
        }))
    }

    /// Acquire the lock, polling until `timeout` has elapsed
    pub async fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let start = Instant::now();
        debug!("Attempting to acquire lock: {:?}", lock_path);

        loop {
            if let Some(mut lock) = Self::try_acquire(lock_path)? {
                lock.waited = start.elapsed();
                info!(
                    waited_ms = lock.waited.as_millis() as u64,
                    "Acquired exclusive lock on {:?}", lock_path
                );
                return Ok(lock);
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: lock_path.to_path_buf(),
                    waited,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL.min(timeout - waited)).await;
        }
    }

    /// Get the lock file path
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// How long the caller waited before the lock was granted
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        debug!("Released lock: {:?}", self.lock_path);
    }
}
