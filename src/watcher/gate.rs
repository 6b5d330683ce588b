//! Host-wide critical section keyed by a lock file.
//!
//! Uses an exclusive `flock(2)` on a well-known file. The kernel drops the
//! lock when the holding process exits, so a crashed holder never wedges
//! later bursts.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{FlockArg, flock};
use tokio::time::{Duration, sleep};

use super::error::WatchError;

/// Pause between attempts while another holder has the lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serializes action runs across every process on the host that uses the
/// same lock path.
#[derive(Debug, Clone)]
pub struct CriticalSectionGate {
    lock_path: PathBuf,
}

/// Held exclusive lock. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too; unlock explicitly so
        // the release does not depend on other handles to the same file.
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
        crate::debug_event!("gate", "released", "{}", self.path.display());
    }
}

impl CriticalSectionGate {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Create the lock file (and its directory) if absent.
    ///
    /// Idempotent. Called at startup so an unusable lock path fails fast.
    pub fn prepare(&self) -> Result<(), WatchError> {
        open_lock_file(&self.lock_path).map(drop)
    }

    /// Wait until the exclusive lock is held.
    ///
    /// No timeout: competing bursts queue up rather than being dropped. The
    /// wait polls a non-blocking lock, so dropping the future abandons it
    /// immediately.
    pub async fn acquire(&self) -> Result<LockGuard, WatchError> {
        let file = open_lock_file(&self.lock_path)?;
        let mut waiting = false;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EWOULDBLOCK) => {
                    if !waiting {
                        crate::debug_event!("gate", "waiting", "{}", self.lock_path.display());
                        waiting = true;
                    }
                    sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(WatchError::LockUnavailable {
                        path: self.lock_path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        crate::debug_event!("gate", "acquired", "{}", self.lock_path.display());
        Ok(LockGuard {
            file,
            path: self.lock_path.clone(),
        })
    }

    /// Run `body` while holding the lock.
    ///
    /// The lock is released on every exit path of `body`, including panics.
    /// Errors only when the lock itself cannot be obtained.
    pub async fn with_lock<F, Fut, T>(&self, body: F) -> Result<T, WatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await?;
        Ok(body().await)
    }
}

fn open_lock_file(path: &Path) -> Result<File, WatchError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| WatchError::LockUnavailable {
            path: path.to_path_buf(),
            reason: format!("cannot create lock directory: {e}"),
        })?;
    }

    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| WatchError::LockUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
