//! Cross-process lock files
//!
//! A lock is a file created with `create_new`: whoever creates it holds the
//! lock, and dropping the [`LockFile`] removes it. Processes sharing a queue
//! directory or a ledger file serialise their read-modify-write cycles on
//! one. A lock file older than [`STALE_AFTER`] was left by a holder that
//! died and is broken.

use chrono::Utc;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Default time to wait for a held lock
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// Age after which a lock file is considered abandoned
pub const STALE_AFTER: Duration = Duration::from_secs(60);

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, waiting up to [`DEFAULT_LOCK_WAIT`]
    ///
    /// # Errors
    /// Returns [`ErrorKind::WouldBlock`] if another holder keeps the lock
    /// past the wait, or the underlying I/O error
    pub async fn acquire(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::acquire_within(path, DEFAULT_LOCK_WAIT).await
    }

    /// Acquire the lock at `path`, waiting up to `wait`
    ///
    /// # Errors
    /// Returns [`ErrorKind::WouldBlock`] if another holder keeps the lock
    /// past `wait`, or the underlying I/O error
    pub async fn acquire_within(path: impl Into<PathBuf>, wait: Duration) -> io::Result<Self> {
        let path = path.into();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    // Constructed first so a failed write still removes the file
                    let lock = Self { path };
                    let holder = format!("pid {} since {}\n", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(holder.as_bytes()).await?;
                    tracing::trace!(path = %lock.path.display(), "lock acquired");
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path).await {
                        tracing::warn!(path = %path.display(), "breaking abandoned lock");
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(io::Error::new(
                            ErrorKind::WouldBlock,
                            format!("{} is held by another process", path.display()),
                        ));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Lock file path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "could not release lock");
            }
        }
    }
}

async fn is_stale(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_AFTER)
}
