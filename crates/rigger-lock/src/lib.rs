//! Cross-process file locks for shared caches.
//!
//! Several worker processes on one host share the same source-mirror
//! directory tree, so mutations are serialised through lock files. A
//! lock is an atomically-created file holding JSON metadata about the
//! holder (PID, hostname, acquisition time); acquisition polls once a
//! second until the file can be created, a deadline passes, or the
//! caller cancels.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rigger_lock::acquire;
//!
//! let lock = acquire("cache/repo.updatelock", Duration::from_secs(30), None)?;
//! // ... mutate the shared directory ...
//! drop(lock); // released on drop
//! # Ok::<(), rigger_lock::LockError>(())
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Interval between acquisition attempts.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum LockError {
    /// The deadline passed while another process held the lock.
    #[error("timed out acquiring lock {name}")]
    TimedOut { name: String },
    /// The caller's cancellation flag was set while waiting.
    #[error("cancelled while waiting for lock {name}")]
    Cancelled { name: String },
    #[error("lock io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata written into the lock file for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        }
    }
}

/// A held lock; the file is removed on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing removal errors. Drop releases
    /// best-effort.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        fs::remove_file(&self.path).map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Acquire an exclusive lock on `path`, polling once a second until the
/// lock file can be created, `timeout` passes, or `cancel` is set.
pub fn acquire(
    path: impl AsRef<Path>,
    timeout: Duration,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<LockHandle, LockError> {
    let path = path.as_ref().to_path_buf();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let deadline = Instant::now() + timeout;

    loop {
        match try_acquire(&path)? {
            Some(handle) => return Ok(handle),
            None => {
                if cancel
                    .as_ref()
                    .is_some_and(|c| c.load(Ordering::Relaxed))
                {
                    return Err(LockError::Cancelled { name });
                }
                if Instant::now() >= deadline {
                    return Err(LockError::TimedOut { name });
                }
                std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }
}

/// One acquisition attempt: atomically create the lock file, or report
/// that another process holds it.
pub fn try_acquire(path: &Path) -> Result<Option<LockHandle>, LockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let info = LockInfo::current();
            let json = serde_json::to_string_pretty(&info).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;
            file.write_all(json.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|source| LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(Some(LockHandle {
                path: path.to_path_buf(),
                released: false,
            }))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Read the holder metadata from an existing lock file.
pub fn holder(path: &Path) -> Option<LockInfo> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}
