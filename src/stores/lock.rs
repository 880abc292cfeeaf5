//! Per-session exclusive OS-level file lock.
//!
//! Fail-fast by contract: a busy lock returns immediately with a retry
//! hint. There is no blocking wait, no stale-lock detection, and no
//! auto-break. A crashed holder's lock is released by the OS when its
//! process dies, and anything else is operator territory.

use fs2::FileExt;
use miette::Diagnostic;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use thiserror::Error;

use super::layout::DataLayout;
use crate::types::SessionId;

/// Errors from lock acquisition and release.
#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    /// Another holder owns the session lock.
    #[error("session {session_id} is locked by another writer")]
    #[diagnostic(
        code(loomrail::lock::busy),
        help("Retry after {retry_after_ms} ms; only one writer may hold a session.")
    )]
    Busy {
        session_id: SessionId,
        retry_after_ms: u64,
    },

    /// Filesystem failure while locking or unlocking.
    #[error("lock I/O failed at {path}: {source}")]
    #[diagnostic(code(loomrail::lock::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// A held exclusive lock. Dropping releases it; [`release`](Self::release)
/// reports unlock errors instead of swallowing them.
#[derive(Debug)]
pub struct LockHandle {
    session_id: SessionId,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    /// The session this handle locks.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Releases the lock, surfacing unlock I/O errors.
    pub fn release(mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            FileExt::unlock(&file).map_err(|source| LockError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}

/// Acquires per-session locks under one data layout.
#[derive(Debug, Clone)]
pub struct SessionLockManager {
    layout: DataLayout,
    retry_after_ms: u64,
}

impl SessionLockManager {
    /// Builds a manager with the hint returned on contention.
    #[must_use]
    pub fn new(layout: DataLayout, retry_after_ms: u64) -> Self {
        Self {
            layout,
            retry_after_ms,
        }
    }

    /// Tries to take the exclusive lock; fails fast when contended.
    pub fn acquire(&self, session_id: &SessionId) -> Result<LockHandle> {
        let path = self.layout.lock_file(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.display().to_string(),
                source,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockHandle {
                session_id: session_id.clone(),
                path,
                file: Some(file),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(LockError::Busy {
                session_id: session_id.clone(),
                retry_after_ms: self.retry_after_ms,
            }),
            Err(source) => Err(LockError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionLockManager::new(DataLayout::new(dir.path()), 1_000);
        let session = SessionId::parse("sess-1").unwrap();

        let held = manager.acquire(&session).unwrap();
        assert!(matches!(
            manager.acquire(&session),
            Err(LockError::Busy { .. })
        ));

        held.release().unwrap();
        let reacquired = manager.acquire(&session).unwrap();
        drop(reacquired);
    }

    #[test]
    fn different_sessions_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionLockManager::new(DataLayout::new(dir.path()), 1_000);
        let a = manager.acquire(&SessionId::parse("a").unwrap()).unwrap();
        let b = manager.acquire(&SessionId::parse("b").unwrap()).unwrap();
        drop(a);
        drop(b);
    }
}
