//! Advisory host lock.
//!
//! Two concurrent runs would interleave their command sequences on the same
//! ports, so actuation is serialized with a non-blocking `flock(2)` on a lock
//! file. The lock is released when the [`AdvisoryLock`] is dropped or the
//! process exits.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

use crate::error::{NetSetupError, Result};

/// Default lock file.
pub const DEFAULT_LOCK_FILE: &str = "/var/lock/deploy-netsetup";

/// An exclusive advisory lock held for the lifetime of the value.
pub struct AdvisoryLock {
    path: PathBuf,
    // Unlocks on drop
    _lock: Flock<File>,
}

impl AdvisoryLock {
    /// Take the lock at `path` without waiting.
    ///
    /// Fails with `LockUnavailable` when another process holds it or the file
    /// cannot be opened.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| NetSetupError::LockUnavailable {
            path: path.clone(),
            reason,
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| unavailable(e.to_string()))?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            if errno == Errno::EWOULDBLOCK {
                unavailable("held by another netsetup run".to_string())
            } else {
                unavailable(errno.desc().to_string())
            }
        })?;

        info!(path = %path.display(), "Acquired host lock");
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for AdvisoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdvisoryLock").field("path", &self.path).finish()
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "Releasing host lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netsetup.lock");

        let held = AdvisoryLock::acquire(&path).unwrap();
        assert_eq!(held.path(), path);

        let second = AdvisoryLock::acquire(&path);
        match second {
            Err(NetSetupError::LockUnavailable { reason, .. }) => {
                assert!(reason.contains("another"));
            }
            other => panic!("expected LockUnavailable, got {:?}", other),
        }

        drop(held);
        assert!(AdvisoryLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_unopenable_lock_file() {
        let result = AdvisoryLock::acquire("/nonexistent-dir/compass/netsetup.lock");
        let err = result.unwrap_err();
        assert!(matches!(err, NetSetupError::LockUnavailable { .. }));
        assert_eq!(err.exit_code(), 5);
    }
}
