// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide exclusive lock keeping a second agent instance off the host.
//!
//! Two convergence loops acting on the same host would race on containers
//! and host resources, so a second instance must fail fast at startup rather
//! than run. The lock is an `flock` on a well-known path; the kernel releases
//! it if the process dies, so a crashed agent never wedges the host.

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::fs::{File, OpenOptions};

#[derive(Debug, thiserror::Error)]
pub enum HostLockError {
    #[error("failed to open lock file {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error(
        "another host-agent instance holds the lock at {path}; refusing to \
         run a second convergence loop"
    )]
    AlreadyHeld {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// An acquired host lock. Dropping it releases the lock; the lock file
/// itself is left in place.
#[derive(Debug)]
pub struct HostLock {
    file: File,
    path: Utf8PathBuf,
}

impl HostLock {
    /// Non-blocking acquisition: either we get the lock now or another
    /// instance has it and we report that.
    pub fn try_acquire(path: &Utf8Path) -> Result<Self, HostLockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| HostLockError::Io { path: path.into(), err })?;
        file.try_lock_exclusive().map_err(|err| {
            HostLockError::AlreadyHeld { path: path.into(), err }
        })?;
        Ok(Self { file, path: path.into() })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        // Best effort; the kernel drops the lock with the fd regardless.
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("agent.lock");

        let held = HostLock::try_acquire(&path).unwrap();
        let err = HostLock::try_acquire(&path).unwrap_err();
        assert!(matches!(err, HostLockError::AlreadyHeld { .. }));

        // Releasing the first lock lets a new instance in.
        drop(held);
        HostLock::try_acquire(&path).unwrap();
    }

    #[test]
    fn unwritable_path_is_an_io_error() {
        let err = HostLock::try_acquire(Utf8Path::new(
            "/nonexistent-dir/agent.lock",
        ))
        .unwrap_err();
        assert!(matches!(err, HostLockError::Io { .. }));
    }
}
