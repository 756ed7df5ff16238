// src/lock.rs

//! Exclusive file locks
//!
//! Two locks use this type:
//!
//! - **Daemon lock**: `/run/pkgworker/pkgworker.lock`, held for the daemon's
//!   lifetime so only one instance serves the socket.
//! - **Package-manager lock**: held by the worker while a transaction
//!   touches the package database, so other package tools wait for us
//!   (and we for them).
//!
//! Both are `flock(LOCK_EX)` locks released when the file is closed.

use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// An exclusive lock held until drop
pub struct FileLock {
    /// Kept open to hold the lock
    file: File,
    path: PathBuf,
    /// Whether a `.pid` file was written next to the lock
    wrote_pid: bool,
}

impl FileLock {
    /// Try to take the lock without blocking
    ///
    /// Returns `Ok(None)` if another process holds it.
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = open_lock_file(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                log::debug!("Acquired lock at {:?}", path);
                Ok(Some(Self {
                    file,
                    path,
                    wrote_pid: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("Lock already held at {:?}", path);
                Ok(None)
            }
            Err(e) => Err(Error::LockError(format!(
                "Failed to lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Retry every `interval` until the lock is free or `keep_waiting`
    /// returns false
    ///
    /// Returns `Ok(None)` when the caller gave up.
    pub fn acquire_while<P, F>(path: P, interval: Duration, mut keep_waiting: F) -> Result<Option<Self>>
    where
        P: AsRef<Path>,
        F: FnMut() -> bool,
    {
        let path = path.as_ref();
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(Some(lock));
            }
            if !keep_waiting() {
                return Ok(None);
            }
            std::thread::sleep(interval);
        }
    }

    /// Whether any process holds the lock at `path`
    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let Ok(file) = File::open(path.as_ref()) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = file.unlock();
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded by the current holder, if any
    pub fn holder_pid<P: AsRef<Path>>(lock_path: P) -> Option<u32> {
        fs::read_to_string(lock_path.as_ref().with_extension("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Record our PID next to the lock
    pub fn write_pid(&mut self) -> Result<()> {
        fs::write(self.path.with_extension("pid"), std::process::id().to_string())?;
        self.wrote_pid = true;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.wrote_pid {
            let _ = fs::remove_file(self.path.with_extension("pid"));
        }
        let _ = self.file.unlock();
        log::debug!("Released lock at {:?}", self.path);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| {
            Error::LockError(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    // Never truncate: another package tool may keep data in its lock file
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| Error::LockError(format!("Failed to open {}: {}", path.display(), e)))
}
