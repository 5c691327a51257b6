//! The database directory's startup/shutdown file lock (spec §5, §6
//! `db_lock`): an OS-level exclusive lock that ensures at most one
//! process opens the store.
//!
//! Grounded on the teacher's `main.rs`, which acquires an exclusive
//! `fs2::FileExt::lock_exclusive` on a sibling `.lock` file before
//! touching the LevelDB files it scans; generalized here from one ad-hoc
//! call site into a small RAII guard held for the store's whole open
//! lifetime, released automatically when the guard (and with it, the
//! facade or organizer that owns it) is dropped.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Holds the directory's `db_lock` exclusive lock for as long as this
/// value lives. Unlocking happens implicitly on drop (closing the fd
/// releases the advisory lock), matching the teacher's
/// lifetime-of-the-process locking (it never explicitly unlocks either).
pub struct DirectoryLock {
    file: File,
}

impl DirectoryLock {
    /// Acquires the directory's `db_lock` file, failing immediately
    /// (rather than blocking) if another process already holds it —
    /// the startup-time single-owner check spec §5 requires.
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join("db_lock");
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.try_lock_exclusive().map_err(|_| Error::AlreadyLocked)?;
        Ok(DirectoryLock { file })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
