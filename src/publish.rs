//! MODULE `publish`: atomic database publication (spec.md §4.9).
//!
//! A [`PendingDatabase`] wraps a [`tempfile::NamedTempFile`] created next to
//! the target path. Its `Drop` unlinks the temp file unless `commit()`
//! already consumed it via rename -- the RAII replacement for the C
//! source's signal-handler-plus-atexit cleanup pair (spec.md §9).

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use signal_hook::consts::{SIGABRT, SIGINT, SIGTERM};
use tempfile::NamedTempFile;

use crate::error::{CoreError, CoreResult};

/// Privileged mode/ownership applied when visibility enforcement is on
/// (spec.md §4.9): readable only by the owner and the locate group.
const VISIBILITY_MODE: u32 = 0o640;

/// A temp file holding a not-yet-published database. Call `commit()` to
/// rename it into place; dropping without committing removes it.
pub struct PendingDatabase {
    temp: Option<NamedTempFile>,
    target: PathBuf,
}

impl PendingDatabase {
    /// Creates a temp file in the same directory as `target`, so the final
    /// rename is guaranteed to stay on one filesystem.
    pub fn create(target: &Path) -> CoreResult<Self> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(dir).map_err(|e| CoreError::OutputIo { path: target.to_path_buf(), source: e })?;
        Ok(PendingDatabase { temp: Some(temp), target: target.to_path_buf() })
    }

    pub fn file(&self) -> &File {
        self.temp.as_ref().expect("PendingDatabase used after commit").as_file()
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.temp.as_mut().expect("PendingDatabase used after commit").as_file_mut()
    }

    /// Applies the target mode/ownership before publishing: `0640` when
    /// visibility enforcement is on (the updater must run with the
    /// privilege needed to reach the locate group; if it can't, the
    /// permission set simply falls back to whatever the process umask
    /// already produced), otherwise the umask-masked default the temp file
    /// was created with (spec.md §4.9).
    pub fn set_mode(&mut self, check_visibility: bool) -> CoreResult<()> {
        if !check_visibility {
            return Ok(());
        }
        let file = self.file();
        let mut perms = file.metadata().map_err(|e| CoreError::OutputIo { path: self.target.clone(), source: e })?.permissions();
        perms.set_mode(VISIBILITY_MODE);
        file.set_permissions(perms).map_err(|e| CoreError::OutputIo { path: self.target.clone(), source: e })
    }

    /// Renames the temp file onto `target`, consuming this guard so `Drop`
    /// no longer unlinks it.
    pub fn commit(mut self) -> CoreResult<()> {
        let temp = self.temp.take().expect("PendingDatabase used after commit");
        temp.persist(&self.target).map_err(|e| CoreError::OutputIo { path: self.target.clone(), source: e.error })?;
        Ok(())
    }
}

/// Holds the old database file open (and advisory-locked) for the entire
/// publication, per spec.md §9's Open Question resolution: the lock's scope
/// covers the read phase *and* the rename, not just the read phase.
pub struct LockedOldDatabase {
    file: File,
}

impl LockedOldDatabase {
    /// Opens `path` read-only and takes an exclusive advisory lock.
    /// Contention maps to `LockHeld` (spec.md §7): a concurrent `updatedb`
    /// run is presumably already in progress.
    pub fn open(path: &Path) -> CoreResult<Option<Self>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::OutputIo { path: path.to_path_buf(), source: e }),
        };
        file.try_lock_exclusive().map_err(|_| CoreError::LockHeld { path: path.to_path_buf() })?;
        Ok(Some(LockedOldDatabase { file }))
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

impl Drop for LockedOldDatabase {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Installs `SIGINT`/`SIGTERM`/`SIGABRT` handlers that flip a shared flag
/// instead of running cleanup logic on the signal thread -- the merge loop
/// polls the flag between directories and unwinds normally, letting
/// [`PendingDatabase`]'s `Drop` do the actual cleanup (spec.md §4.9, §9).
pub fn install_abort_flag() -> CoreResult<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM, SIGABRT] {
        signal_hook::flag::register(sig, Arc::clone(&flag))
            .map_err(|e| CoreError::Config(format!("failed to install signal handler: {e}")))?;
    }
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn uncommitted_pending_database_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mlocate.db");
        let temp_path = {
            let pending = PendingDatabase::create(&target).unwrap();
            pending.temp.as_ref().unwrap().path().to_path_buf()
            // pending dropped here without commit
        };
        assert!(!temp_path.exists());
        assert!(!target.exists());
    }

    #[test]
    fn commit_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mlocate.db");
        let mut pending = PendingDatabase::create(&target).unwrap();
        pending.file_mut().write_all(b"hello").unwrap();
        pending.commit().unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }

    #[test]
    fn visibility_mode_sets_0640() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mlocate.db");
        let mut pending = PendingDatabase::create(&target).unwrap();
        pending.set_mode(true).unwrap();
        let mode = pending.file().metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn second_open_of_locked_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mlocate.db");
        fs::write(&target, b"old").unwrap();
        let _held = LockedOldDatabase::open(&target).unwrap().unwrap();
        let second = File::open(&target).unwrap();
        assert!(second.try_lock_exclusive().is_err());
    }

    #[test]
    fn missing_old_database_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.db");
        assert!(LockedOldDatabase::open(&missing).unwrap().is_none());
    }
}
