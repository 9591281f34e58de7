//! Single-flight lock backed by a file in the working directory.
//!
//! The lock is advisory: every entry point into the orchestrator must go
//! through [`acquire`]. Presence plus modification time encode the state;
//! absence means unlocked. A lock file older than the staleness threshold is
//! treated as abandoned by a crashed run and evicted.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Lock files currently held by this process, so a termination signal
/// handler can release them when guards never get to drop.
static HELD_LOCKS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Remove every lock file this process currently holds.
///
/// For SIGINT/SIGTERM handlers only: a signal that exits the process skips
/// every `Drop`, so the guards cannot release themselves. Foreign locks are
/// never touched; only paths registered by [`acquire`] are removed.
pub fn release_held_locks() {
    let Ok(mut held) = HELD_LOCKS.lock() else {
        return;
    };
    for path in held.drain(..) {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to release lock"),
        }
    }
}

fn register(path: &Path) {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        held.push(path.to_path_buf());
    }
}

fn unregister(path: &Path) {
    if let Ok(mut held) = HELD_LOCKS.lock() {
        held.retain(|held_path| held_path != path);
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// A live (non-stale) lock exists; the caller must skip this trigger.
    #[error("another run holds {path} (age {age_secs}s)")]
    Contention { path: PathBuf, age_secs: u64 },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exclusive ownership of the working directory for one run.
///
/// The lock file is removed when the guard drops, so every exit path —
/// early returns, sync failures, panics — releases the lock. Removal is
/// idempotent: a missing file is not an error.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        unregister(&self.path);
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "lock released"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "failed to release lock"),
        }
    }
}

/// Acquire the lock at `path`, evicting a stale holder if necessary.
///
/// Acquisition is atomic (`create_new`). When the file already exists its
/// age decides the outcome: older than `stale_after` means the previous run
/// crashed, so the file is removed and creation retried exactly once;
/// younger means a live run and [`LockError::Contention`]. Two processes
/// racing the same stale eviction may both pass the removal; the retried
/// `create_new` admits at most one of them per created file, which is the
/// accepted trade-off after a crash.
pub fn acquire(path: &Path, stale_after: Duration) -> Result<LockGuard, LockError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }

    match try_create(path) {
        Ok(()) => {
            debug!(path = %path.display(), "lock acquired");
            register(path);
            return Ok(LockGuard {
                path: path.to_path_buf(),
            });
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    // The holder may release between our create attempt and the stat; a
    // vanished file just means the eviction path can proceed to the retry.
    if let Some(age) = lock_age(path)? {
        if age <= stale_after {
            return Err(LockError::Contention {
                path: path.to_path_buf(),
                age_secs: age.as_secs(),
            });
        }
        warn!(path = %path.display(), age_secs = age.as_secs(), "evicting stale lock");
    }
    if let Err(source) = fs::remove_file(path)
        && source.kind() != io::ErrorKind::NotFound
    {
        return Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        });
    }

    match try_create(path) {
        Ok(()) => {
            debug!(path = %path.display(), "lock acquired after eviction");
            register(path);
            Ok(LockGuard {
                path: path.to_path_buf(),
            })
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            // Lost the post-eviction race to another invocation.
            Err(LockError::Contention {
                path: path.to_path_buf(),
                age_secs: 0,
            })
        }
        Err(source) => Err(LockError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn try_create(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())
}

fn lock_age(path: &Path) -> Result<Option<Duration>, LockError> {
    let modified = match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    // Clock skew can make the mtime sit in the future; treat that as fresh.
    Ok(Some(modified.elapsed().unwrap_or(Duration::ZERO)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const NEVER_STALE: Duration = Duration::from_secs(60 * 60);

    // `release_held_locks` drains the process-wide registry, so tests that
    // hold a registered lock serialize against each other.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[test]
    fn acquire_creates_lock_file_with_pid() {
        let _serial = serial();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");

        let guard = acquire(&path, NEVER_STALE).expect("acquire");
        assert!(path.exists());
        let contents = fs::read_to_string(guard.path()).expect("read lock");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn drop_removes_the_lock_file() {
        let _serial = serial();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");

        let guard = acquire(&path, NEVER_STALE).expect("acquire");
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn fresh_lock_yields_contention() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");
        fs::write(&path, "4242\n").expect("plant foreign lock");

        let err = acquire(&path, NEVER_STALE).expect_err("should contend");
        assert!(matches!(err, LockError::Contention { .. }));
        // The foreign lock must survive a failed acquisition.
        assert!(path.exists());
    }

    #[test]
    fn stale_lock_is_evicted_and_reacquired() {
        let _serial = serial();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");
        fs::write(&path, "4242\n").expect("plant stale lock");
        thread::sleep(Duration::from_millis(30));

        let guard = acquire(&path, Duration::from_millis(5)).expect("evict and acquire");
        let contents = fs::read_to_string(guard.path()).expect("read lock");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn lock_younger_than_threshold_is_not_evicted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");
        fs::write(&path, "4242\n").expect("plant lock");

        let err = acquire(&path, Duration::from_secs(30)).expect_err("should contend");
        assert!(matches!(err, LockError::Contention { .. }));
    }

    #[test]
    fn release_is_idempotent_when_file_already_gone() {
        let _serial = serial();
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".run.lock");

        let guard = acquire(&path, NEVER_STALE).expect("acquire");
        fs::remove_file(&path).expect("remove underneath");
        drop(guard); // must not panic or error
        assert!(!path.exists());
    }

    #[test]
    fn signal_release_removes_held_locks_but_not_foreign_ones() {
        let _serial = serial();
        let temp = tempfile::tempdir().expect("tempdir");
        let held = temp.path().join(".run.lock");
        let foreign = temp.path().join("foreign.lock");
        fs::write(&foreign, "4242\n").expect("plant foreign lock");

        let guard = acquire(&held, NEVER_STALE).expect("acquire");
        release_held_locks();

        assert!(!held.exists(), "held lock removed by the signal path");
        assert!(foreign.exists(), "foreign lock untouched");
        drop(guard); // must tolerate the already-removed file
    }
}
