//! Cross-process mutual exclusion backed by an advisory file lock.
//!
//! A [`ProcessLock`] is reentrant *per process*: the OS lock is taken on the
//! first [`acquire`](ProcessLock::acquire) and dropped on the matching last
//! [`release`](ProcessLock::release). Every handle created for the same lock
//! file inside one process shares the same nesting depth, regardless of which
//! thread or task is holding it. Threads of one process are therefore *not*
//! isolated from each other by this lock; the process is the serialization
//! boundary.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

/// Per-process registry of lock states. Keyed by pid so a forked child never
/// inherits its parent's depth (or its parent's open file description).
static REGISTRY: LazyLock<Mutex<HashMap<(u32, PathBuf), Arc<Shared>>>> = LazyLock::new(Default::default);

struct Shared {
    path: PathBuf,
    /// Held by the one thread taking the OS lock; `state` stays free meanwhile.
    opening: Mutex<()>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    depth: usize,
    file: Option<File>,
}

/// A reentrant, process-wide exclusive lock on a named lock file.
///
/// Cloning is cheap and clones share state with every other handle for the
/// same path.
///
/// ```no_run
/// use kmanga_cache::ProcessLock;
/// # fn example() -> kmanga_cache::error::Result<()> {
/// let lock = ProcessLock::new("/var/cache/kmanga/issue.db.lck");
/// {
///     let _outer = lock.guard()?;
///     let _inner = lock.guard()?; // reentrant
///     assert_eq!(lock.depth(), 2);
/// }
/// assert!(!lock.is_held());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProcessLock {
    shared: Arc<Shared>,
}
impl ProcessLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = std::path::absolute(path.as_ref()).unwrap_or_else(|_| path.as_ref().to_path_buf());
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = registry
            .entry((std::process::id(), path.clone()))
            .or_insert_with(|| Arc::new(Shared { path, opening: Mutex::new(()), state: Mutex::new(State::default()) }))
            .clone();
        Self { shared }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins an acquisition already held by this process.
    fn reenter(&self) -> bool {
        let mut state = self.state();
        if state.depth == 0 {
            return false;
        }
        state.depth += 1;
        true
    }

    /// Blocks until this process holds the lock.
    ///
    /// Only the first (outermost) acquisition touches the filesystem; nested
    /// acquisitions just increase the depth. While the OS lock is awaited,
    /// [`depth`](Self::depth) and [`release`](Self::release) stay usable and
    /// other threads acquiring the same lock queue behind the waiting one.
    pub fn acquire(&self) -> Result<()> {
        if self.reenter() {
            return Ok(());
        }
        let _opening = self.shared.opening.lock().unwrap_or_else(PoisonError::into_inner);
        if self.reenter() {
            return Ok(());
        }
        let path = &self.shared.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Lock(path.clone()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .or_raise(|| ErrorKind::Lock(path.clone()))?;
        tracing::trace!(path = %path.display(), "Waiting for process lock");
        file.lock().or_raise(|| ErrorKind::Lock(path.clone()))?;
        let mut state = self.state();
        state.file = Some(file);
        state.depth = 1;
        Ok(())
    }

    /// Releases one level of nesting, dropping the OS lock when the depth
    /// reaches zero.
    ///
    /// Returns [`ErrorKind::ImbalancedLock`] if the lock isn't held.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state();
        if state.depth == 0 {
            exn::bail!(ErrorKind::ImbalancedLock(self.shared.path.clone()));
        }
        state.depth -= 1;
        if state.depth == 0
            && let Some(file) = state.file.take()
        {
            file.unlock().or_raise(|| ErrorKind::Lock(self.shared.path.clone()))?;
            tracing::trace!(path = %self.shared.path.display(), "Process lock released");
        }
        Ok(())
    }

    /// Acquires the lock and returns a guard that releases it when dropped,
    /// including on early returns and panics.
    pub fn guard(&self) -> Result<LockGuard<'_>> {
        self.acquire()?;
        Ok(LockGuard { lock: self })
    }

    /// Current nesting depth within this process.
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }
}

/// Scoped acquisition of a [`ProcessLock`].
pub struct LockGuard<'a> {
    lock: &'a ProcessLock,
}
impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            tracing::error!(error = ?e, "Failed to release process lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::ops::Deref;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(7)]
    fn test_reentrant_acquire_release(#[case] n: usize) {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock::new(dir.path().join("test.lck"));
        for _ in 0..n {
            lock.acquire().unwrap();
        }
        assert_eq!(lock.depth(), n);
        for _ in 0..n {
            lock.release().unwrap();
        }
        assert!(!lock.is_held());
        let err = lock.release().unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::ImbalancedLock(_)));
    }

    #[test]
    fn test_handles_share_depth() {
        let dir = tempfile::tempdir().unwrap();
        let a = ProcessLock::new(dir.path().join("shared.lck"));
        let b = ProcessLock::new(dir.path().join("shared.lck"));
        a.acquire().unwrap();
        assert_eq!(b.depth(), 1);
        b.release().unwrap();
        assert!(!a.is_held());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock::new(dir.path().join("guard.lck"));
        {
            let _outer = lock.guard().unwrap();
            let _inner = lock.guard().unwrap();
            assert_eq!(lock.depth(), 2);
        }
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock::new(dir.path().join("panic.lck"));
        let result = std::panic::catch_unwind(|| {
            let _guard = lock.guard().unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_lock_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.lck");
        let lock = ProcessLock::new(&path);
        let _guard = lock.guard().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_os_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclusive.lck");
        let lock = ProcessLock::new(&path);
        let _guard = lock.guard().unwrap();
        // A separate open file description contends with the held lock, the
        // same way another process would.
        let other = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(other.try_lock().is_err());
        drop(_guard);
        assert!(other.try_lock().is_ok());
    }

    #[test]
    fn test_waiting_acquire_leaves_state_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contended.lck");
        let other = OpenOptions::new().create(true).truncate(false).write(true).open(&path).unwrap();
        other.lock().unwrap();
        let lock = ProcessLock::new(&path);
        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || lock.acquire())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        assert_eq!(lock.depth(), 0);
        other.unlock().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(lock.depth(), 1);
        lock.release().unwrap();
    }
}
