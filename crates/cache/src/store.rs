//! Persistent key/value index guarded by a [`ProcessLock`].
//!
//! Only one process at a time has an index open. The lock is taken by the
//! first [`DurableStore::open`] in a process and dropped by the matching last
//! [`DurableStore::close`]; nested opens in between share a single connection
//! pool. This mirrors the reference counting of [`ProcessLock`] itself.

use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::lock::ProcessLock;
use crate::table::Table;
use std::collections::HashMap;
use std::ffi::OsString;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::instrument;

static REGISTRY: LazyLock<Mutex<HashMap<(u32, PathBuf), Arc<Shared>>>> = LazyLock::new(Default::default);

struct Shared {
    path: PathBuf,
    lock: ProcessLock,
    /// Serializes the first open so only one task connects.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    depth: usize,
    db: Option<Database>,
}

/// Releases the process lock if an open is abandoned half-way (connection
/// failure, or the opening future being dropped).
struct Rollback<'a>(Option<&'a ProcessLock>);
impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.0.take()
            && let Err(e) = lock.release()
        {
            tracing::error!(error = ?e, "Failed to roll back process lock");
        }
    }
}

/// A persistent associative table, opened at most once per process.
///
/// The index lives at `path`; its lock file is the sibling `<path>.lck`.
#[derive(Clone)]
pub struct DurableStore {
    shared: Arc<Shared>,
}
impl DurableStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = std::path::absolute(path.as_ref()).unwrap_or_else(|_| path.as_ref().to_path_buf());
        let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        let shared = registry
            .entry((std::process::id(), path.clone()))
            .or_insert_with(|| {
                Arc::new(Shared {
                    lock: ProcessLock::new(Self::lock_path(&path)),
                    path,
                    gate: tokio::sync::Mutex::new(()),
                    state: Mutex::new(State::default()),
                })
            })
            .clone();
        Self { shared }
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut lock = OsString::from(path.as_os_str());
        lock.push(".lck");
        PathBuf::from(lock)
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The lock guarding this store.
    pub fn lock(&self) -> &ProcessLock {
        &self.shared.lock
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bumps the depth and hands out the shared table if already open.
    fn reuse(&self) -> Option<Table> {
        let mut state = self.state();
        match state.db.clone() {
            Some(db) if state.depth > 0 => {
                state.depth += 1;
                Some(Table::new(db))
            },
            _ => None,
        }
    }

    /// Opens the table, blocking until this process holds the store's lock.
    ///
    /// Must be balanced by exactly one [`close`](Self::close).
    #[instrument(skip_all, fields(path = %self.shared.path.display()))]
    pub async fn open(&self) -> Result<Table> {
        if let Some(table) = self.reuse() {
            return Ok(table);
        }
        let _gate = self.shared.gate.lock().await;
        if let Some(table) = self.reuse() {
            return Ok(table);
        }
        // Not `spawn_blocking`: a cancelled task would still take the lock with
        // nobody left to release it. Nested opens never reach this point.
        self.acquire_lock()?;
        let mut rollback = Rollback(Some(&self.shared.lock));
        let db = Database::connect(&self.shared.path).await?;
        {
            let mut state = self.state();
            state.db = Some(db.clone());
            state.depth = 1;
        }
        rollback.0 = None;
        tracing::debug!("Durable store opened");
        Ok(Table::new(db))
    }

    /// Takes the OS lock, handing this worker's other tasks to another thread
    /// while it waits when the runtime allows it.
    fn acquire_lock(&self) -> Result<()> {
        let lock = &self.shared.lock;
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| lock.acquire()),
            _ => lock.acquire(),
        }
    }

    /// Closes one level of nesting. The last close drops the connection pool
    /// and then the process lock.
    ///
    /// Returns [`ErrorKind::ImbalancedOpen`] if the store isn't open.
    pub fn close(&self) -> Result<()> {
        let db = {
            let mut state = self.state();
            if state.depth == 0 {
                exn::bail!(ErrorKind::ImbalancedOpen(self.shared.path.clone()));
            }
            state.depth -= 1;
            if state.depth > 0 {
                return Ok(());
            }
            state.db.take()
        };
        // Every write was committed by its own statement; dropping the last
        // pool handle closes the connections.
        drop(db);
        self.shared.lock.release()?;
        tracing::debug!(path = %self.shared.path.display(), "Durable store closed");
        Ok(())
    }

    /// Opens the table and returns a guard that closes it when dropped.
    pub async fn scoped(&self) -> Result<StoreGuard<'_>> {
        let table = self.open().await?;
        Ok(StoreGuard { store: self, table })
    }

    /// Current open depth within this process.
    pub fn depth(&self) -> usize {
        self.state().depth
    }

    pub fn is_open(&self) -> bool {
        self.depth() > 0
    }
}

/// Scoped acquisition of a [`DurableStore`]; derefs to the open [`Table`].
pub struct StoreGuard<'a> {
    store: &'a DurableStore,
    table: Table,
}
impl Deref for StoreGuard<'_> {
    type Target = Table;
    fn deref(&self) -> &Table {
        &self.table
    }
}
impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.store.close() {
            tracing::error!(error = ?e, "Failed to close durable store");
        }
    }
}
