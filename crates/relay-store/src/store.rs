//! The named-state store.
//!
//! [`StateStore`] is a cheap-to-clone handle over a backend plus a cache of
//! loaded roots.  Repeated lookups of the same name share one cached root
//! until the cache is reset, so every handle observes every write.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::backend::{DirectoryBackend, SqliteBackend, StateBackend};
use crate::error::{StoreError, StoreResult};
use crate::handle::StateHandle;
use crate::node::{ContainerKind, NodeLocation, StateNode};
use crate::tree;

/// A cached state root shared by every handle onto that state.
pub(crate) type SharedRoot = Arc<Mutex<StateNode>>;

/// Change observer: receives the state name and a snapshot of its root.
pub type ChangeCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub(crate) fn lock_root(root: &SharedRoot) -> StoreResult<MutexGuard<'_, StateNode>> {
    root.lock()
        .map_err(|e| StoreError::Poisoned(format!("mutex poisoned: {e}")))
}

struct StoreInner {
    backend: Arc<dyn StateBackend>,
    roots: DashMap<String, SharedRoot>,
    on_change: RwLock<Option<ChangeCallback>>,
}

/// Process-wide registry of named persistent states.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// Wrap an arbitrary backend.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        info!(backend = %backend.describe(), "state store ready");
        Self {
            inner: Arc::new(StoreInner {
                backend,
                roots: DashMap::new(),
                on_change: RwLock::new(None),
            }),
        }
    }

    /// Store states as directory trees under `root`.
    pub fn open_directory(root: impl AsRef<Path>) -> StoreResult<Self> {
        let backend = DirectoryBackend::open(root.as_ref())?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// Store states in a SQLite database at `path`.
    pub fn open_sqlite(path: impl AsRef<Path>) -> StoreResult<Self> {
        let backend = SqliteBackend::open(path)?;
        Ok(Self::new(Arc::new(backend)))
    }

    /// A throwaway store backed by an in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Ok(Self::new(Arc::new(SqliteBackend::open_in_memory()?)))
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.inner.backend
    }

    /// Handle onto the root of state `name`, loading it on first access.
    ///
    /// A state that does not exist yet is created as an empty dict.
    pub fn get(&self, name: &str) -> StoreResult<StateHandle> {
        let root = self.root(name)?;
        Ok(StateHandle::new(self.clone(), name.to_string(), root))
    }

    /// Assign `value` to the root of state `name`.
    ///
    /// An object assigned onto a dict root merges into it; anything else
    /// replaces the root.
    #[instrument(skip(self, value))]
    pub fn set(&self, name: &str, value: Value) -> StoreResult<()> {
        let root = self.root(name)?;
        {
            let mut guard = lock_root(&root)?;
            tree::assign(
                self.inner.backend.as_ref(),
                &mut guard,
                &NodeLocation::root(name),
                value,
            )?;
        }
        self.notify(name, &root)
    }

    /// `true` when state `name` loads to a non-empty value.
    pub fn contains(&self, name: &str) -> StoreResult<bool> {
        let root = self.root(name)?;
        let guard = lock_root(&root)?;
        Ok(!guard.is_empty())
    }

    /// Drop state `name` from the cache and remove it from storage.
    #[instrument(skip(self))]
    pub fn delete(&self, name: &str) -> StoreResult<()> {
        self.inner.roots.remove(name);
        self.inner.backend.remove(&NodeLocation::root(name))?;
        info!(state = name, "state deleted");
        Ok(())
    }

    /// Forget every cached root; later lookups reload from storage.
    pub fn reset_cache(&self) {
        let dropped = self.inner.roots.len();
        self.inner.roots.clear();
        debug!(dropped, "state cache reset");
    }

    /// Forget the cached root of one state.
    pub fn evict(&self, name: &str) {
        self.inner.roots.remove(name);
    }

    /// Install the change observer, replacing any previous one.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.inner.on_change.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    /// Remove the change observer.
    pub fn clear_on_change(&self) {
        if let Ok(mut slot) = self.inner.on_change.write() {
            *slot = None;
        }
    }

    /// Names of every persisted state.
    pub fn names(&self) -> StoreResult<Vec<String>> {
        self.inner.backend.state_names()
    }

    // ── internals ───────────────────────────────────────────────────

    pub(crate) fn root(&self, name: &str) -> StoreResult<SharedRoot> {
        if let Some(root) = self.inner.roots.get(name) {
            return Ok(Arc::clone(root.value()));
        }

        match self.inner.roots.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let root = Arc::new(Mutex::new(self.load_root(name)?));
                entry.insert(Arc::clone(&root));
                Ok(root)
            }
        }
    }

    fn load_root(&self, name: &str) -> StoreResult<StateNode> {
        let backend = self.inner.backend.as_ref();
        let location = NodeLocation::root(name);
        if backend.read(&location)?.is_missing() && backend.children(&location)?.is_empty() {
            backend.write_marker(&location, ContainerKind::Dict)?;
            debug!(state = name, "created empty state");
            return Ok(StateNode::empty_dict());
        }
        let node = tree::load(backend, &location)?;
        debug!(state = name, entries = node.len(), "loaded state");
        Ok(node)
    }

    /// Run `f` against the cached root and the backend, then notify.
    pub(crate) fn mutate<T>(
        &self,
        name: &str,
        root: &SharedRoot,
        f: impl FnOnce(&dyn StateBackend, &mut StateNode) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let result = {
            let mut guard = lock_root(root)?;
            f(self.inner.backend.as_ref(), &mut guard)?
        };
        self.notify(name, root)?;
        Ok(result)
    }

    fn notify(&self, name: &str, root: &SharedRoot) -> StoreResult<()> {
        let callback = match self.inner.on_change.read() {
            Ok(slot) => slot.clone(),
            Err(e) => return Err(StoreError::Poisoned(format!("rwlock poisoned: {e}"))),
        };
        let Some(callback) = callback else {
            return Ok(());
        };
        let snapshot = lock_root(root)?.to_value();
        callback(name, &snapshot);
        Ok(())
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.inner.backend.describe())
            .field("cached", &self.inner.roots.len())
            .finish()
    }
}
