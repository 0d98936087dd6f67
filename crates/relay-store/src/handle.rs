//! Path handles into a cached state tree.
//!
//! A [`StateHandle`] names one node of one state by path.  Handles are
//! cheap to clone and resolve their path on every call, so a handle taken
//! before a write still sees the written value.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::StoreResult;
use crate::node::{NodeLocation, StateNode};
use crate::store::{SharedRoot, StateStore, lock_root};
use crate::tree;

/// A handle onto the node at `path` within state `name`.
#[derive(Clone)]
pub struct StateHandle {
    store: StateStore,
    name: String,
    root: SharedRoot,
    path: Vec<String>,
}

impl StateHandle {
    pub(crate) fn new(store: StateStore, name: String, root: SharedRoot) -> Self {
        Self {
            store,
            name,
            root,
            path: Vec::new(),
        }
    }

    /// Name of the state this handle belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key path from the state root to this node.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Persistence location of this node.
    pub fn location(&self) -> NodeLocation {
        NodeLocation::root(self.name.as_str()).join(&self.path)
    }

    /// Handle onto a child of this node.  The child need not exist yet.
    #[must_use]
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut path = self.path.clone();
        path.push(key.into());
        Self {
            store: self.store.clone(),
            name: self.name.clone(),
            root: Arc::clone(&self.root),
            path,
        }
    }

    /// `true` when both handles share the same cached root object.
    pub fn same_root(&self, other: &StateHandle) -> bool {
        Arc::ptr_eq(&self.root, &other.root)
    }

    fn read<T>(&self, f: impl FnOnce(Option<&StateNode>) -> T) -> StoreResult<T> {
        let guard = lock_root(&self.root)?;
        Ok(f(guard.descend(&self.path)))
    }

    // ── reads ───────────────────────────────────────────────────────

    /// Whether a node exists at this handle's path.
    pub fn exists(&self) -> StoreResult<bool> {
        self.read(|node| node.is_some())
    }

    /// JSON snapshot of this node, or `null` if it does not exist.
    pub fn snapshot(&self) -> StoreResult<Value> {
        self.read(|node| node.map(StateNode::to_value).unwrap_or(Value::Null))
    }

    /// JSON snapshot of child `key`, if present.
    pub fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read(|node| {
            node.and_then(|n| n.child(key))
                .map(StateNode::to_value)
        })
    }

    /// Child `key` decoded as `T`.  A value of the wrong shape reads as
    /// `None`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let Some(value) = self.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) => {
                warn!(node = %self.location().child(key), error = %e, "state value has unexpected shape");
                Ok(None)
            }
        }
    }

    /// This node decoded as `T`; missing or mis-shaped reads as `None`.
    pub fn value_as<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
        let value = self.snapshot()?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(serde_json::from_value(value).ok())
    }

    pub fn contains_key(&self, key: &str) -> StoreResult<bool> {
        self.read(|node| node.and_then(|n| n.child(key)).is_some())
    }

    /// Number of children (0 for scalars and missing nodes).
    pub fn len(&self) -> StoreResult<usize> {
        self.read(|node| node.map_or(0, StateNode::len))
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Child keys of a dict, or indices of a list.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        self.read(|node| match node {
            Some(StateNode::Dict(children)) => children.keys().cloned().collect(),
            Some(StateNode::List(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
            _ => Vec::new(),
        })
    }

    // ── writes ──────────────────────────────────────────────────────

    /// Assign `value` to this node, creating missing parents.
    ///
    /// Objects merge into an existing dict; everything else replaces.
    pub fn assign(&self, value: impl Into<Value>) -> StoreResult<()> {
        let value = value.into();
        let root = NodeLocation::root(self.name.as_str());
        self.store.mutate(&self.name, &self.root, |backend, node| {
            tree::assign_at(backend, node, &root, &self.path, value)
        })
    }

    /// Assign `value` to child `key`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> StoreResult<()> {
        self.child(key).assign(value)
    }

    /// Append `value` to the list at this node, creating it if missing.
    pub fn append(&self, value: impl Into<Value>) -> StoreResult<()> {
        let value = value.into();
        let root = NodeLocation::root(self.name.as_str());
        self.store.mutate(&self.name, &self.root, |backend, node| {
            tree::append_at(backend, node, &root, &self.path, value)
        })
    }

    /// Remove child `key`.  Returns `false` if it was not there.
    pub fn remove(&self, key: &str) -> StoreResult<bool> {
        let root = NodeLocation::root(self.name.as_str());
        self.store.mutate(&self.name, &self.root, |backend, node| {
            tree::remove_at(backend, node, &root, &self.path, key)
        })
    }

    /// Run `f` on this node while holding the state's lock, then persist
    /// the value it returns (if any) with [`assign`](Self::assign)
    /// semantics.  Use for read-modify-write sequences.
    pub fn update<F>(&self, f: F) -> StoreResult<Option<Value>>
    where
        F: FnOnce(&Value) -> Option<Value>,
    {
        let root = NodeLocation::root(self.name.as_str());
        self.store.mutate(&self.name, &self.root, |backend, node| {
            let current = node
                .descend(&self.path)
                .map(StateNode::to_value)
                .unwrap_or(Value::Null);
            match f(&current) {
                Some(next) => {
                    tree::assign_at(backend, node, &root, &self.path, next.clone())?;
                    Ok(Some(next))
                }
                None => Ok(None),
            }
        })
    }
}

impl std::fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandle")
            .field("state", &self.name)
            .field("path", &self.path)
            .finish()
    }
}
