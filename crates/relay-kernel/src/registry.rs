//! Named registries.
//!
//! A [`Registry`] maps unique names to shared implementations.  The same
//! type backs the agent, tool and middleware directories: registering a
//! name that already exists overwrites it, and looking up a missing name
//! is a [`KernelError::NotFound`].
//!
//! Internally the registry is backed by [`DashMap`], so it can be shared
//! across tasks without a global lock.
//!
//! # Example
//!
//! ```rust
//! # use std::sync::Arc;
//! # use relay_kernel::Registry;
//! let tools: Registry<str> = Registry::new("tool");
//! tools.register("greeting", Arc::from("hello"));
//!
//! assert_eq!(&*tools.lookup("greeting").unwrap(), "hello");
//! assert!(tools.lookup("missing").unwrap_err().is_not_found());
//! ```

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::{KernelError, Result};

/// Concurrent name → implementation directory.
///
/// Cheap to clone (`Arc`-backed); clones share entries.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: Arc<DashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    /// Create an empty registry.  `kind` names the entries in errors and
    /// log lines.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Store `entry` under `name`, replacing any previous entry, and return
    /// it.
    pub fn register(&self, name: impl Into<String>, entry: Arc<T>) -> Arc<T> {
        let name = name.into();
        let replaced = self.entries.insert(name.clone(), Arc::clone(&entry)).is_some();
        debug!(kind = self.kind, name = %name, replaced, "registered");
        entry
    }

    /// The entry registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<Arc<T>> {
        self.get(name).ok_or_else(|| KernelError::NotFound {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    /// The entry registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
