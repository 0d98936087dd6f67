//! Persistence backends for state trees.
//!
//! A backend stores one record per node: an optional scalar body and an
//! optional container marker, both as raw JSON text.  Decoding (and the
//! degraded-read policy for malformed records) lives in the loader, so
//! every backend shares exactly the same read semantics.

mod directory;
mod sqlite;

pub use directory::{DirectoryBackend, TYPE_FILE, VALUE_FILE};
pub use sqlite::SqliteBackend;

use serde_json::Value;

use crate::error::StoreResult;
use crate::node::{ContainerKind, NodeLocation};

/// Raw stored form of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    /// Scalar body, if the node holds a scalar.
    pub scalar: Option<String>,
    /// Container marker body, if the node is a container.
    pub marker: Option<String>,
}

impl NodeRecord {
    /// Neither a scalar nor a marker is stored at this location.
    pub fn is_missing(&self) -> bool {
        self.scalar.is_none() && self.marker.is_none()
    }
}

/// Storage for the node records of every named state.
///
/// All writes are synchronous: when a method returns, the change is
/// durable as far as the backend can guarantee.
pub trait StateBackend: Send + Sync {
    /// Record that the node at `location` is a container of `kind`.
    fn write_marker(&self, location: &NodeLocation, kind: ContainerKind) -> StoreResult<()>;

    /// Store a scalar value at `location`.
    fn write_scalar(&self, location: &NodeLocation, value: &Value) -> StoreResult<()>;

    /// Read the raw record stored at `location`.
    fn read(&self, location: &NodeLocation) -> StoreResult<NodeRecord>;

    /// Names of the direct child nodes of `location`, sorted.
    fn children(&self, location: &NodeLocation) -> StoreResult<Vec<String>>;

    /// Remove the node at `location` and its entire subtree.  Removing a
    /// missing node is not an error.
    fn remove(&self, location: &NodeLocation) -> StoreResult<()>;

    /// Names of every persisted state, sorted.
    fn state_names(&self) -> StoreResult<Vec<String>>;

    /// Human-readable description used in log lines.
    fn describe(&self) -> String;
}
