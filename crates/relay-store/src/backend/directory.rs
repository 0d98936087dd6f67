//! Directory-tree backend.
//!
//! Each node is a directory named after its sanitized key.  Containers
//! hold a `__type.json` marker (`{"type":"dict"}` or `{"type":"list"}`),
//! scalars hold a `val.json` body, and list children are directories named
//! by their integer index.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{NodeRecord, StateBackend};
use crate::error::StoreResult;
use crate::node::{ContainerKind, NodeLocation};

/// File holding a container's type marker.
pub const TYPE_FILE: &str = "__type.json";
/// File holding a scalar's JSON value.
pub const VALUE_FILE: &str = "val.json";

/// Stores state trees under a root directory, one subdirectory per state.
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    /// Use (and create if needed) `root` as the state directory.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "opened directory state backend");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory backing the node at `location`.
    pub fn node_dir(&self, location: &NodeLocation) -> PathBuf {
        let mut dir = self.root.clone();
        dir.extend(location.components());
        dir
    }

    fn read_optional(path: &Path) -> StoreResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                // Not UTF-8: hand the loader a body it will reject.
                warn!(path = %path.display(), error = %e, "unreadable state file");
                Ok(Some(String::new()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_dirs(dir: &Path) -> StoreResult<Vec<String>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl StateBackend for DirectoryBackend {
    fn write_marker(&self, location: &NodeLocation, kind: ContainerKind) -> StoreResult<()> {
        let dir = self.node_dir(location);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(TYPE_FILE), kind.marker_json())?;
        debug!(node = %location, kind = kind.as_str(), "wrote container marker");
        Ok(())
    }

    fn write_scalar(&self, location: &NodeLocation, value: &Value) -> StoreResult<()> {
        let dir = self.node_dir(location);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(VALUE_FILE), serde_json::to_string(value)?)?;
        Ok(())
    }

    fn read(&self, location: &NodeLocation) -> StoreResult<NodeRecord> {
        let dir = self.node_dir(location);
        Ok(NodeRecord {
            scalar: Self::read_optional(&dir.join(VALUE_FILE))?,
            marker: Self::read_optional(&dir.join(TYPE_FILE))?,
        })
    }

    fn children(&self, location: &NodeLocation) -> StoreResult<Vec<String>> {
        Self::list_dirs(&self.node_dir(location))
    }

    fn remove(&self, location: &NodeLocation) -> StoreResult<()> {
        let dir = self.node_dir(location);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(node = %location, "removed node directory");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn state_names(&self) -> StoreResult<Vec<String>> {
        Self::list_dirs(&self.root)
    }

    fn describe(&self) -> String {
        format!("directory:{}", self.root.display())
    }
}

// ── tests ────────────────────────────────────────────────────────────
