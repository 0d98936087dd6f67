//! Embedded SQLite backend.
//!
//! Every node is a row in `state_nodes`, keyed by its sanitized path
//! (`state/key/0/...`).  Writes go through a single connection guarded by
//! a mutex, so each call is one atomic statement; WAL mode keeps readers
//! from other processes unblocked.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use super::{NodeRecord, StateBackend};
use crate::error::{StoreError, StoreResult};
use crate::migration;
use crate::node::{ContainerKind, NodeLocation};

/// State backend stored in a single SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    label: String,
}

impl SqliteBackend {
    /// Open (or create) a database at `path`, apply pragmas and migrate.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening sqlite state backend");
        let conn = Connection::open(path)?;
        Self::init(conn, format!("sqlite:{}", path.display()))
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory sqlite state backend");
        Self::init(Connection::open_in_memory()?, "sqlite::memory:".to_string())
    }

    fn init(conn: Connection, label: String) -> StoreResult<Self> {
        // WAL: other processes can read while we write.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
        migration::run_all(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            label,
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Poisoned(format!("mutex poisoned: {e}")))
    }

    /// Insert placeholder rows for every ancestor of `location` so child
    /// listings find the node.
    fn ensure_ancestors(conn: &Connection, location: &NodeLocation) -> StoreResult<()> {
        let components = location.components();
        for depth in 1..components.len() {
            let path = components[..depth].join("/");
            let parent = (depth > 1).then(|| components[..depth - 1].join("/"));
            conn.execute(
                "INSERT OR IGNORE INTO state_nodes (path, parent, name) VALUES (?1, ?2, ?3)",
                params![path, parent, components[depth - 1]],
            )?;
        }
        Ok(())
    }

    fn upsert(
        &self,
        location: &NodeLocation,
        marker: Option<String>,
        value: Option<String>,
    ) -> StoreResult<()> {
        let components = location.components();
        let name = components.last().cloned().unwrap_or_default();
        let conn = self.conn()?;
        Self::ensure_ancestors(&conn, location)?;
        conn.execute(
            "INSERT INTO state_nodes (path, parent, name, marker, value)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET marker = excluded.marker, value = excluded.value",
            params![location.key(), location.parent_key(), name, marker, value],
        )?;
        Ok(())
    }
}

impl StateBackend for SqliteBackend {
    fn write_marker(&self, location: &NodeLocation, kind: ContainerKind) -> StoreResult<()> {
        self.upsert(location, Some(kind.marker_json()), None)
    }

    fn write_scalar(&self, location: &NodeLocation, value: &Value) -> StoreResult<()> {
        self.upsert(location, None, Some(serde_json::to_string(value)?))
    }

    fn read(&self, location: &NodeLocation) -> StoreResult<NodeRecord> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT marker, value FROM state_nodes WHERE path = ?1",
                params![location.key()],
                |row| {
                    Ok(NodeRecord {
                        marker: row.get(0)?,
                        scalar: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record.unwrap_or_default())
    }

    fn children(&self, location: &NodeLocation) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name FROM state_nodes WHERE parent = ?1 ORDER BY name")?;
        let names = stmt
            .query_map(params![location.key()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn remove(&self, location: &NodeLocation) -> StoreResult<()> {
        let key = location.key();
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM state_nodes
             WHERE path = ?1 OR substr(path, 1, length(?1) + 1) = ?1 || '/'",
            params![key],
        )?;
        debug!(node = %location, removed, "removed node rows");
        Ok(())
    }

    fn state_names(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT name FROM state_nodes WHERE parent IS NULL ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

// ── tests ────────────────────────────────────────────────────────────
