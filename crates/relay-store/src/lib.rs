//! # relay-store
//!
//! Persistent hierarchical state for Relay.
//!
//! Named states are JSON-like trees (dicts, lists and scalars) that write
//! through to durable storage on every mutation and are re-read lazily
//! after the cache is reset, so several processes can share one state
//! root.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  StateStore (DashMap root cache)        │
//! │  StateHandle (path into a cached root)  │
//! ├─────────────────────────────────────────┤
//! │  tree: load / materialize / merge       │
//! ├─────────────────────────────────────────┤
//! │  DirectoryBackend (__type.json/val.json)│
//! │  SqliteBackend    (WAL, migrations)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use relay_store::StateStore;
//! use serde_json::json;
//!
//! let store = StateStore::open_directory(".states")?;
//! store.set("config", json!({ "retries": 3 }))?;
//! let retries: Option<u32> = store.get("config")?.get_as("retries")?;
//! ```

pub mod backend;
pub mod error;
pub mod handle;
pub mod migration;
pub mod node;
pub mod store;
mod tree;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{DirectoryBackend, NodeRecord, SqliteBackend, StateBackend};
pub use error::{StoreError, StoreResult};
pub use handle::StateHandle;
pub use node::{ContainerKind, NodeLocation, StateNode, sanitize_segment};
pub use store::{ChangeCallback, StateStore};
