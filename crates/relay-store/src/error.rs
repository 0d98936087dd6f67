//! Error types for the relay-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Malformed stored JSON is *not* an error: the loader degrades it to
//! `null` or an empty container, so these variants only cover real I/O
//! failures and misuse of the tree API.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization failed while writing a scalar.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// A path segment tried to descend through a scalar value.
    #[error("cannot descend into scalar at {path}")]
    NotAContainer { path: String },

    /// `append` was called on a node that is not a list.
    #[error("node at {path} is not a list")]
    NotAList { path: String },

    /// A list segment did not parse as a non-negative integer.
    #[error("invalid list index `{segment}` at {path}")]
    InvalidIndex { path: String, segment: String },

    /// A list index pointed past the end of the list.
    #[error("index {index} out of range for list of length {len} at {path}")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    /// A lock guarding a cached root was poisoned by a panicking writer.
    #[error("state lock poisoned: {0}")]
    Poisoned(String),
}
