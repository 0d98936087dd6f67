//! Kernel error types.
//!
//! Registry lookups, the event log and the dispatcher all surface errors
//! through [`KernelError`].  Lookup failures carry the registry kind so a
//! caller can tell an unknown agent from an unknown tool.

use relay_store::StoreError;

/// Unified error type for the Relay kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// No entry is registered under the requested name.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Registry kind, e.g. `"agent"` or `"middleware"`.
        kind: &'static str,
        name: String,
    },

    // -- Event errors -------------------------------------------------------
    /// An event payload was not a JSON object.
    #[error("event payload for `{event_type}` must be an object, got {found}")]
    InvalidPayload { event_type: String, found: String },

    /// Encoding an event failed.
    #[error("event encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The dispatcher worker could not be joined.
    #[error("dispatcher task failed: {0}")]
    TaskJoin(String),

    // -- Storage ------------------------------------------------------------
    /// The backing state store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KernelError {
    /// `true` for a failed registry lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
