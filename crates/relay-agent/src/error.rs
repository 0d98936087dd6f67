//! Agent error types.
//!
//! All agent subsystems surface errors through [`AgentError`].  Each variant
//! carries enough context for callers to decide how to handle the failure.

use std::path::PathBuf;

use relay_kernel::KernelError;
use relay_store::StoreError;

/// Unified error type for the agent engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Engine errors -------------------------------------------------------
    /// A stage kept requesting inference past the configured bound.
    #[error("agent `{agent}` exceeded {rounds} inference rounds in stage `{stage}`")]
    InferenceLimitExceeded {
        agent: String,
        stage: String,
        rounds: u32,
    },

    /// A conversation requested inference without a model selector and no
    /// default model is configured.
    #[error("agent `{agent}` requested inference without a model selector")]
    NoModelSelected { agent: String },

    /// A stage received a value of the wrong shape.
    #[error("expected {expected}, got {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: &'static str,
    },

    /// A paused run was cancelled.
    #[error("execution cancelled")]
    Cancelled,

    // -- Inference errors ----------------------------------------------------
    /// The inference collaborator failed.
    #[error("inference with `{model}` failed: {reason}")]
    Inference { model: String, reason: String },

    // -- Prompt and transcript errors ----------------------------------------
    /// No base prompt file exists for the agent.
    #[error("no prompt `{agent}.conv` under {}", root.display())]
    PromptNotFound { agent: String, root: PathBuf },

    /// A transcript could not be decoded.
    #[error("malformed transcript: {reason}")]
    Transcript { reason: String },

    /// A message role is not one of the known roles.
    #[error("unknown message role `{role}`")]
    InvalidRole { role: String },

    // -- Tool errors ---------------------------------------------------------
    /// A tool rejected its arguments or failed while running.
    #[error("tool `{tool}` failed: {reason}")]
    Tool { tool: String, reason: String },

    // -- Configuration errors ------------------------------------------------
    /// Configuration validation or loading failed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    // -- Serialization and I/O -----------------------------------------------
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    /// An error propagated from the state store.
    #[error("state error: {0}")]
    Store(#[from] StoreError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// `true` when an agent, tool or middleware name was not registered.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, Self::Kernel(KernelError::NotFound { .. }))
    }
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;
