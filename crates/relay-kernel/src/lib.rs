//! Relay kernel.
//!
//! Foundational services shared by the agent engine:
//!
//! - **[`registry`]** -- Generic name → implementation directory backed by
//!   [`dashmap::DashMap`]; one instance each for agents, tools and
//!   middlewares.
//! - **[`events`]** -- Append-only event log persisted in the reserved
//!   `events` state, with primary and watch cursors.
//! - **[`dispatcher`]** -- Background tokio task that polls the log and
//!   delivers events to async handlers in timestamp order.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod registry;

// Re-export the most commonly used types at the crate root for convenience.
pub use dispatcher::{DEFAULT_POLL_INTERVAL, Dispatcher, DispatcherConfig, EventHandler, WILDCARD};
pub use error::{KernelError, Result};
pub use events::{CursorMode, EVENTS_STATE, Event, EventLog};
pub use registry::Registry;
