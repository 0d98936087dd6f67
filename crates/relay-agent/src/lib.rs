//! Relay agent engine.
//!
//! Agents are named pipelines of middlewares.  A middleware transforms the
//! value flowing through the pipeline and may ask for an inference round
//! by returning a [`Conversation`] with `should_infer` set; the engine then
//! calls the [`Inference`] collaborator, appends the reply and runs the
//! same middleware again.
//!
//! - **[`runtime`]** -- Explicit context: registries, state store, event
//!   log, inference collaborator, prompts and execution tracking.
//! - **[`engine`]** -- [`Agent`] and the per-stage inference loop.
//! - **[`entities`]** -- [`Message`], [`Conversation`] and the transcript
//!   text format.
//! - **[`middlewares`]** -- Built-in stages (`prompt`, `fakeLLM`, ...).
//! - **[`tools`]** -- [`Tool`] trait, tool execution, [`WithTools`].
//! - **[`exec`]** -- Execution bookkeeping and the [`PauseGate`].
//! - **[`config`]** -- `relay.toml` loading.

pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod exec;
pub mod flow;
pub mod inference;
pub mod middleware;
pub mod middlewares;
pub mod prompts;
pub mod runtime;
pub mod tools;

pub use config::{
    CONFIG_ENV, DEFAULT_CONFIG_FILE, EngineConfig, EventsConfig, InferenceConfig, RelayConfig,
    STATE_DIR_ENV, StateBackendKind, StateConfig,
};
pub use engine::{Agent, PARENT_KWARG};
pub use entities::{Conversation, Message, Role, TRANSCRIPT_SEPARATOR, Turn};
pub use error::{AgentError, Result};
pub use exec::{EXEC_STATE, ExecTracker, PauseGate};
pub use flow::Flow;
pub use inference::{CommandInference, FAKE_REPLY, FAKE_SELECTOR, Inference, UnconfiguredInference};
pub use middleware::{FnMiddleware, Middleware, StageContext, middleware_fn};
pub use prompts::{HISTORY_DIR, HISTORY_WINDOW, PromptLibrary, Transcript};
pub use runtime::{Registries, Runtime, RuntimeBuilder};
pub use tools::{
    FnTool, NO_TOOL_MARKER, TagToolParser, Tool, ToolArgs, ToolCallParser, ToolCommand,
    ToolOutcome, ToolResults, WithTools, execute_tool_commands, tool_fn,
};
