//! Middleware trait and per-invocation stage context.
//!
//! An agent's pipeline is an ordered list of middleware names.  Each stage
//! receives the value produced by the previous one and may set
//! `should_infer` on a returned [`Conversation`](crate::Conversation) to
//! request another inference round before the pipeline moves on.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::engine::Agent;
use crate::error::Result;
use crate::flow::Flow;
use crate::runtime::Runtime;
use crate::tools::ToolResults;

// ---------------------------------------------------------------------------
// Stage context
// ---------------------------------------------------------------------------

/// Mutable context shared by every stage of one agent invocation.
pub struct StageContext {
    /// Unique identifier of this invocation.
    pub run_id: Uuid,
    /// Runtime that owns the registries, store and event log.
    pub runtime: Runtime,
    /// The agent being invoked.
    pub agent: Arc<Agent>,
    /// The invocation's original input.
    pub args: Flow,
    /// Inference rounds completed so far in this invocation.
    pub hops: u32,
    /// Extra invocation arguments.
    pub kwargs: Map<String, Value>,
    /// Results of the most recent tool round, if any.
    pub tools: Option<ToolResults>,
}

impl StageContext {
    pub fn new(runtime: Runtime, agent: Arc<Agent>, args: Flow, kwargs: Map<String, Value>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            runtime,
            agent,
            args,
            hops: 0,
            kwargs,
            tools: None,
        }
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("run_id", &self.run_id)
            .field("agent", &self.agent.name())
            .field("hops", &self.hops)
            .field("kwargs", &self.kwargs)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Middleware trait
// ---------------------------------------------------------------------------

/// A pipeline stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Transform `value`.  Called again with the new conversation after
    /// every inference round the returned value requests.
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow>;
}

/// Adapter turning a synchronous closure into a [`Middleware`].
pub struct FnMiddleware<F> {
    f: F,
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut StageContext, Flow) -> Result<Flow> + Send + Sync,
{
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        (self.f)(ctx, value)
    }
}

/// Wrap a closure as a shareable middleware.
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(&mut StageContext, Flow) -> Result<Flow> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware { f })
}
