//! Agent pipelines and the inference loop.
//!
//! An [`Agent`] is a name plus an ordered list of middleware names.  Names
//! are resolved against the runtime's middleware registry on first
//! invocation, so agents may be defined before their stages exist.
//!
//! Each stage runs through a small state machine:
//!
//! ```text
//!            apply(stage)
//! Running ────────────────► value
//!    ▲                        │ conversation with should_infer?
//!    │ apply(stage) again     ├── yes ──► AwaitingInference ──► infer ──┐
//!    └────────────────────────┼───────────────────────────────────────────┘
//!                             └── no  ──► Done(value) → next stage
//! ```

use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::entities::{Conversation, Role};
use crate::error::{AgentError, Result};
use crate::flow::Flow;
use crate::inference::{FAKE_REPLY, FAKE_SELECTOR};
use crate::middleware::{Middleware, StageContext};
use crate::runtime::Runtime;

/// Keyword argument naming the calling agent; recorded in the call trace
/// and never shown to stages.
pub const PARENT_KWARG: &str = "_parent";

/// A named middleware pipeline.
pub struct Agent {
    name: String,
    pipeline: Vec<String>,
    stages: OnceLock<Vec<Arc<dyn Middleware>>>,
}

enum LoopState {
    Running(Flow),
    AwaitingInference(Conversation),
    Done(Flow),
}

impl Agent {
    /// Build an agent from a `|`-separated pipeline string.  Names are
    /// trimmed and empty names skipped.
    pub fn new(name: impl Into<String>, pipeline: &str) -> Self {
        Self {
            name: name.into(),
            pipeline: pipeline
                .split('|')
                .map(str::trim)
                .filter(|stage| !stage.is_empty())
                .map(str::to_string)
                .collect(),
            stages: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline(&self) -> &[String] {
        &self.pipeline
    }

    fn stages(&self, rt: &Runtime) -> Result<Vec<Arc<dyn Middleware>>> {
        if let Some(stages) = self.stages.get() {
            return Ok(stages.clone());
        }
        let registry = &rt.registries().middlewares;
        let resolved = self
            .pipeline
            .iter()
            .map(|name| registry.lookup(name))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(self.stages.get_or_init(|| resolved).clone())
    }

    /// Run the pipeline on `input`.
    ///
    /// The first failing stage aborts the invocation; no partial result is
    /// returned.
    #[instrument(skip(self, rt, input, kwargs), fields(agent = %self.name))]
    pub async fn invoke(
        self: &Arc<Self>,
        rt: &Runtime,
        input: Flow,
        mut kwargs: Map<String, Value>,
    ) -> Result<Flow> {
        let stages = self.stages(rt)?;
        let parent = match kwargs.remove(PARENT_KWARG) {
            Some(Value::String(parent)) => Some(parent),
            _ => None,
        };

        rt.exec().record_call(parent.as_deref(), &self.name)?;
        if rt.mark_root_call(&self.name) {
            rt.emit("root_call_agent", json!({ "agent": self.name }))?;
        }
        rt.set_last_active(Some(&self.name));

        rt.exec().agent_start(&self.name)?;
        let outcome = self.run_pipeline(rt, &stages, input, kwargs).await;
        let ended = rt.exec().agent_end(&self.name);
        match (outcome, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), ended) => {
                if let Err(bookkeeping) = ended {
                    warn!(agent = %self.name, error = %bookkeeping, "failed to record agent end");
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        self: &Arc<Self>,
        rt: &Runtime,
        stages: &[Arc<dyn Middleware>],
        input: Flow,
        kwargs: Map<String, Value>,
    ) -> Result<Flow> {
        rt.exec().checkpoint("agent").await?;
        let mut ctx = StageContext::new(rt.clone(), Arc::clone(self), input.clone(), kwargs);
        info!(agent = %self.name, run_id = %ctx.run_id, stages = stages.len(), "agent invoked");

        let mut value = input;
        for (stage, name) in stages.iter().zip(&self.pipeline) {
            value = self.run_stage(&mut ctx, stage.as_ref(), name, value).await?;
        }
        debug!(
            agent = %self.name,
            run_id = %ctx.run_id,
            hops = ctx.hops,
            kind = value.kind(),
            "agent finished"
        );
        Ok(value)
    }

    /// Apply one stage until it stops requesting inference.
    async fn run_stage(
        &self,
        ctx: &mut StageContext,
        stage: &dyn Middleware,
        stage_name: &str,
        input: Flow,
    ) -> Result<Flow> {
        let limit = ctx.runtime.engine_config().max_inference_rounds;
        let mut rounds = 0u32;
        let mut state = LoopState::Running(stage.apply(ctx, input).await?);

        loop {
            state = match state {
                LoopState::Running(Flow::Conversation(conv)) if conv.should_infer => {
                    LoopState::AwaitingInference(conv)
                }
                LoopState::Running(value) => LoopState::Done(value),
                LoopState::AwaitingInference(conv) => {
                    if limit > 0 && rounds >= limit {
                        return Err(AgentError::InferenceLimitExceeded {
                            agent: self.name.clone(),
                            stage: stage_name.to_string(),
                            rounds,
                        });
                    }
                    rounds += 1;
                    let conv = self.infer(ctx, conv).await?;
                    LoopState::Running(stage.apply(ctx, Flow::Conversation(conv)).await?)
                }
                LoopState::Done(value) => return Ok(value),
            };
        }
    }

    /// One inference round: append the reply, clear the request, count the
    /// hop and record the new turn in the transcript.
    async fn infer(&self, ctx: &mut StageContext, conv: Conversation) -> Result<Conversation> {
        let rt = ctx.runtime.clone();
        let selector = conv
            .llm
            .clone()
            .or_else(|| rt.engine_config().default_model.clone())
            .ok_or_else(|| AgentError::NoModelSelected {
                agent: self.name.clone(),
            })?;

        let mut next = if selector == FAKE_SELECTOR {
            conv.rehop(FAKE_REPLY, Role::Assistant)
        } else {
            let hops = conv.hops;
            rt.emit(
                "agent_will_infer",
                json!({ "name": self.name, "llm": selector, "hops": hops }),
            )?;
            rt.emit(
                "llm_stream_start",
                json!({ "name": self.name, "llm": selector, "hops": hops }),
            )?;
            let reply = rt.inference().infer(&conv.to_turns(), &selector).await?;
            let next = conv.rehop(reply, Role::Assistant);
            rt.emit("llm_stream_end", json!({ "name": self.name, "hops": hops }))?;
            next
        };

        next.should_infer = false;
        if let Some(turn) = next.last() {
            rt.prompts().transcript(&self.name).append(turn)?;
        }
        next.hops += 1;
        ctx.hops += 1;
        debug!(agent = %self.name, llm = %selector, hops = ctx.hops, "inference round complete");
        Ok(next)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("pipeline", &self.pipeline)
            .field("resolved", &self.stages.get().is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_string_is_split_and_trimmed() {
        let agent = Agent::new("a", " prompt | fakeLLM||lastMessageContent ");
        assert_eq!(agent.pipeline(), ["prompt", "fakeLLM", "lastMessageContent"]);
        assert!(Agent::new("empty", "").pipeline().is_empty());
    }
}
