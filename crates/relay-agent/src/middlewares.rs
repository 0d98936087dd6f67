//! Built-in middlewares, registered by name on every runtime.
//!
//! | name                 | effect                                              |
//! |----------------------|-----------------------------------------------------|
//! | `prompt`             | base prompt + user turn                             |
//! | `promptHisto`        | base prompt + recent transcript + user turn         |
//! | `llm`                | request inference on the first hop                  |
//! | `fakeLLM`            | select the fake model, request inference on hop 0   |
//! | `<model alias>`      | select a configured model, request inference on hop 0 |
//! | `fromConf`           | delegate to the middleware configured for the agent |
//! | `lastMessageContent` | conversation → text of its last turn                |
//! | `execPause`          | pause checkpoint                                    |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::entities::Message;
use crate::error::{AgentError, Result};
use crate::flow::Flow;
use crate::inference::FAKE_SELECTOR;
use crate::middleware::{Middleware, StageContext};
use crate::prompts::HISTORY_WINDOW;
use crate::runtime::Runtime;

/// `prompt`: the agent's base prompt followed by the input as a user turn.
pub struct Prompt;

#[async_trait]
impl Middleware for Prompt {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let input = value.into_text()?;
        let base = ctx.runtime.prompts().base_prompt(ctx.agent_name())?;
        Ok(Flow::Conversation(base.with_message(Message::user(input))))
    }
}

/// `promptHisto`: like [`Prompt`] with the most recent transcript turns in
/// between.  The user turn is recorded in the transcript.
pub struct PromptHisto;

#[async_trait]
impl Middleware for PromptHisto {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let input = value.into_text()?;
        let prompts = ctx.runtime.prompts();
        let agent = ctx.agent_name();

        let transcript = prompts.transcript(agent);
        let user = Message::user(input);
        let conv = prompts
            .base_prompt(agent)?
            .concat(&transcript.tail(HISTORY_WINDOW))
            .with_message(user.clone());
        transcript.append(&user)?;
        Ok(Flow::Conversation(conv))
    }
}

/// Selects a model and requests inference on the first hop only.
///
/// Without a model this is the plain `llm` stage: the selector already on
/// the conversation is kept.
pub struct ModelSelector {
    model: Option<String>,
}

impl ModelSelector {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
        }
    }

    pub fn keep_current() -> Self {
        Self { model: None }
    }
}

#[async_trait]
impl Middleware for ModelSelector {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let mut conv = value.into_conversation()?;
        if let Some(model) = &self.model {
            conv.llm = Some(model.clone());
        }
        conv.should_infer = ctx.hops == 0;
        Ok(Flow::Conversation(conv))
    }
}

/// `fromConf`: run the middleware configured for the current agent.
pub struct FromConf {
    agent_models: BTreeMap<String, String>,
}

impl FromConf {
    pub fn new(agent_models: BTreeMap<String, String>) -> Self {
        Self { agent_models }
    }
}

#[async_trait]
impl Middleware for FromConf {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let agent = ctx.agent_name();
        let name = self.agent_models.get(agent).ok_or_else(|| AgentError::ConfigError {
            reason: format!("no model configured for agent `{agent}`"),
        })?;
        debug!(agent, middleware = %name, "delegating to configured model");
        let stage = ctx.runtime.registries().middlewares.lookup(name)?;
        stage.apply(ctx, value).await
    }
}

/// `lastMessageContent`: the content of the conversation's last turn.
pub struct LastMessageContent;

#[async_trait]
impl Middleware for LastMessageContent {
    async fn apply(&self, _ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let conv = value.into_conversation()?;
        let last = conv.last().ok_or(AgentError::UnexpectedValue {
            expected: "non-empty conversation",
            found: "empty conversation",
        })?;
        Ok(Flow::Text(last.content.clone()))
    }
}

/// `execPause`: wait at the pause gate, then pass the value through.
pub struct ExecPause;

#[async_trait]
impl Middleware for ExecPause {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        ctx.runtime.exec().checkpoint("stage").await?;
        Ok(value)
    }
}

/// Register the built-ins plus one selector per configured model alias.
pub(crate) fn register_builtins(
    rt: &Runtime,
    models: &BTreeMap<String, String>,
    agent_models: &BTreeMap<String, String>,
) {
    let registry = &rt.registries().middlewares;
    registry.register("prompt", Arc::new(Prompt));
    registry.register("promptHisto", Arc::new(PromptHisto));
    registry.register("llm", Arc::new(ModelSelector::keep_current()));
    registry.register("fakeLLM", Arc::new(ModelSelector::new(FAKE_SELECTOR)));
    registry.register("fromConf", Arc::new(FromConf::new(agent_models.clone())));
    registry.register("lastMessageContent", Arc::new(LastMessageContent));
    registry.register("execPause", Arc::new(ExecPause));

    for (alias, model) in models {
        registry.register(alias.as_str(), Arc::new(ModelSelector::new(model.as_str())));
    }
}
