//! Tools and the tool-using middleware wrapper.
//!
//! A [`Tool`] is a named async function an assistant turn can ask for.
//! [`WithTools`] wraps another middleware: when the conversation's last
//! turn comes from the assistant it parses tool commands out of it with a
//! [`ToolCallParser`], runs them through [`execute_tool_commands`] and
//! feeds the outcome back as a new turn.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument, warn};

use crate::engine::PARENT_KWARG;
use crate::entities::{Conversation, Message, Role};
use crate::error::{AgentError, Result};
use crate::flow::Flow;
use crate::middleware::{Middleware, StageContext};
use crate::runtime::Runtime;

/// Marker that tells [`WithTools`] to leave an assistant turn alone.
pub const NO_TOOL_MARKER: &str = "!!NOTOOL";

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// One-line description, shown by listings.
    fn description(&self) -> &str {
        ""
    }

    /// Run the tool.  `args` is a JSON object, or a string for plain-text
    /// arguments.
    async fn call(&self, rt: &Runtime, args: Value) -> Result<Value>;
}

/// Adapter turning a synchronous closure into a [`Tool`].
pub struct FnTool<F> {
    f: F,
    description: String,
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(&Runtime, Value) -> Result<Value> + Send + Sync,
{
    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, rt: &Runtime, args: Value) -> Result<Value> {
        (self.f)(rt, args)
    }
}

/// Wrap a closure as a shareable tool.
pub fn tool_fn<F>(description: impl Into<String>, f: F) -> Arc<dyn Tool>
where
    F: Fn(&Runtime, Value) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnTool {
        f,
        description: description.into(),
    })
}

// ---------------------------------------------------------------------------
// Commands and results
// ---------------------------------------------------------------------------

/// Raw arguments of a parsed tool command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolArgs {
    /// JSON text; must decode to an object.
    Json(String),
    /// Plain text; empty means no arguments.
    Text(String),
}

/// One tool invocation found in an assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub name: String,
    pub args: ToolArgs,
    /// The command as it appeared in the turn, quoted back in errors.
    pub raw: String,
}

/// Extracts tool commands from assistant text.
pub trait ToolCallParser: Send + Sync {
    fn parse(&self, content: &str) -> Vec<ToolCommand>;
}

/// A tool that ran successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub name: String,
    pub result: Value,
    pub args: Value,
}

/// Everything one tool round produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResults {
    pub errors: Vec<String>,
    used: Vec<ToolOutcome>,
}

impl ToolResults {
    /// Record a successful call; a second call of the same tool replaces
    /// the first.
    pub fn record(&mut self, outcome: ToolOutcome) {
        match self.used.iter_mut().find(|o| o.name == outcome.name) {
            Some(existing) => *existing = outcome,
            None => self.used.push(outcome),
        }
    }

    pub fn used(&self) -> &[ToolOutcome] {
        &self.used
    }

    pub fn used_names(&self) -> Vec<&str> {
        self.used.iter().map(|o| o.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&ToolOutcome> {
        self.used.iter().find(|o| o.name == name)
    }

    /// `{"errors": [..], "<tool>": {name, result, args}, ..}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("errors".into(), json!(self.errors));
        for outcome in &self.used {
            map.insert(
                outcome.name.clone(),
                json!({ "name": outcome.name, "result": outcome.result, "args": outcome.args }),
            );
        }
        Value::Object(map)
    }
}

fn decode_args(name: &str, args: &ToolArgs) -> std::result::Result<Value, String> {
    match args {
        ToolArgs::Json(text) => match serde_json::from_str::<Value>(text) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err(format!("ERROR parsing JSON args for {name}: args must be a JSON object")),
            Err(e) => Err(format!("ERROR parsing JSON args for {name}: {e}")),
        },
        ToolArgs::Text(text) if text.trim().is_empty() => Ok(Value::Object(Map::new())),
        ToolArgs::Text(text) => Ok(Value::String(text.clone())),
    }
}

/// Run already-parsed commands in order.
///
/// Unknown tools, bad arguments and failing tools become entries in
/// [`ToolResults::errors`].  Only a cancelled pause checkpoint or a
/// bookkeeping failure aborts the round.
#[instrument(skip(rt, commands), fields(commands = commands.len()))]
pub async fn execute_tool_commands(rt: &Runtime, commands: Vec<ToolCommand>) -> Result<ToolResults> {
    let mut results = ToolResults::default();

    for command in commands {
        let Some(tool) = rt.registries().tools.get(&command.name) else {
            results.errors.push(format!(
                "ERROR: using:\n```\n{}\n```\nthe tool {} doesn't exist",
                command.raw, command.name
            ));
            continue;
        };
        let args = match decode_args(&command.name, &command.args) {
            Ok(args) => args,
            Err(message) => {
                results.errors.push(message);
                continue;
            }
        };

        rt.exec().tool_start(&command.name, &args)?;
        rt.exec().checkpoint("tool").await?;

        match tool.call(rt, args.clone()).await {
            Ok(result) => {
                rt.exec().tool_end(&command.name, &result)?;
                info!(tool = %command.name, "tool executed");
                results.record(ToolOutcome {
                    name: command.name,
                    result,
                    args,
                });
            }
            Err(e) => {
                warn!(tool = %command.name, error = %e, "tool execution failed");
                rt.exec().tool_end(&command.name, &json!({ "error": e.to_string() }))?;
                results
                    .errors
                    .push(format!("ERROR executing tool {}: {e}", command.name));
            }
        }
    }

    Ok(results)
}

// ---------------------------------------------------------------------------
// Tag parser
// ---------------------------------------------------------------------------

/// Parses `<tool name="x">args</tool>` blocks.  Add `format="json"` to pass
/// a JSON object instead of plain text.
#[derive(Debug, Clone)]
pub struct TagToolParser {
    pattern: Regex,
}

impl TagToolParser {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(
            r#"(?s)<tool\s+name="([^"]+)"(\s+format="json")?\s*>(.*?)</tool>"#,
        )
        .map_err(|e| AgentError::Internal(format!("invalid tool tag pattern: {e}")))?;
        Ok(Self { pattern })
    }
}

impl ToolCallParser for TagToolParser {
    fn parse(&self, content: &str) -> Vec<ToolCommand> {
        self.pattern
            .captures_iter(content)
            .map(|caps| {
                let body = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();
                ToolCommand {
                    name: caps[1].to_string(),
                    args: if caps.get(2).is_some() {
                        ToolArgs::Json(body)
                    } else {
                        ToolArgs::Text(body)
                    },
                    raw: caps[0].to_string(),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tool-using middleware
// ---------------------------------------------------------------------------

/// Runs tool commands found in assistant turns before delegating to the
/// wrapped middleware.
pub struct WithTools {
    inner: Arc<dyn Middleware>,
    parser: Arc<dyn ToolCallParser>,
}

impl WithTools {
    pub fn new(inner: Arc<dyn Middleware>, parser: Arc<dyn ToolCallParser>) -> Self {
        Self { inner, parser }
    }

    fn wants_tools(conv: &Conversation) -> bool {
        conv.last()
            .is_some_and(|m| m.role == Role::Assistant && !m.content.contains(NO_TOOL_MARKER))
    }
}

impl fmt::Debug for WithTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithTools").finish_non_exhaustive()
    }
}

fn result_text(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Middleware for WithTools {
    async fn apply(&self, ctx: &mut StageContext, value: Flow) -> Result<Flow> {
        let conv = match value {
            Flow::Conversation(conv) if Self::wants_tools(&conv) => conv,
            other => return self.inner.apply(ctx, other).await,
        };

        let content = conv.last().map(|m| m.content.clone()).unwrap_or_default();
        let commands = self.parser.parse(&content);
        let results = execute_tool_commands(&ctx.runtime, commands).await?;

        if !results.errors.is_empty() {
            for message in &results.errors {
                error!(agent = %ctx.agent_name(), "{message}");
            }
            let mut next = conv.with_message(Message::system(format!(
                "<error>{:?}</error>",
                results.errors
            )));
            next.should_infer = true;
            return Ok(Flow::Conversation(next));
        }

        let used: Vec<String> = results.used_names().into_iter().map(str::to_string).collect();
        match used.as_slice() {
            [] => {
                ctx.tools = Some(results);
                self.inner.apply(ctx, Flow::Conversation(conv)).await
            }
            [name] => {
                let output = results.get(name).map(|o| o.result.clone()).unwrap_or(Value::Null);
                let mut next = conv.with_message(Message::developer(format!(
                    "<tool_result name=\"{name}\">{}</tool_result>",
                    result_text(&output)
                )));
                next.should_infer = true;
                ctx.runtime.emit(
                    "tool_used",
                    json!({ "agent": ctx.agent_name(), "tool": name, "output": output }),
                )?;
                ctx.tools = Some(results);
                self.inner.apply(ctx, Flow::Conversation(next)).await
            }
            many => {
                let message = format!("<error>Use one tool at a time: {many:?}</error>");
                let mut next = conv.with_message(Message::developer(message));
                next.should_infer = true;
                Ok(Flow::Conversation(next))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Tool {
            tool: tool.to_string(),
            reason: format!("missing string argument `{key}`"),
        })
}

/// `emit`: append `{type, payload}` to the event log.
struct EmitTool;

#[async_trait]
impl Tool for EmitTool {
    fn description(&self) -> &str {
        "Append an event to the event log"
    }

    async fn call(&self, rt: &Runtime, args: Value) -> Result<Value> {
        let event_type = required_str("emit", &args, "type")?;
        let payload = args.get("payload").cloned().unwrap_or(Value::Null);
        let event = rt.emit(event_type, payload)?;
        Ok(serde_json::to_value(event)?)
    }
}

/// `talk_to_agent`: hand `content` to another agent and return its answer.
struct TalkToAgent;

#[async_trait]
impl Tool for TalkToAgent {
    fn description(&self) -> &str {
        "Send a message to another agent and return its reply"
    }

    async fn call(&self, rt: &Runtime, args: Value) -> Result<Value> {
        let name = required_str("talk_to_agent", &args, "agent")?;
        let content = args.get("content").and_then(Value::as_str).unwrap_or_default();
        let parent = rt.last_active();

        rt.emit("talk_to_agent", json!({ "parent": parent, "name": name }))?;
        let mut kwargs = Map::new();
        if let Some(parent) = &parent {
            kwargs.insert(PARENT_KWARG.to_string(), Value::String(parent.clone()));
        }
        let reply = rt.invoke_with(name, Flow::from(content), kwargs).await;
        rt.emit("talk_to_agent_done", json!({ "parent": parent, "name": name }))?;
        rt.set_last_active(parent.as_deref());

        Ok(reply?.to_value())
    }
}

/// Register `emit` and `talk_to_agent`.
pub(crate) fn register_builtins(rt: &Runtime) {
    let tools = &rt.registries().tools;
    tools.register("emit", Arc::new(EmitTool));
    tools.register("talk_to_agent", Arc::new(TalkToAgent));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
