//! Integration tests for the relay-agent crate.
//!
//! Each test builds a runtime over a temporary state directory and prompt
//! library.  Inference is scripted through the `Inference` trait.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_agent::{
    AgentError, Conversation, EngineConfig, FAKE_REPLY, Flow, Inference, Message, Middleware,
    Role, Runtime, StageContext, TagToolParser, ToolArgs, ToolCommand, Turn, WithTools,
    execute_tool_commands, middleware_fn, tool_fn,
};
use relay_store::StateStore;
use serde_json::{Map, Value, json};
use tempfile::TempDir;

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

/// Replies from a fixed script and records every request.
#[derive(Default)]
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, Vec<Turn>)>>,
}

impl Scripted {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            calls: Mutex::default(),
        })
    }

    fn calls(&self) -> Vec<(String, Vec<Turn>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Inference for Scripted {
    async fn infer(&self, turns: &[Turn], model: &str) -> relay_agent::Result<String> {
        self.calls.lock().unwrap().push((model.to_string(), turns.to_vec()));
        Ok(self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "again".to_string()))
    }
}

/// Fails every request.
struct Unreachable;

#[async_trait]
impl Inference for Unreachable {
    async fn infer(&self, _turns: &[Turn], model: &str) -> relay_agent::Result<String> {
        Err(AgentError::Inference {
            model: model.to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

fn write_prompt(dir: &TempDir, agent: &str, text: &str) {
    let path = dir.path().join("prompts").join(format!("{agent}.conv"));
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn builder(dir: &TempDir) -> relay_agent::RuntimeBuilder {
    let store = StateStore::open_directory(dir.path().join("states")).unwrap();
    Runtime::builder(store).prompts_dir(dir.path().join("prompts"))
}

fn runtime(dir: &TempDir) -> Runtime {
    write_prompt(dir, "writer", "system: You write.");
    let rt = builder(dir).build();
    rt.define_agent("writer", "prompt|fakeLLM|lastMessageContent");
    rt
}

fn event_types(rt: &Runtime) -> Vec<String> {
    rt.events()
        .all()
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

fn transcript_text(dir: &Path, agent: &str) -> String {
    fs::read_to_string(dir.join("prompts/.histo").join(format!("{agent}.conv"))).unwrap()
}

/// Starts a conversation from text input and requests inference with
/// `model` on every application.
fn always_infer(model: &'static str) -> Arc<dyn Middleware> {
    middleware_fn(move |_ctx, value| {
        let mut conv = match value {
            Flow::Text(text) => Conversation::new().with_message(Message::user(text)),
            other => other.into_conversation()?,
        };
        conv.llm = Some(model.to_string());
        conv.should_infer = true;
        Ok(conv.into())
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Pipelines and the inference loop
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn fake_pipeline_returns_canned_reply() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);

    let out = rt.invoke("writer", "hi").await.unwrap();
    assert_eq!(out, Flow::Text(FAKE_REPLY.to_string()));
}

#[tokio::test]
async fn fake_inference_counts_one_hop() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    rt.define_agent("drafter", "prompt|fakeLLM");
    write_prompt(&dir, "drafter", "system: Draft.");

    let conv = rt.invoke("drafter", "hi").await.unwrap().into_conversation().unwrap();
    assert_eq!(conv.hops, 1);
    assert!(!conv.should_infer);
    let roles: Vec<Role> = conv.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(conv.last().unwrap().content, FAKE_REPLY);
}

#[tokio::test]
async fn inference_reply_lands_in_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);

    rt.invoke("writer", "hi").await.unwrap();
    rt.invoke("writer", "hi again").await.unwrap();

    // The second identical reply directly follows the first and is dropped.
    let transcript = Conversation::parse_transcript(&transcript_text(dir.path(), "writer")).unwrap();
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript.messages()[0].role, Role::Assistant);
}

#[tokio::test]
async fn root_call_is_recorded_once() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);

    rt.invoke("writer", "one").await.unwrap();
    rt.invoke("writer", "two").await.unwrap();

    assert_eq!(rt.root_call(), Some("writer"));
    let roots = event_types(&rt)
        .into_iter()
        .filter(|t| t == "root_call_agent")
        .count();
    assert_eq!(roots, 1);
    assert_eq!(rt.last_active().as_deref(), Some("writer"));
    assert_eq!(rt.exec().current().unwrap().as_deref(), Some("writer"));
}

#[tokio::test]
async fn configured_model_goes_through_collaborator() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "writer", "system: You write.");
    let script = Scripted::new(&["Hello there"]);
    let rt = builder(&dir)
        .inference(script.clone())
        .model("gpt", "gpt-4o")
        .agent_model("writer", "gpt")
        .build();
    rt.define_agent("writer", "prompt|fromConf|lastMessageContent");

    let out = rt.invoke("writer", "hi").await.unwrap();
    assert_eq!(out.as_text(), Some("Hello there"));

    let calls = script.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "gpt-4o");
    assert!(calls[0].1.iter().all(|t| t.role == Role::User));

    let types = event_types(&rt);
    let lifecycle: Vec<&str> = types
        .iter()
        .map(String::as_str)
        .filter(|t| t.starts_with("agent_") || t.starts_with("llm_"))
        .collect();
    assert_eq!(lifecycle, vec!["agent_will_infer", "llm_stream_start", "llm_stream_end"]);
}

#[tokio::test]
async fn default_model_fills_in_missing_selector() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "writer", "system: You write.");
    let script = Scripted::new(&["ok"]);
    let rt = builder(&dir)
        .inference(script.clone())
        .engine(EngineConfig {
            default_model: Some("house-model".into()),
            ..EngineConfig::default()
        })
        .build();
    rt.define_agent("writer", "prompt|llm|lastMessageContent");

    rt.invoke("writer", "hi").await.unwrap();
    assert_eq!(script.calls()[0].0, "house-model");
}

#[tokio::test]
async fn missing_selector_without_default_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "writer", "system: You write.");
    let rt = builder(&dir).build();
    rt.define_agent("writer", "prompt|llm");

    let err = rt.invoke("writer", "hi").await.unwrap_err();
    assert!(matches!(err, AgentError::NoModelSelected { ref agent } if agent == "writer"));
}

#[tokio::test]
async fn inference_bound_stops_a_runaway_stage() {
    let dir = tempfile::tempdir().unwrap();
    let script = Scripted::new(&[]);
    let rt = builder(&dir)
        .inference(script.clone())
        .engine(EngineConfig {
            max_inference_rounds: 3,
            default_model: None,
        })
        .build();
    rt.register_middleware("alwaysInfer", always_infer("mock"));
    rt.define_agent("looper", "alwaysInfer");

    let err = rt.invoke("looper", "go").await.unwrap_err();
    assert!(matches!(
        err,
        AgentError::InferenceLimitExceeded { ref stage, rounds: 3, .. } if stage == "alwaysInfer"
    ));
    assert_eq!(script.calls().len(), 3);
}

#[tokio::test]
async fn inference_failure_aborts_without_stream_end() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "writer", "system: You write.");
    let rt = builder(&dir)
        .inference(Arc::new(Unreachable))
        .model("gpt", "gpt-4o")
        .build();
    rt.define_agent("writer", "prompt|gpt|lastMessageContent");

    let err = rt.invoke("writer", "hi").await.unwrap_err();
    assert!(matches!(err, AgentError::Inference { ref model, .. } if model == "gpt-4o"));

    let types = event_types(&rt);
    assert!(types.contains(&"llm_stream_start".to_string()));
    assert!(!types.contains(&"llm_stream_end".to_string()));
}

#[tokio::test]
async fn prompt_histo_replays_recent_turns() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "chat", "system:Chat.");
    let script = Scripted::new(&["first answer", "second answer"]);
    let rt = builder(&dir).inference(script.clone()).model("gpt", "gpt-4o").build();
    rt.define_agent("chat", "promptHisto|gpt|lastMessageContent");

    rt.invoke("chat", "q1").await.unwrap();
    rt.invoke("chat", "q2").await.unwrap();

    let calls = script.calls();
    assert_eq!(calls[0].1.len(), 2);
    let second: Vec<&str> = calls[1].1.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(second, vec!["Chat.", "q1", "first answer", "q2"]);
    assert_eq!(calls[1].1[2].role, Role::Assistant);
}

// ═══════════════════════════════════════════════════════════════════════
//  Lookup failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unknown_agent_and_middleware_are_lookup_failures() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);

    let err = rt.invoke("ghost", "hi").await.unwrap_err();
    assert!(err.is_lookup_failure());

    rt.define_agent("broken", "prompt|doesNotExist");
    let err = rt.invoke("broken", "hi").await.unwrap_err();
    assert!(err.is_lookup_failure());
    assert!(err.to_string().contains("middleware not found: doesNotExist"));
}

#[tokio::test]
async fn missing_base_prompt_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    rt.define_agent("nobody", "prompt|fakeLLM");

    let err = rt.invoke("nobody", "hi").await.unwrap_err();
    assert!(matches!(err, AgentError::PromptNotFound { ref agent, .. } if agent == "nobody"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Tools
// ═══════════════════════════════════════════════════════════════════════

fn register_add(rt: &Runtime) {
    rt.register_tool(
        "add",
        tool_fn("Add a and b", |_rt, args: Value| {
            let a = args["a"].as_i64().unwrap_or_default();
            let b = args["b"].as_i64().unwrap_or_default();
            Ok(json!(a + b))
        }),
    );
}

/// Keeps whatever inference request the tool wrapper made, and asks for
/// the first round itself.
fn tool_driver() -> Arc<dyn Middleware> {
    middleware_fn(|ctx, value| {
        let mut conv = match value {
            Flow::Text(text) => Conversation::new().with_message(Message::user(text)),
            other => other.into_conversation()?,
        };
        conv.llm = Some("script".to_string());
        if ctx.hops == 0 {
            conv.should_infer = true;
        }
        Ok(conv.into())
    })
}

fn stage_ctx(rt: &Runtime) -> StageContext {
    let mut ctx = StageContext::new(rt.clone(), rt.define_agent("tester", ""), Flow::from(""), Map::new());
    ctx.hops = 1;
    ctx
}

fn with_tools() -> WithTools {
    let passthrough = middleware_fn(|_ctx, value| Ok(value));
    WithTools::new(passthrough, Arc::new(TagToolParser::new().unwrap()))
}

#[tokio::test]
async fn tool_round_trip_through_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let script = Scripted::new(&[
        r#"<tool name="add" format="json">{"a": 1, "b": 2}</tool>"#,
        "The answer is 3 !!NOTOOL",
    ]);
    let rt = builder(&dir).inference(script.clone()).build();
    register_add(&rt);
    let parser = Arc::new(TagToolParser::new().unwrap());
    rt.register_middleware("calc", Arc::new(WithTools::new(tool_driver(), parser)));
    rt.define_agent("calculator", "calc|lastMessageContent");

    let out = rt.invoke("calculator", "1+2?").await.unwrap();
    assert_eq!(out.as_text(), Some("The answer is 3 !!NOTOOL"));

    let calls = script.calls();
    assert_eq!(calls.len(), 2);
    let tool_turn = calls[1].1.last().unwrap();
    assert_eq!(tool_turn.role, Role::User);
    assert_eq!(tool_turn.content, r#"<tool_result name="add">3</tool_result>"#);

    let used = rt
        .events()
        .all()
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == "tool_used")
        .unwrap();
    assert_eq!(used.payload["tool"], "add");
    assert_eq!(used.payload["output"], 3);
    assert_eq!(used.payload["agent"], "calculator");

    let logs = rt.store().get("exec").unwrap().get("logs").unwrap().unwrap();
    assert_eq!(logs[0]["tool"], "add");
    assert_eq!(logs[0]["result"], 3);
}

#[tokio::test]
async fn tool_errors_become_a_system_turn() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    let mut ctx = stage_ctx(&rt);

    let conv = Conversation::new().with_message(Message::assistant(r#"<tool name="nope">x</tool>"#));
    let out = with_tools().apply(&mut ctx, conv.into()).await.unwrap();
    let conv = out.into_conversation().unwrap();

    let last = conv.last().unwrap();
    assert_eq!(last.role, Role::System);
    assert!(last.content.starts_with("<error>"));
    assert!(last.content.contains("the tool nope doesn't exist"));
    assert!(conv.should_infer);
    assert!(ctx.tools.is_none());
}

#[tokio::test]
async fn more_than_one_tool_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    register_add(&rt);
    rt.register_tool("echo", tool_fn("", |_rt, args| Ok(args)));
    let mut ctx = stage_ctx(&rt);

    let conv = Conversation::new().with_message(Message::assistant(
        r#"<tool name="add" format="json">{"a":1,"b":1}</tool><tool name="echo">hey</tool>"#,
    ));
    let conv = with_tools()
        .apply(&mut ctx, conv.into())
        .await
        .unwrap()
        .into_conversation()
        .unwrap();

    let last = conv.last().unwrap();
    assert_eq!(last.role, Role::Developer);
    assert!(last.content.starts_with("<error>Use one tool at a time"));
    assert!(conv.should_infer);
    assert!(!event_types(&rt).contains(&"tool_used".to_string()));
}

#[tokio::test]
async fn no_tool_turns_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    let mut ctx = stage_ctx(&rt);

    for content in ["just talking", "<tool name=\"add\">1</tool> !!NOTOOL"] {
        let conv = Conversation::new().with_message(Message::assistant(content));
        let out = with_tools().apply(&mut ctx, conv.clone().into()).await.unwrap();
        assert_eq!(out, Flow::Conversation(conv));
    }
    let user_turn = Conversation::new().with_message(Message::user("<tool name=\"add\">1</tool>"));
    let out = with_tools().apply(&mut ctx, user_turn.clone().into()).await.unwrap();
    assert_eq!(out, Flow::Conversation(user_turn));
    assert!(!event_types(&rt).contains(&"tool_used".to_string()));
}

#[tokio::test]
async fn failing_tool_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    rt.register_tool(
        "explode",
        tool_fn("", |_rt, _args| {
            Err(AgentError::Tool {
                tool: "explode".into(),
                reason: "boom".into(),
            })
        }),
    );

    let results = execute_tool_commands(
        &rt,
        vec![ToolCommand {
            name: "explode".into(),
            args: ToolArgs::Text(String::new()),
            raw: "<tool name=\"explode\"></tool>".into(),
        }],
    )
    .await
    .unwrap();

    assert!(results.used().is_empty());
    assert_eq!(results.errors.len(), 1);
    assert!(results.errors[0].starts_with("ERROR executing tool explode"));
}

#[tokio::test]
async fn talk_to_agent_delegates_and_restores_last_active() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    write_prompt(&dir, "helper", "system: Help.");
    rt.define_agent("helper", "prompt|fakeLLM|lastMessageContent");
    rt.set_last_active(Some("boss"));

    let results = execute_tool_commands(
        &rt,
        vec![ToolCommand {
            name: "talk_to_agent".into(),
            args: ToolArgs::Json(r#"{"agent": "helper", "content": "hello"}"#.into()),
            raw: String::new(),
        }],
    )
    .await
    .unwrap();

    assert!(results.errors.is_empty(), "{:?}", results.errors);
    assert_eq!(results.get("talk_to_agent").unwrap().result, json!(FAKE_REPLY));
    assert_eq!(rt.last_active().as_deref(), Some("boss"));

    let events = rt.events().all().unwrap();
    let talk = events.iter().find(|e| e.event_type == "talk_to_agent").unwrap();
    assert_eq!(talk.payload["parent"], "boss");
    assert_eq!(talk.payload["name"], "helper");
    assert!(events.iter().any(|e| e.event_type == "talk_to_agent_done"));

    let trace = rt.store().get("exec").unwrap().get("events").unwrap().unwrap();
    assert_eq!(trace.as_array().unwrap().last().unwrap(), &json!({ "parent": "boss", "me": "helper" }));
}

#[tokio::test]
async fn emit_tool_appends_to_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();

    let results = execute_tool_commands(
        &rt,
        vec![ToolCommand {
            name: "emit".into(),
            args: ToolArgs::Json(r#"{"type": "custom", "payload": {"x": 1}}"#.into()),
            raw: String::new(),
        }],
    )
    .await
    .unwrap();

    assert!(results.errors.is_empty());
    let events = rt.events().all().unwrap();
    assert_eq!(events.last().unwrap().event_type, "custom");
    assert_eq!(events.last().unwrap().payload["x"], 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Pause gate
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn paused_invocation_waits_for_step() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    rt.gate().pause();

    let task = tokio::spawn({
        let rt = rt.clone();
        async move { rt.invoke("writer", "hi").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());
    let exec = rt.store().get("exec").unwrap();
    assert_eq!(exec.get("waiting").unwrap(), Some(json!(true)));

    rt.gate().step();
    let out = task.await.unwrap().unwrap();
    assert_eq!(out.as_text(), Some(FAKE_REPLY));
    assert_eq!(exec.get("waiting").unwrap(), Some(json!(false)));
}

#[tokio::test]
async fn cancelled_invocation_fails() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(&dir);
    rt.gate().pause();

    let task = tokio::spawn({
        let rt = rt.clone();
        async move { rt.invoke("writer", "hi").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    rt.gate().cancel();

    assert!(matches!(task.await.unwrap(), Err(AgentError::Cancelled)));
    let tree = rt.store().get("exec").unwrap().child("tree");
    assert!(tree.is_empty().unwrap(), "aborted agent must leave the in-flight tree");
}

#[tokio::test]
async fn stage_error_survives_failed_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    let rt = builder(&dir).build();
    let exec_dir = dir.path().join("states").join("exec");
    rt.register_middleware(
        "breakExec",
        middleware_fn(move |_ctx, _value| {
            // Turn the exec state into a plain file so agent_end cannot write.
            fs::remove_dir_all(&exec_dir).unwrap();
            fs::write(&exec_dir, "not a directory").unwrap();
            Err(AgentError::Internal("stage exploded".into()))
        }),
    );
    rt.define_agent("fragile", "breakExec");

    match rt.invoke("fragile", "hi").await {
        Err(AgentError::Internal(reason)) => assert_eq!(reason, "stage exploded"),
        other => panic!("expected the stage error, got {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn runtime_from_config_defines_agents() {
    let dir = tempfile::tempdir().unwrap();
    write_prompt(&dir, "writer", "system: You write.");
    let config = relay_agent::RelayConfig::from_toml_str(&format!(
        r#"
        prompts_dir = "{prompts}"

        [state]
        backend = "sqlite"
        path = "{states}"

        [agents]
        writer = "prompt|fakeLLM|lastMessageContent"
        "#,
        prompts = dir.path().join("prompts").display(),
        states = dir.path().join("states").display(),
    ))
    .unwrap();

    let rt = Runtime::from_config(&config).unwrap();
    assert!(rt.registries().agents.contains("writer"));
    let out = rt.invoke("writer", "hi").await.unwrap();
    assert_eq!(out.as_text(), Some(FAKE_REPLY));
    assert!(dir.path().join("states/state.db").exists());
}
