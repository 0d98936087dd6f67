//! The runtime: one explicit context object in place of process globals.
//!
//! A [`Runtime`] owns the agent, tool and middleware registries, the state
//! store and event log, the inference collaborator, the prompt library and
//! the execution tracker.  Cloning is cheap; every clone shares the same
//! inner state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use relay_kernel::{CursorMode, Dispatcher, DispatcherConfig, Event, EventLog, Registry};
use relay_store::StateStore;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::{EngineConfig, RelayConfig};
use crate::engine::Agent;
use crate::error::Result;
use crate::exec::{ExecTracker, PauseGate};
use crate::flow::Flow;
use crate::inference::{CommandInference, Inference, UnconfiguredInference};
use crate::middleware::Middleware;
use crate::prompts::PromptLibrary;
use crate::tools::Tool;
use crate::{middlewares, tools};

/// Name → implementation directories.
#[derive(Clone, Debug)]
pub struct Registries {
    pub agents: Registry<Agent>,
    pub tools: Registry<dyn Tool>,
    pub middlewares: Registry<dyn Middleware>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            agents: Registry::new("agent"),
            tools: Registry::new("tool"),
            middlewares: Registry::new("middleware"),
        }
    }
}

struct RuntimeInner {
    registries: Registries,
    store: StateStore,
    events: EventLog,
    inference: Arc<dyn Inference>,
    engine: EngineConfig,
    poll_interval: Duration,
    prompts: PromptLibrary,
    exec: ExecTracker,
    root_call: OnceLock<String>,
    last_active: Mutex<Option<String>>,
}

/// Shared agent runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder(store: StateStore) -> RuntimeBuilder {
        RuntimeBuilder::new(store)
    }

    /// Open the configured store and collaborator, register built-ins and
    /// define every configured agent.
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let store = config.state.open()?;
        let inference: Arc<dyn Inference> = if config.inference.command.is_empty() {
            Arc::new(UnconfiguredInference)
        } else {
            Arc::new(CommandInference::new(&config.inference.command)?)
        };
        Ok(RuntimeBuilder::new(store)
            .with_config(config)
            .inference(inference)
            .build())
    }

    // -- Accessors -----------------------------------------------------------

    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn inference(&self) -> &Arc<dyn Inference> {
        &self.inner.inference
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.inner.engine
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.inner.prompts
    }

    pub fn exec(&self) -> &ExecTracker {
        &self.inner.exec
    }

    pub fn gate(&self) -> &PauseGate {
        self.inner.exec.gate()
    }

    /// A dispatcher over this runtime's event log.
    pub fn dispatcher(&self, mode: CursorMode) -> Dispatcher {
        Dispatcher::with_config(
            self.inner.events.clone(),
            DispatcherConfig {
                mode,
                poll_interval: self.inner.poll_interval,
            },
        )
    }

    // -- Registration --------------------------------------------------------

    /// Define (or redefine) an agent from a `|`-separated pipeline string.
    pub fn define_agent(&self, name: &str, pipeline: &str) -> Arc<Agent> {
        let agent = Agent::new(name, pipeline);
        debug!(agent = %name, stages = ?agent.pipeline(), "agent defined");
        self.inner.registries.agents.register(name, Arc::new(agent))
    }

    pub fn register_tool(&self, name: &str, tool: Arc<dyn Tool>) {
        self.inner.registries.tools.register(name, tool);
    }

    pub fn register_middleware(&self, name: &str, middleware: Arc<dyn Middleware>) {
        self.inner.registries.middlewares.register(name, middleware);
    }

    // -- Invocation ----------------------------------------------------------

    /// Invoke agent `name` with `input`.
    pub async fn invoke(&self, name: &str, input: impl Into<Flow>) -> Result<Flow> {
        self.invoke_with(name, input.into(), Map::new()).await
    }

    /// Invoke agent `name` with extra keyword arguments.
    pub async fn invoke_with(
        &self,
        name: &str,
        input: Flow,
        kwargs: Map<String, Value>,
    ) -> Result<Flow> {
        let agent = self.inner.registries.agents.lookup(name)?;
        agent.invoke(self, input, kwargs).await
    }

    /// Append an event to the log.
    pub fn emit(&self, event_type: &str, payload: Value) -> Result<Event> {
        Ok(self.inner.events.emit(event_type, payload)?)
    }

    // -- Call bookkeeping ----------------------------------------------------

    /// The first agent invoked in this runtime.
    pub fn root_call(&self) -> Option<&str> {
        self.inner.root_call.get().map(String::as_str)
    }

    /// Record `agent` as the root call.  Returns `false` if one was already
    /// recorded.
    pub(crate) fn mark_root_call(&self, agent: &str) -> bool {
        let marked = self.inner.root_call.set(agent.to_string()).is_ok();
        if marked {
            info!(agent = %agent, "root call");
        }
        marked
    }

    /// The agent that most recently started running.
    pub fn last_active(&self) -> Option<String> {
        self.last_active_slot().clone()
    }

    pub fn set_last_active(&self, agent: Option<&str>) {
        *self.last_active_slot() = agent.map(str::to_string);
    }

    fn last_active_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // A plain `Option<String>` cannot be left half-written.
        self.inner
            .last_active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("registries", &self.inner.registries)
            .field("store", &self.inner.store)
            .field("engine", &self.inner.engine)
            .field("prompts", &self.inner.prompts.root())
            .field("root_call", &self.inner.root_call.get())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Step-by-step [`Runtime`] construction.
pub struct RuntimeBuilder {
    store: StateStore,
    inference: Arc<dyn Inference>,
    engine: EngineConfig,
    poll_interval: Duration,
    prompts_dir: PathBuf,
    gate: PauseGate,
    models: BTreeMap<String, String>,
    agent_models: BTreeMap<String, String>,
    agents: BTreeMap<String, String>,
}

impl RuntimeBuilder {
    pub fn new(store: StateStore) -> Self {
        let defaults = RelayConfig::default();
        Self {
            store,
            inference: Arc::new(UnconfiguredInference),
            engine: defaults.engine,
            poll_interval: defaults.events.poll_interval(),
            prompts_dir: defaults.prompts_dir,
            gate: PauseGate::new(),
            models: BTreeMap::new(),
            agent_models: BTreeMap::new(),
            agents: BTreeMap::new(),
        }
    }

    /// Take everything but the store and collaborator from `config`.
    pub fn with_config(mut self, config: &RelayConfig) -> Self {
        self.engine = config.engine.clone();
        self.poll_interval = config.events.poll_interval();
        self.prompts_dir = config.prompts_dir.clone();
        self.models = config.models.clone();
        self.agent_models = config.agent_models.clone();
        self.agents = config.agents.clone();
        self
    }

    pub fn inference(mut self, inference: Arc<dyn Inference>) -> Self {
        self.inference = inference;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn prompts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.prompts_dir = dir.into();
        self
    }

    pub fn gate(mut self, gate: PauseGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn model(mut self, alias: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(alias.into(), model.into());
        self
    }

    pub fn agent_model(mut self, agent: impl Into<String>, middleware: impl Into<String>) -> Self {
        self.agent_models.insert(agent.into(), middleware.into());
        self
    }

    pub fn build(self) -> Runtime {
        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                registries: Registries::default(),
                events: EventLog::new(self.store.clone()),
                exec: ExecTracker::new(self.store.clone(), self.gate),
                store: self.store,
                inference: self.inference,
                engine: self.engine,
                poll_interval: self.poll_interval,
                prompts: PromptLibrary::new(self.prompts_dir),
                root_call: OnceLock::new(),
                last_active: Mutex::new(None),
            }),
        };

        middlewares::register_builtins(&runtime, &self.models, &self.agent_models);
        tools::register_builtins(&runtime);
        for (name, pipeline) in &self.agents {
            runtime.define_agent(name, pipeline);
        }
        info!(
            agents = runtime.registries().agents.len(),
            middlewares = runtime.registries().middlewares.len(),
            tools = runtime.registries().tools.len(),
            "runtime ready"
        );
        runtime
    }
}
