//! Runtime configuration loaded from `relay.toml`.
//!
//! ```toml
//! prompts_dir = "./prompts"
//!
//! [state]
//! backend = "sqlite"          # or "directory"
//! path = "./.states"
//!
//! [events]
//! poll_interval_ms = 100
//!
//! [engine]
//! max_inference_rounds = 64   # 0 = unbounded
//! default_model = "gpt-4o"
//!
//! [models]
//! gpt = "gpt-4o"
//!
//! [agent_models]
//! writer = "gpt"
//!
//! [agents]
//! writer = "prompt|fromConf|lastMessageContent"
//!
//! [inference]
//! command = ["./bin/infer", "--stream=false"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_store::StateStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};

/// Config file used when neither `--config` nor [`CONFIG_ENV`] is given.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RELAY_CONFIG";

/// Environment variable overriding `state.path`.
pub const STATE_DIR_ENV: &str = "RELAY_STATE_DIR";

const SQLITE_FILE: &str = "state.db";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Storage backend for the state store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Directory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackendKind,
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::Directory,
            path: PathBuf::from("./.states"),
        }
    }
}

impl StateConfig {
    /// Database file for the sqlite backend: `path` itself when it names a
    /// `.db` file, otherwise `path/state.db`.
    pub fn sqlite_file(&self) -> PathBuf {
        if self.path.extension().is_some_and(|ext| ext == "db") {
            self.path.clone()
        } else {
            self.path.join(SQLITE_FILE)
        }
    }

    /// Open the configured store.
    pub fn open(&self) -> Result<StateStore> {
        let store = match self.backend {
            StateBackendKind::Directory => StateStore::open_directory(&self.path)?,
            StateBackendKind::Sqlite => {
                let file = self.sqlite_file();
                if let Some(parent) = file.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                StateStore::open_sqlite(&file)?
            }
        };
        info!(backend = %store.backend().describe(), "state store opened");
        Ok(store)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub poll_interval_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl EventsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Inference loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inference rounds one stage may request; `0` disables the bound.
    pub max_inference_rounds: u32,
    /// Selector used when a conversation requests inference without one.
    pub default_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_inference_rounds: 64,
            default_model: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Program and arguments; empty means no collaborator.
    pub command: Vec<String>,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub prompts_dir: PathBuf,
    pub state: StateConfig,
    pub events: EventsConfig,
    pub engine: EngineConfig,
    /// Alias → model selector; each alias becomes a middleware.
    pub models: BTreeMap<String, String>,
    /// Agent → middleware name used by `fromConf`.
    pub agent_models: BTreeMap<String, String>,
    /// Agent → pipeline string.
    pub agents: BTreeMap<String, String>,
    pub inference: InferenceConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prompts_dir: PathBuf::from("./prompts"),
            state: StateConfig::default(),
            events: EventsConfig::default(),
            engine: EngineConfig::default(),
            models: BTreeMap::new(),
            agent_models: BTreeMap::new(),
            agents: BTreeMap::new(),
            inference: InferenceConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Parse TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })
    }

    /// Load `path`, falling back to defaults when it does not exist, then
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            Self::from_toml_str(&content)?
        } else {
            warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply overrides read through `lookup`.
    #[must_use]
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.state.path = PathBuf::from(dir);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.engine.max_inference_rounds, 64);
        assert_eq!(config.events.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.state.sqlite_file(), PathBuf::from("./.states/state.db"));
    }

    #[test]
    fn full_file_parses() {
        let config = RelayConfig::from_toml_str(
            r#"
            prompts_dir = "p"

            [state]
            backend = "sqlite"
            path = "data/relay.db"

            [engine]
            max_inference_rounds = 0
            default_model = "gpt-4o"

            [models]
            gpt = "gpt-4o"

            [agent_models]
            writer = "gpt"

            [agents]
            writer = "prompt|fromConf|lastMessageContent"

            [inference]
            command = ["infer", "-q"]
            "#,
        )
        .unwrap();

        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(config.state.sqlite_file(), PathBuf::from("data/relay.db"));
        assert_eq!(config.engine.max_inference_rounds, 0);
        assert_eq!(config.engine.default_model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.agent_models["writer"], "gpt");
        assert_eq!(config.inference.command, vec!["infer", "-q"]);
    }

    #[test]
    fn bad_backend_is_a_config_error() {
        let err = RelayConfig::from_toml_str("[state]\nbackend = \"redis\"").unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));
    }

    #[test]
    fn state_dir_env_override() {
        let config = RelayConfig::default().with_env_overrides(|key| {
            (key == STATE_DIR_ENV).then(|| "/tmp/relay-states".to_string())
        });
        assert_eq!(config.state.path, PathBuf::from("/tmp/relay-states"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.prompts_dir, PathBuf::from("./prompts"));
    }

    #[test]
    fn opens_both_backends() {
        let dir = tempfile::tempdir().unwrap();
        for backend in [StateBackendKind::Directory, StateBackendKind::Sqlite] {
            let state = StateConfig {
                backend,
                path: dir.path().join(format!("{backend:?}")),
            };
            let store = state.open().unwrap();
            store.set("s", serde_json::json!({ "k": 1 })).unwrap();
        }
        assert!(dir.path().join("Sqlite/state.db").exists());
    }
}
