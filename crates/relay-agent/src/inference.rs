//! Inference collaborator.
//!
//! The engine never talks to a model provider directly.  It hands the
//! conversation's turns and a model selector to an [`Inference`]
//! implementation and appends whatever text comes back.
//!
//! [`CommandInference`] runs a configured external program per request:
//! the request is written to its stdin as JSON
//! (`{"model": .., "messages": [{role, content}, ..]}`) and its trimmed
//! stdout is the reply.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::entities::Turn;
use crate::error::{AgentError, Result};

/// Model selector that skips the collaborator entirely.
pub const FAKE_SELECTOR: &str = "fake";

/// Assistant reply produced for [`FAKE_SELECTOR`].
pub const FAKE_REPLY: &str = "Fake llm message";

/// Produces the next assistant reply for a conversation.
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(&self, turns: &[Turn], model: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// External command
// ---------------------------------------------------------------------------

/// Runs an external program for each inference request.
#[derive(Debug, Clone)]
pub struct CommandInference {
    program: String,
    args: Vec<String>,
}

impl CommandInference {
    /// `command[0]` is the program, the rest are its arguments.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or_else(|| AgentError::ConfigError {
            reason: "inference command is empty".to_string(),
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Inference for CommandInference {
    async fn infer(&self, turns: &[Turn], model: &str) -> Result<String> {
        let failed = |reason: String| AgentError::Inference {
            model: model.to_string(),
            reason,
        };

        let request = serde_json::to_vec(&json!({ "model": model, "messages": turns }))?;
        debug!(program = %self.program, model, turns = turns.len(), "spawning inference command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("failed to spawn `{}`: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading is judged by its status.
            if let Err(e) = stdin.write_all(&request).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(failed(format!("failed to write request: {e}")));
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| failed(format!("failed to wait for command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(program = %self.program, status = %output.status, "inference command failed");
            return Err(failed(if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                stderr
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

// ---------------------------------------------------------------------------
// Unconfigured
// ---------------------------------------------------------------------------

/// Placeholder used when no collaborator is configured.  Every request
/// fails; the fake selector still works because it never reaches here.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredInference;

#[async_trait]
impl Inference for UnconfiguredInference {
    async fn infer(&self, _turns: &[Turn], model: &str) -> Result<String> {
        Err(AgentError::Inference {
            model: model.to_string(),
            reason: "no inference command configured".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Role;

    fn turns() -> Vec<Turn> {
        vec![Turn {
            role: Role::User,
            content: "hello".into(),
        }]
    }

    #[test]
    fn empty_command_is_a_config_error() {
        let err = CommandInference::new(&[]).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));
    }

    #[tokio::test]
    async fn unconfigured_always_fails() {
        let err = UnconfiguredInference.infer(&turns(), "gpt").await.unwrap_err();
        assert!(matches!(err, AgentError::Inference { ref model, .. } if model == "gpt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_reply_is_trimmed_stdout() {
        let command = vec!["sh".to_string(), "-c".to_string(), "cat >/dev/null; echo '  pong  '".to_string()];
        let inference = CommandInference::new(&command).unwrap();
        let reply = inference.infer(&turns(), "any").await.unwrap();
        assert_eq!(reply, "pong");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_receives_request_json() {
        let command = vec!["sh".to_string(), "-c".to_string(), "cat".to_string()];
        let inference = CommandInference::new(&command).unwrap();
        let reply = inference.infer(&turns(), "echo-model").await.unwrap();
        let request: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(request["model"], "echo-model");
        assert_eq!(request["messages"][0]["role"], "user");
        assert_eq!(request["messages"][0]["content"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let command = vec!["sh".to_string(), "-c".to_string(), "cat >/dev/null; echo quota >&2; exit 3".to_string()];
        let inference = CommandInference::new(&command).unwrap();
        let err = inference.infer(&turns(), "m").await.unwrap_err();
        assert!(matches!(err, AgentError::Inference { ref reason, .. } if reason == "quota"));
    }
}
