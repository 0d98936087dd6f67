//! Execution tracking and the cooperative pause gate.
//!
//! [`ExecTracker`] records what the engine is doing in the reserved `exec`
//! state so an outside observer (the CLI, a debugger UI) can follow a run:
//!
//! ```text
//! exec
//! ├── events        [{parent, me}, ..]          call trace
//! ├── current       name of the agent last invoked
//! ├── tree          {start timestamp: agent}     agents in flight
//! ├── logs          [{tool, args, start, result, end}, ..]
//! ├── pause_before  "agent" | "tool" | null
//! └── waiting       true while a checkpoint is blocked
//! ```
//!
//! [`PauseGate`] lets a caller pause a run at the next checkpoint and
//! release it one step at a time.  Waiters park on a
//! [`tokio::sync::watch`] channel; nothing polls.

use std::sync::{Arc, Mutex, MutexGuard};

use relay_store::{StateHandle, StateStore};
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Reserved state holding execution bookkeeping.
pub const EXEC_STATE: &str = "exec";

/// Serialises bookkeeping mutations across every tracker in the process.
static EXEC_LOCK: Mutex<()> = Mutex::new(());

fn exec_lock() -> MutexGuard<'static, ()> {
    // The guarded data is `()`, so a poisoned lock carries no broken state.
    EXEC_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ---------------------------------------------------------------------------
// Pause gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    paused: bool,
    cancelled: bool,
    /// Checkpoints allowed through while paused.
    permits: u64,
}

/// Outcome of one attempt to pass the gate.
enum Pass {
    Through,
    Blocked,
    Cancelled,
}

/// Cooperative pause/step/cancel control shared by clones.
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Block every following checkpoint until [`step`](Self::step) or
    /// [`resume`](Self::resume).
    pub fn pause(&self) {
        self.tx.send_modify(|state| state.paused = true);
    }

    /// Let exactly one blocked (or the next) checkpoint through.  No-op
    /// while the gate is open.
    pub fn step(&self) {
        self.tx.send_if_modified(|state| {
            if state.paused {
                state.permits += 1;
                true
            } else {
                false
            }
        });
    }

    /// Open the gate and release every waiter.
    pub fn resume(&self) {
        self.tx.send_modify(|state| {
            state.paused = false;
            state.permits = 0;
        });
    }

    /// Fail every current and future checkpoint with
    /// [`AgentError::Cancelled`].
    pub fn cancel(&self) {
        self.tx.send_modify(|state| state.cancelled = true);
    }

    pub fn is_paused(&self) -> bool {
        self.tx.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().cancelled
    }

    fn try_pass(&self) -> Pass {
        let mut outcome = Pass::Blocked;
        self.tx.send_if_modified(|state| {
            if state.cancelled {
                outcome = Pass::Cancelled;
                false
            } else if !state.paused {
                outcome = Pass::Through;
                false
            } else if state.permits > 0 {
                state.permits -= 1;
                outcome = Pass::Through;
                true
            } else {
                false
            }
        });
        outcome
    }

    /// Wait until the gate lets this caller through.  `on_block` runs once,
    /// with `true` before the first wait and `false` once released.
    pub async fn checkpoint_with<F>(&self, mut on_block: F) -> Result<()>
    where
        F: FnMut(bool),
    {
        let mut rx = self.tx.subscribe();
        let mut blocked = false;
        let result = loop {
            match self.try_pass() {
                Pass::Through => break Ok(()),
                Pass::Cancelled => break Err(AgentError::Cancelled),
                Pass::Blocked => {}
            }
            if !blocked {
                blocked = true;
                on_block(true);
            }
            if rx.changed().await.is_err() {
                break Err(AgentError::Cancelled);
            }
        };
        if blocked {
            on_block(false);
        }
        result
    }

    /// Wait until the gate lets this caller through.
    pub async fn checkpoint(&self) -> Result<()> {
        self.checkpoint_with(|_| {}).await
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Writes execution bookkeeping into the `exec` state.
#[derive(Debug, Clone)]
pub struct ExecTracker {
    store: StateStore,
    gate: PauseGate,
}

impl ExecTracker {
    pub fn new(store: StateStore, gate: PauseGate) -> Self {
        Self { store, gate }
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    fn state(&self) -> Result<StateHandle> {
        Ok(self.store.get(EXEC_STATE)?)
    }

    /// Name of the agent most recently invoked.
    pub fn current(&self) -> Result<Option<String>> {
        Ok(self.state()?.get_as::<String>("current")?)
    }

    /// Record a call edge and mark `me` as current.
    pub fn record_call(&self, parent: Option<&str>, me: &str) -> Result<()> {
        let _guard = exec_lock();
        let exec = self.state()?;
        exec.child("events").append(json!({ "parent": parent, "me": me }))?;
        exec.set("current", me)?;
        Ok(())
    }

    /// Mark `agent` as in flight.
    pub fn agent_start(&self, agent: &str) -> Result<()> {
        let _guard = exec_lock();
        let exec = self.state()?;
        exec.child("tree").set(now_secs().to_string(), agent)?;
        exec.set("pause_before", "agent")?;
        Ok(())
    }

    /// Drop every in-flight entry for `agent`.
    pub fn agent_end(&self, agent: &str) -> Result<()> {
        let _guard = exec_lock();
        let exec = self.state()?;
        let tree = exec.child("tree");
        for key in tree.keys()? {
            if tree.get(&key)?.as_ref().and_then(Value::as_str) == Some(agent) {
                tree.remove(&key)?;
            }
        }
        exec.set("pause_before", Value::Null)?;
        Ok(())
    }

    /// Open a log record for a tool call.
    pub fn tool_start(&self, tool: &str, args: &Value) -> Result<()> {
        let _guard = exec_lock();
        let exec = self.state()?;
        exec.child("logs")
            .append(json!({ "tool": tool, "args": args, "start": now_secs() }))?;
        exec.set("pause_before", "tool")?;
        Ok(())
    }

    /// Close the most recent open record for `tool`.
    pub fn tool_end(&self, tool: &str, result: &Value) -> Result<()> {
        let _guard = exec_lock();
        let exec = self.state()?;
        let logs = exec.child("logs");
        if let Value::Array(entries) = logs.snapshot()? {
            let open = entries.iter().rposition(|entry| {
                entry.get("tool").and_then(Value::as_str) == Some(tool) && entry.get("end").is_none()
            });
            if let Some(index) = open {
                let record = logs.child(index.to_string());
                record.set("result", result.clone())?;
                record.set("end", now_secs())?;
            }
        }
        exec.set("pause_before", Value::Null)?;
        Ok(())
    }

    fn set_waiting(&self, waiting: bool) {
        let _guard = exec_lock();
        let written = self.state().and_then(|exec| Ok(exec.set("waiting", waiting)?));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to record pause state");
        }
    }

    /// Pass the pause gate, mirroring `waiting` into the `exec` state while
    /// blocked.
    pub async fn checkpoint(&self, label: &str) -> Result<()> {
        if !self.gate.is_paused() && !self.gate.is_cancelled() {
            return Ok(());
        }
        debug!(label, "reached pause checkpoint");
        self.gate
            .checkpoint_with(|blocked| {
                if blocked {
                    info!(label, "execution paused");
                } else {
                    debug!(label, "execution released");
                }
                self.set_waiting(blocked);
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tracker() -> ExecTracker {
        ExecTracker::new(StateStore::open_in_memory().unwrap(), PauseGate::new())
    }

    #[tokio::test]
    async fn open_gate_passes_immediately() {
        let gate = PauseGate::new();
        gate.checkpoint().await.unwrap();
        gate.step();
        gate.pause();
        gate.resume();
        gate.checkpoint().await.unwrap();
    }

    #[tokio::test]
    async fn step_releases_exactly_one_waiter() {
        let gate = PauseGate::new();
        gate.pause();

        let first = tokio::spawn({
            let gate = gate.clone();
            async move { gate.checkpoint().await }
        });
        let second = tokio::spawn({
            let gate = gate.clone();
            async move { gate.checkpoint().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!first.is_finished() && !second.is_finished());

        gate.step();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            usize::from(first.is_finished()) + usize::from(second.is_finished()),
            1
        );

        gate.resume();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_fails_waiters() {
        let gate = PauseGate::new();
        gate.pause();
        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.checkpoint().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(AgentError::Cancelled)));
        assert!(matches!(gate.checkpoint().await, Err(AgentError::Cancelled)));
    }

    #[tokio::test]
    async fn waiting_is_mirrored_into_state() {
        let tracker = tracker();
        tracker.gate().pause();
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.checkpoint("tool").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let exec = tracker.store.get(EXEC_STATE).unwrap();
        assert_eq!(exec.get("waiting").unwrap(), Some(json!(true)));

        tracker.gate().step();
        waiter.await.unwrap().unwrap();
        assert_eq!(exec.get("waiting").unwrap(), Some(json!(false)));
    }

    #[test]
    fn agent_tree_tracks_in_flight_agents() {
        let tracker = tracker();
        tracker.agent_start("writer").unwrap();
        std::thread::sleep(Duration::from_millis(2));
        tracker.agent_start("reader").unwrap();
        tracker.agent_end("writer").unwrap();

        let tree = tracker.state().unwrap().child("tree");
        let remaining: Vec<Value> = tree
            .keys()
            .unwrap()
            .iter()
            .filter_map(|k| tree.get(k).unwrap())
            .collect();
        assert_eq!(remaining, vec![json!("reader")]);
        assert_eq!(tracker.state().unwrap().get("pause_before").unwrap(), Some(Value::Null));
    }

    #[test]
    fn tool_end_closes_latest_open_record() {
        let tracker = tracker();
        tracker.tool_start("search", &json!({ "q": 1 })).unwrap();
        tracker.tool_end("search", &json!("first")).unwrap();
        tracker.tool_start("search", &json!({ "q": 2 })).unwrap();
        tracker.tool_end("search", &json!("second")).unwrap();

        let logs = tracker.state().unwrap().get("logs").unwrap().unwrap();
        assert_eq!(logs[0]["result"], "first");
        assert_eq!(logs[1]["result"], "second");
        assert!(logs[1]["end"].as_f64().unwrap() >= logs[1]["start"].as_f64().unwrap());
    }

    #[test]
    fn record_call_sets_current() {
        let tracker = tracker();
        tracker.record_call(None, "root").unwrap();
        tracker.record_call(Some("root"), "child").unwrap();
        assert_eq!(tracker.current().unwrap().as_deref(), Some("child"));
        let events = tracker.state().unwrap().get("events").unwrap().unwrap();
        assert_eq!(events[1], json!({ "parent": "root", "me": "child" }));
    }
}
