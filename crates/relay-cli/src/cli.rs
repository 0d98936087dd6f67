//! CLI argument definitions for Relay.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Relay -- run agent pipelines over a persistent state tree.
#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Relay -- agent pipelines over a persistent state tree",
    long_about = "Runs agents defined as middleware pipelines, with every piece of state \
                  and every lifecycle event persisted in a shared state store."
)]
pub struct Cli {
    /// Config file (default: $RELAY_CONFIG, then ./relay.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Invoke an agent and print its result.
    Run {
        /// Agent name.
        agent: String,

        /// Input text; multiple words are joined with spaces.
        #[arg(required = true, num_args = 1..)]
        input: Vec<String>,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or delete persisted state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Read the event log.
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
pub enum StateAction {
    /// Print a state as JSON.
    Show {
        /// State name.
        name: String,

        /// Dotted path inside the state (e.g. `exec.logs.0`).
        #[arg(long)]
        path: Option<String>,
    },

    /// Delete a state and everything under it.
    Delete {
        /// State name.
        name: String,
    },

    /// List persisted state names.
    List,
}

#[derive(Subcommand)]
pub enum EventsAction {
    /// Print events after the cursor and advance it.
    Tail {
        /// Use the watch cursor instead of the primary one.
        #[arg(long)]
        watch: bool,

        /// Keep polling until interrupted.
        #[arg(long, short)]
        follow: bool,
    },
}
