//! Relay CLI -- main binary entry point.
//!
//! Provides the `relay` command with subcommands for invoking agents,
//! inspecting persisted state and reading the event log.

mod cli;
mod helpers;

use anyhow::{Context, Result};
use clap::Parser;
use relay_agent::{RelayConfig, Runtime};
use relay_kernel::{CursorMode, Dispatcher, DispatcherConfig, EventLog};

use cli::{Cli, Commands, EventsAction, StateAction};
use helpers::{format_event, init_tracing, load_config, load_dotenv};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing("info", cli.json_logs);
    load_dotenv();

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Run { agent, input, json } => cmd_run(&config, &agent, &input.join(" "), json).await,
        Commands::State { action } => cmd_state(&config, action),
        Commands::Events { action } => match action {
            EventsAction::Tail { watch, follow } => cmd_events_tail(&config, watch, follow).await,
        },
    }
}

// ---------------------------------------------------------------------------
// relay run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &RelayConfig, agent: &str, input: &str, json: bool) -> Result<()> {
    let runtime = Runtime::from_config(config).context("failed to build runtime")?;

    let output = runtime
        .invoke(agent, input)
        .await
        .with_context(|| format!("agent '{agent}' failed"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output.to_value())?);
    } else {
        println!("{output}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// relay state
// ---------------------------------------------------------------------------

fn cmd_state(config: &RelayConfig, action: StateAction) -> Result<()> {
    let store = config.state.open().context("failed to open state store")?;

    match action {
        StateAction::Show { name, path } => {
            let mut handle = store.get(&name)?;
            for segment in path.iter().flat_map(|p| p.split('.')).filter(|s| !s.is_empty()) {
                handle = handle.child(segment);
            }
            let value = handle.snapshot()?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        StateAction::Delete { name } => {
            store.delete(&name)?;
            println!("deleted state '{name}'");
        }
        StateAction::List => {
            let names = store.names()?;
            if names.is_empty() {
                println!("no states in {}", store.backend().describe());
            }
            for name in names {
                println!("{name}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// relay events tail
// ---------------------------------------------------------------------------

async fn cmd_events_tail(config: &RelayConfig, watch: bool, follow: bool) -> Result<()> {
    let store = config.state.open().context("failed to open state store")?;
    let mode = if watch {
        CursorMode::Watch
    } else {
        CursorMode::Primary
    };

    let dispatcher = Dispatcher::with_config(
        EventLog::new(store),
        DispatcherConfig {
            mode,
            poll_interval: config.events.poll_interval(),
        },
    );
    dispatcher.on_any(|event| async move {
        println!("{}", format_event(&event));
        Ok(())
    });

    if !follow {
        let count = dispatcher.run_once().await?;
        tracing::debug!(count, "events printed");
        return Ok(());
    }

    dispatcher.start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    dispatcher.stop().await?;
    Ok(())
}
