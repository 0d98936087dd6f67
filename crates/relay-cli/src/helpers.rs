//! Shared helpers for the CLI binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use relay_agent::{CONFIG_ENV, DEFAULT_CONFIG_FILE, RelayConfig};
use relay_kernel::Event;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the global tracing subscriber.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Load `.env` from the working directory if there is one.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, "failed to load .env"),
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// `--config`, then `$RELAY_CONFIG`, then `./relay.toml`.
pub fn config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub fn load_config(flag: Option<PathBuf>) -> Result<RelayConfig> {
    let path = config_path(flag);
    RelayConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// One line per event: time, type, payload.
pub fn format_event(event: &Event) -> String {
    let when = chrono::DateTime::from_timestamp_millis(event.timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| event.timestamp.to_string());
    let payload = serde_json::Value::Object(event.payload.clone());
    format!("{when}  {:<20} {payload}", event.event_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_config_flag_wins() {
        let path = config_path(Some(PathBuf::from("/tmp/custom.toml")));
        assert_eq!(path, PathBuf::from("/tmp/custom.toml"));
    }

    #[test]
    fn event_line_carries_type_and_payload() {
        let event = Event {
            event_type: "tool_used".into(),
            payload: json!({ "tool": "add" }).as_object().cloned().unwrap_or_default(),
            timestamp: 0,
        };
        let line = format_event(&event);
        assert!(line.starts_with("1970-01-01 00:00:00.000"));
        assert!(line.contains("tool_used"));
        assert!(line.ends_with(r#"{"tool":"add"}"#));
    }
}
