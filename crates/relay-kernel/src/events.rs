//! Durable event log.
//!
//! Events are appended to a list inside the reserved `events` state, so
//! every process sharing a state root sees the same log.  Delivery is
//! pull-based: readers keep a persisted timestamp cursor and fetch the
//! events strictly newer than it.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use relay_kernel::events::{EventLog, CursorMode};
//! # use relay_store::StateStore;
//! # use serde_json::json;
//! # fn example() -> relay_kernel::Result<()> {
//! let log = EventLog::new(StateStore::open_directory(".states")?);
//! log.emit("startup", json!({ "pid": 42 }))?;
//!
//! let cursor = log.cursor(CursorMode::Primary)?;
//! for event in log.fetch_since(cursor)? {
//!     println!("{} at {}", event.event_type, event.timestamp);
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

use relay_store::StateStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::error::{KernelError, Result};

/// State holding the log and its cursors.
pub const EVENTS_STATE: &str = "events";
/// Key of the event list inside [`EVENTS_STATE`].
pub const LOG_KEY: &str = "events";

/// Serialises reload-and-append so two in-process emits never claim the
/// same list index.
static APPEND_LOCK: Mutex<()> = Mutex::new(());

fn append_lock() -> MutexGuard<'static, ()> {
    APPEND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One timestamped record in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// String field of the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Which persisted cursor a reader advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CursorMode {
    /// The cursor used by the main dispatcher.
    #[default]
    Primary,
    /// An independent cursor for passive observers.
    Watch,
}

impl CursorMode {
    /// Key of this cursor inside [`EVENTS_STATE`].
    pub fn key(&self) -> &'static str {
        match self {
            Self::Primary => "last_event",
            Self::Watch => "last_event_watch",
        }
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Append-only event log stored in a [`StateStore`].
///
/// Cheap to clone; clones share the store.
#[derive(Debug, Clone)]
pub struct EventLog {
    store: StateStore,
}

impl EventLog {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Append a new event and return it.
    ///
    /// `payload` must be a JSON object (or `null` for an empty payload).
    #[instrument(skip(self, payload))]
    pub fn emit(&self, event_type: &str, payload: Value) -> Result<Event> {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(KernelError::InvalidPayload {
                    event_type: event_type.to_string(),
                    found: other.to_string(),
                });
            }
        };
        self.append(Event::new(event_type, payload))
    }

    /// Append an already-built event.
    pub fn append(&self, event: Event) -> Result<Event> {
        let _guard = append_lock();
        // Another process may have appended since our last load.
        self.store.evict(EVENTS_STATE);
        self.store
            .get(EVENTS_STATE)?
            .child(LOG_KEY)
            .append(serde_json::to_value(&event)?)?;
        debug!(event_type = %event.event_type, timestamp = event.timestamp, "event emitted");
        Ok(event)
    }

    /// Events with a timestamp strictly greater than `cursor`, oldest
    /// first.  Entries that do not decode as events are skipped.
    pub fn fetch_since(&self, cursor: i64) -> Result<Vec<Event>> {
        let raw = self.store.get(EVENTS_STATE)?.child(LOG_KEY).snapshot()?;
        let Value::Array(entries) = raw else {
            return Ok(Vec::new());
        };

        let mut events: Vec<Event> = entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<Event>(entry) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(error = %e, "skipping malformed event");
                    None
                }
            })
            .filter(|event| event.timestamp > cursor)
            .collect();
        events.sort_by_key(|event| event.timestamp);
        Ok(events)
    }

    /// Every event in the log, oldest first.
    pub fn all(&self) -> Result<Vec<Event>> {
        self.fetch_since(i64::MIN)
    }

    /// Current value of the `mode` cursor (0 if never set).
    pub fn cursor(&self, mode: CursorMode) -> Result<i64> {
        Ok(self
            .store
            .get(EVENTS_STATE)?
            .get_as::<i64>(mode.key())?
            .unwrap_or(0))
    }

    /// Persist the `mode` cursor.
    pub fn set_cursor(&self, mode: CursorMode, timestamp: i64) -> Result<()> {
        self.store.get(EVENTS_STATE)?.set(mode.key(), timestamp)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
