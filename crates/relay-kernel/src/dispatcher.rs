//! Polling event dispatcher.
//!
//! The dispatcher drives a background tokio task that, every poll
//! interval, drops the store cache, fetches the events newer than its
//! persisted cursor and hands each one to the registered handlers:
//! wildcard handlers first, then handlers for the event's type, each in
//! registration order.  The cursor is advanced to an event's timestamp
//! as soon as that event's handlers finish, so a crash redelivers at most
//! the event that was in flight.
//!
//! # Failure model
//!
//! A handler that returns `Err` is logged and skipped; the remaining
//! handlers still run and the cursor still advances.  A failure to read
//! the log or persist the cursor stops the loop and is returned from
//! [`Dispatcher::stop`].

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{KernelError, Result};
use crate::events::{CursorMode, Event, EventLog};

/// Registration key for handlers that receive every event.
pub const WILDCARD: &str = "*";

/// Default delay between poll cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An async event handler.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

/// Dispatcher settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Which persisted cursor this dispatcher advances.
    pub mode: CursorMode,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: CursorMode::Primary,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Background dispatcher over an [`EventLog`].
///
/// Cheap to clone (`Arc`-backed); clones control the same worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    log: EventLog,
    config: DispatcherConfig,
    /// Handlers keyed by event type; [`WILDCARD`] holds catch-all handlers.
    handlers: DashMap<String, Vec<EventHandler>>,
    running: AtomicBool,
    /// Wakes the worker early when a stop is requested.
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Error that aborted a worker, held until [`Dispatcher::stop`].
    failure: Mutex<Option<KernelError>>,
}

impl Dispatcher {
    /// A dispatcher on the primary cursor with the default interval.
    #[must_use]
    pub fn new(log: EventLog) -> Self {
        Self::with_config(log, DispatcherConfig::default())
    }

    #[must_use]
    pub fn with_config(log: EventLog, config: DispatcherConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                log,
                config,
                handlers: DashMap::new(),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                worker: Mutex::new(None),
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Register `handler` for events of `event_type` (or every event when
    /// `event_type` is [`WILDCARD`]).
    pub fn on<F, Fut>(&self, event_type: &str, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.inner
            .handlers
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
        debug!(event_type, "event handler registered");
    }

    /// Register `handler` for every event.
    pub fn on_any<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.on(WILDCARD, handler);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the background worker.  Returns `false` (and does nothing) if
    /// it is already running.
    ///
    /// Restarting after a fatal error keeps that error for [`stop`](Self::stop).
    pub fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = self
            .inner
            .failure
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(ToString::to_string));
        if let Some(err) = previous {
            warn!(error = %err, "restarting event dispatcher after a fatal error");
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            info!(
                mode = ?inner.config.mode,
                interval_ms = inner.config.poll_interval.as_millis() as u64,
                "event dispatcher started"
            );
            let result = Self::worker_loop(&inner).await;
            inner.running.store(false, Ordering::Release);
            info!("event dispatcher stopped");
            if let Err(err) = result
                && let Ok(mut failure) = inner.failure.lock()
            {
                failure.get_or_insert(err);
            }
        });

        if let Ok(mut slot) = self.inner.worker.lock() {
            *slot = Some(handle);
        }
        true
    }

    /// Stop the worker and wait for the current cycle to finish.
    ///
    /// Returns the first error that aborted a worker since the last stop,
    /// including one from a run that was later restarted.
    pub async fn stop(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wake.notify_one();

        let handle = self.inner.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| KernelError::TaskJoin(e.to_string()))?;
        }

        match self.inner.failure.lock().ok().and_then(|mut slot| slot.take()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run a single poll cycle in the caller's task.  Returns the number of
    /// events dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        Self::cycle(&self.inner).await
    }

    // -- Private helpers ----------------------------------------------------

    async fn worker_loop(inner: &DispatcherInner) -> Result<()> {
        while inner.running.load(Ordering::Acquire) {
            if let Err(err) = Self::cycle(inner).await {
                error!(error = %err, "event dispatch aborted");
                return Err(err);
            }

            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
        }
        Ok(())
    }

    async fn cycle(inner: &DispatcherInner) -> Result<usize> {
        let mode = inner.config.mode;
        let log = inner.log.clone();
        let batch = tokio::task::spawn_blocking(move || {
            log.store().reset_cache();
            let cursor = log.cursor(mode)?;
            log.fetch_since(cursor)
        })
        .await
        .map_err(|e| KernelError::TaskJoin(e.to_string()))??;

        let count = batch.len();
        for event in batch {
            let timestamp = event.timestamp;
            Self::dispatch(inner, event).await;

            let log = inner.log.clone();
            tokio::task::spawn_blocking(move || log.set_cursor(mode, timestamp))
                .await
                .map_err(|e| KernelError::TaskJoin(e.to_string()))??;
        }

        if count > 0 {
            debug!(count, "dispatched event batch");
        }
        Ok(count)
    }

    async fn dispatch(inner: &DispatcherInner, event: Event) {
        let typed = (event.event_type != WILDCARD).then_some(event.event_type.as_str());
        let handlers: Vec<EventHandler> = std::iter::once(WILDCARD)
            .chain(typed)
            .filter_map(|key| inner.handlers.get(key).map(|list| list.value().clone()))
            .flatten()
            .collect();

        for handler in handlers {
            if let Err(reason) = handler(event.clone()).await {
                warn!(
                    event_type = %event.event_type,
                    timestamp = event.timestamp,
                    error = %reason,
                    "event handler failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}
