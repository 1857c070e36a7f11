//! Event dispatch
//!
//! Handlers register under an event type or the `"*"` wildcard. Synchronous
//! dispatch runs every matching handler in registration order and reports
//! each outcome. Background dispatch hands events to a bounded worker pool
//! on a best-effort basis: handler errors and panics are logged and
//! swallowed, a full queue drops the event, and dispatch after shutdown is a
//! no-op.

use std::any::Any;
use std::env::VarError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use opsbot_core::config::parse_or;
use opsbot_core::ConfigError;

use crate::error::EventError;
use crate::event::{event_types, Event};

/// A consumer of dispatched events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and outcomes.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<Value, EventError>;
}

/// Result of running one handler during synchronous dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Completed { handler: String, value: Value },
    Failed { handler: String, error: String },
}

impl HandlerOutcome {
    #[must_use]
    pub fn handler(&self) -> &str {
        match self {
            Self::Completed { handler, .. } | Self::Failed { handler, .. } => handler,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Background executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDispatcherConfig {
    pub max_workers: usize,
    /// Events queued beyond this bound are dropped.
    pub queue_capacity: usize,
}

impl Default for EventDispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_capacity: 256,
        }
    }
}

impl EventDispatcherConfig {
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        Ok(Self {
            max_workers: parse_or(&reader, "EVENT_EXECUTOR_MAX_WORKERS", defaults.max_workers)?,
            queue_capacity: parse_or(&reader, "EVENT_QUEUE_CAPACITY", defaults.queue_capacity)?,
        })
    }
}

struct Registration {
    event_type: String,
    handler: Arc<dyn EventHandler>,
}

/// Ordered handler registry.
#[derive(Clone, Default)]
struct HandlerRegistry {
    registrations: Arc<RwLock<Vec<Registration>>>,
}

impl HandlerRegistry {
    async fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.registrations
            .read()
            .await
            .iter()
            .filter(|r| r.event_type == event_type || r.event_type == event_types::WILDCARD)
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    async fn dispatch(&self, event: &Event) -> Vec<HandlerOutcome> {
        let handlers = self.matching(&event.event_type).await;
        let mut outcomes = Vec::with_capacity(handlers.len());

        for handler in handlers {
            let name = handler.name().to_string();
            let outcome = match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(value)) => HandlerOutcome::Completed {
                    handler: name,
                    value,
                },
                Ok(Err(e)) => {
                    error!(
                        target: "event_dispatch",
                        handler = %name,
                        event_type = %event.event_type,
                        correlation_id = %event.correlation_id,
                        error = %e,
                        "Event handler failed"
                    );
                    HandlerOutcome::Failed {
                        handler: name,
                        error: e.to_string(),
                    }
                }
                Err(panic) => {
                    let err = EventError::HandlerPanicked {
                        handler: name.clone(),
                        cause: panic_message(panic.as_ref()),
                    };
                    error!(
                        target: "event_dispatch",
                        handler = %name,
                        event_type = %event.event_type,
                        correlation_id = %event.correlation_id,
                        error = %err,
                        "Event handler panicked"
                    );
                    HandlerOutcome::Failed {
                        handler: name,
                        error: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }

        outcomes
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Executor {
    sender: mpsc::Sender<Event>,
    workers: Vec<JoinHandle<()>>,
}

/// Fan-out of orchestration events to registered handlers.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: HandlerRegistry,
    executor: Arc<Mutex<Option<Executor>>>,
    config: EventDispatcherConfig,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(EventDispatcherConfig::default())
    }
}

impl EventDispatcher {
    #[must_use]
    pub fn new(config: EventDispatcherConfig) -> Self {
        Self {
            registry: HandlerRegistry::default(),
            executor: Arc::new(Mutex::new(None)),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EventDispatcherConfig {
        &self.config
    }

    /// Register `handler` for `event_type` (or [`event_types::WILDCARD`]).
    pub async fn register(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        debug!(
            target: "event_dispatch",
            event_type = %event_type,
            handler = %handler.name(),
            "Registered event handler"
        );
        self.registry
            .registrations
            .write()
            .await
            .push(Registration {
                event_type,
                handler,
            });
    }

    /// Number of handlers that would receive an event of `event_type`.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.registry.matching(event_type).await.len()
    }

    /// Run every matching handler in registration order and collect outcomes.
    ///
    /// A failing or panicking handler never prevents later handlers from running.
    pub async fn dispatch_event(&self, event: &Event) -> Vec<HandlerOutcome> {
        self.registry.dispatch(event).await
    }

    /// Spawn `max_workers` background workers.
    pub async fn start_event_executor(&self, max_workers: usize) -> Result<(), EventError> {
        let mut executor = self.executor.lock().await;
        if executor.is_some() {
            return Err(EventError::AlreadyRunning);
        }

        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let worker_count = max_workers.max(1);

        let workers = (0..worker_count)
            .map(|worker_id| {
                let registry = self.registry.clone();
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(event) = next else {
                            break;
                        };
                        let outcomes = registry.dispatch(&event).await;
                        debug!(
                            target: "event_dispatch",
                            worker_id,
                            event_type = %event.event_type,
                            correlation_id = %event.correlation_id,
                            handlers = outcomes.len(),
                            failed = outcomes.iter().filter(|o| !o.is_completed()).count(),
                            "Background dispatch complete"
                        );
                    }
                })
            })
            .collect();

        *executor = Some(Executor { sender, workers });
        info!(
            target: "event_dispatch",
            max_workers = worker_count,
            queue_capacity = self.config.queue_capacity,
            "Event executor started"
        );
        Ok(())
    }

    /// Start with the configured worker count.
    pub async fn start(&self) -> Result<(), EventError> {
        self.start_event_executor(self.config.max_workers).await
    }

    pub async fn is_running(&self) -> bool {
        self.executor.lock().await.is_some()
    }

    /// Queue `event` for background handling. Never waits for handlers.
    ///
    /// Returns whether the event was queued. A stopped executor or a full
    /// queue drops the event.
    pub async fn dispatch_background(&self, event: Event) -> bool {
        let executor = self.executor.lock().await;
        let Some(executor) = executor.as_ref() else {
            debug!(
                target: "event_dispatch",
                event_type = %event.event_type,
                correlation_id = %event.correlation_id,
                "Event executor not running, dropping background dispatch"
            );
            return false;
        };

        match executor.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    target: "event_dispatch",
                    event_type = %event.event_type,
                    correlation_id = %event.correlation_id,
                    "Event queue full, dropping background dispatch"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(
                    target: "event_dispatch",
                    event_type = %event.event_type,
                    "Event queue closed, dropping background dispatch"
                );
                false
            }
        }
    }

    /// Stop the executor.
    ///
    /// With `wait`, queued events are drained before this returns; otherwise
    /// workers are aborted and queued events abandoned. Safe to call when
    /// not running.
    pub async fn shutdown_event_executor(&self, wait: bool) {
        let Some(Executor { sender, workers }) = self.executor.lock().await.take() else {
            return;
        };

        if wait {
            drop(sender);
            for worker in workers {
                if let Err(e) = worker.await {
                    warn!(target: "event_dispatch", error = %e, "Event worker ended abnormally");
                }
            }
        } else {
            for worker in &workers {
                worker.abort();
            }
        }

        info!(target: "event_dispatch", drained = wait, "Event executor stopped");
    }
}
