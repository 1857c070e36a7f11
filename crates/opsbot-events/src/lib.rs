//! opsbot Events
//!
//! Orchestration outcome events and their fan-out to audit and notification
//! consumers.
//!
//! - [`event`] - The [`Event`] payload and its JSON wire form
//! - [`dispatcher`] - Handler registry, synchronous dispatch and the bounded
//!   background executor
//! - [`audit`] - Wildcard handler feeding an [`AuditSink`]

pub mod audit;
pub mod dispatcher;
pub mod error;
pub mod event;

pub use audit::{AuditHandler, AuditSink, TracingAuditSink};
pub use dispatcher::{EventDispatcher, EventDispatcherConfig, EventHandler, HandlerOutcome};
pub use error::EventError;
pub use event::{event_types, Event};
