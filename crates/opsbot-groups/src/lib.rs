//! opsbot Groups
//!
//! Multi-provider group membership orchestration.
//!
//! A change is written to the primary directory first, then propagated to
//! every enabled secondary. Each provider sits behind its own circuit
//! breaker, repeated requests are deduplicated through the idempotency
//! cache, and transient secondary failures are queued for the retry worker.
//!
//! # Modules
//!
//! - [`provider`] - The [`GroupProvider`] trait, capabilities, name mapping,
//!   normalization helpers and the [`ProviderRegistry`]
//! - [`orchestrator`] - [`GroupOrchestrator`] and [`MembershipRequest`]
//! - [`response`] - [`OrchestrationResponse`]
//! - [`propagation`] - Retry payload and [`MembershipPropagationProcessor`]
//! - [`config`] - [`GroupsConfig`]

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod propagation;
pub mod provider;
pub mod response;

pub use config::GroupsConfig;
pub use error::{OrchestratorError, ProviderError};
pub use orchestrator::{GroupOrchestrator, MembershipRequest, DUPLICATE_IN_PROGRESS};
pub use propagation::{MembershipPropagationProcessor, PropagationPayload, PROPAGATION_OPERATION};
pub use provider::{
    GroupNameMapping, GroupProvider, MemberQuery, MembershipAction, NormalizedGroup,
    NormalizedMember, ProviderCapabilities, ProviderKind, ProviderRegistry,
};
pub use response::OrchestrationResponse;
