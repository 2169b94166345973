//!
//! Lockstep Core - durable workflow execution engine
//!
//! Workflows are registered as validated step graphs. Every instance is owned
//! by a single task that serializes commands, step results, completions and
//! timer firings, and every transition is committed as one atomic snapshot
//! before it becomes visible. Timer, storage and call collaborators are
//! injected through the traits in [`domain::repository`].
//!
//! Recovery is at-least-once for side effects: after a crash the current
//! step of each instance is executed again with its committed attempt token,
//! so a step's external call may run more than once unless it is idempotent.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - workflow definitions, instance state, collaborator interfaces
pub mod domain;

/// Application layer - instance execution, supervision, commits and the engine
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

/// Subscriber installation
#[cfg(feature = "logging")]
pub mod logging;

pub use application::engine::{
    CommandOutcome, DomainEventHandler, EngineBuilder, TracingEventHandler, WorkflowEngine,
};
pub use config::EngineConfig;
pub use error::CoreError;
pub use types::DataPacket;

pub use domain::codec::{EncodedPayload, JsonMessageCodec, MessageCodec};
pub use domain::recover_strategy::{Backoff, RecoverStrategy};
pub use domain::repository::{
    CommitRecord, CommitStore, Completion, CompletionOutcome, ComponentClient, DeferredRequest,
    IssueResult, PersistedSnapshot, TimerFiring, TimerGateway, TimerKey, TimerKind,
};
pub use domain::step::{Deferred, ScheduledCall, Transition};
pub use domain::workflow_definition::{StepDefinition, StepKind, WorkflowDefinition};
pub use domain::workflow_instance::{
    AttemptToken, DefinitionId, InstanceStatus, StepName, WorkflowId, WorkflowInstanceState,
};
