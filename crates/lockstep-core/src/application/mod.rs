/// Timeout and retry supervision
pub mod supervisor;

/// Persistence commit protocol
pub mod commit;

/// Deferred calls and their completions
pub mod completion;

/// Step execution and transition interpretation
pub mod step_executor;

/// Per-instance state machine
pub(crate) mod instance_actor;

/// Workflow engine command surface
pub mod engine;
