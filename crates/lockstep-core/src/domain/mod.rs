/// Workflow instance state and identifiers
pub mod workflow_instance;

/// Domain events
pub mod events;

/// Workflow definitions and step graph validation
pub mod workflow_definition;

/// Step transitions and function types
pub mod step;

/// Retry and failover policy
pub mod recover_strategy;

/// Versioned payload encoding
pub mod codec;

/// Collaborator interfaces
pub mod repository;
