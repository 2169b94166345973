use thiserror::Error;

/// Core error type for the Lockstep engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Malformed workflow definition, raised at registration
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A step's call, input or transition function failed
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// A step or workflow timeout elapsed
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Command not permitted in the instance's current status
    #[error("Conflict error: {0}")]
    ConflictError(String),

    /// Mutating command or event targeting a finished or failed instance
    #[error("Terminal state error: {0}")]
    TerminalStateError(String),

    /// Committed state no longer matches its definition
    #[error("Unrecoverable error: {0}")]
    UnrecoverableError(String),

    /// An instance with the same workflow ID already exists
    #[error("Workflow instance already exists: {0}")]
    AlreadyExists(String),

    /// Workflow instance not found
    #[error("Workflow instance not found: {0}")]
    WorkflowInstanceNotFound(String),

    /// Workflow definition not found
    #[error("Workflow definition not found: {0}")]
    WorkflowDefinitionNotFound(String),

    /// Payload could not be decoded for the expected type
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Commit store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Timer gateway error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the supervisor may apply the recover strategy for this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::StepExecutionError(_) | CoreError::TimeoutError(_) | CoreError::DecodeError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
