use crate::{
    domain::events::{
        DomainEvent, InstanceFailed, InstanceFinished, InstancePaused, InstanceSignalled,
        InstanceStarted, StepEntered, StepFailedOver, StepRetryScheduled, StepSucceeded,
    },
    CoreError, DataPacket,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Value object: Workflow ID, identifies one instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    /// Create a workflow ID from a caller-chosen string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random workflow ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Workflow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionId(pub String);

impl DefinitionId {
    /// Create a definition ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Step name, unique within a definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepName(pub String);

impl StepName {
    /// Create a step name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fencing value minted on every step entry, retry, pause and end.
///
/// Timer firings and completions carry the token that was current when they
/// were armed or issued; only an exact match may drive a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptToken(pub u64);

impl AttemptToken {
    /// Token of the first step entry
    pub const INITIAL: AttemptToken = AttemptToken(1);

    /// The next token in sequence
    #[inline]
    pub fn next(self) -> Self {
        AttemptToken(self.0 + 1)
    }
}

impl fmt::Display for AttemptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// A synchronous step call is executing, or a retry is scheduled
    Running,

    /// An asynchronous call is outstanding
    Waiting,

    /// Paused by a transition, awaiting a signal
    Paused,

    /// Reached `End`
    Finished,

    /// Failed terminally
    Failed,
}

impl InstanceStatus {
    /// Whether no further mutation is permitted
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Finished | InstanceStatus::Failed)
    }

    /// Stable string form, used by stores for indexing
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Waiting => "WAITING",
            InstanceStatus::Paused => "PAUSED",
            InstanceStatus::Finished => "FINISHED",
            InstanceStatus::Failed => "FAILED",
        }
    }

    /// Parse the string form produced by [`InstanceStatus::as_str`]
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value {
            "RUNNING" => Ok(InstanceStatus::Running),
            "WAITING" => Ok(InstanceStatus::Waiting),
            "PAUSED" => Ok(InstanceStatus::Paused),
            "FINISHED" => Ok(InstanceStatus::Finished),
            "FAILED" => Ok(InstanceStatus::Failed),
            other => Err(CoreError::SerializationError(format!(
                "Unknown instance status: {}",
                other
            ))),
        }
    }
}

/// Aggregate: the full state of one workflow instance.
///
/// Every mutation goes through a guarded method that records a domain event.
/// The engine applies mutations to a copy and swaps it in only after the
/// copy has been committed.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowInstanceState {
    /// Instance identifier
    pub workflow_id: WorkflowId,

    /// Definition the instance runs
    pub definition_id: DefinitionId,

    /// Step being executed; `None` once terminal
    pub current_step: Option<StepName>,

    /// Current status
    pub status: InstanceStatus,

    /// Opaque user state
    pub user_state: DataPacket,

    /// Input the current step was entered with
    pub step_input: DataPacket,

    /// Retries consumed by the current step
    pub attempt_count: u32,

    /// Token of the current attempt
    pub attempt_token: AttemptToken,

    /// A retry is armed and the step is not executing
    #[serde(default)]
    pub retry_scheduled: bool,

    /// Last failure message
    pub error: Option<String>,

    /// Sequence number of the commit holding this snapshot (0 = uncommitted)
    pub sequence: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Domain events recorded since the last commit
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl Clone for WorkflowInstanceState {
    fn clone(&self) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            definition_id: self.definition_id.clone(),
            current_step: self.current_step.clone(),
            status: self.status,
            user_state: self.user_state.clone(),
            step_input: self.step_input.clone(),
            attempt_count: self.attempt_count,
            attempt_token: self.attempt_token,
            retry_scheduled: self.retry_scheduled,
            error: self.error.clone(),
            sequence: self.sequence,
            created_at: self.created_at,
            updated_at: self.updated_at,
            events: Vec::new(), // domain events are not cloned
        }
    }
}

impl PartialEq for WorkflowInstanceState {
    fn eq(&self, other: &Self) -> bool {
        self.workflow_id == other.workflow_id
            && self.definition_id == other.definition_id
            && self.current_step == other.current_step
            && self.status == other.status
            && self.user_state == other.user_state
            && self.step_input == other.step_input
            && self.attempt_count == other.attempt_count
            && self.attempt_token == other.attempt_token
            && self.retry_scheduled == other.retry_scheduled
            && self.error == other.error
            && self.sequence == other.sequence
    }
}

impl WorkflowInstanceState {
    /// Create an instance positioned on its entry step
    pub fn new(
        workflow_id: WorkflowId,
        definition_id: DefinitionId,
        entry_step: StepName,
        input: DataPacket,
        initial_state: DataPacket,
        entry_status: InstanceStatus,
    ) -> Self {
        let now = Utc::now();

        let mut instance = Self {
            workflow_id: workflow_id.clone(),
            definition_id: definition_id.clone(),
            current_step: Some(entry_step.clone()),
            status: entry_status,
            user_state: initial_state,
            step_input: input,
            attempt_count: 0,
            attempt_token: AttemptToken::INITIAL,
            retry_scheduled: false,
            error: None,
            sequence: 0,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(4),
        };

        instance.record_event(Box::new(InstanceStarted {
            workflow_id: workflow_id.clone(),
            definition_id,
            timestamp: now,
        }));
        instance.record_event(Box::new(StepEntered {
            workflow_id,
            step: entry_step,
            attempt: 0,
            token: AttemptToken::INITIAL,
            timestamp: now,
        }));

        instance
    }

    /// Whether the instance is finished or failed
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether an event carrying `token` belongs to the active attempt
    #[inline]
    pub fn matches_token(&self, token: AttemptToken) -> bool {
        self.attempt_token == token
    }

    fn ensure_not_terminal(&self, action: &str) -> Result<(), CoreError> {
        if self.is_terminal() {
            return Err(CoreError::TerminalStateError(format!(
                "Cannot {} instance {} in state: {:?}",
                action, self.workflow_id, self.status
            )));
        }
        Ok(())
    }

    /// Replace the user state
    pub fn update_state(&mut self, state: DataPacket) -> Result<(), CoreError> {
        self.ensure_not_terminal("update state of")?;
        self.user_state = state;
        self.touch();
        Ok(())
    }

    /// Record that the current step produced a result
    pub fn record_success(&mut self) {
        if let Some(step) = self.current_step.clone() {
            self.record_event(Box::new(StepSucceeded {
                workflow_id: self.workflow_id.clone(),
                step,
                timestamp: Utc::now(),
            }));
        }
    }

    /// Move to a new step with a fresh attempt
    pub fn enter_step(
        &mut self,
        step: StepName,
        input: DataPacket,
        entry_status: InstanceStatus,
    ) -> Result<(), CoreError> {
        self.ensure_not_terminal("enter a step on")?;

        self.current_step = Some(step.clone());
        self.step_input = input;
        self.attempt_count = 0;
        self.attempt_token = self.attempt_token.next();
        self.retry_scheduled = false;
        self.status = entry_status;
        self.error = None;

        self.record_event(Box::new(StepEntered {
            workflow_id: self.workflow_id.clone(),
            step,
            attempt: 0,
            token: self.attempt_token,
            timestamp: Utc::now(),
        }));

        self.touch();
        Ok(())
    }

    /// Move to the failover step after retries were exhausted
    pub fn fail_over(
        &mut self,
        step: StepName,
        input: DataPacket,
        entry_status: InstanceStatus,
        error: String,
    ) -> Result<(), CoreError> {
        let from = self.current_step.clone();
        self.enter_step(step.clone(), input, entry_status)?;
        self.error = Some(error);

        if let Some(from) = from {
            self.record_event(Box::new(StepFailedOver {
                workflow_id: self.workflow_id.clone(),
                from,
                to: step,
                timestamp: Utc::now(),
            }));
        }
        Ok(())
    }

    /// Consume one retry of the current step and fence off the failed attempt
    pub fn schedule_retry(&mut self, delay: Duration, error: String) -> Result<(), CoreError> {
        self.ensure_not_terminal("retry a step on")?;
        let step = self.current_step.clone().ok_or_else(|| {
            CoreError::UnrecoverableError(format!(
                "Instance {} has no current step to retry",
                self.workflow_id
            ))
        })?;

        self.attempt_count += 1;
        self.attempt_token = self.attempt_token.next();
        self.retry_scheduled = true;
        self.status = InstanceStatus::Running;
        self.error = Some(error.clone());

        self.record_event(Box::new(StepRetryScheduled {
            workflow_id: self.workflow_id.clone(),
            step,
            attempt: self.attempt_count,
            delay,
            error,
            timestamp: Utc::now(),
        }));

        self.touch();
        Ok(())
    }

    /// Start the retry attempt armed by [`schedule_retry`](Self::schedule_retry)
    pub fn begin_retry(&mut self, entry_status: InstanceStatus) -> Result<(), CoreError> {
        self.ensure_not_terminal("begin a retry on")?;
        if !self.retry_scheduled {
            return Err(CoreError::ConflictError(format!(
                "Instance {} has no scheduled retry",
                self.workflow_id
            )));
        }

        self.retry_scheduled = false;
        self.status = entry_status;

        if let Some(step) = self.current_step.clone() {
            self.record_event(Box::new(StepEntered {
                workflow_id: self.workflow_id.clone(),
                step,
                attempt: self.attempt_count,
                token: self.attempt_token,
                timestamp: Utc::now(),
            }));
        }

        self.touch();
        Ok(())
    }

    /// Pause, awaiting a signal
    pub fn pause(&mut self) -> Result<(), CoreError> {
        self.ensure_not_terminal("pause")?;

        self.status = InstanceStatus::Paused;
        self.attempt_token = self.attempt_token.next();
        self.retry_scheduled = false;

        self.record_event(Box::new(InstancePaused {
            workflow_id: self.workflow_id.clone(),
            timestamp: Utc::now(),
        }));

        self.touch();
        Ok(())
    }

    /// Record an accepted signal
    pub fn accept_signal(&mut self) -> Result<(), CoreError> {
        self.ensure_not_terminal("signal")?;
        if self.status != InstanceStatus::Paused {
            return Err(CoreError::ConflictError(format!(
                "Cannot signal instance {} in state: {:?}",
                self.workflow_id, self.status
            )));
        }

        self.record_event(Box::new(InstanceSignalled {
            workflow_id: self.workflow_id.clone(),
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Complete the instance
    pub fn finish(&mut self) -> Result<(), CoreError> {
        self.ensure_not_terminal("finish")?;

        self.status = InstanceStatus::Finished;
        self.current_step = None;
        self.attempt_token = self.attempt_token.next();
        self.retry_scheduled = false;

        self.record_event(Box::new(InstanceFinished {
            workflow_id: self.workflow_id.clone(),
            timestamp: Utc::now(),
        }));

        self.touch();
        Ok(())
    }

    /// Fail the instance terminally
    pub fn fail(&mut self, error: String) -> Result<(), CoreError> {
        self.ensure_not_terminal("fail")?;

        self.status = InstanceStatus::Failed;
        self.current_step = None;
        self.attempt_token = self.attempt_token.next();
        self.retry_scheduled = false;
        self.error = Some(error.clone());

        self.record_event(Box::new(InstanceFailed {
            workflow_id: self.workflow_id.clone(),
            error,
            timestamp: Utc::now(),
        }));

        self.touch();
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_instance() -> WorkflowInstanceState {
        WorkflowInstanceState::new(
            WorkflowId::new("wf-1"),
            DefinitionId::new("transfer"),
            StepName::new("withdraw"),
            DataPacket::new(json!({"amount": 10})),
            DataPacket::new(json!({"balance": 100})),
            InstanceStatus::Running,
        )
    }

    #[test]
    fn test_instance_creation() {
        let mut instance = running_instance();

        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.current_step, Some(StepName::new("withdraw")));
        assert_eq!(instance.attempt_count, 0);
        assert_eq!(instance.attempt_token, AttemptToken::INITIAL);
        assert_eq!(instance.sequence, 0);

        let types: Vec<_> = instance.take_events().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["instance.started", "step.entered"]);
    }

    #[test]
    fn test_enter_step_resets_attempts_and_bumps_token() {
        let mut instance = running_instance();
        instance
            .schedule_retry(Duration::from_millis(10), "boom".into())
            .unwrap();
        assert_eq!(instance.attempt_count, 1);

        instance
            .enter_step(StepName::new("deposit"), DataPacket::null(), InstanceStatus::Waiting)
            .unwrap();

        assert_eq!(instance.attempt_count, 0);
        assert_eq!(instance.attempt_token, AttemptToken(3));
        assert_eq!(instance.status, InstanceStatus::Waiting);
        assert!(!instance.retry_scheduled);
        assert!(instance.error.is_none());
    }

    #[test]
    fn test_retry_cycle() {
        let mut instance = running_instance();
        let before = instance.attempt_token;

        instance
            .schedule_retry(Duration::from_millis(5), "call failed".into())
            .unwrap();
        assert!(instance.retry_scheduled);
        assert!(!instance.matches_token(before));

        instance.begin_retry(InstanceStatus::Waiting).unwrap();
        assert!(!instance.retry_scheduled);
        assert_eq!(instance.status, InstanceStatus::Waiting);

        // a second begin without a scheduled retry is rejected
        assert!(matches!(
            instance.begin_retry(InstanceStatus::Waiting),
            Err(CoreError::ConflictError(_))
        ));
    }

    #[test]
    fn test_terminal_state_rejects_mutation() {
        let mut instance = running_instance();
        instance.finish().unwrap();

        assert_eq!(instance.status, InstanceStatus::Finished);
        assert!(instance.current_step.is_none());

        let state_before = instance.user_state.clone();
        assert!(matches!(
            instance.update_state(DataPacket::new(json!({"balance": 0}))),
            Err(CoreError::TerminalStateError(_))
        ));
        assert!(matches!(
            instance.enter_step(StepName::new("x"), DataPacket::null(), InstanceStatus::Running),
            Err(CoreError::TerminalStateError(_))
        ));
        assert!(matches!(instance.fail("late".into()), Err(CoreError::TerminalStateError(_))));
        assert_eq!(instance.user_state, state_before);
        assert_eq!(instance.status, InstanceStatus::Finished);
    }

    #[test]
    fn test_signal_requires_pause() {
        let mut instance = running_instance();
        assert!(matches!(instance.accept_signal(), Err(CoreError::ConflictError(_))));

        instance.pause().unwrap();
        assert_eq!(instance.status, InstanceStatus::Paused);
        assert!(instance.accept_signal().is_ok());
    }

    #[test]
    fn test_fail_over_records_event() {
        let mut instance = running_instance();
        instance.take_events();

        instance
            .fail_over(
                StepName::new("compensate"),
                DataPacket::null(),
                InstanceStatus::Running,
                "exhausted".into(),
            )
            .unwrap();

        assert_eq!(instance.current_step, Some(StepName::new("compensate")));
        assert_eq!(instance.error.as_deref(), Some("exhausted"));
        let types: Vec<_> = instance.take_events().iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["step.entered", "step.failed_over"]);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Waiting,
            InstanceStatus::Paused,
            InstanceStatus::Finished,
            InstanceStatus::Failed,
        ] {
            assert_eq!(InstanceStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(InstanceStatus::parse("SLEEPING").is_err());
    }

    #[test]
    fn test_instance_serialization_skips_events() {
        let instance = running_instance();
        let serialized = serde_json::to_value(&instance).unwrap();

        assert_eq!(serialized["status"], json!("RUNNING"));
        assert!(serialized.get("events").is_none());

        let deserialized: WorkflowInstanceState = serde_json::from_value(serialized).unwrap();
        assert_eq!(deserialized, instance);
        assert!(deserialized.events.is_empty());
    }
}
