use crate::domain::workflow_instance::{AttemptToken, DefinitionId, StepName, WorkflowId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::time::Duration;

/// Domain event trait for all events recorded by workflow instances
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the workflow instance this event is associated with
    fn workflow_id(&self) -> &WorkflowId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! domain_event {
    ($ty:ident, $name:literal) => {
        impl DomainEvent for $ty {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn workflow_id(&self) -> &WorkflowId {
                &self.workflow_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// Event: workflow instance started
#[derive(Debug)]
pub struct InstanceStarted {
    /// The instance that was started
    pub workflow_id: WorkflowId,

    /// The definition the instance runs
    pub definition_id: DefinitionId,

    /// The timestamp when the instance was created
    pub timestamp: DateTime<Utc>,
}

domain_event!(InstanceStarted, "instance.started");

/// Event: a step was entered, either fresh or as a retry attempt
#[derive(Debug)]
pub struct StepEntered {
    /// The instance entering the step
    pub workflow_id: WorkflowId,

    /// The step being entered
    pub step: StepName,

    /// Zero for the first attempt
    pub attempt: u32,

    /// Token fencing this attempt
    pub token: AttemptToken,

    /// The timestamp when the step was entered
    pub timestamp: DateTime<Utc>,
}

domain_event!(StepEntered, "step.entered");

/// Event: a step completed and its transition was applied
#[derive(Debug)]
pub struct StepSucceeded {
    /// The instance owning the step
    pub workflow_id: WorkflowId,

    /// The step that completed
    pub step: StepName,

    /// The timestamp of completion
    pub timestamp: DateTime<Utc>,
}

domain_event!(StepSucceeded, "step.succeeded");

/// Event: a failed step will be attempted again after a delay
#[derive(Debug)]
pub struct StepRetryScheduled {
    /// The instance owning the step
    pub workflow_id: WorkflowId,

    /// The failing step
    pub step: StepName,

    /// The attempt number about to run
    pub attempt: u32,

    /// Backoff before the attempt
    pub delay: Duration,

    /// The failure that triggered the retry
    pub error: String,

    /// The timestamp of the failure
    pub timestamp: DateTime<Utc>,
}

domain_event!(StepRetryScheduled, "step.retry_scheduled");

/// Event: retries were exhausted and the instance moved to the failover step
#[derive(Debug)]
pub struct StepFailedOver {
    /// The instance owning the step
    pub workflow_id: WorkflowId,

    /// The step whose retries were exhausted
    pub from: StepName,

    /// The failover step
    pub to: StepName,

    /// The timestamp of the failover
    pub timestamp: DateTime<Utc>,
}

domain_event!(StepFailedOver, "step.failed_over");

/// Event: the instance paused, awaiting a signal
#[derive(Debug)]
pub struct InstancePaused {
    /// The paused instance
    pub workflow_id: WorkflowId,

    /// The timestamp of the pause
    pub timestamp: DateTime<Utc>,
}

domain_event!(InstancePaused, "instance.paused");

/// Event: a signal was accepted by a paused instance
#[derive(Debug)]
pub struct InstanceSignalled {
    /// The signalled instance
    pub workflow_id: WorkflowId,

    /// The timestamp of the signal
    pub timestamp: DateTime<Utc>,
}

domain_event!(InstanceSignalled, "instance.signalled");

/// Event: the instance reached `End`
#[derive(Debug)]
pub struct InstanceFinished {
    /// The finished instance
    pub workflow_id: WorkflowId,

    /// The timestamp of completion
    pub timestamp: DateTime<Utc>,
}

domain_event!(InstanceFinished, "instance.finished");

/// Event: the instance failed terminally
#[derive(Debug)]
pub struct InstanceFailed {
    /// The failed instance
    pub workflow_id: WorkflowId,

    /// The error message
    pub error: String,

    /// The timestamp of the failure
    pub timestamp: DateTime<Utc>,
}

domain_event!(InstanceFailed, "instance.failed");
