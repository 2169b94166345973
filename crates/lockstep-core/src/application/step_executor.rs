use crate::{
    application::{completion::CompletionAdapter, instance_actor::InstanceMessage},
    domain::{
        step::{SignalFn, Transition},
        workflow_definition::{StepDefinition, StepKind},
        workflow_instance::{AttemptToken, WorkflowId},
    },
    CoreError, DataPacket,
};
use futures::FutureExt;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Runs a step's work and interprets its result.
///
/// User functions never escape: errors and panics both come back as
/// `StepExecutionError` (timeouts and decode failures keep their kind).
pub struct StepExecutor {
    completions: CompletionAdapter,
}

impl StepExecutor {
    /// Create an executor
    pub fn new(completions: CompletionAdapter) -> Self {
        Self { completions }
    }

    /// The completion adapter used for async steps
    pub fn completions(&self) -> &CompletionAdapter {
        &self.completions
    }

    /// Compute the input of `step`
    pub fn step_input(
        step: &StepDefinition,
        user_state: &DataPacket,
        transition_input: &DataPacket,
    ) -> Result<DataPacket, CoreError> {
        match &step.input {
            Some(input) => guard(|| input(user_state, transition_input)),
            None => Ok(transition_input.clone()),
        }
    }

    /// Start `step` for the attempt fenced by `token`.
    ///
    /// Call steps run on a spawned task and report a `StepResult`; async steps
    /// issue their deferred call and report a `Completion`. An `Err` means the
    /// step failed before anything was started.
    pub(crate) fn launch(
        &self,
        step: &StepDefinition,
        workflow_id: &WorkflowId,
        token: AttemptToken,
        user_state: &DataPacket,
        transition_input: &DataPacket,
        mailbox: mpsc::Sender<InstanceMessage>,
    ) -> Result<AbortHandle, CoreError> {
        let input = Self::step_input(step, user_state, transition_input)?;

        debug!(
            workflow_id = %workflow_id,
            step = %step.name,
            kind = step.kind.as_str(),
            token = %token,
            "Launching step"
        );

        match &step.kind {
            StepKind::Call { call, .. } => {
                let future = guard(|| Ok(call(input)))?;
                let task = tokio::spawn(async move {
                    let result = match AssertUnwindSafe(future).catch_unwind().await {
                        Ok(result) => result.map_err(into_step_error),
                        Err(panic) => Err(panic_error(panic)),
                    };

                    if mailbox
                        .send(InstanceMessage::StepResult { token, result })
                        .await
                        .is_err()
                    {
                        warn!(token = %token, "Instance mailbox closed before step result arrived");
                    }
                });
                Ok(task.abort_handle())
            }
            StepKind::AsyncCall { issue, .. } => {
                let issue = issue.as_ref().ok_or_else(|| {
                    CoreError::UnrecoverableError(format!("Async step {} has no call function", step.name))
                })?;
                let deferred = guard(|| issue(input))?;
                self.completions.issue(workflow_id, token, deferred, mailbox)
            }
        }
    }

    /// Map a step output to the next transition
    pub fn interpret(
        step: &StepDefinition,
        user_state: &DataPacket,
        output: DataPacket,
    ) -> Result<Transition, CoreError> {
        let then = match &step.kind {
            StepKind::Call { then, .. } => then,
            StepKind::AsyncCall { on_completion, .. } => on_completion.as_ref().ok_or_else(|| {
                CoreError::UnrecoverableError(format!(
                    "Async step {} has no completion function",
                    step.name
                ))
            })?,
        };

        guard(|| then(user_state, output))
    }

    /// Map a signal input to the next transition
    pub fn interpret_signal(
        handler: &SignalFn,
        user_state: &DataPacket,
        input: DataPacket,
    ) -> Result<Transition, CoreError> {
        guard(|| handler(user_state, input))
    }
}

fn guard<T>(f: impl FnOnce() -> Result<T, CoreError>) -> Result<T, CoreError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(into_step_error),
        Err(panic) => Err(panic_error(panic)),
    }
}

fn into_step_error(error: CoreError) -> CoreError {
    if error.is_recoverable() {
        error
    } else {
        CoreError::StepExecutionError(error.to_string())
    }
}

fn panic_error(panic: Box<dyn Any + Send>) -> CoreError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    CoreError::StepExecutionError(format!("Step panicked: {}", message))
}
