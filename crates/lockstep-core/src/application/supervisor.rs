use crate::{
    domain::{
        recover_strategy::RecoverStrategy,
        repository::{DeferredRequest, TimerGateway, TimerKey},
        workflow_instance::{AttemptToken, StepName, WorkflowId},
    },
    CoreError, DataPacket,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// What to do after a step failure
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Run the step again after `delay`
    Retry {
        /// Retry number, starting at 1
        attempt: u32,
        /// Backoff before the retry
        delay: Duration,
    },

    /// Leave the step for the failover step
    Failover {
        /// Failover step
        step: StepName,
        /// Explicit failover input
        input: Option<DataPacket>,
    },

    /// Fail the instance
    Fail,
}

/// Arms step timeouts and retry timers and applies recover strategies
pub struct Supervisor {
    timers: Arc<dyn TimerGateway>,
}

impl Supervisor {
    /// Create a supervisor over a timer gateway
    pub fn new(timers: Arc<dyn TimerGateway>) -> Self {
        Self { timers }
    }

    /// Decide how to recover from a failure of a step that has used
    /// `attempt_count` retries so far
    pub fn decide(strategy: &RecoverStrategy, attempt_count: u32) -> RecoveryDecision {
        if attempt_count < strategy.max_retries {
            let attempt = attempt_count + 1;
            return RecoveryDecision::Retry {
                attempt,
                delay: strategy.backoff.delay_for(attempt),
            };
        }

        match &strategy.failover {
            Some(failover) => RecoveryDecision::Failover {
                step: failover.step.clone(),
                input: failover.input.clone(),
            },
            None => RecoveryDecision::Fail,
        }
    }

    /// Arm the step timeout for the attempt fenced by `token`
    pub async fn arm_step_timeout(
        &self,
        workflow_id: &WorkflowId,
        timeout: Option<Duration>,
        token: AttemptToken,
    ) {
        let Some(timeout) = timeout else {
            return;
        };

        debug!(workflow_id = %workflow_id, token = %token, ?timeout, "Arming step timeout");
        let key = TimerKey::step_timeout(workflow_id.clone());
        if let Err(e) = self.timers.schedule(key, timeout, token).await {
            error!(workflow_id = %workflow_id, error = %e, "Failed to arm step timeout");
        }
    }

    /// Arm the retry timer for the attempt fenced by `token`
    pub async fn arm_retry(
        &self,
        workflow_id: &WorkflowId,
        delay: Duration,
        token: AttemptToken,
    ) -> Result<(), CoreError> {
        debug!(workflow_id = %workflow_id, token = %token, ?delay, "Arming retry");
        self.timers
            .schedule(TimerKey::retry(workflow_id.clone()), delay, token)
            .await
    }

    /// Arm the named user timer `name` to issue `call` after `delay`
    pub async fn arm_user_timer(
        &self,
        name: &str,
        delay: Duration,
        call: DeferredRequest,
    ) -> Result<(), CoreError> {
        debug!(workflow_id = %call.workflow_id, timer = name, ?delay, "Arming user timer");
        let key = TimerKey::user(call.workflow_id.clone(), name);
        self.timers.schedule_call(key, delay, call).await
    }

    /// Disarm the step timeout
    pub async fn disarm_step(&self, workflow_id: &WorkflowId) {
        if let Err(e) = self.timers.cancel(&TimerKey::step_timeout(workflow_id.clone())).await {
            debug!(workflow_id = %workflow_id, error = %e, "Failed to disarm step timeout");
        }
    }

    /// Disarm the step timeout and retry timer of an instance.
    /// User timers outlive the instance's steps and stay armed.
    pub async fn disarm_all(&self, workflow_id: &WorkflowId) {
        for key in [
            TimerKey::step_timeout(workflow_id.clone()),
            TimerKey::retry(workflow_id.clone()),
        ] {
            if let Err(e) = self.timers.cancel(&key).await {
                error!(workflow_id = %workflow_id, error = %e, "Failed to disarm timer");
            }
        }
    }
}
