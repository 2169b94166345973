//! Per-instance state machine
//!
//! Every workflow instance is owned by one task draining one mailbox. Commands,
//! step results, completions and timer firings all arrive as
//! [`InstanceMessage`]s, so no two transitions of an instance ever run
//! concurrently. Each transition is applied to a copy of the state, committed,
//! and only then swapped in and published for queries.

use crate::{
    application::{
        engine::{CommandOutcome, EngineContext},
        step_executor::StepExecutor,
        supervisor::{RecoveryDecision, Supervisor},
    },
    domain::{
        repository::{Completion, TimerFiring, TimerKind},
        step::{Action, ScheduledCall, Transition},
        workflow_definition::{StepDefinition, StepGraph},
        workflow_instance::{AttemptToken, InstanceStatus, WorkflowInstanceState},
    },
    CoreError, DataPacket,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Messages processed by an instance, one at a time
pub(crate) enum InstanceMessage {
    /// Commit the initial snapshot and run the entry step
    Start {
        reply: oneshot::Sender<Result<WorkflowInstanceState, CoreError>>,
    },

    /// Resume from the committed snapshot after a restart
    Recover,

    /// External signal
    Signal {
        input: DataPacket,
        reply: oneshot::Sender<Result<CommandOutcome, CoreError>>,
    },

    /// Result of a call step
    StepResult {
        token: AttemptToken,
        result: Result<DataPacket, CoreError>,
    },

    /// Completion of a deferred call
    Completion(Completion),

    /// Timer firing
    TimerFired(TimerFiring),
}

/// Engine-side handle to a running instance
#[derive(Clone)]
pub(crate) struct InstanceHandle {
    pub(crate) mailbox: mpsc::Sender<InstanceMessage>,
    pub(crate) snapshot: watch::Receiver<WorkflowInstanceState>,
    pub(crate) task: Arc<JoinHandle<()>>,
}

impl InstanceHandle {
    /// Whether the instance task is still draining its mailbox
    pub(crate) fn is_live(&self) -> bool {
        !self.mailbox.is_closed()
    }

    /// Last committed snapshot
    pub(crate) fn snapshot(&self) -> WorkflowInstanceState {
        self.snapshot.borrow().clone()
    }
}

/// What the instance does after a committed transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    /// Execute the current step
    Execute,
    /// Wait for the next message
    Idle,
}

pub(crate) struct InstanceActor {
    state: WorkflowInstanceState,
    graph: StepGraph,
    ctx: Arc<EngineContext>,
    mailbox: mpsc::Receiver<InstanceMessage>,
    self_tx: mpsc::WeakSender<InstanceMessage>,
    snapshot_tx: watch::Sender<WorkflowInstanceState>,
    in_flight: Option<AbortHandle>,
    poisoned: bool,
}

impl Drop for InstanceActor {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

impl InstanceActor {
    /// Spawn the task owning `state`
    pub(crate) fn spawn(
        state: WorkflowInstanceState,
        graph: StepGraph,
        ctx: Arc<EngineContext>,
    ) -> InstanceHandle {
        let (tx, rx) = mpsc::channel(ctx.config.mailbox_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());

        let actor = InstanceActor {
            state,
            graph,
            ctx,
            mailbox: rx,
            self_tx: tx.downgrade(),
            snapshot_tx,
            in_flight: None,
            poisoned: false,
        };

        let task = tokio::spawn(actor.run());

        InstanceHandle {
            mailbox: tx,
            snapshot: snapshot_rx,
            task: Arc::new(task),
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            match message {
                InstanceMessage::Start { reply } => {
                    let result = self.on_start().await;
                    let _ = reply.send(result);
                }
                InstanceMessage::Recover => {
                    let followup = self.on_recover().await;
                    self.follow(followup).await;
                }
                InstanceMessage::Signal { input, reply } => {
                    let result = self.on_signal(input).await;
                    let _ = reply.send(result);
                }
                InstanceMessage::StepResult { token, result } => {
                    let followup = self.on_step_result(token, result).await;
                    self.follow(followup).await;
                }
                InstanceMessage::Completion(completion) => {
                    let followup = self.on_completion(completion).await;
                    self.follow(followup).await;
                }
                InstanceMessage::TimerFired(firing) => {
                    let followup = self.on_timer(firing).await;
                    self.follow(followup).await;
                }
            }

            if self.poisoned {
                break;
            }
        }

        debug!(workflow_id = %self.state.workflow_id, "Instance task stopped");
    }

    // ---- commands ----

    async fn on_start(&mut self) -> Result<WorkflowInstanceState, CoreError> {
        if self.state.sequence != 0 {
            return Err(CoreError::AlreadyExists(self.state.workflow_id.to_string()));
        }

        let mut next = self.state.clone();
        next.events = self.state.take_events();
        if let Err(e) = self.commit(next).await {
            // Nothing was committed; the engine discards this task
            self.poisoned = true;
            return Err(e);
        }

        info!(
            workflow_id = %self.state.workflow_id,
            definition = %self.state.definition_id,
            "Workflow instance started"
        );

        self.follow(Ok(Followup::Execute)).await;
        Ok(self.state.clone())
    }

    async fn on_signal(&mut self, input: DataPacket) -> Result<CommandOutcome, CoreError> {
        if self.state.is_terminal() {
            debug!(workflow_id = %self.state.workflow_id, "Signal on terminal instance ignored");
            return Ok(CommandOutcome::Terminal(self.state.clone()));
        }

        if self.state.status != InstanceStatus::Paused {
            warn!(
                workflow_id = %self.state.workflow_id,
                status = self.state.status.as_str(),
                "Signal rejected"
            );
            return Err(CoreError::ConflictError(format!(
                "Cannot signal instance {} while {}",
                self.state.workflow_id,
                self.state.status.as_str()
            )));
        }

        let handler = self.graph.signal_handler().cloned().ok_or_else(|| {
            CoreError::ConflictError(format!(
                "Workflow {} does not accept signals",
                self.graph.id()
            ))
        })?;

        let transition = StepExecutor::interpret_signal(&handler, &self.state.user_state, input)?;
        let followup = self.apply_transition(transition, true).await?;
        self.follow(Ok(followup)).await;

        Ok(CommandOutcome::Applied(self.state.clone()))
    }

    async fn on_recover(&mut self) -> Result<Followup, CoreError> {
        if self.state.is_terminal() || self.state.status == InstanceStatus::Paused {
            return Ok(Followup::Idle);
        }

        let step = match self.current_step() {
            Ok(step) => step,
            Err(e) => return self.fail_unrecoverable(e).await,
        };

        info!(
            workflow_id = %self.state.workflow_id,
            step = %step.name,
            token = %self.state.attempt_token,
            retry_scheduled = self.state.retry_scheduled,
            "Recovering workflow instance"
        );

        if !self.state.retry_scheduled {
            return Ok(Followup::Execute);
        }

        let strategy = self
            .graph
            .recover_strategy_for(&step, &self.ctx.default_strategy)
            .clone();
        let delay = strategy.backoff.delay_for(self.state.attempt_count);
        if delay.is_zero() {
            return self.begin_retry(&step).await;
        }

        self.ctx
            .supervisor
            .arm_retry(&self.state.workflow_id, delay, self.state.attempt_token)
            .await?;
        Ok(Followup::Idle)
    }

    // ---- events ----

    async fn on_step_result(
        &mut self,
        token: AttemptToken,
        result: Result<DataPacket, CoreError>,
    ) -> Result<Followup, CoreError> {
        if !self.accepts(token, InstanceStatus::Running, "step result") {
            return Ok(Followup::Idle);
        }

        self.settle_attempt().await;
        match result {
            Ok(output) => self.on_success(output).await,
            Err(error) => self.on_failure(error).await,
        }
    }

    async fn on_completion(&mut self, completion: Completion) -> Result<Followup, CoreError> {
        if !self.accepts(completion.token, InstanceStatus::Waiting, "completion") {
            return Ok(Followup::Idle);
        }

        self.settle_attempt().await;
        let step = match self.current_step() {
            Ok(step) => step,
            Err(e) => return self.fail_unrecoverable(e).await,
        };

        match self
            .ctx
            .executor
            .completions()
            .decode_outcome(&step, completion.outcome)
        {
            Ok(output) => self.on_success(output).await,
            Err(error) => self.on_failure(error).await,
        }
    }

    async fn on_timer(&mut self, firing: TimerFiring) -> Result<Followup, CoreError> {
        match &firing.key.kind {
            TimerKind::StepTimeout => {
                let expected = self.state.status;
                if !matches!(expected, InstanceStatus::Running | InstanceStatus::Waiting)
                    || !self.accepts(firing.token, expected, "step timeout")
                {
                    return Ok(Followup::Idle);
                }

                self.abort_in_flight();
                let step = self
                    .state
                    .current_step
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                self.on_failure(CoreError::TimeoutError(format!("Step {} timed out", step)))
                    .await
            }
            TimerKind::Retry => {
                if self.state.is_terminal()
                    || !self.state.retry_scheduled
                    || !self.state.matches_token(firing.token)
                {
                    debug!(
                        workflow_id = %self.state.workflow_id,
                        token = %firing.token,
                        "Discarding stale retry timer"
                    );
                    return Ok(Followup::Idle);
                }

                let step = match self.current_step() {
                    Ok(step) => step,
                    Err(e) => return self.fail_unrecoverable(e).await,
                };
                self.begin_retry(&step).await
            }
            TimerKind::User(name) => {
                // The engine issues user timer calls itself
                debug!(workflow_id = %self.state.workflow_id, timer = %name, "Ignoring user timer");
                Ok(Followup::Idle)
            }
        }
    }

    // ---- transitions ----

    async fn on_success(&mut self, output: DataPacket) -> Result<Followup, CoreError> {
        let step = match self.current_step() {
            Ok(step) => step,
            Err(e) => return self.fail_unrecoverable(e).await,
        };

        match StepExecutor::interpret(&step, &self.state.user_state, output) {
            Ok(transition) => self.apply_transition(transition, false).await,
            Err(error) => self.on_failure(error).await,
        }
    }

    async fn apply_transition(
        &mut self,
        transition: Transition,
        signalled: bool,
    ) -> Result<Followup, CoreError> {
        let resolved = transition.resolve();
        let mut next = self.state.clone();

        if signalled {
            next.accept_signal()?;
        } else {
            next.record_success();
        }

        if let Some(state) = resolved.state {
            next.update_state(state)?;
        }

        let followup = match resolved.action {
            Action::TransitionTo { step, input } => match self.graph.step(&step) {
                Some(target) => {
                    next.enter_step(step, input, target.entry_status())?;
                    Followup::Execute
                }
                None => {
                    let error = CoreError::UnrecoverableError(format!(
                        "Transition to unknown step {} from {}",
                        step,
                        self.state
                            .current_step
                            .as_ref()
                            .map(|s| s.as_str())
                            .unwrap_or("<none>")
                    ));
                    error!(workflow_id = %next.workflow_id, error = %error, "Workflow instance failed");
                    next.fail(error.to_string())?;
                    Followup::Idle
                }
            },
            Action::Pause => {
                next.pause()?;
                Followup::Idle
            }
            Action::End => {
                next.finish()?;
                Followup::Idle
            }
        };

        self.commit(next).await?;
        self.arm_user_timers(resolved.timers).await;

        match self.state.status {
            InstanceStatus::Paused => {
                info!(workflow_id = %self.state.workflow_id, "Workflow instance paused");
            }
            InstanceStatus::Finished => {
                info!(workflow_id = %self.state.workflow_id, "Workflow instance finished");
            }
            _ => {}
        }

        Ok(followup)
    }

    /// Arm the timers of a committed transition under the committed token.
    /// Arming failures are logged; the transition stands.
    async fn arm_user_timers(&self, timers: Vec<ScheduledCall>) {
        for timer in timers {
            let armed = match self.ctx.executor.completions().encode_request(
                &self.state.workflow_id,
                self.state.attempt_token,
                timer.call,
            ) {
                Ok(call) => {
                    self.ctx
                        .supervisor
                        .arm_user_timer(&timer.name, timer.delay, call)
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = armed {
                error!(
                    workflow_id = %self.state.workflow_id,
                    timer = %timer.name,
                    error = %e,
                    "Failed to arm user timer"
                );
            }
        }
    }

    async fn on_failure(&mut self, error: CoreError) -> Result<Followup, CoreError> {
        let step = match self.current_step() {
            Ok(step) => step,
            Err(e) => return self.fail_unrecoverable(e).await,
        };

        let strategy = self
            .graph
            .recover_strategy_for(&step, &self.ctx.default_strategy)
            .clone();
        let message = error.to_string();

        warn!(
            workflow_id = %self.state.workflow_id,
            step = %step.name,
            attempt = self.state.attempt_count,
            error = %message,
            "Step failed"
        );

        let mut next = self.state.clone();
        match Supervisor::decide(&strategy, next.attempt_count) {
            RecoveryDecision::Retry { attempt, delay } => {
                next.schedule_retry(delay, message)?;
                if delay.is_zero() {
                    next.begin_retry(step.entry_status())?;
                    self.commit(next).await?;
                    debug!(workflow_id = %self.state.workflow_id, attempt, "Retrying step immediately");
                    return Ok(Followup::Execute);
                }

                self.commit(next).await?;
                self.ctx
                    .supervisor
                    .arm_retry(&self.state.workflow_id, delay, self.state.attempt_token)
                    .await?;
                Ok(Followup::Idle)
            }
            RecoveryDecision::Failover { step: target, input } => {
                let target_def = self.graph.step(&target).ok_or_else(|| {
                    CoreError::UnrecoverableError(format!("Failover step {} does not exist", target))
                })?;
                let input = input.unwrap_or_else(|| next.step_input.clone());

                next.fail_over(target.clone(), input, target_def.entry_status(), message)?;
                self.commit(next).await?;
                info!(
                    workflow_id = %self.state.workflow_id,
                    from = %step.name,
                    to = %target,
                    "Failing over"
                );
                Ok(Followup::Execute)
            }
            RecoveryDecision::Fail => {
                next.fail(message)?;
                self.commit(next).await?;
                error!(
                    workflow_id = %self.state.workflow_id,
                    step = %step.name,
                    attempts = self.state.attempt_count + 1,
                    "Workflow instance failed"
                );
                Ok(Followup::Idle)
            }
        }
    }

    async fn begin_retry(&mut self, step: &StepDefinition) -> Result<Followup, CoreError> {
        let mut next = self.state.clone();
        next.begin_retry(step.entry_status())?;
        self.commit(next).await?;
        Ok(Followup::Execute)
    }

    async fn fail_unrecoverable(&mut self, error: CoreError) -> Result<Followup, CoreError> {
        error!(workflow_id = %self.state.workflow_id, error = %error, "Unrecoverable instance state");

        let mut next = self.state.clone();
        next.fail(error.to_string())?;
        self.commit(next).await?;
        Ok(Followup::Idle)
    }

    // ---- execution ----

    /// Execute the current step until it is in flight or the instance stops
    /// being runnable. Synchronous launch failures go through the supervisor.
    async fn drive(&mut self) {
        loop {
            if self.poisoned
                || self.state.is_terminal()
                || self.state.retry_scheduled
                || !matches!(self.state.status, InstanceStatus::Running | InstanceStatus::Waiting)
            {
                return;
            }

            let step = match self.current_step() {
                Ok(step) => step,
                Err(e) => {
                    let followup = self.fail_unrecoverable(e).await;
                    self.settle(followup);
                    return;
                }
            };

            let Some(mailbox) = self.self_tx.upgrade() else {
                return;
            };

            let timeout = self
                .graph
                .timeout_for(&step, self.ctx.config.default_step_timeout());
            self.ctx
                .supervisor
                .arm_step_timeout(&self.state.workflow_id, timeout, self.state.attempt_token)
                .await;

            let launched = self.ctx.executor.launch(
                &step,
                &self.state.workflow_id,
                self.state.attempt_token,
                &self.state.user_state,
                &self.state.step_input,
                mailbox,
            );

            match launched {
                Ok(task) => {
                    self.abort_in_flight();
                    self.in_flight = Some(task);
                    return;
                }
                Err(error) => {
                    self.ctx.supervisor.disarm_step(&self.state.workflow_id).await;
                    let followup = self.on_failure(error).await;
                    if self.settle(followup) != Followup::Execute {
                        return;
                    }
                }
            }
        }
    }

    async fn follow(&mut self, followup: Result<Followup, CoreError>) {
        if self.settle(followup) == Followup::Execute {
            self.drive().await;
        }
        if self.state.is_terminal() {
            self.release().await;
        }
    }

    /// Resolve a handler result, poisoning the instance on error
    fn settle(&mut self, followup: Result<Followup, CoreError>) -> Followup {
        match followup {
            Ok(followup) => followup,
            Err(e) => {
                error!(
                    workflow_id = %self.state.workflow_id,
                    sequence = self.state.sequence,
                    error = %e,
                    "Transition aborted; instance stays at its last commit until recovered"
                );
                self.poisoned = true;
                Followup::Idle
            }
        }
    }

    // ---- helpers ----

    async fn commit(&mut self, mut next: WorkflowInstanceState) -> Result<(), CoreError> {
        let events = next.take_events();
        let state_type = self.graph.definition().state_type.clone();
        self.ctx.commits.commit(&mut next, &state_type).await?;

        self.state = next;
        self.snapshot_tx.send_replace(self.state.clone());

        for event in events {
            if let Err(e) = self.ctx.event_handler.handle_event(event).await {
                warn!(workflow_id = %self.state.workflow_id, error = %e, "Event handler failed");
            }
        }
        Ok(())
    }

    fn accepts(&self, token: AttemptToken, status: InstanceStatus, what: &str) -> bool {
        if self.state.is_terminal() {
            debug!(workflow_id = %self.state.workflow_id, token = %token, "Discarding {} for terminal instance", what);
            return false;
        }

        if !self.state.matches_token(token) || self.state.retry_scheduled || self.state.status != status {
            warn!(
                workflow_id = %self.state.workflow_id,
                token = %token,
                current = %self.state.attempt_token,
                status = self.state.status.as_str(),
                "Discarding stale {}",
                what
            );
            return false;
        }

        true
    }

    fn current_step(&self) -> Result<StepDefinition, CoreError> {
        let name = self.state.current_step.as_ref().ok_or_else(|| {
            CoreError::UnrecoverableError(format!(
                "Instance {} has no current step",
                self.state.workflow_id
            ))
        })?;

        self.graph.step(name).cloned().ok_or_else(|| {
            CoreError::UnrecoverableError(format!(
                "Step {} no longer exists in workflow {}",
                name,
                self.graph.id()
            ))
        })
    }

    async fn settle_attempt(&mut self) {
        self.in_flight = None;
        self.ctx.supervisor.disarm_step(&self.state.workflow_id).await;
    }

    fn abort_in_flight(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }

    async fn release(&mut self) {
        self.abort_in_flight();
        self.ctx.supervisor.disarm_all(&self.state.workflow_id).await;
    }
}
