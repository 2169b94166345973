use crate::{domain::workflow_instance::StepName, CoreError, DataPacket};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Type tag used for payloads that carry no registered schema
pub const JSON_VALUE_TYPE: &str = "json.value";

/// Outcome of a step's transition function.
///
/// A closed union: the state machine interprets it with one exhaustive match
/// after [`Transition::resolve`] has folded away the state updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Enter another step with the given input
    TransitionTo {
        /// Target step
        step: StepName,
        /// Input for the target step
        input: DataPacket,
    },

    /// Stop and wait for a signal
    Pause,

    /// Finish the instance
    End,

    /// Replace the user state, then apply the inner transition
    UpdateStateAndTransition {
        /// New user state
        state: DataPacket,
        /// Transition applied after the update
        then: Box<Transition>,
    },

    /// Arm a named timer that issues `call` when it fires, then apply the
    /// inner transition. Arming a name again replaces the earlier timer.
    StartTimer {
        /// Timer name, unique per instance
        name: String,
        /// Delay before the call is issued
        delay: Duration,
        /// Call issued on firing
        call: Deferred,
        /// Transition applied after arming
        then: Box<Transition>,
    },
}

/// A user timer requested by a transition
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    /// Timer name
    pub name: String,
    /// Delay before firing
    pub delay: Duration,
    /// Call issued on firing
    pub call: Deferred,
}

/// A transition with state updates folded away
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Enter another step
    TransitionTo {
        /// Target step
        step: StepName,
        /// Input for the target step
        input: DataPacket,
    },
    /// Pause
    Pause,
    /// End
    End,
}

/// Resolved form of a [`Transition`]
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTransition {
    /// User state to store before the action, if any
    pub state: Option<DataPacket>,
    /// Timers to arm once the transition is committed, outermost first
    pub timers: Vec<ScheduledCall>,
    /// What to do next
    pub action: Action,
}

impl Transition {
    /// Transition to `step` with `input`
    pub fn to(step: impl Into<String>, input: DataPacket) -> Self {
        Transition::TransitionTo {
            step: StepName::new(step),
            input,
        }
    }

    /// Pause
    pub fn pause() -> Self {
        Transition::Pause
    }

    /// End
    pub fn end() -> Self {
        Transition::End
    }

    /// Update the user state, then apply `then`
    pub fn update_state(state: DataPacket, then: Transition) -> Self {
        Transition::UpdateStateAndTransition {
            state,
            then: Box::new(then),
        }
    }

    /// Arm the timer `name` to issue `call` after `delay`, then apply `then`
    pub fn start_timer(
        name: impl Into<String>,
        delay: Duration,
        call: Deferred,
        then: Transition,
    ) -> Self {
        Transition::StartTimer {
            name: name.into(),
            delay,
            call,
            then: Box::new(then),
        }
    }

    /// Fold nested state updates and collect timers; the innermost update wins
    pub fn resolve(self) -> ResolvedTransition {
        let mut state = None;
        let mut timers = Vec::new();
        let mut current = self;
        let action = loop {
            match current {
                Transition::UpdateStateAndTransition { state: next, then } => {
                    state = Some(next);
                    current = *then;
                }
                Transition::StartTimer {
                    name,
                    delay,
                    call,
                    then,
                } => {
                    timers.push(ScheduledCall { name, delay, call });
                    current = *then;
                }
                Transition::TransitionTo { step, input } => {
                    break Action::TransitionTo { step, input };
                }
                Transition::Pause => break Action::Pause,
                Transition::End => break Action::End,
            }
        };

        ResolvedTransition {
            state,
            timers,
            action,
        }
    }
}

/// Description of an external invocation handed to the component client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deferred {
    /// Target service or workflow
    pub target: String,

    /// Method to invoke on the target
    pub method: String,

    /// Request payload
    pub payload: DataPacket,

    /// Type tag the payload is encoded under
    pub payload_type: String,
}

impl Deferred {
    /// Create a deferred call with an untyped JSON payload
    pub fn new(target: impl Into<String>, method: impl Into<String>, payload: DataPacket) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            payload,
            payload_type: JSON_VALUE_TYPE.to_string(),
        }
    }

    /// Set the payload type tag
    pub fn with_type(mut self, type_tag: impl Into<String>) -> Self {
        self.payload_type = type_tag.into();
        self
    }
}

/// Produces a step's input from the user state and the transition input
pub type InputFn =
    Arc<dyn Fn(&DataPacket, &DataPacket) -> Result<DataPacket, CoreError> + Send + Sync>;

/// Synchronous step work
pub type CallFn =
    Arc<dyn Fn(DataPacket) -> BoxFuture<'static, Result<DataPacket, CoreError>> + Send + Sync>;

/// Builds the deferred call of an async step from its input
pub type IssueFn = Arc<dyn Fn(DataPacket) -> Result<Deferred, CoreError> + Send + Sync>;

/// Maps the user state and a step output to the next transition
pub type ThenFn =
    Arc<dyn Fn(&DataPacket, DataPacket) -> Result<Transition, CoreError> + Send + Sync>;

/// Maps the user state and a signal input to the next transition
pub type SignalFn = ThenFn;
