use crate::{
    domain::{
        recover_strategy::RecoverStrategy,
        step::{CallFn, Deferred, InputFn, IssueFn, SignalFn, ThenFn, Transition, JSON_VALUE_TYPE},
        workflow_instance::{DefinitionId, InstanceStatus, StepName},
    },
    CoreError, DataPacket,
};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// What a step does when executed
#[derive(Clone)]
pub enum StepKind {
    /// Work executed in-process; its output feeds `then`
    Call {
        /// The work
        call: CallFn,
        /// Maps the output to a transition
        then: ThenFn,
    },

    /// A deferred call issued through the component client
    AsyncCall {
        /// Builds the deferred call
        issue: Option<IssueFn>,
        /// Maps the completion value to a transition
        on_completion: Option<ThenFn>,
    },
}

impl StepKind {
    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Call { .. } => "call",
            StepKind::AsyncCall { .. } => "async_call",
        }
    }
}

/// One named step of a workflow
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique name within the workflow
    pub name: StepName,

    /// Call or async call
    pub kind: StepKind,

    /// Produces the step input; the transition input is used unchanged when absent
    pub input: Option<InputFn>,

    /// Per-step timeout
    pub timeout: Option<Duration>,

    /// Per-step recover strategy
    pub recover_strategy: Option<RecoverStrategy>,

    /// Steps this step's transition function may move to
    pub declared_targets: Vec<StepName>,

    /// Expected type tag of an async call's result
    pub result_type: Option<String>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind.as_str())
            .field("has_input", &self.input.is_some())
            .field("timeout", &self.timeout)
            .field("recover_strategy", &self.recover_strategy)
            .field("declared_targets", &self.declared_targets)
            .field("result_type", &self.result_type)
            .finish()
    }
}

impl StepDefinition {
    /// Create a step from its parts
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: StepName::new(name),
            kind,
            input: None,
            timeout: None,
            recover_strategy: None,
            declared_targets: Vec::new(),
            result_type: None,
        }
    }

    /// A step running `call` in-process
    pub fn call<C, Fut, T>(name: impl Into<String>, call: C, then: T) -> Self
    where
        C: Fn(DataPacket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DataPacket, CoreError>> + Send + 'static,
        T: Fn(&DataPacket, DataPacket) -> Result<Transition, CoreError> + Send + Sync + 'static,
    {
        let call: CallFn = Arc::new(move |input| call(input).boxed());
        Self::new(
            name,
            StepKind::Call {
                call,
                then: Arc::new(then),
            },
        )
    }

    /// A step issuing a deferred call and awaiting its completion
    pub fn async_call<I, T>(name: impl Into<String>, issue: I, on_completion: T) -> Self
    where
        I: Fn(DataPacket) -> Result<Deferred, CoreError> + Send + Sync + 'static,
        T: Fn(&DataPacket, DataPacket) -> Result<Transition, CoreError> + Send + Sync + 'static,
    {
        Self::new(
            name,
            StepKind::AsyncCall {
                issue: Some(Arc::new(issue)),
                on_completion: Some(Arc::new(on_completion)),
            },
        )
    }

    /// Derive the step input from the user state and transition input
    pub fn with_input<F>(mut self, input: F) -> Self
    where
        F: Fn(&DataPacket, &DataPacket) -> Result<DataPacket, CoreError> + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(input));
        self
    }

    /// Set the step timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the step recover strategy
    pub fn with_recover_strategy(mut self, strategy: RecoverStrategy) -> Self {
        self.recover_strategy = Some(strategy);
        self
    }

    /// Declare the steps the transition function may target
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_targets = targets.into_iter().map(StepName::new).collect();
        self
    }

    /// Declare the type tag of the async call's result
    pub fn with_result_type(mut self, type_tag: impl Into<String>) -> Self {
        self.result_type = Some(type_tag.into());
        self
    }

    /// Status an instance holds while this step executes
    pub fn entry_status(&self) -> InstanceStatus {
        match self.kind {
            StepKind::Call { .. } => InstanceStatus::Running,
            StepKind::AsyncCall { .. } => InstanceStatus::Waiting,
        }
    }
}

/// A workflow: its steps, entry point and policies
#[derive(Clone)]
pub struct WorkflowDefinition {
    /// Definition identifier
    pub id: DefinitionId,

    /// Type tag the user state is encoded under
    pub state_type: String,

    /// User state of a new instance
    pub initial_state: DataPacket,

    /// Steps in declaration order
    pub steps: Vec<StepDefinition>,

    /// Step entered by `start`; the first step when absent
    pub entry_step: Option<StepName>,

    /// Timeout for steps without their own
    pub workflow_timeout: Option<Duration>,

    /// Recover strategy for steps without their own
    pub default_recover_strategy: Option<RecoverStrategy>,

    /// Handler for signals delivered to a paused instance
    pub signal_handler: Option<SignalFn>,
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("state_type", &self.state_type)
            .field("steps", &self.steps)
            .field("entry_step", &self.entry_step)
            .field("workflow_timeout", &self.workflow_timeout)
            .field("default_recover_strategy", &self.default_recover_strategy)
            .field("has_signal_handler", &self.signal_handler.is_some())
            .finish()
    }
}

impl WorkflowDefinition {
    /// Start building a definition
    pub fn builder(id: impl Into<String>) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder {
            definition: WorkflowDefinition {
                id: DefinitionId::new(id),
                state_type: JSON_VALUE_TYPE.to_string(),
                initial_state: DataPacket::null(),
                steps: Vec::new(),
                entry_step: None,
                workflow_timeout: None,
                default_recover_strategy: None,
                signal_handler: None,
            },
        }
    }
}

/// Builder for [`WorkflowDefinition`]
pub struct WorkflowDefinitionBuilder {
    definition: WorkflowDefinition,
}

impl WorkflowDefinitionBuilder {
    /// Type tag of the user state
    pub fn state_type(mut self, type_tag: impl Into<String>) -> Self {
        self.definition.state_type = type_tag.into();
        self
    }

    /// Initial user state
    pub fn initial_state(mut self, state: DataPacket) -> Self {
        self.definition.initial_state = state;
        self
    }

    /// Append a step
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.definition.steps.push(step);
        self
    }

    /// Entry step
    pub fn entry(mut self, step: impl Into<String>) -> Self {
        self.definition.entry_step = Some(StepName::new(step));
        self
    }

    /// Workflow-level step timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.workflow_timeout = Some(timeout);
        self
    }

    /// Workflow-level recover strategy
    pub fn default_recover_strategy(mut self, strategy: RecoverStrategy) -> Self {
        self.definition.default_recover_strategy = Some(strategy);
        self
    }

    /// Handler for signals delivered to a paused instance
    pub fn on_signal<F>(mut self, handler: F) -> Self
    where
        F: Fn(&DataPacket, DataPacket) -> Result<Transition, CoreError> + Send + Sync + 'static,
    {
        self.definition.signal_handler = Some(Arc::new(handler));
        self
    }

    /// Finish building
    pub fn build(self) -> WorkflowDefinition {
        self.definition
    }
}

/// A validated, immutable workflow definition indexed by step name
#[derive(Clone)]
pub struct StepGraph {
    definition: Arc<WorkflowDefinition>,
    index: Arc<HashMap<StepName, usize>>,
    entry: usize,
}

impl fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGraph")
            .field("definition", &self.definition.id)
            .field("steps", &self.definition.steps.len())
            .finish()
    }
}

/// Check a definition and index its steps
pub fn validate(definition: WorkflowDefinition) -> Result<StepGraph, CoreError> {
    let id = &definition.id;

    if definition.steps.is_empty() {
        return Err(CoreError::ValidationError(format!(
            "Workflow {} must have at least one step",
            id
        )));
    }

    let mut index = HashMap::with_capacity(definition.steps.len());
    for (position, step) in definition.steps.iter().enumerate() {
        if index.insert(step.name.clone(), position).is_some() {
            return Err(CoreError::ValidationError(format!(
                "Duplicate step name in workflow {}: {}",
                id, step.name
            )));
        }
    }

    let entry = match &definition.entry_step {
        Some(name) => *index.get(name).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Entry step of workflow {} does not exist: {}",
                id, name
            ))
        })?,
        None => 0,
    };

    let mut checked = HashSet::new();
    for step in &definition.steps {
        for target in &step.declared_targets {
            if !index.contains_key(target) {
                return Err(CoreError::ValidationError(format!(
                    "Step {} references non-existent step: {}",
                    step.name, target
                )));
            }
        }

        if let Some(failover) = step.recover_strategy.as_ref().and_then(|s| s.failover.as_ref()) {
            if !index.contains_key(&failover.step) {
                return Err(CoreError::ValidationError(format!(
                    "Step {} fails over to non-existent step: {}",
                    step.name, failover.step
                )));
            }
        }

        if let StepKind::AsyncCall {
            issue,
            on_completion,
        } = &step.kind
        {
            if issue.is_none() {
                return Err(CoreError::ValidationError(format!(
                    "Async step {} has no call function",
                    step.name
                )));
            }
            if on_completion.is_none() {
                return Err(CoreError::ValidationError(format!(
                    "Async step {} has no completion function",
                    step.name
                )));
            }
        }

        if let Some(timeout) = step.timeout {
            if timeout.is_zero() {
                return Err(CoreError::ValidationError(format!(
                    "Step {} has a zero timeout",
                    step.name
                )));
            }
        }

        checked.insert(&step.name);
    }

    if let Some(failover) = definition
        .default_recover_strategy
        .as_ref()
        .and_then(|s| s.failover.as_ref())
    {
        if !checked.contains(&failover.step) {
            return Err(CoreError::ValidationError(format!(
                "Workflow {} fails over to non-existent step: {}",
                id, failover.step
            )));
        }
    }

    if definition.workflow_timeout.is_some_and(|t| t.is_zero()) {
        return Err(CoreError::ValidationError(format!(
            "Workflow {} has a zero timeout",
            id
        )));
    }

    Ok(StepGraph {
        definition: Arc::new(definition),
        index: Arc::new(index),
        entry,
    })
}

impl StepGraph {
    /// The underlying definition
    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Definition identifier
    pub fn id(&self) -> &DefinitionId {
        &self.definition.id
    }

    /// Look up a step by name
    pub fn step(&self, name: &StepName) -> Option<&StepDefinition> {
        self.index
            .get(name)
            .and_then(|position| self.definition.steps.get(*position))
    }

    /// Whether the graph contains `name`
    pub fn contains(&self, name: &StepName) -> bool {
        self.index.contains_key(name)
    }

    /// The step entered by `start`
    pub fn entry(&self) -> &StepDefinition {
        &self.definition.steps[self.entry]
    }

    /// Timeout of `step`: its own, else the workflow's, else `fallback`
    pub fn timeout_for(&self, step: &StepDefinition, fallback: Option<Duration>) -> Option<Duration> {
        step.timeout
            .or(self.definition.workflow_timeout)
            .or(fallback)
    }

    /// Recover strategy of `step`: its own, else the workflow's, else `fallback`
    pub fn recover_strategy_for<'a>(
        &'a self,
        step: &'a StepDefinition,
        fallback: &'a RecoverStrategy,
    ) -> &'a RecoverStrategy {
        step.recover_strategy
            .as_ref()
            .or(self.definition.default_recover_strategy.as_ref())
            .unwrap_or(fallback)
    }

    /// Signal handler, if registered
    pub fn signal_handler(&self) -> Option<&SignalFn> {
        self.definition.signal_handler.as_ref()
    }
}
