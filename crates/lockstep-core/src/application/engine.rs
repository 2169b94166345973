use crate::{
    application::{
        commit::CommitProtocol,
        completion::CompletionAdapter,
        instance_actor::{InstanceActor, InstanceHandle, InstanceMessage},
        step_executor::StepExecutor,
        supervisor::Supervisor,
    },
    config::EngineConfig,
    domain::{
        codec::{JsonMessageCodec, MessageCodec},
        events::DomainEvent,
        recover_strategy::RecoverStrategy,
        repository::{
            CommitRecord, CommitStore, Completion, ComponentClient, TimerFiring, TimerGateway,
            TimerKind,
        },
        workflow_definition::{validate, StepGraph, WorkflowDefinition},
        workflow_instance::{DefinitionId, WorkflowId, WorkflowInstanceState},
    },
    CoreError, DataPacket,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler for domain events, called after each successful commit
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError>;
}

/// Event handler that logs every event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventHandler;

#[async_trait]
impl DomainEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        debug!(
            event_type = event.event_type(),
            workflow_id = %event.workflow_id(),
            timestamp = %event.timestamp(),
            "{:?}",
            event
        );
        Ok(())
    }
}

/// Result of a mutating command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The command was applied; the snapshot is the committed result
    Applied(WorkflowInstanceState),

    /// The instance is finished or failed; nothing changed
    Terminal(WorkflowInstanceState),
}

impl CommandOutcome {
    /// The resulting snapshot
    pub fn snapshot(&self) -> &WorkflowInstanceState {
        match self {
            CommandOutcome::Applied(state) | CommandOutcome::Terminal(state) => state,
        }
    }

    /// Take the resulting snapshot
    pub fn into_snapshot(self) -> WorkflowInstanceState {
        match self {
            CommandOutcome::Applied(state) | CommandOutcome::Terminal(state) => state,
        }
    }

    /// Whether the command hit a terminal instance
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandOutcome::Terminal(_))
    }

    /// Treat a terminal no-op as `TerminalStateError`
    pub fn into_result(self) -> Result<WorkflowInstanceState, CoreError> {
        match self {
            CommandOutcome::Applied(state) => Ok(state),
            CommandOutcome::Terminal(state) => Err(CoreError::TerminalStateError(format!(
                "Instance {} is {}",
                state.workflow_id,
                state.status.as_str()
            ))),
        }
    }
}

/// Collaborators shared by all instances of an engine
pub(crate) struct EngineContext {
    pub(crate) commits: CommitProtocol,
    pub(crate) supervisor: Supervisor,
    pub(crate) executor: StepExecutor,
    pub(crate) event_handler: Arc<dyn DomainEventHandler>,
    pub(crate) config: EngineConfig,
    pub(crate) default_strategy: RecoverStrategy,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    definitions: DashMap<DefinitionId, StepGraph>,
    instances: DashMap<WorkflowId, InstanceHandle>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Builder for [`WorkflowEngine`]
#[derive(Default)]
pub struct EngineBuilder {
    commit_store: Option<Arc<dyn CommitStore>>,
    timer_gateway: Option<Arc<dyn TimerGateway>>,
    component_client: Option<Arc<dyn ComponentClient>>,
    codec: Option<Arc<dyn MessageCodec>>,
    event_handler: Option<Arc<dyn DomainEventHandler>>,
    config: Option<EngineConfig>,
}

impl EngineBuilder {
    /// Commit store (required)
    pub fn commit_store(mut self, store: Arc<dyn CommitStore>) -> Self {
        self.commit_store = Some(store);
        self
    }

    /// Timer gateway (required)
    pub fn timer_gateway(mut self, timers: Arc<dyn TimerGateway>) -> Self {
        self.timer_gateway = Some(timers);
        self
    }

    /// Component client (required)
    pub fn component_client(mut self, client: Arc<dyn ComponentClient>) -> Self {
        self.component_client = Some(client);
        self
    }

    /// Message codec; defaults to an empty [`JsonMessageCodec`]
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Domain event handler; defaults to [`TracingEventHandler`]
    pub fn event_handler(mut self, handler: Arc<dyn DomainEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Engine configuration; defaults to [`EngineConfig::default`]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<WorkflowEngine, CoreError> {
        let store = self
            .commit_store
            .ok_or_else(|| CoreError::ConfigurationError("A commit store is required".to_string()))?;
        let timers = self
            .timer_gateway
            .ok_or_else(|| CoreError::ConfigurationError("A timer gateway is required".to_string()))?;
        let client = self.component_client.ok_or_else(|| {
            CoreError::ConfigurationError("A component client is required".to_string())
        })?;
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(JsonMessageCodec::new()));
        let event_handler = self
            .event_handler
            .unwrap_or_else(|| Arc::new(TracingEventHandler));
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let ctx = EngineContext {
            commits: CommitProtocol::new(store, codec.clone()),
            supervisor: Supervisor::new(timers),
            executor: StepExecutor::new(CompletionAdapter::new(client, codec)),
            event_handler,
            default_strategy: config.default_recover_strategy(),
            config,
        };

        Ok(WorkflowEngine {
            inner: Arc::new(EngineInner {
                ctx: Arc::new(ctx),
                definitions: DashMap::new(),
                instances: DashMap::with_capacity(64),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Command surface of the workflow engine.
///
/// Cheap to clone; clones share definitions and running instances.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Validate and register a workflow definition
    pub fn register(&self, definition: WorkflowDefinition) -> Result<(), CoreError> {
        let graph = validate(definition)?;

        match self.inner.definitions.entry(graph.id().clone()) {
            Entry::Occupied(_) => Err(CoreError::ValidationError(format!(
                "Workflow definition already registered: {}",
                graph.id()
            ))),
            Entry::Vacant(vacant) => {
                info!(definition = %graph.id(), steps = graph.definition().steps.len(), "Registered workflow definition");
                vacant.insert(graph);
                Ok(())
            }
        }
    }

    /// Whether a definition is registered
    pub fn is_registered(&self, definition_id: &str) -> bool {
        self.inner
            .definitions
            .contains_key(&DefinitionId::new(definition_id))
    }

    /// Create an instance of `definition_id` and run its entry step.
    ///
    /// Returns the snapshot once the start has been committed and the entry
    /// step launched.
    pub async fn start(
        &self,
        definition_id: &str,
        workflow_id: WorkflowId,
        input: DataPacket,
    ) -> Result<WorkflowInstanceState, CoreError> {
        let graph = self.graph(&DefinitionId::new(definition_id))?;

        if self.inner.instances.contains_key(&workflow_id)
            || self.ctx().commits.load_latest(&workflow_id).await?.is_some()
        {
            warn!(workflow_id = %workflow_id, "Start rejected: instance already exists");
            return Err(CoreError::AlreadyExists(workflow_id.to_string()));
        }

        let entry = graph.entry();
        let state = WorkflowInstanceState::new(
            workflow_id.clone(),
            graph.id().clone(),
            entry.name.clone(),
            input,
            graph.definition().initial_state.clone(),
            entry.entry_status(),
        );

        let handle = match self.inner.instances.entry(workflow_id.clone()) {
            Entry::Occupied(_) => return Err(CoreError::AlreadyExists(workflow_id.to_string())),
            Entry::Vacant(vacant) => {
                let handle = InstanceActor::spawn(state, graph, self.inner.ctx.clone());
                vacant.insert(handle.clone());
                handle
            }
        };

        match Self::request(&handle, &workflow_id, |reply| InstanceMessage::Start { reply }).await {
            Ok(state) => Ok(state),
            Err(e) => {
                self.inner.instances.remove(&workflow_id);
                handle.task.abort();
                match e {
                    CoreError::ConflictError(_) => Err(CoreError::AlreadyExists(workflow_id.to_string())),
                    other => Err(other),
                }
            }
        }
    }

    /// Start an instance of `definition_id` under a freshly generated id
    pub async fn start_new(
        &self,
        definition_id: &str,
        input: DataPacket,
    ) -> Result<WorkflowInstanceState, CoreError> {
        self.start(definition_id, WorkflowId::generate(), input).await
    }

    /// Signal an instance.
    ///
    /// A paused instance runs its definition's signal handler. A terminal
    /// instance is left untouched and its snapshot returned as
    /// [`CommandOutcome::Terminal`].
    pub async fn signal(
        &self,
        workflow_id: &WorkflowId,
        input: DataPacket,
    ) -> Result<CommandOutcome, CoreError> {
        let handle = match self.live_handle(workflow_id) {
            Some(handle) => handle,
            None => {
                let record = self
                    .ctx()
                    .commits
                    .load_latest(workflow_id)
                    .await?
                    .ok_or_else(|| CoreError::WorkflowInstanceNotFound(workflow_id.to_string()))?;

                if record.status().is_terminal() {
                    return Ok(CommandOutcome::Terminal(self.decode_record(&record)?));
                }

                match self.rehydrate(&record).await? {
                    Some(handle) => handle,
                    None => {
                        let latest = self.query(workflow_id).await?;
                        return Ok(CommandOutcome::Terminal(latest));
                    }
                }
            }
        };

        Self::request(&handle, workflow_id, |reply| InstanceMessage::Signal { input, reply }).await
    }

    /// Last committed snapshot; never blocks on the instance
    pub async fn query(&self, workflow_id: &WorkflowId) -> Result<WorkflowInstanceState, CoreError> {
        let handle = self.inner.instances.get(workflow_id).map(|h| h.clone());
        if let Some(handle) = handle {
            return Ok(handle.snapshot());
        }

        let record = self
            .ctx()
            .commits
            .load_latest(workflow_id)
            .await?
            .ok_or_else(|| CoreError::WorkflowInstanceNotFound(workflow_id.to_string()))?;
        self.decode_record(&record)
    }

    /// Every commit of an instance, oldest first
    pub async fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<CommitRecord>, CoreError> {
        self.ctx().commits.history(workflow_id).await
    }

    /// Route a completion delivered out of band to its instance
    pub async fn deliver_completion(&self, completion: Completion) -> Result<(), CoreError> {
        let workflow_id = completion.workflow_id.clone();
        self.deliver(&workflow_id, InstanceMessage::Completion(completion)).await
    }

    /// Route a timer firing to its instance.
    ///
    /// User timers bypass the instance: their call is issued through the
    /// component client on a separate task, whatever state the instance is in.
    pub async fn deliver_timer(&self, firing: TimerFiring) -> Result<(), CoreError> {
        let workflow_id = firing.key.workflow_id.clone();

        if let TimerKind::User(name) = &firing.key.kind {
            let Some(call) = firing.call else {
                warn!(workflow_id = %workflow_id, timer = %name, "User timer fired without a call");
                return Ok(());
            };

            debug!(workflow_id = %workflow_id, timer = %name, "User timer fired");
            let completions = self.ctx().executor.completions().clone();
            tokio::spawn(async move { completions.fire_scheduled(call).await });
            return Ok(());
        }

        self.deliver(&workflow_id, InstanceMessage::TimerFired(firing)).await
    }

    /// Forward every firing received on `firings` until the channel closes
    pub fn spawn_timer_listener(&self, mut firings: mpsc::Receiver<TimerFiring>) {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            while let Some(firing) = firings.recv().await {
                if let Err(e) = engine.deliver_timer(firing).await {
                    warn!(error = %e, "Failed to deliver timer firing");
                }
            }
            debug!("Timer listener stopped");
        });

        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push(task);
        }
    }

    /// Resume every non-terminal instance from its last commit.
    ///
    /// Running and waiting steps are executed again with their committed
    /// token, so a step's external call may run more than once across a
    /// crash. Instances whose definition or step is gone are failed.
    /// Returns the number of instances resumed or failed.
    pub async fn recover(&self) -> Result<usize, CoreError> {
        let records = self.ctx().commits.list_active().await?;
        let mut recovered = 0;

        for record in records {
            if self.live_handle(record.workflow_id()).is_some() {
                continue;
            }

            match self.rehydrate(&record).await {
                Ok(_) => recovered += 1,
                Err(e) => {
                    error!(workflow_id = %record.workflow_id(), error = %e, "Failed to recover instance");
                }
            }
        }

        info!(recovered, "Recovery complete");
        Ok(recovered)
    }

    /// Stop all instance tasks and timer listeners.
    ///
    /// Committed state is untouched; a later [`recover`](Self::recover)
    /// resumes where the instances stopped.
    pub fn shutdown(&self) {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            for task in listeners.drain(..) {
                task.abort();
            }
        }

        let count = self.inner.instances.len();
        for handle in self.inner.instances.iter() {
            handle.task.abort();
        }
        self.inner.instances.clear();

        info!(instances = count, "Engine shut down");
    }

    fn ctx(&self) -> &EngineContext {
        &self.inner.ctx
    }

    fn graph(&self, definition_id: &DefinitionId) -> Result<StepGraph, CoreError> {
        self.inner
            .definitions
            .get(definition_id)
            .map(|graph| graph.clone())
            .ok_or_else(|| CoreError::WorkflowDefinitionNotFound(definition_id.to_string()))
    }

    fn live_handle(&self, workflow_id: &WorkflowId) -> Option<InstanceHandle> {
        self.inner
            .instances
            .get(workflow_id)
            .map(|handle| handle.clone())
            .filter(InstanceHandle::is_live)
    }

    fn decode_record(&self, record: &CommitRecord) -> Result<WorkflowInstanceState, CoreError> {
        let state_type = self
            .inner
            .definitions
            .get(&record.snapshot.definition_id)
            .map(|graph| graph.definition().state_type.clone())
            .unwrap_or_else(|| record.snapshot.user_state.type_tag.clone());

        self.ctx().commits.from_record(record, &state_type)
    }

    /// Spawn an instance task from a committed record and tell it to resume.
    /// Returns `None` if the instance had to be failed instead.
    async fn rehydrate(&self, record: &CommitRecord) -> Result<Option<InstanceHandle>, CoreError> {
        let workflow_id = record.workflow_id().clone();

        let graph = match self.graph(&record.snapshot.definition_id) {
            Ok(graph) => graph,
            Err(_) => {
                let error = CoreError::UnrecoverableError(format!(
                    "Workflow definition {} is not registered",
                    record.snapshot.definition_id
                ));
                self.ctx().commits.fail_record(record, &error).await?;
                return Ok(None);
            }
        };

        let state = match self.ctx().commits.from_record(record, &graph.definition().state_type) {
            Ok(state) => state,
            Err(e) => {
                let error = CoreError::UnrecoverableError(format!("Cannot decode committed state: {}", e));
                self.ctx().commits.fail_record(record, &error).await?;
                return Ok(None);
            }
        };

        let handle = match self.inner.instances.entry(workflow_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Ok(Some(occupied.get().clone()));
                }
                let handle = InstanceActor::spawn(state, graph, self.inner.ctx.clone());
                occupied.insert(handle.clone());
                handle
            }
            Entry::Vacant(vacant) => {
                let handle = InstanceActor::spawn(state, graph, self.inner.ctx.clone());
                vacant.insert(handle.clone());
                handle
            }
        };

        handle
            .mailbox
            .send(InstanceMessage::Recover)
            .await
            .map_err(|_| not_running(&workflow_id))?;

        Ok(Some(handle))
    }

    async fn deliver(&self, workflow_id: &WorkflowId, message: InstanceMessage) -> Result<(), CoreError> {
        match self.live_handle(workflow_id) {
            Some(handle) => handle
                .mailbox
                .send(message)
                .await
                .map_err(|_| not_running(workflow_id)),
            None => {
                debug!(workflow_id = %workflow_id, "No running instance; dropping event");
                Ok(())
            }
        }
    }

    async fn request<T>(
        handle: &InstanceHandle,
        workflow_id: &WorkflowId,
        build: impl FnOnce(oneshot::Sender<Result<T, CoreError>>) -> InstanceMessage,
    ) -> Result<T, CoreError> {
        let (reply, response) = oneshot::channel();
        handle
            .mailbox
            .send(build(reply))
            .await
            .map_err(|_| not_running(workflow_id))?;

        response.await.map_err(|_| not_running(workflow_id))?
    }
}

fn not_running(workflow_id: &WorkflowId) -> CoreError {
    CoreError::Other(format!("Instance {} is not running", workflow_id))
}
