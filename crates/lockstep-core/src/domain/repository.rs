//! Collaborator interfaces for the Lockstep engine
//!
//! The engine never owns storage, timers or remote calls. It consumes them
//! through the traits below; external crates provide durable
//! implementations and the `memory` module provides in-process ones.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::codec::EncodedPayload;
use super::workflow_instance::{AttemptToken, DefinitionId, InstanceStatus, StepName, WorkflowId};
use crate::{CoreError, DataPacket};

/// Full instance snapshot as written by the commit protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Instance identifier
    pub workflow_id: WorkflowId,
    /// Definition the instance runs
    pub definition_id: DefinitionId,
    /// Step being executed
    pub current_step: Option<StepName>,
    /// Status after the transition
    pub status: InstanceStatus,
    /// Codec-encoded user state
    pub user_state: EncodedPayload,
    /// Input of the current step
    pub step_input: DataPacket,
    /// Retries consumed by the current step
    pub attempt_count: u32,
    /// Active attempt token
    pub attempt_token: AttemptToken,
    /// A retry is armed
    pub retry_scheduled: bool,
    /// Last failure message
    pub error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// One atomic commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Position in the instance's commit log, starting at 1
    pub sequence: u64,
    /// Commit timestamp
    pub committed_at: DateTime<Utc>,
    /// State after the transition
    pub snapshot: PersistedSnapshot,
}

impl CommitRecord {
    /// Instance the record belongs to
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.snapshot.workflow_id
    }

    /// Status recorded by the commit
    pub fn status(&self) -> InstanceStatus {
        self.snapshot.status
    }
}

/// Durable, append-only log of instance commits
#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Append a record atomically.
    ///
    /// Fails with `ConflictError` unless `record.sequence` is exactly one past
    /// the latest committed sequence for the instance.
    async fn commit(&self, record: &CommitRecord) -> Result<(), CoreError>;

    /// Latest record of an instance
    async fn load_latest(&self, workflow_id: &WorkflowId) -> Result<Option<CommitRecord>, CoreError>;

    /// Every record of an instance in sequence order
    async fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<CommitRecord>, CoreError>;

    /// Latest record of every non-terminal instance
    async fn list_active(&self) -> Result<Vec<CommitRecord>, CoreError>;
}

/// Purpose of a timer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Step or workflow timeout
    StepTimeout,
    /// Backoff before a retry
    Retry,
    /// Named timer armed by a workflow; its firing issues a deferred call
    User(String),
}

/// Identity of a timer; scheduling the same key again replaces the timer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerKey {
    /// Owning instance
    pub workflow_id: WorkflowId,
    /// Purpose
    pub kind: TimerKind,
}

impl TimerKey {
    /// Timeout timer of an instance
    pub fn step_timeout(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            kind: TimerKind::StepTimeout,
        }
    }

    /// Retry timer of an instance
    pub fn retry(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            kind: TimerKind::Retry,
        }
    }

    /// Named workflow timer of an instance
    pub fn user(workflow_id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            workflow_id,
            kind: TimerKind::User(name.into()),
        }
    }
}

/// A timer firing delivered back to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct TimerFiring {
    /// Timer that fired
    pub key: TimerKey,
    /// Token the timer was armed with
    pub token: AttemptToken,
    /// Deferred call to issue, for user timers
    pub call: Option<DeferredRequest>,
}

impl TimerFiring {
    /// Firing of an engine timer
    pub fn new(key: TimerKey, token: AttemptToken) -> Self {
        Self {
            key,
            token,
            call: None,
        }
    }
}

/// Schedules and cancels delayed callbacks
#[async_trait]
pub trait TimerGateway: Send + Sync {
    /// Arm `key` to fire after `delay` carrying `token`
    async fn schedule(&self, key: TimerKey, delay: Duration, token: AttemptToken) -> Result<(), CoreError>;

    /// Arm `key` to fire after `delay` carrying `call`.
    ///
    /// The gateway owns the call until the timer fires, so a durable gateway
    /// must persist it with the timer.
    async fn schedule_call(&self, key: TimerKey, delay: Duration, call: DeferredRequest) -> Result<(), CoreError>;

    /// Disarm `key`; cancelling an unknown key succeeds
    async fn cancel(&self, key: &TimerKey) -> Result<(), CoreError>;
}

/// A deferred call as handed to the component client
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredRequest {
    /// Issuing instance
    pub workflow_id: WorkflowId,
    /// Token of the issuing attempt
    pub token: AttemptToken,
    /// Target service or workflow
    pub target: String,
    /// Method on the target
    pub method: String,
    /// Encoded request
    pub payload: EncodedPayload,
}

/// Result of a deferred call
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The call produced a value
    Success(EncodedPayload),
    /// The call failed
    Failure(String),
}

/// A completion correlated to an instance by `(workflow_id, token)`
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Instance awaiting the completion
    pub workflow_id: WorkflowId,
    /// Token of the attempt that issued the call
    pub token: AttemptToken,
    /// Outcome
    pub outcome: CompletionOutcome,
}

/// What the component client did with a request
#[derive(Debug, Clone, PartialEq)]
pub enum IssueResult {
    /// The call finished
    Completed(CompletionOutcome),
    /// The call was accepted; its completion arrives through
    /// `WorkflowEngine::deliver_completion`
    Accepted,
}

/// Issues calls to other services or workflows
#[async_trait]
pub trait ComponentClient: Send + Sync {
    /// Issue a deferred call. The engine never retries this itself.
    async fn issue(&self, request: DeferredRequest) -> Result<IssueResult, CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use crate::domain::step::JSON_VALUE_TYPE;
    use dashmap::{mapref::entry::Entry, DashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// In-memory commit store backed by a concurrent map of commit logs
    pub struct MemoryCommitStore {
        commits: Arc<DashMap<String, Vec<CommitRecord>>>,
        failures: Arc<AtomicUsize>,
    }

    impl MemoryCommitStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self {
                commits: Arc::new(DashMap::with_capacity(64)),
                failures: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Make the next `count` commits fail with `StateStoreError`
        pub fn fail_next_commits(&self, count: usize) {
            self.failures.store(count, Ordering::SeqCst);
        }

        /// Number of records committed for an instance
        pub fn commit_count(&self, workflow_id: &WorkflowId) -> usize {
            self.commits
                .get(&workflow_id.0)
                .map(|log| log.len())
                .unwrap_or(0)
        }
    }

    impl Default for MemoryCommitStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl CommitStore for MemoryCommitStore {
        async fn commit(&self, record: &CommitRecord) -> Result<(), CoreError> {
            let injected = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(CoreError::StateStoreError(
                    "Injected commit failure".to_string(),
                ));
            }

            let mut log = self.commits.entry(record.workflow_id().0.clone()).or_default();
            let latest = log.last().map(|r| r.sequence).unwrap_or(0);
            if record.sequence != latest + 1 {
                return Err(CoreError::ConflictError(format!(
                    "Commit sequence {} for {} does not follow {}",
                    record.sequence,
                    record.workflow_id(),
                    latest
                )));
            }

            log.push(record.clone());
            Ok(())
        }

        async fn load_latest(&self, workflow_id: &WorkflowId) -> Result<Option<CommitRecord>, CoreError> {
            Ok(self
                .commits
                .get(&workflow_id.0)
                .and_then(|log| log.last().cloned()))
        }

        async fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<CommitRecord>, CoreError> {
            Ok(self
                .commits
                .get(&workflow_id.0)
                .map(|log| log.clone())
                .unwrap_or_default())
        }

        async fn list_active(&self) -> Result<Vec<CommitRecord>, CoreError> {
            let mut active: Vec<CommitRecord> = self
                .commits
                .iter()
                .filter_map(|log| log.last().cloned())
                .filter(|record| !record.status().is_terminal())
                .collect();
            active.sort_by(|a, b| a.workflow_id().0.cmp(&b.workflow_id().0));
            Ok(active)
        }
    }

    type TimerEntry = (AttemptToken, JoinHandle<()>);

    /// In-memory timer gateway: one sleeping task per armed key
    pub struct MemoryTimerGateway {
        timers: Arc<DashMap<TimerKey, TimerEntry>>,
        timer_tx: mpsc::Sender<TimerFiring>,
    }

    impl MemoryTimerGateway {
        /// Create a gateway and the receiver its firings are delivered on
        pub fn new() -> (Self, mpsc::Receiver<TimerFiring>) {
            let (timer_tx, timer_rx) = mpsc::channel(64);

            let gateway = Self {
                timers: Arc::new(DashMap::with_capacity(64)),
                timer_tx,
            };

            (gateway, timer_rx)
        }

        /// Number of armed timers
        pub fn armed(&self) -> usize {
            self.timers.len()
        }

        /// Whether `key` is armed
        pub fn is_armed(&self, key: &TimerKey) -> bool {
            self.timers.contains_key(key)
        }
    }

    impl MemoryTimerGateway {
        fn arm(&self, key: TimerKey, delay: Duration, token: AttemptToken, call: Option<DeferredRequest>) {
            let timers = self.timers.clone();
            let tx = self.timer_tx.clone();
            let fired_key = key.clone();

            // Hold the slot while spawning so a zero delay cannot fire before the insert
            let slot = self.timers.entry(key);
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;

                // Only remove the entry if it has not been re-armed meanwhile
                timers.remove_if(&fired_key, |_, (armed, _)| *armed == token);

                let firing = TimerFiring {
                    key: fired_key,
                    token,
                    call,
                };
                if tx.send(firing).await.is_err() {
                    tracing::debug!("Timer channel closed, dropping firing");
                }
            });

            match slot {
                Entry::Occupied(mut occupied) => {
                    let (_, previous) = occupied.insert((token, handle));
                    previous.abort();
                }
                Entry::Vacant(vacant) => {
                    vacant.insert((token, handle));
                }
            }
        }
    }

    #[async_trait]
    impl TimerGateway for MemoryTimerGateway {
        async fn schedule(&self, key: TimerKey, delay: Duration, token: AttemptToken) -> Result<(), CoreError> {
            self.arm(key, delay, token, None);
            Ok(())
        }

        async fn schedule_call(&self, key: TimerKey, delay: Duration, call: DeferredRequest) -> Result<(), CoreError> {
            self.arm(key, delay, call.token, Some(call));
            Ok(())
        }

        async fn cancel(&self, key: &TimerKey) -> Result<(), CoreError> {
            if let Some((_, (_, handle))) = self.timers.remove(key) {
                handle.abort();
            }
            Ok(())
        }
    }

    type Handler = Arc<dyn Fn(DataPacket) -> Result<DataPacket, String> + Send + Sync>;

    enum Route {
        Reply { reply_type: String, handler: Handler },
        Accept,
    }

    /// In-memory component client routing requests to registered handlers
    pub struct MemoryComponentClient {
        routes: DashMap<String, Route>,
        requests: Mutex<Vec<DeferredRequest>>,
    }

    impl MemoryComponentClient {
        /// Create a client with no routes
        pub fn new() -> Self {
            Self {
                routes: DashMap::new(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn route_key(target: &str, method: &str) -> String {
            format!("{}/{}", target, method)
        }

        /// Answer `target/method` with `handler`, replying untyped JSON
        pub fn on<F>(&self, target: &str, method: &str, handler: F)
        where
            F: Fn(DataPacket) -> Result<DataPacket, String> + Send + Sync + 'static,
        {
            self.on_typed(target, method, JSON_VALUE_TYPE, handler);
        }

        /// Answer `target/method` with `handler`, tagging replies `reply_type`
        pub fn on_typed<F>(&self, target: &str, method: &str, reply_type: &str, handler: F)
        where
            F: Fn(DataPacket) -> Result<DataPacket, String> + Send + Sync + 'static,
        {
            self.routes.insert(
                Self::route_key(target, method),
                Route::Reply {
                    reply_type: reply_type.to_string(),
                    handler: Arc::new(handler),
                },
            );
        }

        /// Accept `target/method` without completing it
        pub fn accept(&self, target: &str, method: &str) {
            self.routes.insert(Self::route_key(target, method), Route::Accept);
        }

        /// Every request issued so far
        pub fn requests(&self) -> Vec<DeferredRequest> {
            self.requests
                .lock()
                .map(|requests| requests.clone())
                .unwrap_or_default()
        }

        /// Number of requests issued to `target/method`
        pub fn calls(&self, target: &str, method: &str) -> usize {
            self.requests()
                .iter()
                .filter(|r| r.target == target && r.method == method)
                .count()
        }
    }

    impl Default for MemoryComponentClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ComponentClient for MemoryComponentClient {
        async fn issue(&self, request: DeferredRequest) -> Result<IssueResult, CoreError> {
            self.requests
                .lock()
                .map_err(|e| CoreError::Other(format!("Failed to record request: {}", e)))?
                .push(request.clone());

            let key = Self::route_key(&request.target, &request.method);
            let (reply_type, handler) = match self.routes.get(&key).as_deref() {
                Some(Route::Accept) => return Ok(IssueResult::Accepted),
                Some(Route::Reply {
                    reply_type,
                    handler,
                }) => (reply_type.clone(), handler.clone()),
                None => {
                    return Ok(IssueResult::Completed(CompletionOutcome::Failure(format!(
                        "No handler for {}",
                        key
                    ))))
                }
            };

            let input: serde_json::Value = serde_json::from_slice(&request.payload.bytes)?;
            let outcome = match handler(DataPacket::new(input)) {
                Ok(reply) => CompletionOutcome::Success(EncodedPayload::new(
                    reply_type,
                    serde_json::to_vec(reply.as_value())?,
                )),
                Err(error) => CompletionOutcome::Failure(error),
            };

            Ok(IssueResult::Completed(outcome))
        }
    }
}
