mod common;

use async_trait::async_trait;
use common::TestEngine;
use lockstep_core::domain::events::DomainEvent;
use lockstep_core::{
    AttemptToken, Backoff, Completion, CompletionOutcome, ComponentClient, CoreError, DataPacket,
    Deferred, DeferredRequest, DomainEventHandler, EncodedPayload, EngineConfig, InstanceStatus,
    IssueResult, RecoverStrategy, StepDefinition, TimerFiring, TimerKey, Transition,
    WorkflowDefinition, WorkflowEngine, WorkflowId,
};
use lockstep_core::domain::repository::memory::{
    MemoryCommitStore, MemoryComponentClient, MemoryTimerGateway,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::sleep;

fn success(workflow_id: &WorkflowId, token: AttemptToken, value: serde_json::Value) -> Completion {
    Completion {
        workflow_id: workflow_id.clone(),
        token,
        outcome: CompletionOutcome::Success(EncodedPayload::new(
            "json.value",
            serde_json::to_vec(&value).unwrap(),
        )),
    }
}

fn failure(workflow_id: &WorkflowId, token: AttemptToken, error: &str) -> Completion {
    Completion {
        workflow_id: workflow_id.clone(),
        token,
        outcome: CompletionOutcome::Failure(error.to_string()),
    }
}

// Checkout with a single async charge step that is retried three times
fn checkout_workflow(with_refund: bool) -> WorkflowDefinition {
    let mut strategy = RecoverStrategy::max_retries(3);
    if with_refund {
        strategy = strategy.failover_to("refund");
    }

    let mut builder = WorkflowDefinition::builder("checkout").step(
        StepDefinition::async_call(
            "charge",
            |input| Ok(Deferred::new("payments", "charge", input)),
            |_, _| Ok(Transition::end()),
        )
        .with_recover_strategy(strategy),
    );

    if with_refund {
        builder = builder.step(StepDefinition::call(
            "refund",
            |input| async move { Ok(input) },
            |_, _| Ok(Transition::end()),
        ));
    }

    builder.build()
}

#[tokio::test]
async fn test_exhausted_retries_fail_instance() {
    let t = TestEngine::new();
    t.client.on("payments", "charge", |_| Err("card declined".to_string()));
    t.engine.register(checkout_workflow(false)).unwrap();

    let id = WorkflowId::new("order-1");
    let started = t
        .engine
        .start("checkout", id.clone(), DataPacket::new(json!({"amount": 30})))
        .await
        .unwrap();
    assert_eq!(started.status, InstanceStatus::Waiting);
    assert_eq!(started.sequence, 1);

    let failed = t.wait_for_status(&id, InstanceStatus::Failed).await;
    assert_eq!(t.client.calls("payments", "charge"), 4);
    assert_eq!(failed.attempt_count, 3);
    assert!(failed.current_step.is_none());
    assert!(failed.error.unwrap().contains("card declined"));

    for record in t.engine.history(&id).await.unwrap() {
        assert!(record.snapshot.attempt_count <= 3);
    }
}

#[tokio::test]
async fn test_exhausted_retries_fail_over() {
    let t = TestEngine::new();
    t.client.on("payments", "charge", |_| Err("card declined".to_string()));
    t.engine.register(checkout_workflow(true)).unwrap();

    let id = WorkflowId::new("order-2");
    t.engine
        .start("checkout", id.clone(), DataPacket::new(json!({"amount": 30})))
        .await
        .unwrap();

    let finished = t.wait_for_status(&id, InstanceStatus::Finished).await;
    assert_eq!(t.client.calls("payments", "charge"), 4);
    assert!(finished.current_step.is_none());

    let history = t.engine.history(&id).await.unwrap();
    let refund = history
        .iter()
        .find(|r| r.snapshot.current_step.as_ref().map(|s| s.as_str()) == Some("refund"))
        .expect("failover step should be committed");
    assert_eq!(refund.snapshot.attempt_count, 0);
    assert_eq!(refund.snapshot.step_input.as_value(), &json!({"amount": 30}));
}

#[tokio::test]
async fn test_timeout_retries_and_discards_late_completion() {
    let t = TestEngine::new();
    t.client.accept("inventory", "reserve");
    t.engine
        .register(
            WorkflowDefinition::builder("reservation")
                .step(
                    StepDefinition::async_call(
                        "reserve",
                        |input| Ok(Deferred::new("inventory", "reserve", input)),
                        |_, _| Ok(Transition::end()),
                    )
                    .with_timeout(Duration::from_millis(50))
                    .with_recover_strategy(RecoverStrategy::max_retries(1)),
                )
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("res-1");
    let started = t
        .engine
        .start("reservation", id.clone(), DataPacket::null())
        .await
        .unwrap();

    let retried = t.wait_for(&id, |s| s.attempt_count == 1).await;
    assert!(retried.attempt_token > started.attempt_token);

    // Completion of the timed-out attempt arrives after the retry started
    t.engine
        .deliver_completion(success(&id, started.attempt_token, json!({"reserved": true})))
        .await
        .unwrap();

    let failed = t.wait_for_status(&id, InstanceStatus::Failed).await;
    assert!(failed.error.unwrap().contains("timed out"));
    assert_eq!(t.client.calls("inventory", "reserve"), 2);
    assert!(!t.timers.is_armed(&TimerKey::step_timeout(id.clone())));
}

#[tokio::test]
async fn test_stale_tokens_never_transition() {
    let t = TestEngine::new();
    t.client.accept("reviews", "approve");
    t.engine
        .register(
            WorkflowDefinition::builder("approval")
                .step(
                    StepDefinition::async_call(
                        "approve",
                        |input| Ok(Deferred::new("reviews", "approve", input)),
                        |_, output| Ok(Transition::update_state(output, Transition::end())),
                    )
                    .with_recover_strategy(RecoverStrategy::max_retries(1)),
                )
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("doc-1");
    let first = t.engine.start("approval", id.clone(), DataPacket::null()).await.unwrap();

    t.engine
        .deliver_timer(TimerFiring::new(
            TimerKey::step_timeout(id.clone()),
            AttemptToken(first.attempt_token.0 + 100),
        ))
        .await
        .unwrap();
    t.engine
        .deliver_completion(failure(&id, first.attempt_token, "reviewer unavailable"))
        .await
        .unwrap();

    let second = t
        .wait_for(&id, |s| s.attempt_count == 1 && s.status == InstanceStatus::Waiting)
        .await;
    assert!(second.attempt_token > first.attempt_token);

    // A duplicate from the failed attempt, then the real answer
    t.engine
        .deliver_completion(success(&id, first.attempt_token, json!({"n": 1})))
        .await
        .unwrap();
    t.engine
        .deliver_completion(success(&id, second.attempt_token, json!({"n": 2})))
        .await
        .unwrap();

    let finished = t.wait_for_status(&id, InstanceStatus::Finished).await;
    assert_eq!(finished.user_state.as_value(), &json!({"n": 2}));
    let commits = t.history_len(&id).await;

    t.engine
        .deliver_completion(success(&id, second.attempt_token, json!({"n": 3})))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let after = t.engine.query(&id).await.unwrap();
    assert_eq!(after.user_state.as_value(), &json!({"n": 2}));
    assert_eq!(t.history_len(&id).await, commits);
}

#[tokio::test]
async fn test_retry_bound_with_backoff() {
    let t = TestEngine::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    t.engine
        .register(
            WorkflowDefinition::builder("flaky")
                .step(
                    StepDefinition::call(
                        "fetch",
                        move |_: DataPacket| {
                            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            async move {
                                if n < 3 {
                                    Err(CoreError::StepExecutionError(format!("attempt {} failed", n)))
                                } else {
                                    Ok(DataPacket::new(json!({"attempt": n})))
                                }
                            }
                        },
                        |_, output| Ok(Transition::update_state(output, Transition::end())),
                    )
                    .with_recover_strategy(
                        RecoverStrategy::max_retries(2)
                            .with_backoff(Backoff::fixed(Duration::from_millis(10))),
                    ),
                )
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("flaky-1");
    t.engine.start("flaky", id.clone(), DataPacket::null()).await.unwrap();

    let finished = t.wait_for_status(&id, InstanceStatus::Finished).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(finished.user_state.as_value(), &json!({"attempt": 3}));

    let history = t.engine.history(&id).await.unwrap();
    assert!(history.iter().any(|r| r.snapshot.retry_scheduled));
    for (i, record) in history.iter().enumerate() {
        assert_eq!(record.sequence, i as u64 + 1);
    }
}

#[tokio::test]
async fn test_permanent_call_failure_runs_step_n_plus_one_times() {
    let t = TestEngine::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();

    t.engine
        .register(
            WorkflowDefinition::builder("doomed")
                .default_recover_strategy(RecoverStrategy::max_retries(2))
                .step(StepDefinition::call(
                    "explode",
                    move |_: DataPacket| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if true {
                                panic!("boom");
                            }
                            Ok(DataPacket::null())
                        }
                    },
                    |_, _| Ok(Transition::end()),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("doomed-1");
    t.engine.start("doomed", id.clone(), DataPacket::null()).await.unwrap();

    let failed = t.wait_for_status(&id, InstanceStatus::Failed).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(failed.error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_second_start_already_exists() {
    let t = TestEngine::new();
    t.engine
        .register(
            WorkflowDefinition::builder("hold")
                .step(StepDefinition::call(
                    "park",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::pause()),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("hold-1");
    t.engine
        .start("hold", id.clone(), DataPacket::new(json!({"first": true})))
        .await
        .unwrap();
    let paused = t.wait_for_status(&id, InstanceStatus::Paused).await;
    let commits = t.history_len(&id).await;

    let second = t
        .engine
        .start("hold", id.clone(), DataPacket::new(json!({"second": true})))
        .await;
    assert!(matches!(second, Err(CoreError::AlreadyExists(_))));

    assert_eq!(t.engine.query(&id).await.unwrap(), paused);
    assert_eq!(t.history_len(&id).await, commits);
}

#[tokio::test]
async fn test_start_new_generates_distinct_ids() {
    let t = TestEngine::new();
    t.engine
        .register(
            WorkflowDefinition::builder("echo")
                .step(StepDefinition::call(
                    "run",
                    |input| async move { Ok(input) },
                    |_, output| Ok(Transition::update_state(output, Transition::end())),
                ))
                .build(),
        )
        .unwrap();

    let first = t.engine.start_new("echo", DataPacket::new(json!(1))).await.unwrap();
    let second = t.engine.start_new("echo", DataPacket::new(json!(2))).await.unwrap();
    assert_ne!(first.workflow_id, second.workflow_id);

    let finished = t.wait_for_status(&second.workflow_id, InstanceStatus::Finished).await;
    assert_eq!(finished.user_state.as_value(), &json!(2));
}

#[tokio::test]
async fn test_signal_after_end_is_noop() {
    let t = TestEngine::new();
    t.engine
        .register(
            WorkflowDefinition::builder("once")
                .on_signal(|_, input| Ok(Transition::update_state(input, Transition::end())))
                .step(StepDefinition::call(
                    "run",
                    |input| async move { Ok(input) },
                    |_, output| Ok(Transition::update_state(output, Transition::end())),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("once-1");
    t.engine
        .start("once", id.clone(), DataPacket::new(json!({"done": true})))
        .await
        .unwrap();
    let finished = t.wait_for_status(&id, InstanceStatus::Finished).await;
    let commits = t.history_len(&id).await;

    let outcome = t
        .engine
        .signal(&id, DataPacket::new(json!({"overwrite": true})))
        .await
        .unwrap();
    assert!(outcome.is_terminal());
    assert_eq!(outcome.snapshot(), &finished);
    assert!(matches!(outcome.into_result(), Err(CoreError::TerminalStateError(_))));
    assert_eq!(t.history_len(&id).await, commits);
}

#[tokio::test]
async fn test_signal_resumes_paused_instance() {
    let t = TestEngine::new();
    t.engine
        .register(
            WorkflowDefinition::builder("review")
                .initial_state(DataPacket::new(json!({"approved": false})))
                .on_signal(|_, input| {
                    let approved = input.get("approved").cloned().unwrap_or(json!(false));
                    Ok(Transition::update_state(
                        DataPacket::new(json!({"approved": approved})),
                        Transition::to("ship", input),
                    ))
                })
                .step(StepDefinition::call(
                    "submit",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::pause()),
                ))
                .step(StepDefinition::call(
                    "ship",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::end()),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("review-1");
    t.engine.start("review", id.clone(), DataPacket::null()).await.unwrap();
    t.wait_for_status(&id, InstanceStatus::Paused).await;

    let outcome = t
        .engine
        .signal(&id, DataPacket::new(json!({"approved": true})))
        .await
        .unwrap();
    assert!(!outcome.is_terminal());
    assert_eq!(outcome.snapshot().user_state.as_value(), &json!({"approved": true}));

    let finished = t.wait_for_status(&id, InstanceStatus::Finished).await;
    assert_eq!(finished.user_state.as_value(), &json!({"approved": true}));
}

#[tokio::test]
async fn test_signal_conflicts() {
    let t = TestEngine::new();
    t.client.accept("shipping", "book");
    t.engine
        .register(
            WorkflowDefinition::builder("shipment")
                .step(StepDefinition::async_call(
                    "book",
                    |input| Ok(Deferred::new("shipping", "book", input)),
                    |_, _| Ok(Transition::end()),
                ))
                .build(),
        )
        .unwrap();
    t.engine
        .register(
            WorkflowDefinition::builder("deaf")
                .step(StepDefinition::call(
                    "park",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::pause()),
                ))
                .build(),
        )
        .unwrap();

    let waiting = WorkflowId::new("ship-1");
    let before = t.engine.start("shipment", waiting.clone(), DataPacket::null()).await.unwrap();
    let result = t.engine.signal(&waiting, DataPacket::null()).await;
    assert!(matches!(result, Err(CoreError::ConflictError(_))));
    assert_eq!(t.engine.query(&waiting).await.unwrap(), before);

    let paused = WorkflowId::new("deaf-1");
    t.engine.start("deaf", paused.clone(), DataPacket::null()).await.unwrap();
    t.wait_for_status(&paused, InstanceStatus::Paused).await;
    let result = t.engine.signal(&paused, DataPacket::null()).await;
    assert!(matches!(result, Err(CoreError::ConflictError(_))));

    let result = t.engine.signal(&WorkflowId::new("nobody"), DataPacket::null()).await;
    assert!(matches!(result, Err(CoreError::WorkflowInstanceNotFound(_))));
}

#[tokio::test]
async fn test_transition_to_unknown_step_fails() {
    let t = TestEngine::new();
    t.engine
        .register(
            WorkflowDefinition::builder("lost")
                .step(StepDefinition::call(
                    "start",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::to("nowhere", DataPacket::null())),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("lost-1");
    t.engine.start("lost", id.clone(), DataPacket::null()).await.unwrap();

    let failed = t.wait_for_status(&id, InstanceStatus::Failed).await;
    assert!(failed.error.unwrap().contains("nowhere"));
}

#[tokio::test]
async fn test_query_unknown_instance() {
    let t = TestEngine::new();
    let result = t.engine.query(&WorkflowId::new("ghost")).await;
    assert!(matches!(result, Err(CoreError::WorkflowInstanceNotFound(_))));
}

struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl DomainEventHandler for RecordingHandler {
    async fn handle_event(&self, event: Box<dyn DomainEvent>) -> Result<(), CoreError> {
        self.events.lock().unwrap().push(event.event_type().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_events_dispatched_after_commit() {
    let handler = Arc::new(RecordingHandler {
        events: Mutex::new(Vec::new()),
    });
    let (timers, firings) = MemoryTimerGateway::new();
    let engine = WorkflowEngine::builder()
        .commit_store(Arc::new(MemoryCommitStore::new()))
        .timer_gateway(Arc::new(timers))
        .component_client(Arc::new(MemoryComponentClient::new()))
        .event_handler(handler.clone())
        .config(EngineConfig::default())
        .build()
        .unwrap();
    engine.spawn_timer_listener(firings);

    engine
        .register(
            WorkflowDefinition::builder("echo")
                .step(StepDefinition::call(
                    "echo",
                    |input| async move { Ok(input) },
                    |_, _| Ok(Transition::end()),
                ))
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("echo-1");
    engine.start("echo", id.clone(), DataPacket::null()).await.unwrap();

    // Events are handled after the snapshot is published
    for _ in 0..400 {
        if handler.events.lock().unwrap().len() >= 4 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.query(&id).await.unwrap().status, InstanceStatus::Finished);

    let events = handler.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["instance.started", "step.entered", "step.succeeded", "instance.finished"]
    );
}

// Routes `pinger/ping` calls back into the engine as signals
struct SelfSignalClient {
    engine: OnceLock<WorkflowEngine>,
}

#[async_trait]
impl ComponentClient for SelfSignalClient {
    async fn issue(&self, request: DeferredRequest) -> Result<IssueResult, CoreError> {
        let engine = self
            .engine
            .get()
            .ok_or_else(|| CoreError::Other("engine not wired".to_string()))?;
        let input: serde_json::Value = serde_json::from_slice(&request.payload.bytes)?;
        let outcome = engine.signal(&request.workflow_id, DataPacket::new(input)).await?;

        Ok(IssueResult::Completed(CompletionOutcome::Success(EncodedPayload::new(
            "json.value",
            serde_json::to_vec(outcome.snapshot().user_state.as_value())?,
        ))))
    }
}

#[tokio::test]
async fn test_user_timer_call_resumes_paused_instance() {
    common::init_tracing();
    let client = Arc::new(SelfSignalClient {
        engine: OnceLock::new(),
    });
    let (timers, firings) = MemoryTimerGateway::new();
    let timers = Arc::new(timers);
    let engine = WorkflowEngine::builder()
        .commit_store(Arc::new(MemoryCommitStore::new()))
        .timer_gateway(timers.clone())
        .component_client(client.clone())
        .build()
        .unwrap();
    engine.spawn_timer_listener(firings);
    assert!(client.engine.set(engine.clone()).is_ok());

    engine
        .register(
            WorkflowDefinition::builder("pinger")
                .initial_state(DataPacket::new(json!({"value": 0, "finished": false})))
                .on_signal(|_, input| {
                    let value = input.get("value").cloned().unwrap_or(json!(0));
                    Ok(Transition::update_state(
                        DataPacket::new(json!({"value": value, "finished": true})),
                        Transition::end(),
                    ))
                })
                .step(
                    StepDefinition::call(
                        "counter",
                        |input| async move { Ok(input) },
                        |_, _| {
                            Ok(Transition::start_timer(
                                "ping",
                                Duration::from_millis(300),
                                Deferred::new("pinger", "ping", DataPacket::new(json!({"value": 12}))),
                                Transition::pause(),
                            ))
                        },
                    )
                    .with_timeout(Duration::from_millis(50)),
                )
                .build(),
        )
        .unwrap();

    let id = WorkflowId::new("pinger-1");
    engine.start("pinger", id.clone(), DataPacket::null()).await.unwrap();

    let mut state = engine.query(&id).await.unwrap();
    for _ in 0..400 {
        if state.status == InstanceStatus::Paused {
            break;
        }
        sleep(Duration::from_millis(5)).await;
        state = engine.query(&id).await.unwrap();
    }
    assert_eq!(state.status, InstanceStatus::Paused);
    assert!(timers.is_armed(&TimerKey::user(id.clone(), "ping")));

    for _ in 0..400 {
        if state.status == InstanceStatus::Finished {
            break;
        }
        sleep(Duration::from_millis(5)).await;
        state = engine.query(&id).await.unwrap();
    }
    assert_eq!(state.status, InstanceStatus::Finished);
    assert_eq!(state.user_state.as_value(), &json!({"value": 12, "finished": true}));
    assert!(!timers.is_armed(&TimerKey::user(id.clone(), "ping")));
}
