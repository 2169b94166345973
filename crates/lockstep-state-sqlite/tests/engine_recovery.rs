use lockstep_core::domain::repository::memory::{MemoryComponentClient, MemoryTimerGateway};
use lockstep_core::{
    DataPacket, Deferred, InstanceStatus, StepDefinition, Transition, WorkflowDefinition,
    WorkflowEngine, WorkflowId, WorkflowInstanceState,
};
use lockstep_state_sqlite::{SqliteCommitStore, SqliteConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn shipping_workflow() -> WorkflowDefinition {
    WorkflowDefinition::builder("shipping")
        .initial_state(DataPacket::new(json!({"labels": 0})))
        .step(StepDefinition::async_call(
            "label",
            |input| Ok(Deferred::new("carrier", "label", input)),
            |_, label| {
                Ok(Transition::update_state(
                    DataPacket::new(json!({"labels": 1, "label": label.into_value()})),
                    Transition::end(),
                ))
            },
        ))
        .build()
}

fn engine(store: &SqliteCommitStore, client: Arc<MemoryComponentClient>) -> WorkflowEngine {
    let (timers, firings) = MemoryTimerGateway::new();
    let engine = WorkflowEngine::builder()
        .commit_store(Arc::new(store.clone()))
        .timer_gateway(Arc::new(timers))
        .component_client(client)
        .build()
        .unwrap();
    engine.spawn_timer_listener(firings);
    engine.register(shipping_workflow()).unwrap();
    engine
}

async fn wait_finished(engine: &WorkflowEngine, id: &WorkflowId) -> WorkflowInstanceState {
    for _ in 0..400 {
        let state = engine.query(id).await.unwrap();
        if state.status == InstanceStatus::Finished {
            return state;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("instance {} did not finish", id);
}

#[tokio::test]
async fn test_engine_recovers_from_sqlite() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = SqliteCommitStore::connect(&SqliteConfig::in_memory()).await.unwrap();
    let id = WorkflowId::new("parcel-1");

    let stalled = Arc::new(MemoryComponentClient::new());
    stalled.accept("carrier", "label");
    let first = engine(&store, stalled);
    let waiting = first
        .start("shipping", id.clone(), DataPacket::new(json!({"parcel": "p-1"})))
        .await
        .unwrap();
    assert_eq!(waiting.status, InstanceStatus::Waiting);
    first.shutdown();

    let carrier = Arc::new(MemoryComponentClient::new());
    carrier.on("carrier", "label", |input| {
        Ok(DataPacket::new(json!(format!(
            "LBL-{}",
            input.get("parcel").and_then(|p| p.as_str()).unwrap_or("?")
        ))))
    });
    let second = engine(&store, carrier.clone());

    // Before recovery, queries are served from the store
    assert_eq!(second.query(&id).await.unwrap(), waiting);

    assert_eq!(second.recover().await.unwrap(), 1);
    let finished = wait_finished(&second, &id).await;
    assert_eq!(
        finished.user_state.as_value(),
        &json!({"labels": 1, "label": "LBL-p-1"})
    );
    assert_eq!(carrier.requests()[0].token, waiting.attempt_token);

    let history = second.history(&id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status(), InstanceStatus::Finished);
    assert_eq!(second.recover().await.unwrap(), 0);
}
