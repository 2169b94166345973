#![allow(dead_code)]

use lockstep_core::domain::repository::memory::{
    MemoryCommitStore, MemoryComponentClient, MemoryTimerGateway,
};
use lockstep_core::{
    CoreError, EngineConfig, InstanceStatus, WorkflowEngine, WorkflowId, WorkflowInstanceState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Route engine logs to the test harness; `RUST_LOG` selects the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine wired to in-memory collaborators
pub struct TestEngine {
    pub engine: WorkflowEngine,
    pub store: Arc<MemoryCommitStore>,
    pub timers: Arc<MemoryTimerGateway>,
    pub client: Arc<MemoryComponentClient>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryCommitStore::new()))
    }

    /// Build an engine over an existing store, as a restarted process would
    pub fn with_store(store: Arc<MemoryCommitStore>) -> Self {
        init_tracing();
        let (timers, firings) = MemoryTimerGateway::new();
        let timers = Arc::new(timers);
        let client = Arc::new(MemoryComponentClient::new());

        let engine = WorkflowEngine::builder()
            .commit_store(store.clone())
            .timer_gateway(timers.clone())
            .component_client(client.clone())
            .config(EngineConfig::default())
            .build()
            .expect("engine should build");
        engine.spawn_timer_listener(firings);

        Self {
            engine,
            store,
            timers,
            client,
        }
    }

    pub async fn history_len(&self, id: &WorkflowId) -> usize {
        self.engine.history(id).await.unwrap().len()
    }

    /// Poll until `check` holds for the instance snapshot
    pub async fn wait_for<F>(&self, id: &WorkflowId, check: F) -> WorkflowInstanceState
    where
        F: Fn(&WorkflowInstanceState) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.engine.query(id).await {
                Ok(state) if check(&state) => return state,
                Ok(_) | Err(CoreError::WorkflowInstanceNotFound(_)) => {}
                Err(e) => panic!("query failed: {}", e),
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {}; last snapshot: {:?}",
                    id,
                    self.engine.query(id).await
                );
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_status(&self, id: &WorkflowId, status: InstanceStatus) -> WorkflowInstanceState {
        self.wait_for(id, |state| state.status == status).await
    }
}
