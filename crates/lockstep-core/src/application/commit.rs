use crate::{
    domain::{
        codec::MessageCodec,
        repository::{CommitRecord, CommitStore, PersistedSnapshot},
        workflow_instance::{InstanceStatus, WorkflowId, WorkflowInstanceState},
    },
    CoreError,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error};

/// Turns instance snapshots into atomic commit records and back
pub struct CommitProtocol {
    store: Arc<dyn CommitStore>,
    codec: Arc<dyn MessageCodec>,
}

impl CommitProtocol {
    /// Create a commit protocol
    pub fn new(store: Arc<dyn CommitStore>, codec: Arc<dyn MessageCodec>) -> Self {
        Self { store, codec }
    }

    /// Build the record that would follow `state`'s last commit
    pub fn to_record(
        &self,
        state: &WorkflowInstanceState,
        state_type: &str,
    ) -> Result<CommitRecord, CoreError> {
        let user_state = self.codec.encode(state_type, &state.user_state)?;

        Ok(CommitRecord {
            sequence: state.sequence + 1,
            committed_at: Utc::now(),
            snapshot: PersistedSnapshot {
                workflow_id: state.workflow_id.clone(),
                definition_id: state.definition_id.clone(),
                current_step: state.current_step.clone(),
                status: state.status,
                user_state,
                step_input: state.step_input.clone(),
                attempt_count: state.attempt_count,
                attempt_token: state.attempt_token,
                retry_scheduled: state.retry_scheduled,
                error: state.error.clone(),
                created_at: state.created_at,
                updated_at: state.updated_at,
            },
        })
    }

    /// Rebuild instance state from a record, decoding the user state as `state_type`
    pub fn from_record(
        &self,
        record: &CommitRecord,
        state_type: &str,
    ) -> Result<WorkflowInstanceState, CoreError> {
        let snapshot = &record.snapshot;
        let user_state = self.codec.decode(&snapshot.user_state, state_type)?;

        Ok(WorkflowInstanceState {
            workflow_id: snapshot.workflow_id.clone(),
            definition_id: snapshot.definition_id.clone(),
            current_step: snapshot.current_step.clone(),
            status: snapshot.status,
            user_state,
            step_input: snapshot.step_input.clone(),
            attempt_count: snapshot.attempt_count,
            attempt_token: snapshot.attempt_token,
            retry_scheduled: snapshot.retry_scheduled,
            error: snapshot.error.clone(),
            sequence: record.sequence,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            events: Vec::new(),
        })
    }

    /// Durably commit `state` as the successor of its last commit.
    ///
    /// `state.sequence` is only advanced once the store has accepted the
    /// record; on error the caller still holds the previous snapshot.
    pub async fn commit(
        &self,
        state: &mut WorkflowInstanceState,
        state_type: &str,
    ) -> Result<(), CoreError> {
        let record = self.to_record(state, state_type)?;

        if let Err(e) = self.store.commit(&record).await {
            error!(
                workflow_id = %state.workflow_id,
                sequence = record.sequence,
                error = %e,
                "Commit failed"
            );
            return Err(e);
        }

        state.sequence = record.sequence;
        debug!(
            workflow_id = %state.workflow_id,
            sequence = record.sequence,
            status = state.status.as_str(),
            step = ?state.current_step,
            token = %state.attempt_token,
            "Committed"
        );
        Ok(())
    }

    /// Commit a FAILED successor of `record` without decoding its user state.
    ///
    /// Used when a committed instance can no longer be rehydrated.
    pub async fn fail_record(
        &self,
        record: &CommitRecord,
        error: &CoreError,
    ) -> Result<CommitRecord, CoreError> {
        let now = Utc::now();
        let mut next = record.clone();
        next.sequence = record.sequence + 1;
        next.committed_at = now;

        let snapshot = &mut next.snapshot;
        snapshot.status = InstanceStatus::Failed;
        snapshot.current_step = None;
        snapshot.attempt_token = snapshot.attempt_token.next();
        snapshot.retry_scheduled = false;
        snapshot.error = Some(error.to_string());
        snapshot.updated_at = now;

        self.store.commit(&next).await?;
        error!(
            workflow_id = %next.workflow_id(),
            sequence = next.sequence,
            error = %error,
            "Workflow instance failed during recovery"
        );
        Ok(next)
    }

    /// Latest record of an instance
    pub async fn load_latest(&self, workflow_id: &WorkflowId) -> Result<Option<CommitRecord>, CoreError> {
        self.store.load_latest(workflow_id).await
    }

    /// All records of an instance
    pub async fn history(&self, workflow_id: &WorkflowId) -> Result<Vec<CommitRecord>, CoreError> {
        self.store.history(workflow_id).await
    }

    /// Latest records of all non-terminal instances
    pub async fn list_active(&self) -> Result<Vec<CommitRecord>, CoreError> {
        self.store.list_active().await
    }
}
