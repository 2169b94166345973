use crate::{
    application::instance_actor::InstanceMessage,
    domain::{
        codec::MessageCodec,
        repository::{
            Completion, CompletionOutcome, ComponentClient, DeferredRequest, IssueResult,
        },
        step::Deferred,
        workflow_definition::StepDefinition,
        workflow_instance::{AttemptToken, WorkflowId},
    },
    CoreError, DataPacket,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Hands deferred calls to the component client and routes their
/// completions back into the issuing instance's mailbox
#[derive(Clone)]
pub struct CompletionAdapter {
    client: Arc<dyn ComponentClient>,
    codec: Arc<dyn MessageCodec>,
}

impl CompletionAdapter {
    /// Create an adapter
    pub fn new(client: Arc<dyn ComponentClient>, codec: Arc<dyn MessageCodec>) -> Self {
        Self { client, codec }
    }

    /// Encode `deferred` as a request issued under `(workflow_id, token)`
    pub fn encode_request(
        &self,
        workflow_id: &WorkflowId,
        token: AttemptToken,
        deferred: Deferred,
    ) -> Result<DeferredRequest, CoreError> {
        let payload = self
            .codec
            .encode(&deferred.payload_type, &deferred.payload)
            .map_err(|e| CoreError::StepExecutionError(format!("Failed to encode request: {}", e)))?;

        Ok(DeferredRequest {
            workflow_id: workflow_id.clone(),
            token,
            target: deferred.target,
            method: deferred.method,
            payload,
        })
    }

    /// Encode `deferred` and issue it under `(workflow_id, token)`.
    ///
    /// The returned handle aborts the local wait only; the call itself may
    /// still take effect at the target.
    pub(crate) fn issue(
        &self,
        workflow_id: &WorkflowId,
        token: AttemptToken,
        deferred: Deferred,
        mailbox: mpsc::Sender<InstanceMessage>,
    ) -> Result<AbortHandle, CoreError> {
        let request = self.encode_request(workflow_id, token, deferred)?;

        debug!(
            workflow_id = %workflow_id,
            token = %token,
            target = %request.target,
            method = %request.method,
            "Issuing deferred call"
        );

        let client = self.client.clone();
        let workflow_id = workflow_id.clone();
        let task = tokio::spawn(async move {
            let outcome = match client.issue(request).await {
                Ok(IssueResult::Completed(outcome)) => outcome,
                Ok(IssueResult::Accepted) => return,
                Err(e) => CompletionOutcome::Failure(e.to_string()),
            };

            let completion = Completion {
                workflow_id,
                token,
                outcome,
            };
            if mailbox.send(InstanceMessage::Completion(completion)).await.is_err() {
                warn!(token = %token, "Instance mailbox closed before completion arrived");
            }
        });

        Ok(task.abort_handle())
    }

    /// Issue the call carried by a user timer.
    ///
    /// Nothing waits on the outcome; failures are logged.
    pub async fn fire_scheduled(&self, request: DeferredRequest) {
        let workflow_id = request.workflow_id.clone();
        let target = format!("{}/{}", request.target, request.method);

        match self.client.issue(request).await {
            Ok(IssueResult::Completed(CompletionOutcome::Failure(error))) => {
                warn!(workflow_id = %workflow_id, target = %target, error = %error, "Scheduled call failed");
            }
            Ok(_) => {
                debug!(workflow_id = %workflow_id, target = %target, "Scheduled call issued");
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, target = %target, error = %e, "Failed to issue scheduled call");
            }
        }
    }

    /// Turn a completion outcome into the step's output
    pub fn decode_outcome(
        &self,
        step: &StepDefinition,
        outcome: CompletionOutcome,
    ) -> Result<DataPacket, CoreError> {
        match outcome {
            CompletionOutcome::Success(payload) => {
                let expected = step.result_type.as_deref().unwrap_or(&payload.type_tag);
                self.codec.decode(&payload, expected)
            }
            CompletionOutcome::Failure(error) => Err(CoreError::StepExecutionError(error)),
        }
    }
}
