//! `checkpoint_workflow`: mark progress without advancing.
//!
//! A checkpoint branches a marker node off the originating step node and
//! re-mints a state token that still points at the *original* node; the
//! preferred tip does not move, so `continue` keeps resolving to the same
//! pending step. Replays recover the checkpoint node id from the log and
//! never write again.

use tracing::instrument;

use crate::engine::service::{CheckpointResponse, NextCall, WorkflowService};
use crate::errors::ServiceError;
use crate::events::{
    EdgeCreated, EdgeKind, EventBatch, EventBody, EventScope, NewSessionEvent, NodeCreated,
    NodeKind, dedupe,
};
use crate::projections::project_run_dag;
use crate::stores::SessionTruth;
use crate::tokens::{StateTokenPayload, TokenError};
use crate::types::NodeId;

impl WorkflowService {
    /// Records a checkpoint for the node the token binds.
    #[instrument(skip(self, checkpoint_token))]
    pub async fn checkpoint_workflow(
        &self,
        checkpoint_token: &str,
    ) -> Result<CheckpointResponse, ServiceError> {
        let budget_ms = self.config.call_timeout.as_millis() as u64;
        match tokio::time::timeout(
            self.config.call_timeout,
            self.checkpoint_inner(checkpoint_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(budget_ms)),
        }
    }

    async fn checkpoint_inner(
        &self,
        checkpoint_token: &str,
    ) -> Result<CheckpointResponse, ServiceError> {
        let token = self.codec.verify_checkpoint(checkpoint_token)?;
        let session_id = token.session_id.clone();

        self.gate
            .with_healthy_session_lock::<_, ServiceError, _, _>(&session_id, |ctx| async move {
                let truth = ctx.truth;
                let workflow_hash = Self::session_workflow_hash(&truth)?;
                let dag = project_run_dag(&truth.events, &token.run_id);
                let Some(origin) = dag.node(&token.node_id) else {
                    return Err(TokenError::UnknownNode {
                        node_id: token.node_id.clone(),
                    }
                    .into());
                };

                let dedupe_key = dedupe::checkpoint(
                    &token.session_id,
                    &token.run_id,
                    &token.node_id,
                    &token.attempt_id,
                );

                let checkpoint_node_id = match Self::find_checkpoint(&truth, &dedupe_key) {
                    Some(existing) => existing,
                    None => {
                        let checkpoint_node_id = NodeId::generate();
                        let mut batch = EventBatch::default();
                        // The marker observes the origin's snapshot, which
                        // the manifest already pins; no new pin needed.
                        batch.events.push(NewSessionEvent::new(
                            EventBody::NodeCreated(NodeCreated {
                                run_id: token.run_id.clone(),
                                node_id: checkpoint_node_id.clone(),
                                node_kind: NodeKind::Checkpoint,
                                step_id: origin.step_id.clone(),
                                parent_node_id: Some(token.node_id.clone()),
                                snapshot_ref: origin.snapshot_ref.clone(),
                                attempt_id: Some(token.attempt_id.clone()),
                            }),
                            Some(EventScope {
                                run_id: token.run_id.clone(),
                                node_id: Some(checkpoint_node_id.clone()),
                            }),
                            dedupe_key,
                        ));
                        batch.events.push(NewSessionEvent::new(
                            EventBody::EdgeCreated(EdgeCreated {
                                run_id: token.run_id.clone(),
                                edge_kind: EdgeKind::Checkpoint,
                                from_node_id: token.node_id.clone(),
                                to_node_id: checkpoint_node_id.clone(),
                            }),
                            Some(EventScope {
                                run_id: token.run_id.clone(),
                                node_id: Some(checkpoint_node_id.clone()),
                            }),
                            dedupe::edge(&token.run_id, &token.node_id, &checkpoint_node_id),
                        ));
                        self.store.append(&ctx.witness, batch).await?;
                        checkpoint_node_id
                    }
                };

                let state_token = self.codec.sign_state(&StateTokenPayload {
                    session_id: token.session_id.clone(),
                    run_id: token.run_id.clone(),
                    node_id: token.node_id.clone(),
                    workflow_hash_ref: workflow_hash.short_ref(),
                })?;

                Ok(CheckpointResponse {
                    checkpoint_node_id,
                    state_token,
                    next_call: Some(NextCall::continue_rehydrate()),
                })
            })
            .await
    }

    /// Recovers a previously recorded checkpoint node by dedupe key.
    fn find_checkpoint(truth: &SessionTruth, dedupe_key: &str) -> Option<NodeId> {
        truth.find_dedupe(dedupe_key).and_then(|e| match &e.body {
            EventBody::NodeCreated(n) if n.node_kind == NodeKind::Checkpoint => {
                Some(n.node_id.clone())
            }
            _ => None,
        })
    }
}
