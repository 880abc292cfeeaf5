//! `start_workflow`: pin, create the session, mint the first tokens.

use tracing::instrument;

use crate::engine::context::validate_context;
use crate::engine::prompt::render_step_prompt;
use crate::engine::service::{
    NextCall, PendingStepView, StartArgs, StartResponse, WorkflowService,
};
use crate::engine::snapshot::{EngineState, ExecutionSnapshot};
use crate::errors::ServiceError;
use crate::events::{
    ContextSet, EventBatch, EventBody, EventScope, NewSessionEvent, NewSnapshotPin, NodeCreated,
    NodeKind, ObservationRecorded, PreferencesChanged, RunStarted, SessionCreated, dedupe,
};
use crate::tokens::{AckTokenPayload, CheckpointTokenPayload, StateTokenPayload};
use crate::types::{AttemptId, NodeId, RunId, SessionId};
use crate::workspace::capture_anchors;

impl WorkflowService {
    /// Starts a new session executing the given workflow.
    ///
    /// Pins the workflow, creates the session under the gate, and returns
    /// the first pending step with a full token set. Anchor capture is
    /// best-effort and never blocks the start.
    #[instrument(skip(self, args), fields(workflow = %args.workflow.id))]
    pub async fn start_workflow(&self, args: StartArgs) -> Result<StartResponse, ServiceError> {
        let budget_ms = self.config.call_timeout.as_millis() as u64;
        match tokio::time::timeout(self.config.call_timeout, self.start_inner(args)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(budget_ms)),
        }
    }

    async fn start_inner(&self, args: StartArgs) -> Result<StartResponse, ServiceError> {
        if let Some(context) = &args.context {
            validate_context(
                context,
                self.config.max_context_depth,
                self.config.max_context_bytes,
            )
            .map_err(|v| v.into_service_error())?;
        }

        let workflow = args.workflow;
        let workflow_hash = self.pinned.put(&workflow.pinned_snapshot()).await?;

        let session_id = SessionId::generate();
        let run_id = RunId::generate();
        let root_node_id = NodeId::generate();
        let root_attempt = AttemptId::generate();
        let preferences = args.preferences.unwrap_or_default();

        let initial_state = EngineState::initial(&workflow);
        let snapshot = ExecutionSnapshot::new(initial_state);
        let snapshot_ref = self.snapshots.put(&snapshot).await?;

        let anchors = args
            .workspace_path
            .as_deref()
            .map(capture_anchors)
            .filter(|a| !a.is_empty());

        let mut batch = EventBatch::default();
        batch.events.push(NewSessionEvent::new(
            EventBody::SessionCreated(SessionCreated {
                workflow_hash: workflow_hash.clone(),
                workspace_path: args
                    .workspace_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            }),
            None,
            dedupe::session_created(&session_id),
        ));
        batch.events.push(NewSessionEvent::new(
            EventBody::PreferencesChanged(PreferencesChanged { preferences }),
            None,
            dedupe::preferences(&session_id, "initial"),
        ));
        if let Some(context) = args.context {
            batch.events.push(NewSessionEvent::new(
                EventBody::ContextSet(ContextSet { context }),
                None,
                dedupe::context(&session_id, "initial"),
            ));
        }
        if let Some(anchors) = anchors {
            batch.events.push(NewSessionEvent::new(
                EventBody::ObservationRecorded(ObservationRecorded { anchors }),
                None,
                dedupe::observation(&session_id, "start"),
            ));
        }
        batch.events.push(NewSessionEvent::new(
            EventBody::RunStarted(RunStarted {
                run_id: run_id.clone(),
                workflow_hash: workflow_hash.clone(),
            }),
            Some(EventScope {
                run_id: run_id.clone(),
                node_id: None,
            }),
            dedupe::run_started(&run_id),
        ));
        let root_created = NewSessionEvent::new(
            EventBody::NodeCreated(NodeCreated {
                run_id: run_id.clone(),
                node_id: root_node_id.clone(),
                node_kind: NodeKind::Step,
                step_id: snapshot
                    .engine_state()
                    .pending()
                    .map(|p| p.step_id.clone()),
                parent_node_id: None,
                snapshot_ref: Some(snapshot_ref.clone()),
                attempt_id: Some(root_attempt.clone()),
            }),
            Some(EventScope {
                run_id: run_id.clone(),
                node_id: Some(root_node_id.clone()),
            }),
            dedupe::node(&run_id, &root_node_id),
        );
        batch.pins.push(NewSnapshotPin {
            snapshot_ref: snapshot_ref.clone(),
            created_by_event_id: root_created.event_id.clone(),
        });
        batch.events.push(root_created);

        let store = std::sync::Arc::clone(&self.store);
        self.gate
            .with_new_session_lock::<_, ServiceError, _, _>(&session_id, |ctx| {
                let store = std::sync::Arc::clone(&store);
                async move {
                    store.append(&ctx.witness, batch).await?;
                    Ok(())
                }
            })
            .await?;

        let pending = snapshot.engine_state().pending().cloned();
        let state_token = self.codec.sign_state(&StateTokenPayload {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            node_id: root_node_id.clone(),
            workflow_hash_ref: workflow_hash.short_ref(),
        })?;
        let (ack_token, checkpoint_token, pending_view) = match &pending {
            Some(pending_step) => {
                let ack = self.codec.sign_ack(&AckTokenPayload {
                    session_id: session_id.clone(),
                    run_id: run_id.clone(),
                    node_id: root_node_id.clone(),
                    attempt_id: root_attempt.clone(),
                })?;
                let chk = self.codec.sign_checkpoint(&CheckpointTokenPayload {
                    session_id,
                    run_id,
                    node_id: root_node_id,
                    attempt_id: root_attempt,
                })?;
                let rendered = render_step_prompt(
                    &workflow,
                    pending_step,
                    self.config.recovery_budget_bytes,
                );
                (
                    Some(ack),
                    Some(chk),
                    Some(PendingStepView {
                        step_id: rendered.step_id,
                        title: rendered.title,
                        prompt: rendered.prompt,
                    }),
                )
            }
            None => (None, None, None),
        };

        let is_complete = snapshot.engine_state().is_complete();
        Ok(StartResponse {
            state_token,
            ack_token,
            checkpoint_token,
            is_complete,
            pending: pending_view,
            preferences,
            next_intent: (!is_complete).then(|| "advance".to_string()),
            next_call: (!is_complete).then(NextCall::continue_advance),
        })
    }
}
