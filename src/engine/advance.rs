//! `continue_workflow`: rehydration and the advance state machine.
//!
//! An advance moves a run forward exactly one step inside a single
//! gate-held critical section: project the DAG, short-circuit to a
//! fact-returning replay when the attempt was already recorded, validate
//! the submission, detect blockers, then write either the blocked pair of
//! events or the advanced batch (node, edge, outputs, snapshot pin, and
//! `advance_recorded`) as one unit.
//!
//! Replay never writes and re-mints byte-identical tokens: signing is a
//! pure function of payload and signing key, and every payload input is
//! recovered from the log.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::engine::blockers::{
    BlockKind, Blocker, BlockerCategory, CapabilityStatus, DetectionInputs, detect_blockers,
    loop_control_breaks,
};
use crate::engine::context::{
    ContextViolation, merge_context, missing_context_keys, validate_context,
};
use crate::engine::guardrails::apply_guardrails;
use crate::engine::prompt::{RecoveryInputs, render_rehydrate_prompt, render_step_prompt};
use crate::engine::service::{
    NextCall, PendingStepView, TokenBundle, ValidationReport, WorkflowService,
};
use crate::engine::snapshot::{
    EngineState, ExecutionSnapshot, LoopFrame, LoopPathEntry, PendingStep,
};
use crate::errors::{ErrorCode, ServiceError};
use crate::events::{
    AdvanceOutcome, AdvanceRecorded, Autonomy, ContextSet, CriterionCheck, EdgeCreated, EdgeKind,
    EventBatch, EventBody, EventScope, NewSessionEvent, NewSnapshotPin, NodeCreated,
    NodeKind, NodeOutputAppended, OutputChannel, Preferences, ValidationPerformed, dedupe,
};
use crate::gate::GateContext;
use crate::projections::{RunDag, project_node_outputs, project_run_dag, project_snapshot_state};
use crate::stores::SessionTruth;
use crate::tokens::{
    AckTokenPayload, CheckpointTokenPayload, StateTokenPayload, TokenError,
    assert_token_scope_matches,
};
use crate::types::{AttemptId, NodeId, ShortHashRef};
use crate::workflow::{WorkflowDefinition, WorkflowStep};

/// What the agent wants from `continue_workflow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueIntent {
    /// Restore position and context without writing.
    Rehydrate,
    /// Submit the pending step's output and move forward.
    Advance,
}

/// One produced artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactOutput {
    pub name: String,
    pub content: String,
}

/// The agent's submission for the pending step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes_markdown: Option<String>,
    /// Structured output for steps carrying an output contract.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactOutput>,
    /// Set when the user confirmed a confirmation-requiring step.
    #[serde(default)]
    pub user_confirmed: bool,
}

impl AgentOutput {
    /// A submission consisting only of markdown notes.
    #[must_use]
    pub fn notes(notes: &str) -> Self {
        Self {
            notes_markdown: Some(notes.to_string()),
            ..Self::default()
        }
    }

    /// Attaches structured output.
    #[must_use]
    pub fn with_structured(mut self, value: Value) -> Self {
        self.structured = Some(value);
        self
    }

    /// Marks the submission as user-confirmed.
    #[must_use]
    pub fn confirmed(mut self) -> Self {
        self.user_confirmed = true;
        self
    }

    fn has_notes(&self) -> bool {
        self.notes_markdown
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty())
    }
}

/// Arguments to `continue_workflow`.
#[derive(Debug, Clone)]
pub struct ContinueArgs {
    pub intent: ContinueIntent,
    pub state_token: String,
    pub ack_token: Option<String>,
    pub output: Option<AgentOutput>,
    pub context: Option<Value>,
    /// Capability availability the agent declares for this call.
    pub capabilities: FxHashMap<String, CapabilityStatus>,
}

impl ContinueArgs {
    /// A rehydration call.
    #[must_use]
    pub fn rehydrate(state_token: &str) -> Self {
        Self {
            intent: ContinueIntent::Rehydrate,
            state_token: state_token.to_string(),
            ack_token: None,
            output: None,
            context: None,
            capabilities: FxHashMap::default(),
        }
    }

    /// An advance call.
    #[must_use]
    pub fn advance(state_token: &str, ack_token: &str, output: AgentOutput) -> Self {
        Self {
            intent: ContinueIntent::Advance,
            state_token: state_token.to_string(),
            ack_token: Some(ack_token.to_string()),
            output: Some(output),
            context: None,
            capabilities: FxHashMap::default(),
        }
    }

    /// Attaches a context object.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Declares a capability status.
    #[must_use]
    pub fn with_capability(mut self, name: &str, status: CapabilityStatus) -> Self {
        self.capabilities.insert(name.to_string(), status);
        self
    }
}

/// Response of `continue_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContinueResponse {
    #[serde(rename_all = "camelCase")]
    Ok {
        state_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_token: Option<String>,
        is_complete: bool,
        pending: Option<PendingStepView>,
        preferences: Preferences,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<Blocker>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next_intent: Option<String>,
        next_call: Option<NextCall>,
    },
    #[serde(rename_all = "camelCase")]
    Blocked {
        state_token: String,
        blockers: Vec<Blocker>,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_ack_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<ValidationReport>,
        pending: Option<PendingStepView>,
        preferences: Preferences,
        next_call: Option<NextCall>,
    },
}

impl ContinueResponse {
    /// Whether the call advanced (or rehydrated) rather than blocked.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, ContinueResponse::Ok { .. })
    }
}

impl WorkflowService {
    /// Rehydrates or advances a session, per the call's intent.
    #[instrument(skip(self, args), fields(intent = ?args.intent))]
    pub async fn continue_workflow(
        &self,
        args: ContinueArgs,
    ) -> Result<ContinueResponse, ServiceError> {
        let budget_ms = self.config.call_timeout.as_millis() as u64;
        match tokio::time::timeout(self.config.call_timeout, self.continue_inner(args)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(budget_ms)),
        }
    }

    async fn continue_inner(&self, args: ContinueArgs) -> Result<ContinueResponse, ServiceError> {
        let state = self.codec.verify_state(&args.state_token)?;

        if let Some(context) = &args.context {
            validate_context(
                context,
                self.config.max_context_depth,
                self.config.max_context_bytes,
            )
            .map_err(ContextViolation::into_service_error)?;
        }

        match args.intent {
            ContinueIntent::Rehydrate => self.rehydrate(state).await,
            ContinueIntent::Advance => {
                let ack_text = args.ack_token.as_deref().ok_or_else(|| {
                    ServiceError::validation(
                        "advance requires an ack token",
                        serde_json::json!({"kind": "missing_ack_token"}),
                    )
                })?;
                let ack = self.codec.verify_ack(ack_text)?;
                assert_token_scope_matches(&state, &ack)?;
                let session_id = state.session_id.clone();
                self.gate
                    .with_healthy_session_lock::<_, ServiceError, _, _>(&session_id, |ctx| {
                        self.advance_locked(ctx, &state, &ack, args)
                    })
                    .await
            }
        }
    }

    // ── Rehydrate ───────────────────────────────────────────────────────

    async fn rehydrate(&self, state: StateTokenPayload) -> Result<ContinueResponse, ServiceError> {
        let health = self.gate.check_health(&state.session_id).await?;
        if !health.is_healthy() {
            return Err(crate::gate::GateError::NotHealthy {
                session_id: state.session_id.clone(),
                health,
            }
            .into());
        }

        let truth = self.store.load(&state.session_id).await?;
        let workflow_hash = Self::session_workflow_hash(&truth)?;
        if !state.workflow_hash_ref.matches(&workflow_hash) {
            return Err(TokenError::WorkflowHashMismatch.into());
        }

        let dag = project_run_dag(&truth.events, &state.run_id);
        if !dag.contains(&state.node_id) {
            return Err(TokenError::UnknownNode {
                node_id: state.node_id.clone(),
            }
            .into());
        }

        let (_, snapshot) = self.node_snapshot(&dag, &state.node_id).await?;
        let snap_state = project_snapshot_state(&snapshot);
        let workflow = self.pinned_workflow(&truth).await?;
        let preferences = Self::project_preferences(&truth);
        let attempt = self.node_attempt(&dag, &state.node_id)?;

        let pending_view = snap_state.pending.as_ref().map(|pending| {
            let outputs = project_node_outputs(&truth.events);
            let rendered = render_rehydrate_prompt(
                &workflow,
                pending,
                RecoveryInputs {
                    dag: &dag,
                    outputs: &outputs,
                    node_id: &state.node_id,
                },
                self.config.recovery_budget_bytes,
            );
            PendingStepView {
                step_id: rendered.step_id,
                title: rendered.title,
                prompt: rendered.prompt,
            }
        });

        let bundle = self.mint_bundle(
            &state.session_id,
            &state.run_id,
            &state.node_id,
            &attempt,
            pending_view.is_some(),
            workflow_hash.short_ref(),
        )?;

        Ok(ok_response(
            bundle,
            snap_state.is_complete,
            pending_view,
            preferences,
            Vec::new(),
        ))
    }

    // ── Advance ─────────────────────────────────────────────────────────

    async fn advance_locked(
        &self,
        ctx: GateContext,
        state: &StateTokenPayload,
        ack: &AckTokenPayload,
        args: ContinueArgs,
    ) -> Result<ContinueResponse, ServiceError> {
        let truth = ctx.truth;
        let workflow_hash = Self::session_workflow_hash(&truth)?;
        if !state.workflow_hash_ref.matches(&workflow_hash) {
            return Err(TokenError::WorkflowHashMismatch.into());
        }
        let dag = project_run_dag(&truth.events, &state.run_id);
        if !dag.contains(&state.node_id) {
            return Err(TokenError::UnknownNode {
                node_id: state.node_id.clone(),
            }
            .into());
        }
        let workflow = self.pinned_workflow(&truth).await?;
        let preferences = Self::project_preferences(&truth);

        let dedupe_key = dedupe::advance(
            &state.session_id,
            &state.run_id,
            &state.node_id,
            &ack.attempt_id,
        );
        if truth.has_dedupe(&dedupe_key) {
            return self
                .replay_advance(&truth, &dag, &workflow, state, &workflow_hash.short_ref(), &dedupe_key)
                .await;
        }

        let (_, snapshot) = self.node_snapshot(&dag, &state.node_id).await?;
        let Some(pending) = snapshot.engine_state().pending().cloned() else {
            return Err(ServiceError::new(
                ErrorCode::PreconditionFailed,
                "node has no pending step to advance",
            ));
        };
        let step = workflow.step(&pending.step_id).ok_or_else(|| {
            ServiceError::internal(format!(
                "pending step {} is absent from the pinned workflow",
                pending.step_id
            ))
        })?;

        let session_context = Self::project_session_context(&truth);
        let merged_context = match &args.context {
            Some(context) => merge_context(&session_context, context),
            None => session_context,
        };
        let budget_exceeded = match validate_context(
            &merged_context,
            self.config.max_context_depth,
            self.config.max_context_bytes,
        ) {
            Ok(_) => None,
            Err(ContextViolation::BudgetExceeded {
                measured_bytes,
                max_bytes,
            }) => Some((measured_bytes, max_bytes)),
            Err(other) => return Err(other.into_service_error()),
        };

        let output = args.output.clone().unwrap_or_default();
        let inputs = DetectionInputs {
            notes_markdown: output.notes_markdown.clone(),
            structured_output: output.structured.clone(),
            user_confirmed: output.user_confirmed,
            missing_context_keys: missing_context_keys(&merged_context, &step.required_context),
            context_budget_exceeded: budget_exceeded,
            capabilities: args.capabilities.clone(),
            confirmation_enforced: preferences.autonomy == Autonomy::Guided,
        };
        let outcome = apply_guardrails(preferences.risk_policy, detect_blockers(step, &inputs));

        let validation = (!step.validation_criteria.is_empty()).then(|| {
            let criteria: Vec<CriterionCheck> = step
                .validation_criteria
                .iter()
                .map(|criterion| CriterionCheck {
                    criterion: criterion.clone(),
                    satisfied: output.has_notes(),
                })
                .collect();
            ValidationReport {
                passed: criteria.iter().all(|c| c.satisfied),
                criteria,
            }
        });

        if !outcome.blocking.is_empty() {
            return self
                .write_blocked(
                    &ctx.witness,
                    state,
                    ack,
                    &workflow,
                    &pending,
                    preferences,
                    outcome.blocking,
                    validation,
                    workflow_hash.short_ref(),
                    dedupe_key,
                )
                .await;
        }

        self.write_advanced(
            &ctx.witness,
            state,
            ack,
            &workflow,
            snapshot.engine_state(),
            preferences,
            output,
            args.context,
            validation,
            outcome.warnings,
            workflow_hash.short_ref(),
            dedupe_key,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_blocked(
        &self,
        witness: &crate::gate::Witness,
        state: &StateTokenPayload,
        ack: &AckTokenPayload,
        workflow: &WorkflowDefinition,
        pending: &PendingStep,
        preferences: Preferences,
        blocking: Vec<Blocker>,
        validation: Option<ValidationReport>,
        hash_ref: ShortHashRef,
        dedupe_key: String,
    ) -> Result<ContinueResponse, ServiceError> {
        let terminal = blocking.iter().any(|b| {
            matches!(
                b.code.category(),
                BlockerCategory::Invariant | BlockerCategory::Corruption
            )
        });
        let block_kind = if terminal {
            BlockKind::TerminalBlock
        } else {
            BlockKind::RetryableBlock
        };
        let retry_attempt_id = (!terminal).then(|| ack.attempt_id.next());
        let blocked_node_id = NodeId::generate();

        let mut batch = EventBatch::default();
        batch.events.push(NewSessionEvent::new(
            EventBody::NodeCreated(NodeCreated {
                run_id: state.run_id.clone(),
                node_id: blocked_node_id.clone(),
                node_kind: NodeKind::BlockedAttempt,
                step_id: Some(pending.step_id.clone()),
                parent_node_id: Some(state.node_id.clone()),
                snapshot_ref: None,
                attempt_id: Some(ack.attempt_id.clone()),
            }),
            Some(EventScope {
                run_id: state.run_id.clone(),
                node_id: Some(blocked_node_id.clone()),
            }),
            dedupe::node(&state.run_id, &blocked_node_id),
        ));

        let validation_ref = validation.as_ref().map(|report| {
            let event = NewSessionEvent::new(
                EventBody::ValidationPerformed(ValidationPerformed {
                    run_id: state.run_id.clone(),
                    node_id: state.node_id.clone(),
                    attempt_id: ack.attempt_id.clone(),
                    passed: report.passed,
                    criteria: report.criteria.clone(),
                }),
                Some(EventScope {
                    run_id: state.run_id.clone(),
                    node_id: Some(state.node_id.clone()),
                }),
                dedupe::validation(&state.run_id, &state.node_id, &ack.attempt_id),
            );
            let id = event.event_id.clone();
            batch.events.push(event);
            id
        });

        batch.events.push(NewSessionEvent::new(
            EventBody::AdvanceRecorded(AdvanceRecorded {
                run_id: state.run_id.clone(),
                node_id: state.node_id.clone(),
                attempt_id: ack.attempt_id.clone(),
                outcome: AdvanceOutcome::Blocked {
                    block_kind,
                    blockers: blocking.clone(),
                    blocked_node_id,
                    retry_attempt_id: retry_attempt_id.clone(),
                    validation_ref,
                },
            }),
            Some(EventScope {
                run_id: state.run_id.clone(),
                node_id: Some(state.node_id.clone()),
            }),
            dedupe_key,
        ));

        self.store.append(witness, batch).await?;

        self.blocked_response(
            state,
            workflow,
            pending,
            preferences,
            blocking,
            retry_attempt_id,
            validation,
            hash_ref,
        )
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_advanced(
        &self,
        witness: &crate::gate::Witness,
        state: &StateTokenPayload,
        ack: &AckTokenPayload,
        workflow: &WorkflowDefinition,
        engine_state: &EngineState,
        preferences: Preferences,
        output: AgentOutput,
        context: Option<Value>,
        validation: Option<ValidationReport>,
        warnings: Vec<Blocker>,
        hash_ref: ShortHashRef,
        dedupe_key: String,
    ) -> Result<ContinueResponse, ServiceError> {
        let next_state =
            advance_engine_state(workflow, engine_state, output.structured.as_ref())?;
        let next_snapshot = ExecutionSnapshot::new(next_state);
        let snapshot_ref = self.snapshots.put(&next_snapshot).await?;
        let next_node_id = NodeId::generate();
        let next_attempt = ack.attempt_id.next();

        let mut batch = EventBatch::default();
        if let Some(context) = context {
            batch.events.push(NewSessionEvent::new(
                EventBody::ContextSet(ContextSet { context }),
                None,
                dedupe::context(&state.session_id, ack.attempt_id.as_str()),
            ));
        }
        if output.has_notes() {
            batch.events.push(NewSessionEvent::new(
                EventBody::NodeOutputAppended(NodeOutputAppended {
                    run_id: state.run_id.clone(),
                    node_id: state.node_id.clone(),
                    channel: OutputChannel::Recap,
                    content: output.notes_markdown.clone().unwrap_or_default(),
                    attempt_id: Some(ack.attempt_id.clone()),
                }),
                Some(EventScope {
                    run_id: state.run_id.clone(),
                    node_id: Some(state.node_id.clone()),
                }),
                dedupe::output(
                    &state.run_id,
                    &state.node_id,
                    OutputChannel::Recap,
                    &ack.attempt_id,
                ),
            ));
        }
        for (position, artifact) in output.artifacts.iter().enumerate() {
            let content = serde_json::to_string(artifact)
                .map_err(|e| ServiceError::internal(format!("artifact serialization: {e}")))?;
            batch.events.push(NewSessionEvent::new(
                EventBody::NodeOutputAppended(NodeOutputAppended {
                    run_id: state.run_id.clone(),
                    node_id: state.node_id.clone(),
                    channel: OutputChannel::Artifact,
                    content,
                    attempt_id: Some(ack.attempt_id.clone()),
                }),
                Some(EventScope {
                    run_id: state.run_id.clone(),
                    node_id: Some(state.node_id.clone()),
                }),
                dedupe::artifact_output(&state.run_id, &state.node_id, &ack.attempt_id, position),
            ));
        }
        if let Some(report) = &validation {
            batch.events.push(NewSessionEvent::new(
                EventBody::ValidationPerformed(ValidationPerformed {
                    run_id: state.run_id.clone(),
                    node_id: state.node_id.clone(),
                    attempt_id: ack.attempt_id.clone(),
                    passed: report.passed,
                    criteria: report.criteria.clone(),
                }),
                Some(EventScope {
                    run_id: state.run_id.clone(),
                    node_id: Some(state.node_id.clone()),
                }),
                dedupe::validation(&state.run_id, &state.node_id, &ack.attempt_id),
            ));
        }

        let node_created = NewSessionEvent::new(
            EventBody::NodeCreated(NodeCreated {
                run_id: state.run_id.clone(),
                node_id: next_node_id.clone(),
                node_kind: NodeKind::Step,
                step_id: next_snapshot
                    .engine_state()
                    .pending()
                    .map(|p| p.step_id.clone()),
                parent_node_id: Some(state.node_id.clone()),
                snapshot_ref: Some(snapshot_ref.clone()),
                attempt_id: Some(next_attempt.clone()),
            }),
            Some(EventScope {
                run_id: state.run_id.clone(),
                node_id: Some(next_node_id.clone()),
            }),
            dedupe::node(&state.run_id, &next_node_id),
        );
        batch.pins.push(NewSnapshotPin {
            snapshot_ref: snapshot_ref.clone(),
            created_by_event_id: node_created.event_id.clone(),
        });
        batch.events.push(node_created);

        batch.events.push(NewSessionEvent::new(
            EventBody::EdgeCreated(EdgeCreated {
                run_id: state.run_id.clone(),
                edge_kind: EdgeKind::AckedStep,
                from_node_id: state.node_id.clone(),
                to_node_id: next_node_id.clone(),
            }),
            Some(EventScope {
                run_id: state.run_id.clone(),
                node_id: Some(next_node_id.clone()),
            }),
            dedupe::edge(&state.run_id, &state.node_id, &next_node_id),
        ));

        batch.events.push(NewSessionEvent::new(
            EventBody::AdvanceRecorded(AdvanceRecorded {
                run_id: state.run_id.clone(),
                node_id: state.node_id.clone(),
                attempt_id: ack.attempt_id.clone(),
                outcome: AdvanceOutcome::Advanced {
                    next_node_id: next_node_id.clone(),
                    snapshot_ref,
                    warnings: warnings.clone(),
                },
            }),
            Some(EventScope {
                run_id: state.run_id.clone(),
                node_id: Some(state.node_id.clone()),
            }),
            dedupe_key,
        ));

        self.store.append(witness, batch).await?;

        let snap_state = project_snapshot_state(&next_snapshot);
        let pending_view = snap_state.pending.as_ref().map(|p| {
            let rendered = render_step_prompt(workflow, p, self.config.recovery_budget_bytes);
            PendingStepView {
                step_id: rendered.step_id,
                title: rendered.title,
                prompt: rendered.prompt,
            }
        });
        let bundle = self.mint_bundle(
            &state.session_id,
            &state.run_id,
            &next_node_id,
            &next_attempt,
            pending_view.is_some(),
            hash_ref,
        )?;
        Ok(ok_response(
            bundle,
            snap_state.is_complete,
            pending_view,
            preferences,
            warnings,
        ))
    }

    // ── Replay ──────────────────────────────────────────────────────────

    /// Fact-returning replay: rebuilds the original response from recorded
    /// events without re-running validation or blocker detection.
    async fn replay_advance(
        &self,
        truth: &SessionTruth,
        dag: &RunDag,
        workflow: &WorkflowDefinition,
        state: &StateTokenPayload,
        hash_ref: &ShortHashRef,
        dedupe_key: &str,
    ) -> Result<ContinueResponse, ServiceError> {
        let event = truth
            .find_dedupe(dedupe_key)
            .ok_or_else(|| ServiceError::internal("replay key vanished between checks"))?;
        let EventBody::AdvanceRecorded(record) = &event.body else {
            return Err(ServiceError::internal(format!(
                "dedupe key {dedupe_key:?} does not belong to an advance"
            )));
        };

        match &record.outcome {
            AdvanceOutcome::Advanced {
                next_node_id,
                snapshot_ref,
                warnings,
            } => {
                let snapshot = self.snapshots.get(snapshot_ref).await?.ok_or_else(|| {
                    ServiceError::new(
                        ErrorCode::StorageCorruptionDetected,
                        format!("snapshot {snapshot_ref} is absent"),
                    )
                })?;
                let snap_state = project_snapshot_state(&snapshot);
                let next_attempt = self.node_attempt(dag, next_node_id)?;
                let pending_view = snap_state.pending.as_ref().map(|p| {
                    let rendered =
                        render_step_prompt(workflow, p, self.config.recovery_budget_bytes);
                    PendingStepView {
                        step_id: rendered.step_id,
                        title: rendered.title,
                        prompt: rendered.prompt,
                    }
                });
                let bundle = self.mint_bundle(
                    &state.session_id,
                    &state.run_id,
                    next_node_id,
                    &next_attempt,
                    pending_view.is_some(),
                    hash_ref.clone(),
                )?;
                let preferences = Self::project_preferences(truth);
                Ok(ok_response(
                    bundle,
                    snap_state.is_complete,
                    pending_view,
                    preferences,
                    warnings.clone(),
                ))
            }
            AdvanceOutcome::Blocked {
                blockers,
                retry_attempt_id,
                validation_ref,
                ..
            } => {
                let (_, snapshot) = self.node_snapshot(dag, &state.node_id).await?;
                let pending = snapshot.engine_state().pending().cloned().ok_or_else(|| {
                    ServiceError::internal("blocked node lost its pending step")
                })?;
                let validation = validation_ref.as_ref().and_then(|reference| {
                    truth.events.iter().find_map(|e| match &e.body {
                        EventBody::ValidationPerformed(v) if &e.event_id == reference => {
                            Some(ValidationReport {
                                passed: v.passed,
                                criteria: v.criteria.clone(),
                            })
                        }
                        _ => None,
                    })
                });
                let preferences = Self::project_preferences(truth);
                self.blocked_response(
                    state,
                    workflow,
                    &pending,
                    preferences,
                    blockers.clone(),
                    retry_attempt_id.clone(),
                    validation,
                    hash_ref.clone(),
                )
            }
        }
    }

    // ── Shared pieces ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn blocked_response(
        &self,
        state: &StateTokenPayload,
        workflow: &WorkflowDefinition,
        pending: &PendingStep,
        preferences: Preferences,
        blockers: Vec<Blocker>,
        retry_attempt_id: Option<AttemptId>,
        validation: Option<ValidationReport>,
        hash_ref: ShortHashRef,
    ) -> Result<ContinueResponse, ServiceError> {
        let state_token = self.codec.sign_state(&StateTokenPayload {
            session_id: state.session_id.clone(),
            run_id: state.run_id.clone(),
            node_id: state.node_id.clone(),
            workflow_hash_ref: hash_ref,
        })?;
        let retry_ack_token = match &retry_attempt_id {
            Some(attempt) => Some(self.codec.sign_ack(&AckTokenPayload {
                session_id: state.session_id.clone(),
                run_id: state.run_id.clone(),
                node_id: state.node_id.clone(),
                attempt_id: attempt.clone(),
            })?),
            None => None,
        };
        let retryable = retry_ack_token.is_some();
        let rendered = render_step_prompt(workflow, pending, self.config.recovery_budget_bytes);
        Ok(ContinueResponse::Blocked {
            state_token,
            blockers,
            retryable,
            retry_ack_token,
            validation,
            pending: Some(PendingStepView {
                step_id: rendered.step_id,
                title: rendered.title,
                prompt: rendered.prompt,
            }),
            preferences,
            next_call: retryable.then(NextCall::continue_advance),
        })
    }

    fn node_attempt(&self, dag: &RunDag, node_id: &NodeId) -> Result<AttemptId, ServiceError> {
        dag.node(node_id)
            .and_then(|n| n.attempt_id.clone())
            .ok_or_else(|| {
                ServiceError::internal(format!("node {node_id} carries no attempt id"))
            })
    }

    pub(crate) fn mint_bundle(
        &self,
        session_id: &crate::types::SessionId,
        run_id: &crate::types::RunId,
        node_id: &NodeId,
        attempt_id: &AttemptId,
        has_pending: bool,
        hash_ref: ShortHashRef,
    ) -> Result<TokenBundle, ServiceError> {
        let state_token = self.codec.sign_state(&StateTokenPayload {
            session_id: session_id.clone(),
            run_id: run_id.clone(),
            node_id: node_id.clone(),
            workflow_hash_ref: hash_ref,
        })?;
        let (ack_token, checkpoint_token) = if has_pending {
            let ack = self.codec.sign_ack(&AckTokenPayload {
                session_id: session_id.clone(),
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                attempt_id: attempt_id.clone(),
            })?;
            let chk = self.codec.sign_checkpoint(&CheckpointTokenPayload {
                session_id: session_id.clone(),
                run_id: run_id.clone(),
                node_id: node_id.clone(),
                attempt_id: attempt_id.clone(),
            })?;
            (Some(ack), Some(chk))
        } else {
            (None, None)
        };
        Ok(TokenBundle {
            state_token,
            ack_token,
            checkpoint_token,
        })
    }
}

fn ok_response(
    bundle: TokenBundle,
    is_complete: bool,
    pending: Option<PendingStepView>,
    preferences: Preferences,
    warnings: Vec<Blocker>,
) -> ContinueResponse {
    ContinueResponse::Ok {
        state_token: bundle.state_token,
        ack_token: bundle.ack_token,
        checkpoint_token: bundle.checkpoint_token,
        is_complete,
        pending,
        preferences,
        warnings,
        next_intent: (!is_complete).then(|| "advance".to_string()),
        next_call: (!is_complete).then(NextCall::continue_advance),
    }
}

// ── Engine stepping ─────────────────────────────────────────────────────

/// Computes the engine state after the pending step completes.
///
/// Loop rule: completing the tail step of a loop body consults the
/// loop-control output. A `continue` below the iteration cap jumps back
/// to the body head with the iteration bumped, anything else leaves the
/// loop and proceeds linearly.
pub(crate) fn advance_engine_state(
    workflow: &WorkflowDefinition,
    state: &EngineState,
    structured_output: Option<&Value>,
) -> Result<EngineState, ServiceError> {
    let EngineState::Running {
        completed,
        loop_stack,
        pending: Some(pending),
    } = state
    else {
        return Err(ServiceError::new(
            ErrorCode::PreconditionFailed,
            "engine state has no pending step",
        ));
    };

    let step = workflow.step(&pending.step_id).ok_or_else(|| {
        ServiceError::internal(format!("step {} is not in the workflow", pending.step_id))
    })?;
    let index = workflow
        .step_index(&step.id)
        .ok_or_else(|| ServiceError::internal("step index lookup failed"))?;

    let mut completed = completed.clone();
    completed.insert(step.id.clone());
    let mut loop_stack = loop_stack.clone();

    // Loop tail: decide re-entry before falling through to linear order.
    if let Some(meta) = &step.loop_meta
        && is_loop_tail(workflow, index, &meta.loop_id)
    {
        let iteration = loop_stack
            .iter()
            .find(|f| f.loop_id == meta.loop_id)
            .map_or(1, |f| f.iteration);
        let wants_continue = structured_output.is_some_and(|v| !loop_control_breaks(v));
        if wants_continue && iteration < meta.max_iterations {
            let head = loop_head(workflow, &meta.loop_id).ok_or_else(|| {
                ServiceError::internal(format!("loop {} has no head step", meta.loop_id))
            })?;
            bump_iteration(&mut loop_stack, meta, head);
            return Ok(EngineState::Running {
                completed,
                pending: Some(PendingStep {
                    step_id: head.id.clone(),
                    loop_path: loop_path(&loop_stack),
                }),
                loop_stack,
            });
        }
        loop_stack.retain(|f| f.loop_id != meta.loop_id);
    }

    match workflow.steps.get(index + 1) {
        None => Ok(EngineState::Complete {
            completed,
            loop_stack,
        }),
        Some(next) => {
            if let Some(meta) = &next.loop_meta
                && !loop_stack.iter().any(|f| f.loop_id == meta.loop_id)
            {
                loop_stack.push(LoopFrame {
                    loop_id: meta.loop_id.clone(),
                    head_step_id: next.id.clone(),
                    iteration: 1,
                });
            }
            Ok(EngineState::Running {
                completed,
                pending: Some(PendingStep {
                    step_id: next.id.clone(),
                    loop_path: loop_path(&loop_stack),
                }),
                loop_stack,
            })
        }
    }
}

fn is_loop_tail(
    workflow: &WorkflowDefinition,
    index: usize,
    loop_id: &crate::types::DelimiterSafeId,
) -> bool {
    workflow
        .steps
        .get(index + 1)
        .and_then(|next| next.loop_meta.as_ref())
        .is_none_or(|next_meta| &next_meta.loop_id != loop_id)
}

fn loop_head<'a>(
    workflow: &'a WorkflowDefinition,
    loop_id: &crate::types::DelimiterSafeId,
) -> Option<&'a WorkflowStep> {
    workflow
        .steps
        .iter()
        .find(|s| s.loop_meta.as_ref().is_some_and(|m| &m.loop_id == loop_id))
}

fn bump_iteration(
    loop_stack: &mut Vec<LoopFrame>,
    meta: &crate::workflow::LoopMeta,
    head: &WorkflowStep,
) {
    match loop_stack.iter_mut().find(|f| f.loop_id == meta.loop_id) {
        Some(frame) => frame.iteration += 1,
        None => loop_stack.push(LoopFrame {
            loop_id: meta.loop_id.clone(),
            head_step_id: head.id.clone(),
            iteration: 2,
        }),
    }
}

fn loop_path(loop_stack: &[LoopFrame]) -> Vec<LoopPathEntry> {
    loop_stack
        .iter()
        .map(|f| LoopPathEntry {
            loop_id: f.loop_id.clone(),
            iteration: f.iteration,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{OutputContract, WorkflowBuilder, WorkflowStep};
    use serde_json::json;

    fn linear() -> WorkflowDefinition {
        WorkflowBuilder::new("w", "W")
            .step("one", "One", "p")
            .step("two", "Two", "p")
            .compile()
            .unwrap()
    }

    fn looped() -> WorkflowDefinition {
        WorkflowBuilder::new("w", "W")
            .push_step(
                WorkflowStep::new("probe", "Probe", "p")
                    .unwrap()
                    .with_loop("scan", 3)
                    .unwrap(),
            )
            .push_step(
                WorkflowStep::new("decide", "Decide", "p")
                    .unwrap()
                    .with_loop("scan", 3)
                    .unwrap()
                    .with_output_contract(OutputContract::LoopControl),
            )
            .step("wrap", "Wrap", "p")
            .compile()
            .unwrap()
    }

    #[test]
    fn linear_advance_walks_to_completion() {
        let workflow = linear();
        let s0 = EngineState::initial(&workflow);
        let s1 = advance_engine_state(&workflow, &s0, None).unwrap();
        assert_eq!(s1.pending().unwrap().step_id.as_str(), "two");
        let s2 = advance_engine_state(&workflow, &s1, None).unwrap();
        assert!(s2.is_complete());
        assert_eq!(s2.completed().len(), 2);
    }

    #[test]
    fn loop_continue_re_enters_the_head() {
        let workflow = looped();
        let s0 = EngineState::initial(&workflow);
        assert_eq!(s0.pending().unwrap().loop_path.len(), 1);
        let s1 = advance_engine_state(&workflow, &s0, None).unwrap();
        assert_eq!(s1.pending().unwrap().step_id.as_str(), "decide");

        let s2 =
            advance_engine_state(&workflow, &s1, Some(&json!({"action": "continue"}))).unwrap();
        let pending = s2.pending().unwrap();
        assert_eq!(pending.step_id.as_str(), "probe");
        assert_eq!(pending.loop_path[0].iteration, 2);
    }

    #[test]
    fn loop_break_leaves_the_body() {
        let workflow = looped();
        let s0 = EngineState::initial(&workflow);
        let s1 = advance_engine_state(&workflow, &s0, None).unwrap();
        let s2 = advance_engine_state(&workflow, &s1, Some(&json!({"action": "break"}))).unwrap();
        assert_eq!(s2.pending().unwrap().step_id.as_str(), "wrap");
        assert!(s2.loop_stack().is_empty());
    }

    #[test]
    fn loop_iteration_cap_forces_exit() {
        let workflow = looped();
        let mut state = EngineState::initial(&workflow);
        // Run the loop to its cap of 3 iterations, always asking to continue.
        for _ in 0..3 {
            state = advance_engine_state(&workflow, &state, None).unwrap();
            state = advance_engine_state(&workflow, &state, Some(&json!({"action": "continue"})))
                .unwrap();
        }
        assert_eq!(state.pending().unwrap().step_id.as_str(), "wrap");
    }

    #[test]
    fn advancing_without_pending_is_a_precondition_failure() {
        let workflow = linear();
        let complete = EngineState::Complete {
            completed: Default::default(),
            loop_stack: Vec::new(),
        };
        let err = advance_engine_state(&workflow, &complete, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::PreconditionFailed);
    }
}
