//! The workflow service: constructor wiring and the shared operation glue.
//!
//! [`WorkflowService`] owns the stores, the lock manager, the gate, and the
//! token codec through explicit constructor wiring, no container. The operation
//! entry points live with their logic: `start_workflow` in
//! [`super::start`], `continue_workflow` in [`super::advance`], and
//! `checkpoint_workflow` in [`super::checkpoint`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::engine::snapshot::ExecutionSnapshot;
use crate::errors::{ErrorCode, ServiceError};
use crate::events::{CriterionCheck, EventBody, Preferences};
use crate::gate::ExecutionGate;
use crate::keyring::Keyring;
use crate::projections::{ResumeCandidate, RunDag, rank_resume_candidates};
use crate::stores::{
    DataLayout, PinnedWorkflowStore, SessionEventLogStore, SessionLockManager, SessionTruth,
    SnapshotStore,
};
use crate::tokens::TokenCodec;
use crate::types::{NodeId, SnapshotRef, WorkflowHash};
use crate::workflow::{WorkflowDefinition, WorkflowSnapshot};

/// Arguments to `start_workflow`.
///
/// Workflow discovery and file loading are the embedder's concern; the
/// engine receives an already-compiled definition.
#[derive(Debug, Clone)]
pub struct StartArgs {
    pub workflow: WorkflowDefinition,
    pub context: Option<Value>,
    pub workspace_path: Option<PathBuf>,
    pub preferences: Option<Preferences>,
}

impl StartArgs {
    /// Starts a workflow with default preferences and no context.
    #[must_use]
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            workflow,
            context: None,
            workspace_path: None,
            preferences: None,
        }
    }

    /// Attaches an initial context object.
    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Records the workspace the agent runs in, enabling anchor capture.
    #[must_use]
    pub fn with_workspace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    /// Overrides the default preferences.
    #[must_use]
    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = Some(preferences);
        self
    }
}

/// The step the agent should work on next, fully rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStepView {
    pub step_id: String,
    pub title: String,
    pub prompt: String,
}

/// Machine-readable template for the agent's next call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextCall {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

impl NextCall {
    /// The usual successor: advance through `continue_workflow`.
    #[must_use]
    pub fn continue_advance() -> Self {
        Self {
            tool: "continue_workflow".to_string(),
            intent: Some("advance".to_string()),
        }
    }

    /// Rehydration through `continue_workflow`.
    #[must_use]
    pub fn continue_rehydrate() -> Self {
        Self {
            tool: "continue_workflow".to_string(),
            intent: Some("rehydrate".to_string()),
        }
    }
}

/// Response of `start_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub state_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_token: Option<String>,
    pub is_complete: bool,
    pub pending: Option<PendingStepView>,
    pub preferences: Preferences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_intent: Option<String>,
    pub next_call: Option<NextCall>,
}

/// Validation results surfaced with a blocked response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub passed: bool,
    pub criteria: Vec<CriterionCheck>,
}

/// Response of `checkpoint_workflow`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub checkpoint_node_id: NodeId,
    pub state_token: String,
    pub next_call: Option<NextCall>,
}

/// Tokens minted for one node position.
#[derive(Debug, Clone)]
pub(crate) struct TokenBundle {
    pub state_token: String,
    pub ack_token: Option<String>,
    pub checkpoint_token: Option<String>,
}

/// The durable workflow execution service.
#[derive(Clone)]
pub struct WorkflowService {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<SessionEventLogStore>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) pinned: Arc<PinnedWorkflowStore>,
    pub(crate) gate: ExecutionGate,
    pub(crate) codec: TokenCodec,
}

impl WorkflowService {
    /// Opens (or initializes) an engine over the configured data directory.
    ///
    /// Loads the keyring once; a fresh data directory gets a generated
    /// signing key persisted before the first session exists.
    pub fn open(config: EngineConfig) -> Result<Self, ServiceError> {
        let layout = DataLayout::new(&config.data_dir);
        let keyring = Keyring::load_or_generate(&layout.keyring_file())?;
        Ok(Self::with_keyring(config, keyring))
    }

    /// Opens an engine with an explicit keyring (tests, rotation tooling).
    #[must_use]
    pub fn with_keyring(config: EngineConfig, keyring: Keyring) -> Self {
        let layout = DataLayout::new(&config.data_dir);
        let store = Arc::new(SessionEventLogStore::new(layout.clone()));
        let snapshots = Arc::new(SnapshotStore::new(&layout));
        let pinned = Arc::new(PinnedWorkflowStore::new(&layout));
        let locks = SessionLockManager::new(
            layout.clone(),
            config.lock_retry_after.as_millis() as u64,
        );
        let gate = ExecutionGate::new(Arc::clone(&store), Arc::clone(&snapshots), locks);
        let codec = TokenCodec::new(Arc::new(keyring));
        Self {
            config,
            store,
            snapshots,
            pinned,
            gate,
            codec,
        }
    }

    /// Ranks healthy sessions against the caller's workspace anchors,
    /// best match first.
    ///
    /// Unhealthy or unreadable sessions are skipped rather than failing
    /// the listing; resuming them needs operator intervention anyway.
    pub async fn resume_candidates(
        &self,
        target: &crate::workspace::WorkspaceAnchors,
    ) -> Result<Vec<ResumeCandidate>, ServiceError> {
        let mut candidates = Vec::new();
        for session_id in self.store.list_sessions().await? {
            let Ok(health) = self.gate.check_health(&session_id).await else {
                continue;
            };
            if !health.is_healthy() {
                continue;
            }
            let Ok(truth) = self.store.load(&session_id).await else {
                continue;
            };
            let anchors = truth
                .events
                .iter()
                .find_map(|e| match &e.body {
                    EventBody::ObservationRecorded(o) => Some(o.anchors.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let last_event_index = truth.events.len().saturating_sub(1) as u64;
            candidates.push(ResumeCandidate {
                session_id,
                anchors,
                last_event_index,
            });
        }
        Ok(rank_resume_candidates(candidates, target))
    }

    /// The session's current preferences: the last `preferences_changed`
    /// event, or the defaults.
    #[must_use]
    pub(crate) fn project_preferences(truth: &SessionTruth) -> Preferences {
        truth
            .events
            .iter()
            .rev()
            .find_map(|e| match &e.body {
                EventBody::PreferencesChanged(p) => Some(p.preferences),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// The session's merged context: every `context_set` event folded in
    /// log order.
    #[must_use]
    pub(crate) fn project_session_context(truth: &SessionTruth) -> Value {
        let mut merged = Value::Object(serde_json::Map::new());
        for event in &truth.events {
            if let EventBody::ContextSet(c) = &event.body {
                merged = super::context::merge_context(&merged, &c.context);
            }
        }
        merged
    }

    /// The workflow hash the session was created against.
    pub(crate) fn session_workflow_hash(truth: &SessionTruth) -> Result<WorkflowHash, ServiceError> {
        truth
            .events
            .first()
            .and_then(|e| match &e.body {
                EventBody::SessionCreated(c) => Some(c.workflow_hash.clone()),
                _ => None,
            })
            .ok_or_else(|| ServiceError::internal("session log has no session_created event"))
    }

    /// Loads the pinned workflow definition the session runs.
    pub(crate) async fn pinned_workflow(
        &self,
        truth: &SessionTruth,
    ) -> Result<WorkflowDefinition, ServiceError> {
        let hash = Self::session_workflow_hash(truth)?;
        let snapshot = self.pinned.get(&hash).await?.ok_or_else(|| {
            ServiceError::new(
                ErrorCode::StorageCorruptionDetected,
                format!("pinned workflow {hash} is absent"),
            )
        })?;
        match snapshot {
            WorkflowSnapshot::V1Pinned { definition } => Ok(definition),
            WorkflowSnapshot::V1Preview { .. } => Err(ServiceError::internal(
                "session references a preview snapshot, which is not executable",
            )),
        }
    }

    /// Loads the execution snapshot a DAG node observes.
    pub(crate) async fn node_snapshot(
        &self,
        dag: &RunDag,
        node_id: &NodeId,
    ) -> Result<(SnapshotRef, ExecutionSnapshot), ServiceError> {
        let node = dag
            .node(node_id)
            .ok_or_else(|| ServiceError::internal(format!("node {node_id} vanished from DAG")))?;
        let reference = node.snapshot_ref.clone().ok_or_else(|| {
            ServiceError::internal(format!("node {node_id} carries no snapshot reference"))
        })?;
        let snapshot = self.snapshots.get(&reference).await?.ok_or_else(|| {
            ServiceError::new(
                ErrorCode::StorageCorruptionDetected,
                format!("snapshot {reference} is absent"),
            )
        })?;
        Ok((reference, snapshot))
    }

}
