//! Execution snapshots: the engine state between steps.
//!
//! A snapshot is an immutable, content-addressed capture of where a run
//! stands: which steps completed, what loop frames are live, and what is
//! pending. Snapshots are values in a global content-addressed store shared
//! across sessions; `snapshot_ref = sha256(canonical_json(snapshot))`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::canon::CanonError;
use crate::digest::canonical_digest;
use crate::engine::blockers::{BlockKind, Blocker};
use crate::types::{AttemptId, DelimiterSafeId, EventId, SnapshotRef};
use crate::workflow::WorkflowDefinition;

/// Current snapshot envelope version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// One live loop body the run is inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopFrame {
    pub loop_id: DelimiterSafeId,
    pub head_step_id: DelimiterSafeId,
    /// 1-based iteration counter.
    pub iteration: u32,
}

/// One `loop@iteration` element of a pending step's loop path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopPathEntry {
    pub loop_id: DelimiterSafeId,
    pub iteration: u32,
}

/// The step awaiting the agent's next submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingStep {
    pub step_id: DelimiterSafeId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loop_path: Vec<LoopPathEntry>,
}

/// Why a run is blocked, captured when a blocked state is snapshotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedState {
    pub kind: BlockKind,
    pub blockers: Vec<Blocker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_ref: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt_id: Option<AttemptId>,
}

/// The engine state tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EngineState {
    #[serde(rename_all = "camelCase")]
    Running {
        completed: BTreeSet<DelimiterSafeId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        loop_stack: Vec<LoopFrame>,
        pending: Option<PendingStep>,
    },
    #[serde(rename_all = "camelCase")]
    Blocked {
        completed: BTreeSet<DelimiterSafeId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        loop_stack: Vec<LoopFrame>,
        blocked: BlockedState,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        completed: BTreeSet<DelimiterSafeId>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        loop_stack: Vec<LoopFrame>,
    },
}

impl EngineState {
    /// The initial state of a freshly started run.
    #[must_use]
    pub fn initial(workflow: &WorkflowDefinition) -> Self {
        let first = workflow.steps.first().expect("compiled workflows are non-empty");
        let mut loop_stack = Vec::new();
        let mut loop_path = Vec::new();
        if let Some(meta) = &first.loop_meta {
            loop_stack.push(LoopFrame {
                loop_id: meta.loop_id.clone(),
                head_step_id: first.id.clone(),
                iteration: 1,
            });
            loop_path.push(LoopPathEntry {
                loop_id: meta.loop_id.clone(),
                iteration: 1,
            });
        }
        EngineState::Running {
            completed: BTreeSet::new(),
            loop_stack,
            pending: Some(PendingStep {
                step_id: first.id.clone(),
                loop_path,
            }),
        }
    }

    /// The pending step, if the run awaits a submission.
    #[must_use]
    pub fn pending(&self) -> Option<&PendingStep> {
        match self {
            EngineState::Running { pending, .. } => pending.as_ref(),
            _ => None,
        }
    }

    /// Steps completed so far.
    #[must_use]
    pub fn completed(&self) -> &BTreeSet<DelimiterSafeId> {
        match self {
            EngineState::Running { completed, .. }
            | EngineState::Blocked { completed, .. }
            | EngineState::Complete { completed, .. } => completed,
        }
    }

    /// Live loop frames, innermost last.
    #[must_use]
    pub fn loop_stack(&self) -> &[LoopFrame] {
        match self {
            EngineState::Running { loop_stack, .. }
            | EngineState::Blocked { loop_stack, .. }
            | EngineState::Complete { loop_stack, .. } => loop_stack,
        }
    }

    /// Whether the run has finished every step.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, EngineState::Complete { .. })
    }
}

/// Versioned payload inside the snapshot envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnginePayload {
    pub v: u32,
    pub engine_state: EngineState,
}

/// The persisted, content-addressed snapshot envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub v: u32,
    pub kind: String,
    pub engine_payload: EnginePayload,
}

impl ExecutionSnapshot {
    /// Wraps an engine state in the versioned envelope.
    #[must_use]
    pub fn new(engine_state: EngineState) -> Self {
        Self {
            v: SNAPSHOT_VERSION,
            kind: "execution_snapshot".to_string(),
            engine_payload: EnginePayload {
                v: SNAPSHOT_VERSION,
                engine_state,
            },
        }
    }

    /// Borrows the engine state.
    #[must_use]
    pub fn engine_state(&self) -> &EngineState {
        &self.engine_payload.engine_state
    }

    /// Content address of this snapshot.
    pub fn snapshot_ref(&self) -> Result<SnapshotRef, CanonError> {
        let (_, digest) = canonical_digest(self)?;
        Ok(SnapshotRef::from_digest(&digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowBuilder;

    fn workflow() -> WorkflowDefinition {
        WorkflowBuilder::new("demo", "Demo")
            .step("one", "One", "Do one.")
            .step("two", "Two", "Do two.")
            .compile()
            .unwrap()
    }

    #[test]
    fn initial_state_pends_first_step() {
        let state = EngineState::initial(&workflow());
        assert_eq!(state.pending().unwrap().step_id.as_str(), "one");
        assert!(!state.is_complete());
        assert!(state.completed().is_empty());
    }

    #[test]
    fn snapshot_ref_is_deterministic() {
        let snap = ExecutionSnapshot::new(EngineState::initial(&workflow()));
        assert_eq!(snap.snapshot_ref().unwrap(), snap.snapshot_ref().unwrap());
    }

    #[test]
    fn snapshot_wire_form_carries_envelope() {
        let snap = ExecutionSnapshot::new(EngineState::initial(&workflow()));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["kind"], "execution_snapshot");
        assert_eq!(json["v"], 1);
        assert_eq!(json["enginePayload"]["engineState"]["phase"], "running");
        let back: ExecutionSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
    }
}
