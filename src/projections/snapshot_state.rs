//! Snapshot state: pending step and completion derived from a snapshot.

use crate::engine::snapshot::{EngineState, ExecutionSnapshot, PendingStep};

/// What a referenced execution snapshot says about the run.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotState {
    pub pending: Option<PendingStep>,
    pub is_complete: bool,
}

/// Derives pending/complete from an execution snapshot.
#[must_use]
pub fn project_snapshot_state(snapshot: &ExecutionSnapshot) -> SnapshotState {
    let state = snapshot.engine_state();
    SnapshotState {
        pending: state.pending().cloned(),
        is_complete: matches!(state, EngineState::Complete { .. }),
    }
}
