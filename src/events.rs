//! The session event model: the engine's append-only source of truth.
//!
//! Everything that happens to a session is an event with a contiguous
//! `event_index`, a closed `kind`, and a session-unique `dedupe_key`.
//! Events are never modified or deleted; append is the only mutation, and
//! an append whose dedupe key already exists is a silent no-op, which is
//! what makes every write path idempotent under replay.
//!
//! The persisted shapes here are explicit serde structs decoupled from
//! in-memory engine types, serialized in camelCase because event lines are
//! hashed and inspected as canonical JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::blockers::{BlockKind, Blocker};
use crate::types::{
    AttemptId, DelimiterSafeId, EventId, NodeId, RunId, SessionId, SnapshotRef, WorkflowHash,
};
use crate::workspace::WorkspaceAnchors;

/// Current event envelope version.
pub const EVENT_VERSION: u32 = 1;

/// Kind of a node in a run's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A step the agent executed (or is executing).
    Step,
    /// A progress marker branched off a step node.
    Checkpoint,
    /// A rejected submission; never advances the run.
    BlockedAttempt,
}

/// Kind of an edge in a run's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Connects a completed step node to its acknowledged successor.
    AckedStep,
    /// Connects a step node to a checkpoint branched off it.
    Checkpoint,
}

/// Output channel of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// Markdown notes recapping what the agent did.
    Recap,
    /// A produced artifact (path, diff, document).
    Artifact,
}

impl OutputChannel {
    /// Stable textual form used inside dedupe keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutputChannel::Recap => "recap",
            OutputChannel::Artifact => "artifact",
        }
    }
}

/// How much initiative the agent is granted between confirmations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    /// Pause for the user at confirmation-requiring steps.
    #[default]
    Guided,
    /// Proceed without confirmation pauses.
    Autonomous,
}

/// How aggressively capability deficits may be downgraded to warnings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskPolicy {
    /// Every capability deficit blocks.
    Conservative,
    /// Unknown capabilities warn; unavailable ones block.
    #[default]
    Balanced,
    /// Both unknown and unavailable capabilities warn.
    Aggressive,
}

/// Session-scoped execution preferences, recorded at creation and on change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub autonomy: Autonomy,
    pub risk_policy: RiskPolicy,
}

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// Run/node scope of an event, when it concerns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventScope {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// One appended event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub v: u32,
    pub event_id: EventId,
    pub event_index: u64,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<EventScope>,
    #[serde(flatten)]
    pub body: EventBody,
    pub dedupe_key: String,
}

/// An event as handed to `append`, before an index is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionEvent {
    pub event_id: EventId,
    pub scope: Option<EventScope>,
    pub body: EventBody,
    pub dedupe_key: String,
}

impl NewSessionEvent {
    /// Builds an unindexed event with a fresh event id.
    #[must_use]
    pub fn new(body: EventBody, scope: Option<EventScope>, dedupe_key: String) -> Self {
        Self {
            event_id: EventId::generate(),
            scope,
            body,
            dedupe_key,
        }
    }

    /// Finalizes into an appendable event at the given index.
    #[must_use]
    pub fn into_event(self, session_id: SessionId, event_index: u64) -> SessionEvent {
        SessionEvent {
            v: EVENT_VERSION,
            event_id: self.event_id,
            event_index,
            session_id,
            scope: self.scope,
            body: self.body,
            dedupe_key: self.dedupe_key,
        }
    }
}

/// The closed set of event kinds with their payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    SessionCreated(SessionCreated),
    RunStarted(RunStarted),
    NodeCreated(NodeCreated),
    EdgeCreated(EdgeCreated),
    NodeOutputAppended(NodeOutputAppended),
    PreferencesChanged(PreferencesChanged),
    ContextSet(ContextSet),
    ObservationRecorded(ObservationRecorded),
    ValidationPerformed(ValidationPerformed),
    AdvanceRecorded(AdvanceRecorded),
}

impl EventBody {
    /// Snapshot references this event's payload mentions.
    ///
    /// Every reference returned here must be pinned in the manifest at or
    /// before the referencing event's index; the log validator enforces it.
    #[must_use]
    pub fn referenced_snapshots(&self) -> Vec<&SnapshotRef> {
        match self {
            EventBody::NodeCreated(n) => n.snapshot_ref.iter().collect(),
            EventBody::AdvanceRecorded(a) => match &a.outcome {
                AdvanceOutcome::Advanced { snapshot_ref, .. } => vec![snapshot_ref],
                AdvanceOutcome::Blocked { .. } => Vec::new(),
            },
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub workflow_hash: WorkflowHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub run_id: RunId,
    pub workflow_hash: WorkflowHash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCreated {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    /// Workflow step this node executes; absent for checkpoint nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<DelimiterSafeId>,
    /// Node this one descends from; absent for the run's root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<NodeId>,
    /// Execution snapshot the node observes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<SnapshotRef>,
    /// Attempt that produced the node, for checkpoint and blocked nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCreated {
    pub run_id: RunId,
    pub edge_kind: EdgeKind,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutputAppended {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub channel: OutputChannel,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesChanged {
    pub preferences: Preferences,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSet {
    /// Canonical-JSON-safe context object supplied by the agent.
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationRecorded {
    pub anchors: WorkspaceAnchors,
}

/// Result of checking one validation criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionCheck {
    pub criterion: String,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationPerformed {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
    pub passed: bool,
    pub criteria: Vec<CriterionCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceRecorded {
    pub run_id: RunId,
    /// The node whose pending step this advance submitted.
    pub node_id: NodeId,
    pub attempt_id: AttemptId,
    #[serde(flatten)]
    pub outcome: AdvanceOutcome,
}

/// Outcome of one advance, with everything replay needs to reconstruct the
/// original response from facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    #[serde(rename_all = "camelCase")]
    Advanced {
        next_node_id: NodeId,
        snapshot_ref: SnapshotRef,
        /// Guardrail-downgraded blockers surfaced with the response; kept
        /// here so replay reproduces them byte-identically.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<Blocker>,
    },
    #[serde(rename_all = "camelCase")]
    Blocked {
        block_kind: BlockKind,
        blockers: Vec<Blocker>,
        blocked_node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_attempt_id: Option<AttemptId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation_ref: Option<EventId>,
    },
}

// ---------------------------------------------------------------------------
// Snapshot pins & manifest
// ---------------------------------------------------------------------------

/// Manifest attestation that a snapshot is referenced by the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPin {
    pub snapshot_ref: SnapshotRef,
    pub event_index: u64,
    pub created_by_event_id: EventId,
}

/// A pin as handed to `append`, before the creating event has an index.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshotPin {
    pub snapshot_ref: SnapshotRef,
    pub created_by_event_id: EventId,
}

/// The session manifest: every snapshot pin, in pin order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    pub v: u32,
    pub pins: Vec<SnapshotPin>,
}

/// One atomic unit of writes: events plus the pins they introduce.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<NewSessionEvent>,
    pub pins: Vec<NewSnapshotPin>,
}

// ---------------------------------------------------------------------------
// Dedupe keys
// ---------------------------------------------------------------------------

/// Canonical dedupe-key constructors.
///
/// Keys are colon-joined; every participating id is delimiter-safe, so the
/// keys parse unambiguously.
pub mod dedupe {
    use super::*;

    pub fn session_created(session: &SessionId) -> String {
        format!("session_created:{session}")
    }

    pub fn run_started(run: &RunId) -> String {
        format!("run_started:{run}")
    }

    pub fn node(run: &RunId, node: &NodeId) -> String {
        format!("node:{run}:{node}")
    }

    pub fn edge(run: &RunId, from: &NodeId, to: &NodeId) -> String {
        format!("edge:{run}:{from}:{to}")
    }

    pub fn output(run: &RunId, node: &NodeId, channel: OutputChannel, attempt: &AttemptId) -> String {
        format!("output:{run}:{node}:{}:{attempt}", channel.as_str())
    }

    /// Artifacts need a position suffix: one attempt may produce several.
    pub fn artifact_output(
        run: &RunId,
        node: &NodeId,
        attempt: &AttemptId,
        position: usize,
    ) -> String {
        format!("output:{run}:{node}:artifact:{attempt}:{position}")
    }

    pub fn preferences(session: &SessionId, label: &str) -> String {
        format!("prefs:{session}:{label}")
    }

    pub fn context(session: &SessionId, label: &str) -> String {
        format!("context:{session}:{label}")
    }

    pub fn observation(session: &SessionId, label: &str) -> String {
        format!("observation:{session}:{label}")
    }

    pub fn validation(run: &RunId, node: &NodeId, attempt: &AttemptId) -> String {
        format!("validation:{run}:{node}:{attempt}")
    }

    /// The advance idempotency key mandated by the external contract.
    pub fn advance(
        session: &SessionId,
        run: &RunId,
        node: &NodeId,
        attempt: &AttemptId,
    ) -> String {
        format!("advance:{session}:{run}:{node}:{attempt}")
    }

    /// The checkpoint idempotency key mandated by the external contract.
    pub fn checkpoint(
        session: &SessionId,
        run: &RunId,
        node: &NodeId,
        attempt: &AttemptId,
    ) -> String {
        format!("checkpoint:{session}:{run}:{node}:{attempt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape_is_kind_plus_data() {
        let session = SessionId::parse("s1").unwrap();
        let run = RunId::parse("r1").unwrap();
        let event = NewSessionEvent::new(
            EventBody::RunStarted(RunStarted {
                run_id: run.clone(),
                workflow_hash: WorkflowHash::from_canonical_bytes(b"w"),
            }),
            Some(EventScope {
                run_id: run.clone(),
                node_id: None,
            }),
            dedupe::run_started(&run),
        )
        .into_event(session, 0);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "run_started");
        assert_eq!(json["data"]["runId"], "r1");
        assert_eq!(json["eventIndex"], 0);
        assert_eq!(json["dedupeKey"], "run_started:r1");

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn advance_outcome_roundtrips() {
        let advanced = AdvanceOutcome::Advanced {
            next_node_id: NodeId::parse("n2").unwrap(),
            snapshot_ref: SnapshotRef::from_canonical_bytes(b"s"),
            warnings: Vec::new(),
        };
        let json = serde_json::to_value(&advanced).unwrap();
        assert_eq!(json["outcome"], "advanced");
        let back: AdvanceOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, advanced);
    }

    #[test]
    fn referenced_snapshots_cover_node_and_advance() {
        let sref = SnapshotRef::from_canonical_bytes(b"x");
        let body = EventBody::NodeCreated(NodeCreated {
            run_id: RunId::parse("r").unwrap(),
            node_id: NodeId::parse("n").unwrap(),
            node_kind: NodeKind::Step,
            step_id: None,
            parent_node_id: None,
            snapshot_ref: Some(sref.clone()),
            attempt_id: None,
        });
        assert_eq!(body.referenced_snapshots(), vec![&sref]);
    }
}
