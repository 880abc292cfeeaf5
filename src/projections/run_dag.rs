//! The run DAG: nodes, edges, tips, and the preferred tip.
//!
//! Reconstructed purely from `node_created` and `edge_created` events. The
//! **preferred tip** is the deterministic "current" node of a run: the
//! target of the latest `acked_step` edge, falling back to the run's root
//! step. Checkpoint and blocked-attempt nodes branch off step nodes and
//! never advance the preferred tip, which is why a checkpoint leaves
//! `continue` aimed at the original pending step.

use rustc_hash::FxHashMap;

use crate::events::{EdgeKind, EventBody, NodeKind, SessionEvent};
use crate::types::{AttemptId, DelimiterSafeId, NodeId, RunId, SnapshotRef};

/// One node of the run DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDagNode {
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    pub step_id: Option<DelimiterSafeId>,
    pub parent_node_id: Option<NodeId>,
    pub snapshot_ref: Option<SnapshotRef>,
    pub attempt_id: Option<AttemptId>,
    pub created_at_event_index: u64,
}

/// One edge of the run DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDagEdge {
    pub edge_kind: EdgeKind,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub created_at_event_index: u64,
}

/// The projected DAG of one run.
#[derive(Debug, Clone, Default)]
pub struct RunDag {
    pub nodes: FxHashMap<NodeId, RunDagNode>,
    /// Node ids in creation order.
    pub node_order: Vec<NodeId>,
    pub edges: Vec<RunDagEdge>,
    /// Leaves: nodes with no outgoing edge, in creation order.
    pub tip_node_ids: Vec<NodeId>,
    /// The deterministic current node.
    pub preferred_tip: Option<NodeId>,
}

impl RunDag {
    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&RunDagNode> {
        self.nodes.get(id)
    }

    /// Whether the run knows this node.
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Step-node ancestry of a node, root first, excluding the node itself.
    #[must_use]
    pub fn step_ancestry(&self, id: &NodeId) -> Vec<&RunDagNode> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(id).and_then(|n| n.parent_node_id.as_ref());
        while let Some(parent_id) = cursor {
            let Some(parent) = self.nodes.get(parent_id) else {
                break;
            };
            if parent.node_kind == NodeKind::Step {
                chain.push(parent);
            }
            cursor = parent.parent_node_id.as_ref();
        }
        chain.reverse();
        chain
    }

    /// Step nodes strictly downstream of a node along `acked_step` edges.
    #[must_use]
    pub fn downstream_steps(&self, id: &NodeId) -> Vec<&RunDagNode> {
        let mut out = Vec::new();
        let mut frontier = vec![id.clone()];
        while let Some(current) = frontier.pop() {
            for edge in &self.edges {
                if edge.edge_kind == EdgeKind::AckedStep && edge.from_node_id == current {
                    if let Some(node) = self.nodes.get(&edge.to_node_id) {
                        out.push(node);
                        frontier.push(node.node_id.clone());
                    }
                }
            }
        }
        out.sort_by_key(|n| n.created_at_event_index);
        out
    }

    /// Sibling branches of a node: other children of its parent, newest first.
    #[must_use]
    pub fn sibling_branches(&self, id: &NodeId) -> Vec<&RunDagNode> {
        let Some(parent_id) = self.nodes.get(id).and_then(|n| n.parent_node_id.clone()) else {
            return Vec::new();
        };
        let mut siblings: Vec<&RunDagNode> = self
            .node_order
            .iter()
            .filter_map(|nid| self.nodes.get(nid))
            .filter(|n| n.parent_node_id.as_ref() == Some(&parent_id) && &n.node_id != id)
            .collect();
        siblings.sort_by(|a, b| b.created_at_event_index.cmp(&a.created_at_event_index));
        siblings
    }
}

/// Projects one run's DAG from an event prefix.
#[must_use]
pub fn project_run_dag(events: &[SessionEvent], run_id: &RunId) -> RunDag {
    let mut dag = RunDag::default();

    for event in events {
        match &event.body {
            EventBody::NodeCreated(n) if &n.run_id == run_id => {
                let node = RunDagNode {
                    node_id: n.node_id.clone(),
                    node_kind: n.node_kind,
                    step_id: n.step_id.clone(),
                    parent_node_id: n.parent_node_id.clone(),
                    snapshot_ref: n.snapshot_ref.clone(),
                    attempt_id: n.attempt_id.clone(),
                    created_at_event_index: event.event_index,
                };
                dag.node_order.push(n.node_id.clone());
                dag.nodes.insert(n.node_id.clone(), node);
            }
            EventBody::EdgeCreated(e) if &e.run_id == run_id => {
                dag.edges.push(RunDagEdge {
                    edge_kind: e.edge_kind,
                    from_node_id: e.from_node_id.clone(),
                    to_node_id: e.to_node_id.clone(),
                    created_at_event_index: event.event_index,
                });
            }
            _ => {}
        }
    }

    let has_outgoing: rustc_hash::FxHashSet<&NodeId> =
        dag.edges.iter().map(|e| &e.from_node_id).collect();
    dag.tip_node_ids = dag
        .node_order
        .iter()
        .filter(|id| !has_outgoing.contains(id))
        .cloned()
        .collect();

    dag.preferred_tip = preferred_tip(&dag);
    dag
}

/// Tie-break rule: among step nodes that no `acked_step` edge leaves, the
/// one entered by the latest `acked_step` edge wins; remaining ties go to
/// the highest creation index.
fn preferred_tip(dag: &RunDag) -> Option<NodeId> {
    let acked_out: rustc_hash::FxHashSet<&NodeId> = dag
        .edges
        .iter()
        .filter(|e| e.edge_kind == EdgeKind::AckedStep)
        .map(|e| &e.from_node_id)
        .collect();

    let incoming_acked = |id: &NodeId| -> Option<u64> {
        dag.edges
            .iter()
            .filter(|e| e.edge_kind == EdgeKind::AckedStep && &e.to_node_id == id)
            .map(|e| e.created_at_event_index)
            .max()
    };

    dag.node_order
        .iter()
        .filter_map(|id| dag.nodes.get(id))
        .filter(|n| n.node_kind == NodeKind::Step && !acked_out.contains(&n.node_id))
        .max_by_key(|n| (incoming_acked(&n.node_id), n.created_at_event_index))
        .map(|n| n.node_id.clone())
}
