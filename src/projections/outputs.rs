//! Node outputs: the current value per channel, with history retained.
//!
//! A later output on the same `(node, channel)` replaces the earlier one
//! for projection purposes; both remain in the log forever.

use rustc_hash::FxHashMap;

use crate::events::{EventBody, OutputChannel, SessionEvent};
use crate::types::{AttemptId, NodeId};

/// One recorded output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub channel: OutputChannel,
    pub content: String,
    pub attempt_id: Option<AttemptId>,
    pub event_index: u64,
}

/// Outputs of one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutputs {
    /// The non-superseded output per channel.
    pub current: FxHashMap<OutputChannel, OutputRecord>,
    /// Every output ever appended, in log order.
    pub history: Vec<OutputRecord>,
}

impl NodeOutputs {
    /// The current recap note, if any.
    #[must_use]
    pub fn recap(&self) -> Option<&str> {
        self.current
            .get(&OutputChannel::Recap)
            .map(|r| r.content.as_str())
    }
}

/// Projects every node's outputs from an event prefix.
#[must_use]
pub fn project_node_outputs(events: &[SessionEvent]) -> FxHashMap<NodeId, NodeOutputs> {
    let mut out: FxHashMap<NodeId, NodeOutputs> = FxHashMap::default();
    for event in events {
        if let EventBody::NodeOutputAppended(o) = &event.body {
            let record = OutputRecord {
                channel: o.channel,
                content: o.content.clone(),
                attempt_id: o.attempt_id.clone(),
                event_index: event.event_index,
            };
            let entry = out.entry(o.node_id.clone()).or_default();
            entry.history.push(record.clone());
            entry.current.insert(o.channel, record);
        }
    }
    out
}
