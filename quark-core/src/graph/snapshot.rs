//! Graph Snapshots
//!
//! A serializable view of the graph, used by adapters and for debugging
//! leaks (atoms that stay linked after their scope was torn down).

use serde::Serialize;

use super::node::{Node, NodeId, NodeKind};
use super::scheduler::UpdateScheduler;
use crate::reactive::ProducerId;

/// Point-in-time copy of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    pub producer: Option<ProducerId>,
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub in_flight: bool,
    pub stale: bool,
    pub hooks: usize,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id(),
            kind: node.kind(),
            label: node.label().to_string(),
            producer: node.producer(),
            dependencies: node.dependencies().iter().copied().collect(),
            dependents: node.dependents().iter().copied().collect(),
            in_flight: node.is_in_flight(),
            stale: node.is_stale(),
            hooks: node.hooks.len(),
        }
    }
}

/// Point-in-time copy of the whole graph, in node creation order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl GraphSnapshot {
    /// Capture the current state of a scheduler.
    pub fn capture(scheduler: &UpdateScheduler) -> Self {
        Self {
            nodes: scheduler.nodes().map(NodeSnapshot::from).collect(),
        }
    }

    /// Find a node by its label.
    pub fn find(&self, label: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| node.label == label)
    }

    /// Count the edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|node| node.dependencies.len()).sum()
    }

    /// Render the snapshot as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
