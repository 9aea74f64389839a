//! Graph Nodes
//!
//! This module defines the node types that live in the dependency graph.
//! Every atom (one producer queried with one argument signature) and every
//! root scope owns exactly one node. Typed values stay in the producer's
//! atom store; the node only carries the type-erased bookkeeping that the
//! scheduler needs.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::LocalBoxFuture;
use indexmap::IndexSet;
use serde::Serialize;

use crate::error::Error;
use crate::reactive::{EventBus, HookSlot, ProducerId, Settled};

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// An atom of an asynchronous source. Leaves of the graph: they have
    /// dependents but never dependencies.
    Source,

    /// An atom of a compose. Has dependencies and may have dependents.
    Compose,

    /// A root scope created by `setup`. Has dependencies, never dependents.
    Root,
}

/// Type-erased re-resolution of an atom, used by broadcasts.
pub(crate) type Refresher = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<(), Error>>>;

/// Type-erased re-execution of a host body.
pub(crate) type Rerun = Rc<dyn Fn()>;

/// A node in the dependency graph.
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// What kind of node this is.
    kind: NodeKind,

    /// Human readable name: producer name plus argument signature.
    label: String,

    /// The producer this atom belongs to. `None` for root scopes.
    producer: Option<ProducerId>,

    /// Nodes that this node read during its last execution, in read order.
    dependencies: IndexSet<NodeId>,

    /// Nodes that read this node during their last execution.
    dependents: IndexSet<NodeId>,

    /// A dependency changed since this host last executed.
    stale: bool,

    /// A resolution is under way (sources only).
    in_flight: bool,

    /// The root scope was torn down.
    ended: bool,

    /// Teardown unlinked this atom; the next cache hit re-runs its body.
    detached: bool,

    /// Positional hook state of this host.
    pub(crate) hooks: Vec<HookSlot>,

    /// Lifecycle channel of this atom or root scope.
    events: EventBus,

    /// Re-execution of the host body (composes and roots).
    rerun: Option<Rerun>,

    /// Re-resolution used by broadcasts (sources and composes).
    refresh: Option<Refresher>,

    /// Settles when the current resolution finishes.
    settled: Option<Settled>,
}

impl Node {
    /// Create a new node with the given kind.
    pub fn new(kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            kind,
            label: label.into(),
            producer: None,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
            stale: false,
            in_flight: false,
            ended: false,
            detached: false,
            hooks: Vec::new(),
            events: EventBus::new(),
            rerun: None,
            refresh: None,
            settled: None,
        }
    }

    /// Create a new source atom node.
    pub fn source(label: impl Into<String>) -> Self {
        Self::new(NodeKind::Source, label)
    }

    /// Create a new compose atom node.
    pub fn compose(label: impl Into<String>) -> Self {
        Self::new(NodeKind::Compose, label)
    }

    /// Create a new root scope node.
    pub fn root(label: impl Into<String>) -> Self {
        Self::new(NodeKind::Root, label)
    }

    pub(crate) fn with_producer(mut self, producer: ProducerId) -> Self {
        self.producer = Some(producer);
        self
    }

    pub(crate) fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Get the node's kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Get the node's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Get the producer that owns this atom.
    pub fn producer(&self) -> Option<ProducerId> {
        self.producer
    }

    /// Get the lifecycle bus of this node.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Whether a dependency changed since the last execution.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// Whether a resolution is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub(crate) fn begin_flight(&mut self, settled: Settled) {
        self.in_flight = true;
        self.settled = Some(settled);
    }

    pub(crate) fn end_flight(&mut self) {
        self.in_flight = false;
        self.settled = None;
    }

    pub(crate) fn settled(&self) -> Option<&Settled> {
        self.settled.as_ref()
    }

    /// Whether the root scope has ended.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub(crate) fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Whether teardown unlinked this atom.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn set_detached(&mut self, detached: bool) {
        self.detached = detached;
    }

    pub(crate) fn set_rerun(&mut self, rerun: Rerun) {
        self.rerun = Some(rerun);
    }

    pub(crate) fn rerun(&self) -> Option<&Rerun> {
        self.rerun.as_ref()
    }

    pub(crate) fn set_refresh(&mut self, refresh: Refresher) {
        self.refresh = Some(refresh);
    }

    pub(crate) fn refresh(&self) -> Option<&Refresher> {
        self.refresh.as_ref()
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.shift_remove(&node_id);
    }

    /// Get all dependencies, in read order.
    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.shift_remove(&node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// Clear all dependencies, returning them.
    pub fn take_dependencies(&mut self) -> IndexSet<NodeId> {
        std::mem::take(&mut self.dependencies)
    }

    /// Clear all hook slots, returning them in slot order.
    pub(crate) fn take_hooks(&mut self) -> Vec<HookSlot> {
        std::mem::take(&mut self.hooks)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("dependencies", &self.dependencies)
            .field("dependents", &self.dependents)
            .field("stale", &self.stale)
            .field("in_flight", &self.in_flight)
            .field("ended", &self.ended)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn new_nodes_are_idle() {
        let node = Node::source("book(7)");
        assert_eq!(node.kind(), NodeKind::Source);
        assert_eq!(node.label(), "book(7)");
        assert!(!node.is_stale());
        assert!(!node.is_in_flight());
        assert!(!node.is_ended());
    }

    #[test]
    fn dependencies_keep_read_order() {
        let mut node = Node::compose("total(7)");
        let dep1 = NodeId::new();
        let dep2 = NodeId::new();

        node.add_dependency(dep2);
        node.add_dependency(dep1);
        node.add_dependency(dep2);

        let order: Vec<_> = node.dependencies().iter().copied().collect();
        assert_eq!(order, vec![dep2, dep1]);

        node.remove_dependency(dep2);
        assert!(!node.dependencies().contains(&dep2));
        assert_eq!(node.dependencies().len(), 1);
    }

    #[test]
    fn take_dependencies_empties_the_set() {
        let mut node = Node::root("scope");
        node.add_dependency(NodeId::new());
        node.add_dependency(NodeId::new());

        let taken = node.take_dependencies();
        assert_eq!(taken.len(), 2);
        assert!(node.dependencies().is_empty());
    }
}
