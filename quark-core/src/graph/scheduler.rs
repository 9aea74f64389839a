//! Update Scheduler
//!
//! The scheduler owns the node arena and determines the order in which
//! hosts re-execute after an atom settles. It ensures that dependencies are
//! always re-executed before their dependents.
//!
//! # Algorithm
//!
//! 1. When an atom settles with a new value, its direct dependents are
//!    marked stale.
//! 2. The transitive set of dependents is collected (ended hosts are pruned
//!    from the dependent lists on the way).
//! 3. The set is sorted topologically (dependencies before dependents).
//! 4. Each node, in order, re-executes if it is stale and none of its
//!    dependencies is still in flight. A re-executed compose marks its own
//!    dependents stale.
//!
//! A host whose dependencies are still resolving stays stale; the last of
//! those dependencies to settle runs another pass that picks it up. This is
//! what makes a host re-execute once per update instead of once per input.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::node::{Node, NodeId, NodeKind, Refresher, Rerun};
use crate::reactive::{EventBus, ProducerId, Settled};

/// The update scheduler manages the dependency graph and coordinates updates.
pub struct UpdateScheduler {
    /// All nodes in the graph, indexed by ID, in creation order.
    nodes: IndexMap<NodeId, Node>,
}

impl UpdateScheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: IndexMap::new(),
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.shift_remove(&node_id)?;

        for dep_id in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        Some(node)
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Get a mutable reference to a node.
    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    /// Iterate over all nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// Adding an existing edge is a no-op.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if dependency == dependent {
            return;
        }
        if !self.nodes.contains_key(&dependency) || !self.nodes.contains_key(&dependent) {
            return;
        }
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Unlink every dependency of `host` that is not in `keep`.
    ///
    /// Called when an execution finishes so that the edge set matches
    /// exactly what the execution read.
    pub fn retain_dependencies(&mut self, host: NodeId, keep: &HashSet<NodeId>) {
        let stale: Vec<NodeId> = match self.nodes.get(&host) {
            Some(node) => node
                .dependencies()
                .iter()
                .filter(|dep| !keep.contains(dep))
                .copied()
                .collect(),
            None => return,
        };
        for dep in stale {
            self.remove_edge(dep, host);
        }
    }

    /// Mark the direct dependents of a node as stale.
    pub fn mark_dependents_stale(&mut self, node_id: NodeId) {
        let dependents: SmallVec<[NodeId; 8]> = match self.nodes.get(&node_id) {
            Some(node) => node.dependents().iter().copied().collect(),
            None => return,
        };
        for id in dependents {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.set_stale(true);
            }
        }
    }

    /// Collect the transitive dependents of a node, topologically sorted.
    ///
    /// Ended hosts are dropped from every dependent list they are found in.
    pub fn affected(&mut self, origin: NodeId) -> Vec<NodeId> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        queue.push_back(origin);
        visited.insert(origin);

        while let Some(node_id) = queue.pop_front() {
            let (live, ended) = self.split_dependents(node_id);
            if let Some(node) = self.nodes.get_mut(&node_id) {
                for id in &ended {
                    node.remove_dependent(*id);
                }
            }
            for dependent_id in live {
                if visited.insert(dependent_id) {
                    to_process.push(dependent_id);
                    queue.push_back(dependent_id);
                }
            }
        }

        self.topological_sort(to_process)
    }

    /// Split the dependents of a node into live and ended hosts.
    fn split_dependents(&self, node_id: NodeId) -> (Vec<NodeId>, Vec<NodeId>) {
        let Some(node) = self.nodes.get(&node_id) else {
            return (Vec::new(), Vec::new());
        };
        node.dependents().iter().copied().partition(|id| {
            self.nodes
                .get(id)
                .map(|dependent| !dependent.is_ended())
                .unwrap_or(false)
        })
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    fn topological_sort(&self, nodes: Vec<NodeId>) -> Vec<NodeId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::new();
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        result
    }

    /// Whether any transitive dependency of the node is still resolving.
    pub fn has_pending_dependency(&self, node_id: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<NodeId> = match self.nodes.get(&node_id) {
            Some(node) => node.dependencies().iter().copied().collect(),
            None => return false,
        };

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                if node.is_in_flight() {
                    return true;
                }
                stack.extend(node.dependencies().iter().copied());
            }
        }
        false
    }

    /// Settle futures of every transitive dependency currently in flight.
    pub(crate) fn pending_dependencies(&self, node_id: NodeId) -> Vec<Settled> {
        let mut visited = HashSet::new();
        let mut pending = Vec::new();
        let mut stack: Vec<NodeId> = match self.nodes.get(&node_id) {
            Some(node) => node.dependencies().iter().copied().collect(),
            None => return pending,
        };

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                if let Some(settled) = node.settled() {
                    pending.push(settled.clone());
                }
                stack.extend(node.dependencies().iter().copied());
            }
        }
        pending
    }

    /// Take the rerun of a host if it is ready to re-execute.
    ///
    /// A host is ready when it is live, stale and none of its dependencies
    /// is in flight. Taking the rerun clears the stale flag.
    pub(crate) fn ready_rerun(&mut self, node_id: NodeId) -> Option<Rerun> {
        let ready = {
            let node = self.nodes.get(&node_id)?;
            !node.is_ended() && node.is_stale() && node.rerun().is_some()
        };
        if !ready || self.has_pending_dependency(node_id) {
            return None;
        }
        let node = self.nodes.get_mut(&node_id)?;
        node.set_stale(false);
        node.rerun().cloned()
    }

    /// Refreshers of the direct dependencies of a host.
    ///
    /// With `only`, dependencies are restricted to the named producers.
    pub(crate) fn dependency_refreshers(
        &self,
        node_id: NodeId,
        only: Option<&[ProducerId]>,
    ) -> Vec<Refresher> {
        let Some(node) = self.nodes.get(&node_id) else {
            return Vec::new();
        };
        node.dependencies()
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|dep| match (only, dep.producer()) {
                (None, _) => true,
                (Some(ids), Some(producer)) => ids.contains(&producer),
                (Some(_), None) => false,
            })
            .filter_map(|dep| dep.refresh().cloned())
            .collect()
    }

    /// Lifecycle buses that observe a node: its own bus and the bus of every
    /// live root scope that transitively depends on it.
    pub(crate) fn observers(&self, node_id: NodeId) -> Vec<EventBus> {
        let mut buses = Vec::new();
        let Some(origin) = self.nodes.get(&node_id) else {
            return buses;
        };
        buses.push(origin.events().clone());

        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = origin.dependents().iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.is_ended() {
                continue;
            }
            match node.kind() {
                NodeKind::Root => buses.push(node.events().clone()),
                _ => queue.extend(node.dependents().iter().copied()),
            }
        }
        buses
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn with_rerun(node: Node) -> Node {
        let mut node = node;
        node.set_rerun(Rc::new(|| {}));
        node
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = UpdateScheduler::new();

        let id1 = scheduler.add_node(Node::source("book(1)"));
        let id2 = scheduler.add_node(Node::compose("total(1)"));

        assert_eq!(scheduler.node_count(), 2);

        scheduler.remove_node(id1);
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
    }

    #[test]
    fn removing_a_node_unlinks_both_directions() {
        let mut scheduler = UpdateScheduler::new();
        let source_id = scheduler.add_node(Node::source("book(1)"));
        let derived_id = scheduler.add_node(Node::compose("total(1)"));
        let root_id = scheduler.add_node(Node::root("scope"));

        scheduler.add_edge(source_id, derived_id);
        scheduler.add_edge(derived_id, root_id);
        scheduler.remove_node(derived_id);

        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
        assert!(scheduler.get_node(root_id).unwrap().dependencies().is_empty());
    }

    #[test]
    fn add_and_remove_edges() {
        let mut scheduler = UpdateScheduler::new();

        let source_id = scheduler.add_node(Node::source("book(1)"));
        let derived_id = scheduler.add_node(Node::compose("total(1)"));

        scheduler.add_edge(source_id, derived_id);
        scheduler.add_edge(source_id, derived_id);

        assert_eq!(
            scheduler.get_node(source_id).unwrap().dependents().len(),
            1
        );
        assert!(scheduler
            .get_node(derived_id)
            .unwrap()
            .dependencies()
            .contains(&source_id));

        scheduler.remove_edge(source_id, derived_id);

        assert!(!scheduler
            .get_node(source_id)
            .unwrap()
            .dependents()
            .contains(&derived_id));
        assert!(!scheduler
            .get_node(derived_id)
            .unwrap()
            .dependencies()
            .contains(&source_id));
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut scheduler = UpdateScheduler::new();
        let id = scheduler.add_node(Node::compose("loop"));
        scheduler.add_edge(id, id);
        assert!(scheduler.get_node(id).unwrap().dependencies().is_empty());
    }

    #[test]
    fn affected_is_topologically_sorted() {
        let mut scheduler = UpdateScheduler::new();

        // source -> derived1 -> derived2, and source -> derived2 directly
        let source_id = scheduler.add_node(Node::source("s"));
        let derived1_id = scheduler.add_node(Node::compose("d1"));
        let derived2_id = scheduler.add_node(Node::compose("d2"));

        scheduler.add_edge(source_id, derived2_id);
        scheduler.add_edge(source_id, derived1_id);
        scheduler.add_edge(derived1_id, derived2_id);

        let order = scheduler.affected(source_id);
        assert_eq!(order.len(), 2);

        let pos1 = order.iter().position(|&id| id == derived1_id);
        let pos2 = order.iter().position(|&id| id == derived2_id);
        assert!(pos1 < pos2);
    }

    #[test]
    fn affected_prunes_ended_hosts() {
        let mut scheduler = UpdateScheduler::new();
        let source_id = scheduler.add_node(Node::source("s"));
        let root_id = scheduler.add_node(Node::root("scope"));
        scheduler.add_edge(source_id, root_id);

        scheduler.get_node_mut(root_id).unwrap().mark_ended();

        assert!(scheduler.affected(source_id).is_empty());
        assert!(scheduler.get_node(source_id).unwrap().dependents().is_empty());
    }

    #[test]
    fn retain_dependencies_drops_unread_edges() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::source("a"));
        let b = scheduler.add_node(Node::source("b"));
        let host = scheduler.add_node(Node::root("scope"));
        scheduler.add_edge(a, host);
        scheduler.add_edge(b, host);

        let keep: HashSet<_> = [b].into_iter().collect();
        scheduler.retain_dependencies(host, &keep);

        assert!(scheduler.get_node(a).unwrap().dependents().is_empty());
        assert!(scheduler.get_node(b).unwrap().dependents().contains(&host));
        assert_eq!(scheduler.get_node(host).unwrap().dependencies().len(), 1);
    }

    #[test]
    fn stale_host_waits_for_pending_dependencies() {
        let mut scheduler = UpdateScheduler::new();
        let a = scheduler.add_node(Node::source("a"));
        let b = scheduler.add_node(Node::source("b"));
        let host = scheduler.add_node(with_rerun(Node::compose("c")));
        scheduler.add_edge(a, host);
        scheduler.add_edge(b, host);

        let settled = futures_util::FutureExt::shared(
            futures_util::FutureExt::boxed_local(futures_util::future::ready(())),
        );
        scheduler.get_node_mut(b).unwrap().begin_flight(settled);
        scheduler.mark_dependents_stale(a);

        assert!(scheduler.has_pending_dependency(host));
        assert!(scheduler.ready_rerun(host).is_none());
        assert!(scheduler.get_node(host).unwrap().is_stale());

        scheduler.get_node_mut(b).unwrap().end_flight();
        assert!(scheduler.ready_rerun(host).is_some());
        assert!(!scheduler.get_node(host).unwrap().is_stale());
        assert!(scheduler.ready_rerun(host).is_none());
    }

    #[test]
    fn observers_reach_live_roots_through_composes() {
        let mut scheduler = UpdateScheduler::new();
        let source_id = scheduler.add_node(Node::source("s"));
        let derived_id = scheduler.add_node(Node::compose("d"));
        let root_id = scheduler.add_node(Node::root("scope"));
        let ended_id = scheduler.add_node(Node::root("ended"));

        scheduler.add_edge(source_id, derived_id);
        scheduler.add_edge(derived_id, root_id);
        scheduler.add_edge(source_id, ended_id);
        scheduler.get_node_mut(ended_id).unwrap().mark_ended();

        // the atom's own bus plus the live root's bus
        assert_eq!(scheduler.observers(source_id).len(), 2);
    }
}
