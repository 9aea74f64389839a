//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects sources, composes
//! and root scopes. It owns the dependency graph and schedules re-execution
//! when atoms settle.
//!
//! # How It Works
//!
//! 1. When an atom is queried inside a host, the runtime records the edge.
//!
//! 2. When a host body returns, edges to atoms it no longer read are removed.
//!
//! 3. When a source atom settles, the runtime:
//!    a. Marks its direct dependents stale (only when a value was produced)
//!    b. Orders every transitive dependent topologically
//!    c. Re-executes each stale host whose dependencies are all settled
//!
//! 4. Teardown walks dependency edges downwards, revoking hook state and
//!    unlinking atoms that lost their last dependent.
//!
//! # Threading
//!
//! The graph is thread-local. Everything happens on the thread that owns the
//! `LocalSet` driving the resolutions, so no locking is involved; the only
//! rule is that no user code may run while the graph is borrowed.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::mem;

use tracing::{debug, trace};

use super::context::ReactiveContext;
use super::event::EventBus;
use crate::graph::{GraphSnapshot, Node, NodeId, NodeKind, UpdateScheduler};

thread_local! {
    static SCHEDULER: RefCell<UpdateScheduler> = RefCell::new(UpdateScheduler::new());
    /// Nodes forgotten while the graph was borrowed.
    static ORPHANS: RefCell<Vec<NodeId>> = RefCell::new(Vec::new());
}

/// The per-thread reactive runtime.
pub struct Runtime;

impl Runtime {
    /// Run `f` with the graph borrowed.
    ///
    /// `f` must not call back into user code.
    pub(crate) fn with<R>(f: impl FnOnce(&mut UpdateScheduler) -> R) -> R {
        SCHEDULER.with(|scheduler| f(&mut scheduler.borrow_mut()))
    }

    /// Add a node to the graph.
    pub(crate) fn insert(node: Node) -> NodeId {
        Self::collect_orphans();
        Self::with(|graph| graph.add_node(node))
    }

    /// Record a read of `atom` by the current host, if any.
    pub(crate) fn track(atom: NodeId) {
        if let Some(host) = ReactiveContext::track_read(atom) {
            Self::with(|graph| graph.add_edge(atom, host));
        }
    }

    /// Execute a host body in a tracked frame.
    ///
    /// When the body returns, the host's dependency set is exactly the set
    /// of atoms the body read.
    pub(crate) fn execute<R>(host: NodeId, body: impl FnOnce() -> R) -> R {
        let ctx = ReactiveContext::enter(host);
        let value = body();
        let reads = ReactiveContext::reads();
        drop(ctx);
        Self::with(|graph| graph.retain_dependencies(host, &reads));
        value
    }

    /// Re-execute the dependents of `origin` after it settled.
    ///
    /// `changed` is false when the resolution failed: dependents are not
    /// marked stale, but hosts that were already waiting on `origin` get
    /// their chance to run.
    pub(crate) fn propagate(origin: NodeId, changed: bool) {
        Self::collect_orphans();
        let order = Self::with(|graph| {
            if changed {
                graph.mark_dependents_stale(origin);
            }
            graph.affected(origin)
        });
        debug!(node = %origin, changed, affected = order.len(), "propagating");
        Self::flush(order);
    }

    /// Re-execute every host of `order` that is ready to run.
    fn flush(order: Vec<NodeId>) {
        for id in order {
            let rerun = Self::with(|graph| graph.ready_rerun(id));
            if let Some(rerun) = rerun {
                trace!(node = %id, "re-executing host");
                rerun();
            }
        }
    }

    /// Buses observing a node, followed by `extra`.
    pub(crate) fn observers(node: NodeId, extra: &EventBus) -> Vec<EventBus> {
        let mut buses = Self::with(|graph| graph.observers(node));
        buses.push(extra.clone());
        buses
    }

    /// Revoke the hook state of `node` and unlink it from its dependencies,
    /// recursing into every dependency left without dependents.
    ///
    /// Calling it twice is a no-op the second time.
    pub(crate) fn teardown(node: NodeId) {
        let mut queue = vec![node];
        let mut visited = HashSet::new();

        while let Some(id) = queue.pop() {
            if !visited.insert(id) {
                continue;
            }

            let (hooks, orphans) = Self::with(|graph| {
                let Some(host) = graph.get_node_mut(id) else {
                    return (Vec::new(), Vec::new());
                };
                let hooks = host.take_hooks();
                let dependencies = host.take_dependencies();
                host.set_stale(false);
                if host.kind() == NodeKind::Compose {
                    host.set_detached(true);
                }

                let mut orphans = Vec::new();
                for dep_id in dependencies {
                    if let Some(dep) = graph.get_node_mut(dep_id) {
                        dep.remove_dependent(id);
                        if dep.dependents().is_empty() {
                            orphans.push(dep_id);
                        }
                    }
                }
                (hooks, orphans)
            });

            trace!(node = %id, hooks = hooks.len(), orphans = orphans.len(), "tearing down");
            for hook in hooks {
                hook.revoke();
            }
            queue.extend(orphans);
        }
    }

    /// Tear a node down and remove it from the graph.
    ///
    /// Hosts that were waiting for the node to settle stop waiting: the ones
    /// left stale and with nothing else in flight re-execute.
    pub(crate) fn remove(node: NodeId) {
        let waiting = Self::with(|graph| graph.affected(node));
        Self::teardown(node);
        // The removed node may own closures holding producers; drop it
        // after the graph borrow ends.
        let removed = Self::with(|graph| graph.remove_node(node));
        drop(removed);
        Self::flush(waiting);
    }

    /// Remove nodes whose atoms no longer exist.
    ///
    /// Used from destructors. While the graph is borrowed the nodes are
    /// queued and removed by the next insertion or propagation; a destroyed
    /// graph is skipped.
    pub(crate) fn forget(nodes: Vec<NodeId>) {
        if nodes.is_empty() {
            return;
        }
        let idle = SCHEDULER
            .try_with(|scheduler| scheduler.try_borrow_mut().is_ok())
            .unwrap_or(false);
        if !idle {
            let _ = ORPHANS.try_with(|orphans| {
                if let Ok(mut orphans) = orphans.try_borrow_mut() {
                    orphans.extend(nodes);
                }
            });
            return;
        }
        for node in nodes {
            Self::remove(node);
        }
    }

    fn collect_orphans() {
        let orphans = ORPHANS
            .try_with(|orphans| orphans.try_borrow_mut().map(|mut o| mem::take(&mut *o)))
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        for node in orphans {
            Self::remove(node);
        }
    }

    /// Whether teardown detached a compose atom.
    pub fn is_detached(node: NodeId) -> bool {
        Self::with(|graph| graph.get_node(node).map(Node::is_detached).unwrap_or(false))
    }

    /// Spawn a resolution on the current `LocalSet`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a `tokio::task::LocalSet`.
    pub(crate) fn spawn<F>(future: F)
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        drop(tokio::task::spawn_local(future));
    }

    /// Get the current host, if any.
    pub fn current_host() -> Option<NodeId> {
        ReactiveContext::current_host()
    }

    /// Check if we're inside a tracked execution.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }

    /// Number of nodes in this thread's graph.
    pub fn node_count() -> usize {
        Self::with(|graph| graph.node_count())
    }

    /// Capture the current graph.
    pub fn snapshot() -> GraphSnapshot {
        Self::with(|graph| GraphSnapshot::capture(graph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::reactive::{HookSlot, Pending};

    #[test]
    fn execute_records_reads_as_dependencies() {
        let atom = Runtime::insert(Node::source("a"));
        let unread = Runtime::insert(Node::source("b"));
        let host = Runtime::insert(Node::root("scope"));
        Runtime::with(|graph| graph.add_edge(unread, host));

        Runtime::execute(host, || Runtime::track(atom));

        let deps: Vec<_> = Runtime::with(|graph| {
            graph.get_node(host).unwrap().dependencies().iter().copied().collect()
        });
        assert_eq!(deps, vec![atom]);
        assert!(Runtime::with(|graph| graph.get_node(unread).unwrap().dependents().is_empty()));
    }

    #[test]
    fn reads_outside_a_host_create_no_edges() {
        let atom = Runtime::insert(Node::source("a"));
        Runtime::track(atom);
        assert!(Runtime::with(|graph| graph.get_node(atom).unwrap().dependents().is_empty()));
    }

    #[test]
    fn propagate_reruns_stale_dependents_once() {
        let runs = Rc::new(Cell::new(0));
        let source = Runtime::insert(Node::source("s"));
        let mut host = Node::compose("c");
        let runs_clone = runs.clone();
        host.set_rerun(Rc::new(move || runs_clone.set(runs_clone.get() + 1)));
        let host = Runtime::insert(host);
        Runtime::with(|graph| graph.add_edge(source, host));

        Runtime::propagate(source, false);
        assert_eq!(runs.get(), 0);

        Runtime::propagate(source, true);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn teardown_revokes_hooks_and_orphans() {
        let revoked = Rc::new(Cell::new(0));
        let source = Runtime::insert(Node::source("s"));
        let derived = Runtime::insert(Node::compose("c"));
        let root = Runtime::insert(Node::root("scope"));
        Runtime::with(|graph| {
            graph.add_edge(source, derived);
            graph.add_edge(derived, root);
            for id in [derived, root] {
                let revoked = revoked.clone();
                graph.get_node_mut(id).unwrap().hooks.push(HookSlot::effect(
                    None,
                    Some(Box::new(move || revoked.set(revoked.get() + 1))),
                ));
            }
        });

        Runtime::teardown(root);
        Runtime::teardown(root);

        assert_eq!(revoked.get(), 2);
        assert!(Runtime::is_detached(derived));
        assert!(Runtime::with(|graph| graph.get_node(source).unwrap().dependents().is_empty()));
    }

    #[test]
    fn removing_a_resolving_dependency_reruns_waiting_hosts() {
        let runs = Rc::new(Cell::new(0));
        let landed = Runtime::insert(Node::source("a"));
        let resolving = Runtime::insert(Node::source("b"));
        let mut host = Node::compose("c");
        let runs_clone = runs.clone();
        host.set_rerun(Rc::new(move || runs_clone.set(runs_clone.get() + 1)));
        let host = Runtime::insert(host);
        Runtime::with(|graph| {
            graph.add_edge(landed, host);
            graph.add_edge(resolving, host);
            let settled = Pending::<u32>::ready(Ok(0)).settled();
            graph.get_node_mut(resolving).unwrap().begin_flight(settled);
        });

        Runtime::propagate(landed, true);
        assert_eq!(runs.get(), 0);

        Runtime::remove(resolving);
        assert_eq!(runs.get(), 1);
        assert!(Runtime::with(|graph| !graph.get_node(host).unwrap().is_stale()));
    }

    fn node_with_cleanup(revoked: &Rc<Cell<u32>>) -> NodeId {
        let revoked = revoked.clone();
        let mut node = Node::compose("guarded");
        node.hooks.push(HookSlot::effect(
            None,
            Some(Box::new(move || revoked.set(revoked.get() + 1))),
        ));
        Runtime::insert(node)
    }

    #[test]
    fn forget_revokes_hooks() {
        let revoked = Rc::new(Cell::new(0));
        let node = node_with_cleanup(&revoked);

        Runtime::forget(vec![node]);
        assert_eq!(revoked.get(), 1);
        assert!(Runtime::with(|graph| graph.get_node(node).is_none()));
    }

    #[test]
    fn forget_is_deferred_while_the_graph_is_busy() {
        let revoked = Rc::new(Cell::new(0));
        let node = node_with_cleanup(&revoked);

        Runtime::with(|_| Runtime::forget(vec![node]));
        assert_eq!(revoked.get(), 0);

        Runtime::insert(Node::source("next"));
        assert_eq!(revoked.get(), 1);
        assert!(Runtime::with(|graph| graph.get_node(node).is_none()));
    }

    #[test]
    fn shared_dependencies_survive_partial_teardown() {
        let source = Runtime::insert(Node::source("s"));
        let derived = Runtime::insert(Node::compose("c"));
        let first = Runtime::insert(Node::root("first"));
        let second = Runtime::insert(Node::root("second"));
        Runtime::with(|graph| {
            graph.add_edge(source, derived);
            graph.add_edge(derived, first);
            graph.add_edge(derived, second);
        });

        Runtime::teardown(first);

        assert!(!Runtime::is_detached(derived));
        assert!(Runtime::with(|graph| {
            graph.get_node(source).unwrap().dependents().contains(&derived)
        }));
    }
}
