//! Composes
//!
//! A compose is a synchronous derivation over other producers. Its body runs
//! inside a host frame, so every atom it queries becomes a dependency of the
//! compose atom, and hooks called by the body are scoped to that atom.
//!
//! # How It Works
//!
//! 1. The first query for some arguments creates the atom and runs the body.
//!
//! 2. When a dependency settles with a new value, the scheduler re-runs the
//!    body, once every dependency is settled, and marks the compose's own
//!    dependents stale so they re-run after it. Each re-run is announced
//!    with `beforeFlush` and `afterFlush`.
//!
//! 3. A broadcast refreshes the dependencies (all of them, or those of the
//!    named producers). The body then re-runs through the same propagation
//!    path, which is what keeps it to a single re-run per broadcast.
//!
//! A compose that reads nothing is a plain cache keyed by its arguments.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::rc::{Rc, Weak};

use futures_util::future::{self, join_all};
use futures_util::FutureExt;
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::context::ReactiveContext;
use super::event::{emit_all, Event, EventBus, EventKind};
use super::pending::Pending;
use super::producer::{self, Producer, ProducerId, ProducerKind, Query, Release, Renew};
use super::runtime::Runtime;
use crate::error::Error;
use crate::graph::{Node, NodeId, Refresher, Rerun};

type Derive<A, T> = Box<dyn Fn(&A) -> T>;

pub(crate) struct ComposeAtom<A, T> {
    args: A,
    key: String,
    node: NodeId,
    value: RefCell<T>,
    pending: RefCell<Pending<T>>,
    events: EventBus,
}

pub(crate) struct ComposeDef<A, T> {
    id: ProducerId,
    name: String,
    derive: Derive<A, T>,
    default: T,
    events: EventBus,
    atoms: RefCell<IndexMap<A, Rc<ComposeAtom<A, T>>>>,
}

/// A derived, cached producer.
///
/// The body must not query the atom it is computing, directly or through
/// other composes.
pub struct Compose<A, T> {
    def: Rc<ComposeDef<A, T>>,
}

impl<A, T> Compose<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Define a compose. The default value is computed by running `derive`
    /// once with default arguments in dry mode, where queries return
    /// producer defaults and hooks do nothing.
    pub fn new<F>(derive: F) -> Self
    where
        A: Default,
        F: Fn(&A) -> T + 'static,
    {
        Self::named(std::any::type_name::<T>(), derive)
    }

    /// Like [`Compose::new`], with a display name.
    pub fn named<F>(name: impl Into<String>, derive: F) -> Self
    where
        A: Default,
        F: Fn(&A) -> T + 'static,
    {
        let default = ReactiveContext::dry_run(|| {
            let _untracked = ReactiveContext::untracked();
            derive(&A::default())
        });
        Self::build(name.into(), Box::new(derive), default)
    }

    /// Define a compose with an explicit default value. No dry run happens.
    pub fn with_default<F>(derive: F, default: T) -> Self
    where
        F: Fn(&A) -> T + 'static,
    {
        Self::build(std::any::type_name::<T>().to_string(), Box::new(derive), default)
    }

    /// Like [`Compose::with_default`], with a display name.
    pub fn named_with_default<F>(name: impl Into<String>, derive: F, default: T) -> Self
    where
        F: Fn(&A) -> T + 'static,
    {
        Self::build(name.into(), Box::new(derive), default)
    }

    fn build(name: String, derive: Derive<A, T>, default: T) -> Self {
        producer::register::<Self>();
        Self {
            def: Rc::new(ComposeDef {
                id: ProducerId::new(),
                name,
                derive,
                default,
                events: EventBus::new(),
                atoms: RefCell::new(IndexMap::new()),
            }),
        }
    }

    /// The default value.
    pub fn default_value(&self) -> &T {
        &self.def.default
    }

    /// Number of cached atoms.
    pub fn len(&self) -> usize {
        self.def.atoms.borrow().len()
    }

    /// Whether no atom is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an atom exists for `args`.
    pub fn contains(&self, args: &A) -> bool {
        self.def.atoms.borrow().contains_key(args)
    }

    fn broadcast_for(&self, atom: Rc<ComposeAtom<A, T>>) -> Broadcast<A, T> {
        Broadcast {
            def: self.def.clone(),
            atom,
        }
    }
}

impl<A, T> ComposeDef<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    fn lookup(&self, args: &A) -> Option<Rc<ComposeAtom<A, T>>> {
        self.atoms.borrow().get(args).cloned()
    }

    fn standalone(&self, args: A) -> Rc<ComposeAtom<A, T>> {
        let key = format!("{args:?}");
        Rc::new(ComposeAtom {
            args,
            key,
            node: NodeId::new(),
            value: RefCell::new(self.default.clone()),
            pending: RefCell::new(Pending::ready(Ok(self.default.clone()))),
            events: EventBus::new(),
        })
    }

    fn create(self: &Rc<Self>, args: A) -> Rc<ComposeAtom<A, T>> {
        let key = format!("{args:?}");
        let events = EventBus::new();
        let mut node = Node::compose(format!("{}({})", self.name, key))
            .with_producer(self.id)
            .with_events(events.clone());
        let node_id = node.id();

        let atom = Rc::new(ComposeAtom {
            args: args.clone(),
            key,
            node: node_id,
            value: RefCell::new(self.default.clone()),
            pending: RefCell::new(Pending::ready(Ok(self.default.clone()))),
            events,
        });

        let (def, weak_atom) = (Rc::downgrade(self), Rc::downgrade(&atom));
        let rerun: Rerun = Rc::new(move || {
            if let (Some(def), Some(atom)) = (def.upgrade(), weak_atom.upgrade()) {
                def.recompute(&atom);
                Runtime::with(|graph| graph.mark_dependents_stale(atom.node));
            }
        });

        let (def, weak_atom) = (Rc::downgrade(self), Rc::downgrade(&atom));
        let refresh: Refresher = Rc::new(move || match (def.upgrade(), weak_atom.upgrade()) {
            (Some(def), Some(atom)) => def.broadcast(&atom, None).discard(),
            _ => future::ready(Err(Error::Released)).boxed_local(),
        });

        node.set_rerun(rerun);
        node.set_refresh(refresh);
        Runtime::insert(node);
        self.atoms.borrow_mut().insert(args, atom.clone());
        trace!(producer = %self.name, key = %atom.key, node = %node_id, "created compose atom");
        atom
    }

    /// Run the body in the atom's frame and store the result.
    fn evaluate(&self, atom: &ComposeAtom<A, T>) -> T {
        trace!(producer = %self.name, key = %atom.key, "evaluating compose");
        let value = Runtime::execute(atom.node, || (self.derive)(&atom.args));
        *atom.value.borrow_mut() = value.clone();
        value
    }

    /// Re-run the body after a dependency changed, announcing it as a flush
    /// on the atom's observers.
    fn recompute(&self, atom: &ComposeAtom<A, T>) {
        let buses = Runtime::observers(atom.node, &self.events);
        let event = |kind| Event::about(kind, self.id, atom.node, &atom.key);

        emit_all(&buses, &event(EventKind::BeforeFlush));
        self.evaluate(atom);
        emit_all(&buses, &event(EventKind::AfterFlush));
    }

    /// Evaluate and reset the pending future to wait for dependencies that
    /// are still resolving.
    fn establish(&self, atom: &Rc<ComposeAtom<A, T>>) {
        self.evaluate(atom);
        *atom.pending.borrow_mut() = Self::deferred(atom);
    }

    fn deferred(atom: &Rc<ComposeAtom<A, T>>) -> Pending<T> {
        let waiting = Runtime::with(|graph| graph.pending_dependencies(atom.node));
        if waiting.is_empty() {
            return Pending::ready(Ok(atom.value.borrow().clone()));
        }

        let weak_atom = Rc::downgrade(atom);
        Pending::new(async move {
            join_all(waiting).await;
            current_value(&weak_atom)
        })
    }

    /// Refresh dependencies and resolve once the body re-ran.
    fn broadcast(
        self: &Rc<Self>,
        atom: &Rc<ComposeAtom<A, T>>,
        only: Option<Vec<ProducerId>>,
    ) -> Pending<T> {
        let refreshers =
            Runtime::with(|graph| graph.dependency_refreshers(atom.node, only.as_deref()));
        let buses = Runtime::observers(atom.node, &self.events);
        let (producer, node, key) = (self.id, atom.node, atom.key.clone());
        let event = move |kind| Event::about(kind, producer, node, &key);

        emit_all(&buses, &event(EventKind::BeforeAffect));
        debug!(
            producer = %self.name,
            key = %atom.key,
            dependencies = refreshers.len(),
            selective = only.is_some(),
            "broadcasting"
        );

        let refreshing: Vec<_> = refreshers.iter().map(|refresh| refresh()).collect();
        if refreshing.is_empty() {
            // Nothing to wait for: re-run the body right away. A detached
            // atom is attached again by this run.
            Runtime::with(|graph| {
                if let Some(node) = graph.get_node_mut(node) {
                    node.set_detached(false);
                }
            });
            emit_all(&buses, &event(EventKind::BeforeFlush));
            self.evaluate(atom);
            emit_all(&buses, &event(EventKind::AfterFlush));
            Runtime::propagate(node, true);
        }

        let weak_atom = Rc::downgrade(atom);
        let name = self.name.clone();
        let pending = Pending::new(async move {
            let failure = join_all(refreshing).await.into_iter().find_map(Result::err);
            emit_all(&buses, &event(EventKind::AfterAffect));

            let outcome = match failure {
                Some(error) => Err(error),
                None => current_value(&weak_atom),
            };
            match &outcome {
                Ok(_) => emit_all(&buses, &event(EventKind::Success)),
                Err(error) => {
                    warn!(producer = %name, node = %node, %error, "broadcast failed");
                    emit_all(&buses, &event(EventKind::Fail).with_error(error.clone()));
                }
            }
            emit_all(&buses, &event(EventKind::Finish));
            outcome
        });

        *atom.pending.borrow_mut() = pending.clone();
        Runtime::spawn(pending.clone());
        pending
    }

    fn release_atom(&self, atom: Rc<ComposeAtom<A, T>>) {
        debug!(producer = %self.name, key = %atom.key, node = %atom.node, "releasing compose atom");
        Runtime::remove(atom.node);
    }
}

fn current_value<A, T: Clone>(atom: &Weak<ComposeAtom<A, T>>) -> Result<T, Error> {
    atom.upgrade()
        .map(|atom| atom.value.borrow().clone())
        .ok_or(Error::Released)
}

impl<A, T> Drop for ComposeDef<A, T> {
    fn drop(&mut self) {
        let nodes = self.atoms.get_mut().values().map(|atom| atom.node).collect();
        Runtime::forget(nodes);
    }
}

impl<A, T> Clone for Compose<A, T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<A, T> Debug for Compose<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compose")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("atoms", &self.def.atoms.borrow().len())
            .finish()
    }
}

impl<A, T> Producer for Compose<A, T> {
    fn id(&self) -> ProducerId {
        self.def.id
    }

    fn kind(&self) -> ProducerKind {
        ProducerKind::Compose
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn events(&self) -> EventBus {
        self.def.events.clone()
    }
}

impl<A, T> Query for Compose<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    type Args = A;
    type Output = T;
    type Handle = Broadcast<A, T>;

    fn query(&self, args: A) -> (T, Broadcast<A, T>, Pending<T>) {
        if ReactiveContext::is_dry() {
            let atom = self.def.standalone(args);
            let pending = atom.pending.borrow().clone();
            return (self.def.default.clone(), self.broadcast_for(atom), pending);
        }

        let atom = match self.def.lookup(&args) {
            Some(atom) => {
                Runtime::track(atom.node);
                let detached = Runtime::with(|graph| match graph.get_node_mut(atom.node) {
                    Some(node) if node.is_detached() => {
                        node.set_detached(false);
                        true
                    }
                    _ => false,
                });
                if detached {
                    trace!(producer = %self.def.name, key = %atom.key, "re-attaching compose atom");
                    self.def.establish(&atom);
                }
                atom
            }
            None => {
                let atom = self.def.create(args);
                Runtime::track(atom.node);
                self.def.establish(&atom);
                atom
            }
        };

        let value = atom.value.borrow().clone();
        let pending = atom.pending.borrow().clone();
        (value, self.broadcast_for(atom), pending)
    }

    fn read(&self, args: &A) -> T {
        match self.def.lookup(args) {
            Some(atom) => atom.value.borrow().clone(),
            None => self.def.default.clone(),
        }
    }

    fn release_with(&self, args: &A) {
        let removed = self.def.atoms.borrow_mut().shift_remove(args);
        if let Some(atom) = removed {
            self.def.release_atom(atom);
        }
    }
}

impl<A, T> Release for Compose<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    fn release(&self) {
        let atoms: Vec<_> = self.def.atoms.borrow_mut().drain(..).map(|(_, atom)| atom).collect();
        for atom in atoms {
            self.def.release_atom(atom);
        }
    }
}

/// Dependency refresh handle of one compose atom.
///
/// Two handles are equal when they belong to the same atom.
pub struct Broadcast<A, T> {
    def: Rc<ComposeDef<A, T>>,
    atom: Rc<ComposeAtom<A, T>>,
}

impl<A, T> Broadcast<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Refresh every dependency and resolve after the body re-ran.
    ///
    /// Fails with the first error of a refreshed dependency; the cached
    /// value is then the one computed before the broadcast.
    pub fn call(&self) -> Pending<T> {
        self.def.broadcast(&self.atom, None)
    }

    /// Refresh only the dependencies that belong to `producers`.
    pub fn only(&self, producers: &[&dyn Producer]) -> Pending<T> {
        let ids = producers.iter().map(|producer| producer.id()).collect();
        self.def.broadcast(&self.atom, Some(ids))
    }

    /// The lifecycle bus of the atom.
    pub fn events(&self) -> EventBus {
        self.atom.events.clone()
    }

    /// The argument signature of the atom.
    pub fn args(&self) -> &A {
        &self.atom.args
    }

    /// The graph node of the atom.
    pub fn node(&self) -> NodeId {
        self.atom.node
    }
}

impl<A, T> Renew<T> for Broadcast<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    fn renew(&self) -> Pending<T> {
        self.call()
    }
}

impl<A, T> Clone for Broadcast<A, T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            atom: self.atom.clone(),
        }
    }
}

impl<A, T> PartialEq for Broadcast<A, T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.atom, &other.atom)
    }
}

impl<A, T> Eq for Broadcast<A, T> {}

impl<A: Debug, T> Debug for Broadcast<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("producer", &self.def.name)
            .field("args", &self.atom.args)
            .field("node", &self.atom.node)
            .finish()
    }
}
