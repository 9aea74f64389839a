//! Sources
//!
//! A source is an asynchronous producer: a fetch function from an argument
//! signature to a future of a value, plus the default value returned until
//! the first resolution lands.
//!
//! # How It Works
//!
//! Querying a source looks up the atom for the arguments. The first query
//! creates the atom, links it to the current host and starts a resolution;
//! the default value is returned synchronously. Later queries return the
//! cached value and the latest pending future.
//!
//! A resolution:
//!
//! 1. Emits `beforeAffect` and `beforeFlush`
//! 2. Calls the fetch function once and spawns the future on the `LocalSet`
//! 3. On success stores the value; on failure leaves it untouched
//! 4. Emits `afterFlush`, propagates to dependents, emits `afterAffect`
//! 5. Emits `success` or `fail`, then `finish`
//!
//! Refreshing an atom that is already resolving returns the pending future
//! of the running resolution instead of starting another one.

use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use futures_util::future::{self, LocalBoxFuture};
use futures_util::FutureExt;
use indexmap::IndexMap;
use tracing::{debug, trace, warn};

use super::context::ReactiveContext;
use super::event::{emit_all, Event, EventBus, EventKind};
use super::pending::Pending;
use super::producer::{self, Producer, ProducerId, ProducerKind, Query, Release, Renew, Request};
use super::runtime::Runtime;
use crate::error::Error;
use crate::graph::{Node, NodeId, Refresher};

type Fetch<A, T> = Box<dyn Fn(&A) -> LocalBoxFuture<'static, Result<T, Error>>>;

/// One cached resolution record of a source.
pub(crate) struct SourceAtom<A, T> {
    args: A,
    key: String,
    node: NodeId,
    value: RefCell<T>,
    /// Latest resolution, settled or not.
    pending: RefCell<Pending<T>>,
    /// The resolution under way, if any.
    in_flight: RefCell<Option<Pending<T>>>,
    events: EventBus,
}

pub(crate) struct SourceDef<A, T> {
    id: ProducerId,
    name: String,
    fetch: Fetch<A, T>,
    default: T,
    events: EventBus,
    atoms: RefCell<IndexMap<A, Rc<SourceAtom<A, T>>>>,
}

/// An asynchronous, cached producer.
///
/// Cloning yields another handle to the same definition and atom store.
pub struct Source<A, T> {
    def: Rc<SourceDef<A, T>>,
}

impl<A, T> Source<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Define a source from a fetch function and a default value.
    pub fn new<F, Fut, E>(fetch: F, default: T) -> Self
    where
        F: Fn(&A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<Box<dyn StdError>> + 'static,
    {
        Self::named(std::any::type_name::<T>(), fetch, default)
    }

    /// Define a source with a display name used in logs and graph labels.
    pub fn named<F, Fut, E>(name: impl Into<String>, fetch: F, default: T) -> Self
    where
        F: Fn(&A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<Box<dyn StdError>> + 'static,
    {
        producer::register::<Self>();
        let fetch: Fetch<A, T> = Box::new(move |args| {
            fetch(args)
                .map(|result| result.map_err(Error::producer))
                .boxed_local()
        });
        Self {
            def: Rc::new(SourceDef {
                id: ProducerId::new(),
                name: name.into(),
                fetch,
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

    fn refresh_for(&self, atom: Rc<SourceAtom<A, T>>) -> Refresh<A, T> {
        Refresh {
            def: self.def.clone(),
            atom,
        }
    }
}

impl<A, T> SourceDef<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    fn lookup(&self, args: &A) -> Option<Rc<SourceAtom<A, T>>> {
        self.atoms.borrow().get(args).cloned()
    }

    /// An atom that is in neither the store nor the graph.
    fn standalone(&self, args: A) -> Rc<SourceAtom<A, T>> {
        let key = format!("{args:?}");
        Rc::new(SourceAtom {
            args,
            key,
            node: NodeId::new(),
            value: RefCell::new(self.default.clone()),
            pending: RefCell::new(Pending::ready(Ok(self.default.clone()))),
            in_flight: RefCell::new(None),
            events: EventBus::new(),
        })
    }

    /// Create an atom, insert it in the store and give it a graph node.
    fn create(self: &Rc<Self>, args: A) -> Rc<SourceAtom<A, T>> {
        let key = format!("{args:?}");
        let events = EventBus::new();
        let mut node = Node::source(format!("{}({})", self.name, key))
            .with_producer(self.id)
            .with_events(events.clone());
        let node_id = node.id();

        let atom = Rc::new(SourceAtom {
            args: args.clone(),
            key,
            node: node_id,
            value: RefCell::new(self.default.clone()),
            pending: RefCell::new(Pending::ready(Ok(self.default.clone()))),
            in_flight: RefCell::new(None),
            events,
        });

        let def = Rc::downgrade(self);
        let weak_atom = Rc::downgrade(&atom);
        let refresh: Refresher = Rc::new(move || match (def.upgrade(), weak_atom.upgrade()) {
            (Some(def), Some(atom)) => def.resolve(&atom).discard(),
            _ => future::ready(Err(Error::Released)).boxed_local(),
        });
        node.set_refresh(refresh);

        Runtime::insert(node);
        self.atoms.borrow_mut().insert(args, atom.clone());
        trace!(producer = %self.name, key = %atom.key, node = %node_id, "created source atom");
        atom
    }

    /// Start a resolution of `atom`, or join the one under way.
    fn resolve(self: &Rc<Self>, atom: &Rc<SourceAtom<A, T>>) -> Pending<T> {
        let running = atom.in_flight.borrow().clone();
        if let Some(pending) = running {
            trace!(producer = %self.name, key = %atom.key, "joining resolution in flight");
            return pending;
        }

        // The observer set is fixed for the whole resolution so that every
        // bus that saw the start also sees the end.
        let buses = Runtime::observers(atom.node, &self.events);
        let (producer, node, key) = (self.id, atom.node, atom.key.clone());
        let event = move |kind| Event::about(kind, producer, node, &key);

        emit_all(&buses, &event(EventKind::BeforeAffect));
        emit_all(&buses, &event(EventKind::BeforeFlush));
        debug!(producer = %self.name, key = %atom.key, node = %node, "resolving source");

        let fetching = (self.fetch)(&atom.args);
        let weak_atom = Rc::downgrade(atom);
        let name = self.name.clone();
        let pending = Pending::new(async move {
            let result = fetching.await;
            settle(&weak_atom, node, &result);

            emit_all(&buses, &event(EventKind::AfterFlush));
            Runtime::propagate(node, result.is_ok());
            emit_all(&buses, &event(EventKind::AfterAffect));
            match &result {
                Ok(_) => {
                    debug!(producer = %name, node = %node, "source resolved");
                    emit_all(&buses, &event(EventKind::Success));
                }
                Err(error) => {
                    warn!(producer = %name, node = %node, %error, "source failed");
                    emit_all(&buses, &event(EventKind::Fail).with_error(error.clone()));
                }
            }
            emit_all(&buses, &event(EventKind::Finish));
            result
        });

        *atom.in_flight.borrow_mut() = Some(pending.clone());
        *atom.pending.borrow_mut() = pending.clone();
        let settled = pending.settled();
        Runtime::with(|graph| {
            if let Some(node) = graph.get_node_mut(node) {
                node.begin_flight(settled);
            }
        });
        Runtime::spawn(pending.clone());
        pending
    }

    fn release_atom(&self, atom: Rc<SourceAtom<A, T>>) {
        debug!(producer = %self.name, key = %atom.key, node = %atom.node, "releasing source atom");
        Runtime::remove(atom.node);
    }
}

/// Record the outcome of a resolution on the atom and its node.
fn settle<A, T: Clone>(atom: &Weak<SourceAtom<A, T>>, node: NodeId, result: &Result<T, Error>) {
    if let Some(atom) = atom.upgrade() {
        if let Ok(value) = result {
            *atom.value.borrow_mut() = value.clone();
        }
        atom.in_flight.borrow_mut().take();
    }
    Runtime::with(|graph| {
        if let Some(node) = graph.get_node_mut(node) {
            node.end_flight();
        }
    });
}

impl<A, T> Drop for SourceDef<A, T> {
    fn drop(&mut self) {
        let nodes = self.atoms.get_mut().values().map(|atom| atom.node).collect();
        Runtime::forget(nodes);
    }
}

impl<A, T> Clone for Source<A, T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<A, T> Debug for Source<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("atoms", &self.def.atoms.borrow().len())
            .finish()
    }
}

impl<A, T> Producer for Source<A, T> {
    fn id(&self) -> ProducerId {
        self.def.id
    }

    fn kind(&self) -> ProducerKind {
        ProducerKind::Source
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn events(&self) -> EventBus {
        self.def.events.clone()
    }
}

impl<A, T> Query for Source<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    type Args = A;
    type Output = T;
    type Handle = Refresh<A, T>;

    fn query(&self, args: A) -> (T, Refresh<A, T>, Pending<T>) {
        if ReactiveContext::is_dry() {
            let atom = self.def.standalone(args);
            let pending = atom.pending.borrow().clone();
            return (self.def.default.clone(), self.refresh_for(atom), pending);
        }

        let atom = match self.def.lookup(&args) {
            Some(atom) => {
                Runtime::track(atom.node);
                atom
            }
            None => {
                let atom = self.def.create(args);
                // Link before resolving so that root lifecycles see the start.
                Runtime::track(atom.node);
                self.def.resolve(&atom);
                atom
            }
        };

        let value = atom.value.borrow().clone();
        let pending = atom.pending.borrow().clone();
        (value, self.refresh_for(atom), pending)
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

impl<A, T> Request for Source<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    type Args = A;
    type Output = T;

    fn request(&self, args: A) -> Pending<T> {
        trace!(producer = %self.def.name, key = ?args, "requesting source");
        let pending = Pending::new((self.def.fetch)(&args));
        Runtime::spawn(pending.clone());
        pending
    }
}

impl<A, T> Release for Source<A, T>
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

/// Re-resolution handle of one source atom.
///
/// Two handles are equal when they belong to the same atom.
pub struct Refresh<A, T> {
    def: Rc<SourceDef<A, T>>,
    atom: Rc<SourceAtom<A, T>>,
}

impl<A, T> Refresh<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Start a resolution, or join the one in flight.
    pub fn call(&self) -> Pending<T> {
        self.def.resolve(&self.atom)
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

    /// Whether a resolution is under way.
    pub fn is_in_flight(&self) -> bool {
        self.atom.in_flight.borrow().is_some()
    }
}

impl<A, T> Renew<T> for Refresh<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    fn renew(&self) -> Pending<T> {
        self.call()
    }
}

impl<A, T> Clone for Refresh<A, T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
            atom: self.atom.clone(),
        }
    }
}

impl<A, T> PartialEq for Refresh<A, T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.atom, &other.atom)
    }
}

impl<A, T> Eq for Refresh<A, T> {}

impl<A: Debug, T> Debug for Refresh<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refresh")
            .field("producer", &self.def.name)
            .field("args", &self.atom.args)
            .field("node", &self.atom.node)
            .finish()
    }
}
