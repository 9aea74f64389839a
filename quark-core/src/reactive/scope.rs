//! Root Scopes
//!
//! [`setup`] runs a body as a root host: every atom the body queries becomes
//! a dependency of the scope, and the body re-runs whenever one of them
//! settles with a new value. The returned [`Teardown`] ends the scope.
//!
//! # Teardown
//!
//! Stopping a scope revokes its hooks (running pending effect cleanups) and
//! unlinks it from its dependencies. Every dependency left without any
//! dependent is torn down the same way, so effects registered by composes
//! that only this scope used are revoked too. Resolutions already under way
//! are not cancelled; their results land without reaching the scope.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::debug;

use super::event::EventBus;
use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId};

/// Options for [`setup`].
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// Bus receiving the lifecycle events of every atom the scope depends
    /// on. A fresh bus is created when `None`.
    pub lifecycle: Option<EventBus>,
    /// Wait for [`Teardown::start`] instead of running the body right away.
    pub lazy: bool,
}

impl SetupOptions {
    /// Options for a scope that starts on [`Teardown::start`].
    pub fn lazy() -> Self {
        Self {
            lazy: true,
            ..Self::default()
        }
    }

    /// Use `lifecycle` as the scope's lifecycle bus.
    pub fn with_lifecycle(mut self, lifecycle: EventBus) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }
}

struct RootScope<R> {
    node: Cell<Option<NodeId>>,
    body: RefCell<Box<dyn FnMut() -> R>>,
    value: RefCell<Option<R>>,
    lifecycle: EventBus,
    started: Cell<bool>,
    ended: Cell<bool>,
}

impl<R: 'static> RootScope<R> {
    /// Give the scope a fresh root node and run the body.
    fn activate(self: &Rc<Self>) {
        let mut node = Node::root("scope").with_events(self.lifecycle.clone());
        let scope = self.clone();
        node.set_rerun(Rc::new(move || scope.run()));

        let id = Runtime::insert(node);
        self.node.set(Some(id));
        self.started.set(true);
        self.ended.set(false);
        debug!(node = %id, "scope started");
        self.run();
    }

    fn run(&self) {
        let Some(node) = self.node.get() else {
            return;
        };
        if self.ended.get() {
            return;
        }
        let Ok(mut body) = self.body.try_borrow_mut() else {
            // Re-entered from its own body; the next propagation pass picks
            // it up.
            Runtime::with(|graph| {
                if let Some(host) = graph.get_node_mut(node) {
                    host.set_stale(true);
                }
            });
            return;
        };
        let value = Runtime::execute(node, || (*body)());
        drop(body);
        *self.value.borrow_mut() = Some(value);
    }

    fn end(&self) {
        if self.ended.replace(true) {
            return;
        }
        let Some(node) = self.node.take() else {
            return;
        };
        Runtime::with(|graph| {
            if let Some(host) = graph.get_node_mut(node) {
                host.mark_ended();
            }
        });
        Runtime::remove(node);
        debug!(node = %node, "scope stopped");
    }
}

/// Run `body` as a root host.
///
/// Unless `options.lazy` is set the body runs before `setup` returns.
pub fn setup<R, F>(body: F, options: SetupOptions) -> Teardown<R>
where
    R: 'static,
    F: FnMut() -> R + 'static,
{
    let scope = Rc::new(RootScope {
        node: Cell::new(None),
        body: RefCell::new(Box::new(body)),
        value: RefCell::new(None),
        lifecycle: options.lifecycle.unwrap_or_default(),
        started: Cell::new(false),
        ended: Cell::new(false),
    });
    if !options.lazy {
        scope.activate();
    }
    Teardown { scope }
}

/// Handle to a root scope.
///
/// Dropping the handle does not end the scope.
#[must_use = "the scope keeps running until `stop` is called"]
pub struct Teardown<R> {
    scope: Rc<RootScope<R>>,
}

impl<R: 'static> Teardown<R> {
    /// End the scope. Calling it again does nothing.
    pub fn stop(&self) {
        self.scope.end();
    }

    /// Run a lazy scope for the first time.
    ///
    /// Does nothing if the scope already runs; fails once it was stopped.
    pub fn start(&self) -> Result<()> {
        if self.scope.ended.get() {
            return Err(Error::Ended);
        }
        if !self.scope.started.get() {
            self.scope.activate();
        }
        Ok(())
    }

    /// Re-activate a stopped scope. The body runs again with fresh hooks.
    pub fn resume(&self) {
        if self.scope.ended.get() || !self.scope.started.get() {
            self.scope.activate();
        }
    }

    /// Whether the scope was stopped.
    pub fn is_ended(&self) -> bool {
        self.scope.ended.get()
    }

    /// Whether the body has run at least once.
    pub fn is_started(&self) -> bool {
        self.scope.started.get()
    }

    /// The graph node of the scope while it is active.
    pub fn node(&self) -> Option<NodeId> {
        self.scope.node.get()
    }

    /// The lifecycle bus of the scope.
    pub fn lifecycle(&self) -> EventBus {
        self.scope.lifecycle.clone()
    }
}

impl<R: Clone> Teardown<R> {
    /// The result of the latest run of the body.
    pub fn value(&self) -> Option<R> {
        self.scope.value.borrow().clone()
    }
}

impl<R> fmt::Debug for Teardown<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("node", &self.scope.node.get())
            .field("started", &self.scope.started.get())
            .field("ended", &self.scope.ended.get())
            .finish()
    }
}
