//! Actions
//!
//! An action is an asynchronous operation that is requested, never queried:
//! it has no cached value and no atoms in the graph. Requests with equal
//! arguments made while one is still running share its pending future.
//! Once settled, the request is forgotten and the next one runs again.

use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use tracing::{debug, warn};

use super::event::{Event, EventBus, EventKind};
use super::pending::Pending;
use super::producer::{self, Producer, ProducerId, ProducerKind, Release, Request};
use super::runtime::Runtime;
use crate::error::Error;

type Run<A, T> = Box<dyn Fn(&A) -> LocalBoxFuture<'static, Result<T, Error>>>;

struct ActionDef<A, T> {
    id: ProducerId,
    name: String,
    run: Run<A, T>,
    events: EventBus,
    in_flight: RefCell<IndexMap<A, Pending<T>>>,
}

/// A request-only asynchronous producer.
pub struct Action<A, T> {
    def: Rc<ActionDef<A, T>>,
}

impl<A, T> Action<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Define an action.
    pub fn new<F, Fut, E>(run: F) -> Self
    where
        F: Fn(&A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<Box<dyn StdError>> + 'static,
    {
        Self::named(std::any::type_name::<T>(), run)
    }

    /// Define an action with a display name.
    pub fn named<F, Fut, E>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        E: Into<Box<dyn StdError>> + 'static,
    {
        producer::register::<Self>();
        let run: Run<A, T> = Box::new(move |args| {
            run(args)
                .map(|result| result.map_err(Error::producer))
                .boxed_local()
        });
        Self {
            def: Rc::new(ActionDef {
                id: ProducerId::new(),
                name: name.into(),
                run,
                events: EventBus::new(),
                in_flight: RefCell::new(IndexMap::new()),
            }),
        }
    }

    /// Whether a request with these arguments is running.
    pub fn is_running(&self, args: &A) -> bool {
        self.def.in_flight.borrow().contains_key(args)
    }

    /// Number of requests running.
    pub fn running(&self) -> usize {
        self.def.in_flight.borrow().len()
    }
}

impl<A, T> Clone for Action<A, T> {
    fn clone(&self) -> Self {
        Self {
            def: self.def.clone(),
        }
    }
}

impl<A, T> Debug for Action<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.def.id)
            .field("name", &self.def.name)
            .field("running", &self.def.in_flight.borrow().len())
            .finish()
    }
}

impl<A, T> Producer for Action<A, T> {
    fn id(&self) -> ProducerId {
        self.def.id
    }

    fn kind(&self) -> ProducerKind {
        ProducerKind::Action
    }

    fn name(&self) -> &str {
        &self.def.name
    }

    fn events(&self) -> EventBus {
        self.def.events.clone()
    }
}

impl<A, T> Request for Action<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    type Args = A;
    type Output = T;

    fn request(&self, args: A) -> Pending<T> {
        let running = self.def.in_flight.borrow().get(&args).cloned();
        if let Some(pending) = running {
            return pending;
        }

        debug!(action = %self.def.name, key = ?args, "running action");
        let running = (self.def.run)(&args);
        let def = Rc::downgrade(&self.def);
        let (events, producer) = (self.def.events.clone(), self.def.id);
        let name = self.def.name.clone();
        let settled_args = args.clone();
        let event = move |kind| Event {
            producer: Some(producer),
            key: Some(format!("{settled_args:?}")),
            ..Event::new(kind)
        };

        let forget_args = args.clone();
        let pending = Pending::new(async move {
            let result = running.await;
            if let Some(def) = def.upgrade() {
                def.in_flight.borrow_mut().shift_remove(&forget_args);
            }
            match &result {
                Ok(_) => events.emit(&event(EventKind::Success)),
                Err(error) => {
                    warn!(action = %name, %error, "action failed");
                    events.emit(&event(EventKind::Fail).with_error(error.clone()));
                }
            }
            events.emit(&event(EventKind::Finish));
            result
        });

        self.def.in_flight.borrow_mut().insert(args, pending.clone());
        Runtime::spawn(pending.clone());
        pending
    }
}

impl<A, T> Release for Action<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
{
    /// Forget the running requests. They are not cancelled; later requests
    /// start new runs instead of joining them.
    fn release(&self) {
        self.def.in_flight.borrow_mut().clear();
    }
}
