//! Shared test infrastructure for the quark integration tests.
//!
//! Provides the `LocalSet` runner, counted producers and an event recorder.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use quark_core::{Error, EventBus, EventKind, Source};

pub const ALL_KINDS: [EventKind; 7] = [
    EventKind::BeforeAffect,
    EventKind::AfterAffect,
    EventKind::BeforeFlush,
    EventKind::AfterFlush,
    EventKind::Success,
    EventKind::Fail,
    EventKind::Finish,
];

/// Run a test body on a current-thread runtime inside a `LocalSet`.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime");
    tokio::task::LocalSet::new().block_on(&runtime, future)
}

/// Yield to the scheduler a few times so spawned resolutions can land.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// A shared call counter.
#[derive(Clone, Default)]
pub struct Counter(Rc<Cell<u32>>);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }
}

/// A source returning `value(args)` after `delay` scheduler yields,
/// counting invocations.
pub fn counted_source(
    name: &str,
    delay: usize,
    calls: Counter,
    value: impl Fn(u32) -> u32 + 'static,
) -> Source<u32, u32> {
    Source::named(
        name,
        move |args: &u32| {
            calls.bump();
            let result = value(*args);
            async move {
                for _ in 0..delay {
                    tokio::task::yield_now().await;
                }
                Ok::<_, Error>(result)
            }
        },
        0,
    )
}

/// A source that fails while `failing` is set.
pub fn flaky_source(failing: Rc<Cell<bool>>, value: u32) -> Source<(), u32> {
    Source::named(
        "flaky",
        move |_: &()| {
            let fail = failing.get();
            async move {
                tokio::task::yield_now().await;
                if fail {
                    Err("service unavailable")
                } else {
                    Ok(value)
                }
            }
        },
        0,
    )
}

/// Records event kinds seen on a bus.
#[derive(Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<EventKind>>>);

impl EventLog {
    /// Record the given kinds of `bus`.
    pub fn attach(bus: &EventBus, kinds: &[EventKind]) -> Self {
        let log = Self::default();
        for &kind in kinds {
            let entries = log.0.clone();
            bus.on(kind, move |event| entries.borrow_mut().push(event.kind));
        }
        log
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.0.borrow().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.0.borrow().iter().filter(|k| **k == kind).count()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}
