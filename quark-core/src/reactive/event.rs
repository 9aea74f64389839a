//! Lifecycle Events
//!
//! A minimal publish/subscribe channel. Every atom, every producer and every
//! root scope owns one [`EventBus`].
//!
//! `beforeAffect` and `afterAffect` are coalesced through a counter: nested
//! or overlapping starts collapse into one observable `beforeAffect`, and
//! only the matching last end emits `afterAffect`. A root scope whose two
//! sources refresh at the same time therefore sees a single start/end pair,
//! which is what a loading indicator wants.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use smallvec::SmallVec;

use super::producer::ProducerId;
use crate::error::Error;
use crate::graph::NodeId;

/// The kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A resolution is about to start (coalesced).
    BeforeAffect,
    /// All overlapping resolutions finished (coalesced).
    AfterAffect,
    /// A value is about to be produced.
    BeforeFlush,
    /// A value was produced.
    AfterFlush,
    /// The resolution succeeded.
    Success,
    /// The resolution failed.
    Fail,
    /// The resolution finished, successfully or not.
    Finish,
}

impl EventKind {
    /// The wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeAffect => "beforeAffect",
            Self::AfterAffect => "afterAffect",
            Self::BeforeFlush => "beforeFlush",
            Self::AfterFlush => "afterFlush",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Finish => "finish",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Producer of the atom the event is about.
    pub producer: Option<ProducerId>,
    /// Graph node of the atom.
    pub node: Option<NodeId>,
    /// Debug rendering of the argument signature.
    pub key: Option<String>,
    /// The failure, for `fail` events.
    #[serde(skip)]
    pub error: Option<Error>,
}

impl Event {
    /// Create a bare event of the given kind.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            producer: None,
            node: None,
            key: None,
            error: None,
        }
    }

    pub(crate) fn about(kind: EventKind, producer: ProducerId, node: NodeId, key: &str) -> Self {
        Self {
            kind,
            producer: Some(producer),
            node: Some(node),
            key: Some(key.to_string()),
            error: None,
        }
    }

    pub(crate) fn with_error(mut self, error: Error) -> Self {
        self.error = Some(error);
        self
    }
}

/// A listener callback. Removal matches on pointer identity.
pub type Listener = Rc<dyn Fn(&Event)>;

#[derive(Default)]
struct BusInner {
    listeners: RefCell<SmallVec<[(EventKind, Listener); 4]>>,
    affecting: Cell<usize>,
}

/// A lifecycle channel. Cloning yields another handle to the same channel.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<BusInner>,
}

impl EventBus {
    /// Create a new channel with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for an event kind.
    ///
    /// Returns the listener handle to pass to [`EventBus::off`].
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Listener
    where
        F: Fn(&Event) + 'static,
    {
        let listener: Listener = Rc::new(callback);
        self.add(kind, listener.clone());
        listener
    }

    /// Register an existing listener for an event kind.
    pub fn add(&self, kind: EventKind, listener: Listener) {
        self.inner.listeners.borrow_mut().push((kind, listener));
    }

    /// Remove a listener. Both the kind and the listener must match.
    pub fn off(&self, kind: EventKind, listener: &Listener) {
        self.inner
            .listeners
            .borrow_mut()
            .retain(|(k, l)| {
                !(*k == kind && std::ptr::addr_eq(Rc::as_ptr(l), Rc::as_ptr(listener)))
            });
    }

    /// Whether any listener is registered for the kind.
    pub fn has(&self, kind: EventKind) -> bool {
        self.inner.listeners.borrow().iter().any(|(k, _)| *k == kind)
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.inner.listeners.borrow_mut().clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }

    /// Whether an affect is open on this bus.
    pub fn is_affecting(&self) -> bool {
        self.inner.affecting.get() > 0
    }

    /// Deliver an event to the listeners of its kind, in registration order.
    ///
    /// Listeners may register or remove listeners while being called; the
    /// change takes effect from the next emission.
    pub fn emit(&self, event: &Event) {
        match event.kind {
            EventKind::BeforeAffect => {
                let depth = self.inner.affecting.get() + 1;
                self.inner.affecting.set(depth);
                if depth != 1 {
                    return;
                }
            }
            EventKind::AfterAffect => {
                let depth = self.inner.affecting.get().saturating_sub(1);
                self.inner.affecting.set(depth);
                if depth != 0 {
                    return;
                }
            }
            _ => {}
        }

        let listeners: SmallVec<[Listener; 4]> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter(|(kind, _)| *kind == event.kind)
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    /// Whether two handles point to the same channel.
    pub fn ptr_eq(&self, other: &EventBus) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("affecting", &self.inner.affecting.get())
            .finish()
    }
}

/// Emit one event on a set of buses, skipping duplicate handles.
pub(crate) fn emit_all(buses: &[EventBus], event: &Event) {
    for (index, bus) in buses.iter().enumerate() {
        if buses[..index].iter().any(|seen| seen.ptr_eq(bus)) {
            continue;
        }
        bus.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus, kinds: &[EventKind]) -> Rc<RefCell<Vec<EventKind>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for &kind in kinds {
            let log = log.clone();
            bus.on(kind, move |event| log.borrow_mut().push(event.kind));
        }
        log
    }

    #[test]
    fn listeners_receive_matching_kinds() {
        let bus = EventBus::new();
        let log = recorder(&bus, &[EventKind::Success]);

        bus.emit(&Event::new(EventKind::Success));
        bus.emit(&Event::new(EventKind::Fail));

        assert_eq!(*log.borrow(), vec![EventKind::Success]);
    }

    #[test]
    fn off_matches_kind_and_listener() {
        let bus = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let count_clone = count.clone();
        let listener = bus.on(EventKind::Finish, move |_| count_clone.set(count_clone.get() + 1));

        // Wrong kind: nothing removed.
        bus.off(EventKind::Success, &listener);
        bus.emit(&Event::new(EventKind::Finish));
        assert_eq!(count.get(), 1);

        bus.off(EventKind::Finish, &listener);
        bus.emit(&Event::new(EventKind::Finish));
        assert_eq!(count.get(), 1);
        assert!(!bus.has(EventKind::Finish));
    }

    #[test]
    fn affect_events_are_coalesced() {
        let bus = EventBus::new();
        let log = recorder(&bus, &[EventKind::BeforeAffect, EventKind::AfterAffect]);

        bus.emit(&Event::new(EventKind::BeforeAffect));
        bus.emit(&Event::new(EventKind::BeforeAffect));
        assert!(bus.is_affecting());
        bus.emit(&Event::new(EventKind::AfterAffect));
        bus.emit(&Event::new(EventKind::AfterAffect));
        assert!(!bus.is_affecting());

        assert_eq!(
            *log.borrow(),
            vec![EventKind::BeforeAffect, EventKind::AfterAffect]
        );
    }

    #[test]
    fn unmatched_after_affect_is_absorbed() {
        let bus = EventBus::new();
        let log = recorder(&bus, &[EventKind::AfterAffect]);

        bus.emit(&Event::new(EventKind::AfterAffect));
        assert_eq!(log.borrow().len(), 1);
        assert!(!bus.is_affecting());
    }

    #[test]
    fn emit_all_skips_duplicate_buses() {
        let bus = EventBus::new();
        let log = recorder(&bus, &[EventKind::Success]);

        emit_all(&[bus.clone(), bus.clone()], &Event::new(EventKind::Success));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn event_kinds_serialize_to_wire_names() {
        let json = serde_json::to_string(&EventKind::BeforeAffect).unwrap();
        assert_eq!(json, "\"beforeAffect\"");
        assert_eq!(EventKind::AfterFlush.to_string(), "afterFlush");
    }
}
