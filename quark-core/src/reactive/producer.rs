//! Producers
//!
//! A producer is a definition of how to compute or fetch a value for an
//! argument signature. There are exactly three kinds, and what each kind can
//! do is expressed by the traits it implements rather than by inspecting it
//! at runtime:
//!
//! | kind      | [`Query`] | [`Request`] | [`Release`] |
//! |-----------|-----------|-------------|-------------|
//! | `Source`  | yes       | yes         | yes         |
//! | `Compose` | yes       | no          | yes         |
//! | `Action`  | no        | yes         | yes         |
//!
//! Passing an action to `query` or a compose to `request` is therefore a
//! compile error instead of a runtime failure.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::event::EventBus;
use super::pending::Pending;

thread_local! {
    static PRODUCER_TYPES: RefCell<HashSet<TypeId>> = RefCell::new(HashSet::new());
}

/// Unique identifier for a producer definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProducerId(u64);

impl ProducerId {
    /// Generate a new unique producer ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ProducerId {
    fn default() -> Self {
        Self::new()
    }
}

/// The closed set of producer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerKind {
    /// Asynchronous atomic producer.
    Source,
    /// Synchronous derivation over other producers.
    Compose,
    /// Request-only asynchronous operation.
    Action,
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Source => "source",
            Self::Compose => "compose",
            Self::Action => "action",
        };
        f.write_str(name)
    }
}

/// Common surface of every producer.
pub trait Producer {
    /// Identity of the definition.
    fn id(&self) -> ProducerId;

    /// Which kind of producer this is.
    fn kind(&self) -> ProducerKind;

    /// Display name, used in logs and graph labels.
    fn name(&self) -> &str;

    /// The producer-wide lifecycle bus. Receives the events of every atom.
    fn events(&self) -> EventBus;
}

/// Handles that can start a new resolution of their atom.
pub trait Renew<T> {
    /// Start (or join) a resolution.
    fn renew(&self) -> Pending<T>;
}

/// Producers whose atoms can be queried and cached.
pub trait Query: Producer {
    /// Argument signature. A tuple when there are several arguments.
    type Args;
    /// Cached value type.
    type Output;
    /// Handle returned next to the value: a refresh for sources, a
    /// broadcast for composes.
    type Handle: Renew<Self::Output>;

    /// Look up or create the atom for `args`, tracking the read.
    fn query(&self, args: Self::Args) -> (Self::Output, Self::Handle, Pending<Self::Output>);

    /// Read the cached value without tracking or resolving.
    ///
    /// Returns the producer default when no atom exists.
    fn read(&self, args: &Self::Args) -> Self::Output;

    /// Drop the atom for one signature and revoke its effects.
    fn release_with(&self, args: &Self::Args);
}

/// Producers that can be invoked directly, bypassing the cache.
pub trait Request: Producer {
    /// Argument signature.
    type Args;
    /// Resolved value type.
    type Output;

    /// Invoke the producer once, without creating dependency edges.
    fn request(&self, args: Self::Args) -> Pending<Self::Output>;
}

/// Producers with cached state that can be cleared.
pub trait Release: Producer {
    /// Drop every atom of this producer and revoke their effects.
    fn release(&self);
}

/// Remember that values of type `P` are producers.
pub(crate) fn register<P: 'static>() {
    PRODUCER_TYPES.with(|types| {
        types.borrow_mut().insert(TypeId::of::<P>());
    });
}

/// Whether a value is a producer defined on this thread.
pub fn is_producer(value: &dyn Any) -> bool {
    let type_id = value.type_id();
    PRODUCER_TYPES.with(|types| types.borrow().contains(&type_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker;

    #[test]
    fn registered_types_are_producers() {
        assert!(!is_producer(&Marker));
        register::<Marker>();
        assert!(is_producer(&Marker));
        assert!(!is_producer(&42_u32));
    }

    #[test]
    fn producer_ids_are_unique() {
        assert_ne!(ProducerId::new(), ProducerId::new());
    }

    #[test]
    fn kinds_display_lowercase() {
        assert_eq!(ProducerKind::Compose.to_string(), "compose");
    }
}
