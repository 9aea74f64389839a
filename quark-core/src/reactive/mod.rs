//! Reactive Engine
//!
//! This module implements the reactive cache: producers, atoms, hosts and
//! the hooks that give hosts local state.
//!
//! # Concepts
//!
//! ## Producers
//!
//! A producer defines how to obtain a value for an argument signature.
//! [`Source`]s fetch asynchronously, [`Compose`]s derive synchronously from
//! other producers, and [`Action`]s are request-only operations.
//!
//! ## Atoms
//!
//! An atom is one producer queried with one argument signature. It holds the
//! cached value, the latest pending future and a lifecycle bus. Equal
//! arguments always address the same atom.
//!
//! ## Hosts
//!
//! A host is whatever is executing while atoms are queried: a root scope
//! created by [`setup`], or a compose atom running its body. Queries made by
//! a host become its dependencies, and the host re-runs when they change.
//!
//! # Implementation Notes
//!
//! Dependency tracking uses a thread-local stack of execution frames. The
//! graph itself is an arena of nodes indexed by ID (see [`crate::graph`]),
//! also thread-local; typed atoms live in their producer's store and refer
//! to their node by ID.
//!
//! Resolutions are spawned with `tokio::task::spawn_local`, so sources and
//! actions must be used from inside a `tokio::task::LocalSet`.

mod action;
mod compose;
mod context;
mod event;
mod hooks;
mod ops;
mod pending;
mod producer;
mod runtime;
mod scope;
mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use action::Action;
pub use compose::{Broadcast, Compose};
pub use context::ReactiveContext;
pub use event::{Event, EventBus, EventKind, Listener};
pub use hooks::{affect, apply, cell, select, Cleanup};
pub use ops::{
    fetch, get, query, read, release, release_all, release_with, renew, request, subscribe,
};
pub use pending::Pending;
pub use producer::{is_producer, Producer, ProducerId, ProducerKind, Query, Release, Renew, Request};
pub use runtime::Runtime;
pub use scope::{setup, SetupOptions, Teardown};
pub use source::{Refresh, Source};

pub(crate) use hooks::HookSlot;
pub(crate) use pending::Settled;
