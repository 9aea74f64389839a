//! Quark Core
//!
//! A dependency-tracking reactive cache. It memoizes the results of
//! parameterized producers, recomputes derived values when their inputs
//! change, and reports every resolution through lifecycle events. Hosts get
//! call-position-addressed local state through hooks, without any UI
//! framework.
//!
//! It implements:
//!
//! - Asynchronous sources with request coalescing
//! - Synchronous composes with automatic dependency tracking
//! - Request-only actions
//! - Hooks: effects, memoized values, owned sources and mutable cells
//! - Root scopes with recursive teardown
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: producers, atoms, hooks, scopes and the runtime
//! - `graph`: the arena-backed dependency graph and its scheduler
//! - `error`: the error type shared by pending futures and events
//!
//! Everything is single-threaded. Resolutions are spawned on the current
//! `tokio::task::LocalSet`.
//!
//! # Example
//!
//! ```rust,no_run
//! use quark_core::{query, read, setup, Compose, Error, SetupOptions, Source};
//!
//! #[derive(Clone, Debug, Default, PartialEq)]
//! struct Book {
//!     title: String,
//!     price: u32,
//! }
//!
//! # async fn demo() {
//! // An asynchronous source keyed by book id
//! let book = Source::named(
//!     "book",
//!     |id: &u32| {
//!         let id = *id;
//!         async move { Ok::<_, Error>(Book { title: format!("#{id}"), price: 12 }) }
//!     },
//!     Book::default(),
//! );
//!
//! // A derived value over it
//! let source = book.clone();
//! let total = Compose::new(move |id: &u32| query(&source, *id).0.price * 2);
//!
//! // A root scope re-runs whenever `total` changes
//! let scope = setup(move || query(&total, 7).0, SetupOptions::default());
//! assert_eq!(scope.value(), Some(0));
//!
//! quark_core::fetch(&book, 7).await.unwrap();
//! assert_eq!(scope.value(), Some(24));
//! assert_eq!(read(&book, &7).price, 12);
//! scope.stop();
//! # }
//! ```

pub mod error;
pub mod graph;
pub mod reactive;

pub use error::{Error, Result};
pub use reactive::{
    affect, apply, cell, fetch, get, is_producer, query, read, release, release_all, release_with,
    renew, request, select, setup, subscribe, Action, Broadcast, Cleanup, Compose, Event,
    EventBus, EventKind, Pending, Producer, ProducerKind, Query, Refresh, Release, Renew, Request,
    Runtime, SetupOptions, Source, Teardown,
};
