//! Free-function API
//!
//! Thin entry points over the producer traits, in the shape adapters use:
//! `query` inside hosts, `get`/`read` for untracked reads, `subscribe` for
//! lifecycle events.

use super::context::ReactiveContext;
use super::event::EventBus;
use super::pending::Pending;
use super::producer::{Producer, Query, Release, Renew, Request};

/// Look up or create the atom for `args`.
///
/// Inside a host the atom becomes a dependency of the host.
pub fn query<P: Query>(producer: &P, args: P::Args) -> (P::Output, P::Handle, Pending<P::Output>) {
    producer.query(args)
}

/// The cached value, creating the atom (and starting its resolution) if it
/// does not exist. Never creates a dependency edge.
pub fn get<P: Query>(producer: &P, args: P::Args) -> P::Output {
    let _untracked = ReactiveContext::untracked();
    producer.query(args).0
}

/// The cached value, or the producer default when no atom exists. Never
/// resolves and never creates a dependency edge.
pub fn read<P: Query>(producer: &P, args: &P::Args) -> P::Output {
    producer.read(args)
}

/// The pending future of the atom for `args`.
pub fn fetch<P: Query>(producer: &P, args: P::Args) -> Pending<P::Output> {
    producer.query(args).2
}

/// Force a new resolution of the atom for `args`.
///
/// Refreshes a source atom, or broadcasts a compose atom.
pub fn renew<P: Query>(producer: &P, args: P::Args) -> Pending<P::Output> {
    producer.query(args).1.renew()
}

/// Drop every atom of a producer and revoke their effects.
pub fn release<P: Release + ?Sized>(producer: &P) {
    producer.release();
}

/// Drop the atom of one signature and revoke its effects.
pub fn release_with<P: Query>(producer: &P, args: &P::Args) {
    producer.release_with(args);
}

/// Release several producers of any kind.
pub fn release_all(producers: &[&dyn Release]) {
    for producer in producers {
        producer.release();
    }
}

/// Invoke a producer once, bypassing the cache.
pub fn request<P: Request>(producer: &P, args: P::Args) -> Pending<P::Output> {
    producer.request(args)
}

/// The producer-wide lifecycle bus.
pub fn subscribe<P: Producer + ?Sized>(producer: &P) -> EventBus {
    producer.events()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::compose::Compose;
    use crate::reactive::event::EventKind;
    use crate::reactive::scope::{setup, SetupOptions};
    use crate::reactive::source::Source;
    use crate::reactive::testing::run_local;
    use std::cell::Cell;
    use std::rc::Rc;

    fn constant(value: u32) -> Source<(), u32> {
        Source::new(move |_: &()| async move { Ok::<_, Error>(value) }, 0)
    }

    #[test]
    fn get_does_not_track() {
        run_local(async {
            let source = constant(3);
            let reader = source.clone();
            let scope = setup(move || get(&reader, ()), SetupOptions::default());

            fetch(&source, ()).await.unwrap();
            let node = scope.node().unwrap();
            let snapshot = crate::reactive::Runtime::snapshot();
            let root = snapshot.nodes.iter().find(|n| n.id == node).unwrap();
            assert!(root.dependencies.is_empty());
            assert_eq!(scope.value(), Some(0));
            assert_eq!(read(&source, &()), 3);
            scope.stop();
        });
    }

    #[test]
    fn renew_runs_the_producer_again() {
        run_local(async {
            let calls = Rc::new(Cell::new(0));
            let counter = calls.clone();
            let source = Source::new(
                move |_: &()| {
                    counter.set(counter.get() + 1);
                    let value = counter.get();
                    async move { Ok::<_, Error>(value) }
                },
                0,
            );

            assert_eq!(fetch(&source, ()).await.unwrap(), 1);
            assert_eq!(renew(&source, ()).await.unwrap(), 2);
            assert_eq!(calls.get(), 2);
        });
    }

    #[test]
    fn release_all_accepts_mixed_kinds() {
        let source = constant(1);
        let compose = Compose::with_default(|n: &u8| *n, 0);
        compose.query(4);

        release_all(&[&source, &compose]);
        assert!(compose.is_empty());
    }

    #[test]
    fn subscribe_sees_every_atom() {
        run_local(async {
            let source = Source::new(
                |n: &u32| {
                    let n = *n;
                    async move { Ok::<_, Error>(n) }
                },
                0,
            );
            let finished = Rc::new(Cell::new(0));
            let counter = finished.clone();
            subscribe(&source).on(EventKind::Finish, move |_| counter.set(counter.get() + 1));

            fetch(&source, 1).await.unwrap();
            fetch(&source, 2).await.unwrap();
            assert_eq!(finished.get(), 2);
        });
    }
}
