//! Hooks
//!
//! Positional local state for hosts. Every root scope and compose atom keeps
//! an ordered list of hook slots on its graph node; the execution frame
//! counts hook calls, and the n-th call of an execution addresses the n-th
//! slot.
//!
//! # Call Order
//!
//! A host must call the same hooks in the same order on every execution.
//! Calling a hook conditionally shifts every slot after it; the engine does
//! not detect this and the hooks involved will read each other's state.
//!
//! # Dry Mode
//!
//! While a compose computes its default value, hooks register nothing:
//! [`affect`] does not run, [`select`] computes without memoizing, [`apply`]
//! returns a throwaway source and [`cell`] a throwaway cell.

use std::any::Any;
use std::cell::RefCell;
use std::error::Error as StdError;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::mem;
use std::rc::Rc;

use super::context::ReactiveContext;
use super::runtime::Runtime;
use super::source::Source;
use crate::graph::NodeId;

/// Teardown callback returned by an effect.
pub type Cleanup = Box<dyn FnOnce()>;

/// State of one hook slot.
pub(crate) enum HookSlot {
    /// Claimed by an execution that has not stored anything yet.
    Vacant,
    /// An effect: its dependency snapshot and pending cleanup.
    Effect {
        deps: Option<Box<dyn Any>>,
        cleanup: Option<Cleanup>,
    },
    /// A memoized value and the dependencies it was computed from.
    Memo { deps: Box<dyn Any>, value: Rc<dyn Any> },
    /// A source owned by the host.
    SubSource(Rc<dyn Any>),
    /// A mutable cell.
    Cell(Rc<dyn Any>),
}

impl HookSlot {
    pub(crate) fn effect(deps: Option<Box<dyn Any>>, cleanup: Option<Cleanup>) -> Self {
        Self::Effect { deps, cleanup }
    }

    /// Release the slot, running the effect cleanup if one is pending.
    pub(crate) fn revoke(self) {
        if let Self::Effect {
            cleanup: Some(cleanup),
            ..
        } = self
        {
            cleanup();
        }
    }
}

/// Claim the next slot of the current execution.
fn claim(hook: &str) -> (NodeId, usize) {
    match ReactiveContext::next_hook() {
        Some(slot) => slot,
        None => panic!(
            "`{hook}` was called outside a tracked execution; hooks are only valid inside a `setup` body or a compose body"
        ),
    }
}

/// Access a slot of a host, growing the slot list as needed.
///
/// Returns `None` when the host is gone from the graph.
fn with_slot<R>(host: NodeId, index: usize, f: impl FnOnce(&mut HookSlot) -> R) -> Option<R> {
    Runtime::with(|graph| {
        let node = graph.get_node_mut(host)?;
        if node.hooks.len() <= index {
            node.hooks.resize_with(index + 1, || HookSlot::Vacant);
        }
        Some(f(&mut node.hooks[index]))
    })
}

/// Store a slot, handing back what it replaced.
///
/// The old slot is dropped by the caller, outside the graph borrow.
fn store(host: NodeId, index: usize, slot: HookSlot) -> Option<HookSlot> {
    with_slot(host, index, |current| mem::replace(current, slot))
}

/// Register an effect.
///
/// `run` executes on the first call for this slot and again whenever `deps`
/// differs from the value stored by the previous run; the cleanup returned by
/// the previous run is invoked first. With `deps` set to `None` the effect
/// runs once and is not re-run while `deps` stays `None`.
///
/// Pending cleanups run when the host is torn down.
///
/// # Panics
///
/// Panics when called outside a `setup` body or a compose body.
pub fn affect<F, D>(run: F, deps: Option<D>)
where
    F: FnOnce() -> Option<Cleanup>,
    D: PartialEq + 'static,
{
    if ReactiveContext::is_dry() {
        return;
    }
    let (host, index) = claim("affect");

    let previous = with_slot(host, index, |slot| match slot {
        HookSlot::Effect {
            deps: stored,
            cleanup,
        } => {
            let unchanged = match (stored.as_ref(), deps.as_ref()) {
                (None, None) => true,
                (Some(old), Some(new)) => old.downcast_ref::<D>() == Some(new),
                _ => false,
            };
            if unchanged {
                None
            } else {
                Some(cleanup.take())
            }
        }
        _ => Some(None),
    });

    // `None` when the host is gone, `Some(None)` when deps are unchanged.
    if let Some(Some(cleanup)) = previous {
        run_effect(host, index, cleanup, run, deps);
    }
}

fn run_effect<F, D>(host: NodeId, index: usize, previous: Option<Cleanup>, run: F, deps: Option<D>)
where
    F: FnOnce() -> Option<Cleanup>,
    D: PartialEq + 'static,
{
    if let Some(cleanup) = previous {
        cleanup();
    }
    let cleanup = run();
    let deps = deps.map(|deps| Box::new(deps) as Box<dyn Any>);

    let mut slot = Some(HookSlot::effect(deps, cleanup));
    let replaced = with_slot(host, index, |current| {
        slot.take().map(|new| mem::replace(current, new))
    });
    drop(replaced);

    // The host was removed while the effect ran.
    if let Some(orphan) = slot {
        orphan.revoke();
    }
}

/// Memoize a value.
///
/// `compute` runs on the first call for this slot and whenever `deps`
/// differs from the value it was last computed with.
///
/// # Panics
///
/// Panics when called outside a `setup` body or a compose body.
pub fn select<T, F, D>(compute: F, deps: D) -> T
where
    T: Clone + 'static,
    F: FnOnce() -> T,
    D: PartialEq + 'static,
{
    if ReactiveContext::is_dry() {
        return compute();
    }
    let (host, index) = claim("select");

    let cached = with_slot(host, index, |slot| match slot {
        HookSlot::Memo { deps: stored, value } if stored.downcast_ref::<D>() == Some(&deps) => {
            value.downcast_ref::<T>().cloned()
        }
        _ => None,
    })
    .flatten();
    if let Some(value) = cached {
        return value;
    }

    let value = compute();
    let replaced = store(
        host,
        index,
        HookSlot::Memo {
            deps: Box::new(deps),
            value: Rc::new(value.clone()),
        },
    );
    drop(replaced);
    value
}

/// Create a source owned by the host.
///
/// The source is created on the first call for this slot; later calls
/// return the same source and ignore their arguments. Query it like any
/// other source.
///
/// # Panics
///
/// Panics when called outside a `setup` body or a compose body.
pub fn apply<A, T, F, Fut, E>(fetch: F, default: T) -> Source<A, T>
where
    A: Clone + Eq + Hash + Debug + 'static,
    T: Clone + 'static,
    F: Fn(&A) -> Fut + 'static,
    Fut: Future<Output = Result<T, E>> + 'static,
    E: Into<Box<dyn StdError>> + 'static,
{
    if ReactiveContext::is_dry() {
        return Source::new(fetch, default);
    }
    let (host, index) = claim("apply");

    let existing = with_slot(host, index, |slot| match slot {
        HookSlot::SubSource(source) => source.downcast_ref::<Source<A, T>>().cloned(),
        _ => None,
    })
    .flatten();
    if let Some(source) = existing {
        return source;
    }

    let source = Source::new(fetch, default);
    let replaced = store(host, index, HookSlot::SubSource(Rc::new(source.clone())));
    drop(replaced);
    source
}

/// A mutable cell that survives re-executions of the host.
///
/// `initial` is used on the first call for this slot only.
///
/// # Panics
///
/// Panics when called outside a `setup` body or a compose body.
pub fn cell<T: 'static>(initial: T) -> Rc<RefCell<T>> {
    if ReactiveContext::is_dry() {
        return Rc::new(RefCell::new(initial));
    }
    let (host, index) = claim("cell");

    let existing = with_slot(host, index, |slot| match slot {
        HookSlot::Cell(cell) => cell.clone().downcast::<RefCell<T>>().ok(),
        _ => None,
    })
    .flatten();
    if let Some(cell) = existing {
        return cell;
    }

    let cell = Rc::new(RefCell::new(initial));
    let replaced = store(host, index, HookSlot::Cell(cell.clone()));
    drop(replaced);
    cell
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use crate::graph::Node;

    fn host() -> NodeId {
        Runtime::insert(Node::root("hooks"))
    }

    fn execute<R>(host: NodeId, body: impl FnOnce() -> R) -> R {
        Runtime::execute(host, body)
    }

    #[test]
    fn effect_reruns_when_deps_change() {
        let host = host();
        let runs = Rc::new(Cell::new(0));
        let cleanups = Rc::new(Cell::new(0));

        for deps in [1, 1, 2] {
            let runs = runs.clone();
            let cleanups = cleanups.clone();
            execute(host, || {
                affect(
                    move || {
                        runs.set(runs.get() + 1);
                        Some(Box::new(move || cleanups.set(cleanups.get() + 1)) as Cleanup)
                    },
                    Some(deps),
                )
            });
        }

        assert_eq!(runs.get(), 2);
        assert_eq!(cleanups.get(), 1);

        Runtime::teardown(host);
        assert_eq!(cleanups.get(), 2);
    }

    #[test]
    fn effect_without_deps_runs_once() {
        let host = host();
        let runs = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            execute(host, || {
                affect(
                    move || {
                        runs.set(runs.get() + 1);
                        None
                    },
                    None::<()>,
                )
            });
        }

        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn select_memoizes_by_deps() {
        let host = host();
        let computed = Rc::new(Cell::new(0));
        let mut results = Vec::new();

        for deps in ["a", "a", "b"] {
            let computed = computed.clone();
            results.push(execute(host, || {
                select(
                    move || {
                        computed.set(computed.get() + 1);
                        deps.to_uppercase()
                    },
                    deps,
                )
            }));
        }

        assert_eq!(results, vec!["A", "A", "B"]);
        assert_eq!(computed.get(), 2);
    }

    #[test]
    fn cell_survives_executions() {
        let host = host();
        let first = execute(host, || cell(0_u32));
        *first.borrow_mut() = 7;
        let second = execute(host, || cell(0_u32));

        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(*second.borrow(), 7);
    }

    #[test]
    fn slots_are_addressed_by_call_order() {
        let host = host();
        let (a, b) = execute(host, || (cell("a"), cell("b")));
        let (a2, b2) = execute(host, || (cell("x"), cell("y")));

        assert!(Rc::ptr_eq(&a, &a2));
        assert!(Rc::ptr_eq(&b, &b2));
        assert_eq!(*b2.borrow(), "b");
    }

    #[test]
    fn hooks_are_inert_in_dry_mode() {
        let ran = Rc::new(Cell::new(false));
        let ran_clone = ran.clone();
        let value = ReactiveContext::dry_run(|| {
            affect(
                move || {
                    ran_clone.set(true);
                    None
                },
                Some(1),
            );
            select(|| 3, ())
        });

        assert_eq!(value, 3);
        assert!(!ran.get());
    }

    #[test]
    #[should_panic(expected = "outside a tracked execution")]
    fn hooks_outside_a_host_panic() {
        cell(1);
    }
}
