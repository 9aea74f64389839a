//! Reactive Context
//!
//! The reactive context tracks which host is currently executing.
//! This enables automatic dependency tracking: when an atom is queried,
//! we can register the current host as a dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack to track the currently executing host.
//! When a root scope or compose body runs, we push a frame onto the stack.
//! When the body returns, the frame is popped.
//!
//! Each frame also carries the hook cursor of the execution (the number of
//! hook calls made so far) and the set of atoms read, which becomes the
//! host's dependency set once the body returns.
//!
//! A separate thread-local flag marks the dry run used to seed compose
//! defaults; while it is set, queries and hooks are inert.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;

use crate::graph::NodeId;

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
    static DRY_RUN: Cell<usize> = const { Cell::new(0) };
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone)]
struct ContextEntry {
    /// The host being executed. `None` for untracked frames.
    host: Option<NodeId>,
    /// Number of hook calls made during this execution.
    hook_cursor: usize,
    /// Atoms read during this execution.
    reads: HashSet<NodeId>,
}

/// Guard that pops the context when dropped.
///
/// This ensures the context stack is properly maintained even if
/// the body panics.
pub struct ReactiveContext {
    host: Option<NodeId>,
}

impl ReactiveContext {
    /// Enter a tracked frame for the given host.
    ///
    /// While this frame is on top of the stack, queried atoms become
    /// dependencies of `host`.
    pub fn enter(host: NodeId) -> Self {
        Self::push(Some(host))
    }

    /// Enter an untracked frame.
    ///
    /// Reads made while it is on top of the stack create no edges.
    pub fn untracked() -> Self {
        Self::push(None)
    }

    fn push(host: Option<NodeId>) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                host,
                hook_cursor: 0,
                reads: HashSet::new(),
            });
        });
        Self { host }
    }

    /// Check if a tracked frame is on top of the stack.
    pub fn is_active() -> bool {
        Self::current_host().is_some()
    }

    /// Get the current host, if any.
    pub fn current_host() -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().and_then(|entry| entry.host))
    }

    /// Record a read of `atom`.
    ///
    /// Returns the host that should depend on it, if the read is tracked.
    pub fn track_read(atom: NodeId) -> Option<NodeId> {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let entry = stack.last_mut()?;
            let host = entry.host?;
            entry.reads.insert(atom);
            Some(host)
        })
    }

    /// Claim the next hook slot of the current execution.
    ///
    /// Returns the host and the slot index, or `None` outside a tracked frame.
    pub fn next_hook() -> Option<(NodeId, usize)> {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let entry = stack.last_mut()?;
            let host = entry.host?;
            let index = entry.hook_cursor;
            entry.hook_cursor += 1;
            Some((host, index))
        })
    }

    /// Get the atoms read in the current frame.
    pub fn reads() -> HashSet<NodeId> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .map(|entry| entry.reads.clone())
                .unwrap_or_default()
        })
    }

    /// Whether the compose-default dry run is active.
    pub fn is_dry() -> bool {
        DRY_RUN.with(|depth| depth.get() > 0)
    }

    /// Run `f` in dry mode.
    pub fn dry_run<R>(f: impl FnOnce() -> R) -> R {
        struct Reset;
        impl Drop for Reset {
            fn drop(&mut self) {
                DRY_RUN.with(|depth| depth.set(depth.get().saturating_sub(1)));
            }
        }

        DRY_RUN.with(|depth| depth.set(depth.get() + 1));
        let _reset = Reset;
        f()
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.host, self.host,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.host, entry.host
                );
            }
        });
    }
}
