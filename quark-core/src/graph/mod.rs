//! Dependency Graph
//!
//! This module implements the graph that tracks read relationships between
//! hosts (root scopes and compose atoms) and the atoms they read.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent atoms (one producer with one argument signature) or
//!   root scopes
//! - Edges represent reads: if host H read atom A during its last execution,
//!   there is an edge from A to H
//!
//! When an atom settles, we traverse the graph to find all affected hosts and
//! re-execute them in dependency order.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena indexed by [`NodeId`]. Typed atoms refer to their
//!    node by ID, never by pointer, so teardown over the graph cannot leak
//!    through reference cycles.
//!
//! 2. We maintain both forward (dependencies) and reverse (dependents) edges
//!    to enable efficient traversal in both directions.
//!
//! 3. Dependencies are ordered by first read, which is the order broadcasts
//!    refresh them in.

mod node;
mod scheduler;
mod snapshot;

pub use node::{Node, NodeId, NodeKind};
pub(crate) use node::{Refresher, Rerun};
pub use scheduler::UpdateScheduler;
pub use snapshot::{GraphSnapshot, NodeSnapshot};
