//! Dependency Graph
//!
//! This module implements the dependency graph that ties a component's
//! variables together and the lazy, memoized, pull-based evaluation that
//! runs over it.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are the component's variables (inputs, properties, locals,
//!   sequences, observers, events, transitions)
//! - Edges mean "consumer read producer", reconstructed at every
//!   computation by recording the reads the formula actually performed
//!
//! When an input changes, dirty flags propagate to transitive dependents
//! without recomputing anything. Recomputation happens only when a node is
//! next read, and a `MaybeDirty` node first verifies whether any value it
//! observed last time actually changed before re-running its formula.
//!
//! # Design Decisions
//!
//! 1. Nodes live in an arena indexed by [`NodeId`] and edges are id lists
//!    inside the nodes, never references between nodes. Ownership cycles
//!    cannot form and the graph stays traversable in both directions.
//!
//! 2. Every formula is side-effect-free and memoization is purely
//!    value-keyed, so evaluation order can never affect output.
//!
//! 3. Re-entering a node mid-evaluation is a hard `CyclicEvaluation` error
//!    rather than a deadlock or unbounded recursion.

mod eval;
mod node;

pub use eval::{EvalCtx, ExprFn, Graph};
pub(crate) use eval::SeqFrame;
pub use node::{DirtyState, Node, NodeId, NodeKind, ReadKey};
