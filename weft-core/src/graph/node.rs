//! Graph Nodes
//!
//! This module defines the vertices of a component's dependency graph.
//! Nodes are stored in an arena owned by the [`Graph`](super::Graph) and
//! addressed by [`NodeId`] (an index), never by references between nodes.
//! That removes ownership cycles entirely while keeping the graph walkable
//! in both directions.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::graph::ExprFn;
use crate::sequence::SequenceState;
use crate::transition::TransitionSpec;
use crate::value::Value;

/// Unique identifier for a node: an index into the owning graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// The raw id value.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Validity state of a node's memoized value.
///
/// The tri-state scheme keeps invalidation cheap: a changed input marks its
/// transitive dependents `MaybeDirty` without recomputing anything, and the
/// next read verifies whether the observed inputs actually changed before
/// paying for a recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The memoized value is up to date.
    Clean,
    /// Something upstream changed; the memoized inputs must be re-verified
    /// on the next read.
    MaybeDirty,
    /// The node must recompute on the next read.
    Dirty,
}

/// What a read observed: either a plain node value or one element of a
/// sequence. Element reads carry the index so re-verification can recompute
/// exactly the element that was consumed.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadKey {
    /// A read of a node's own value.
    Node(NodeId),
    /// A read of element `.1` of sequence node `.0`.
    Element(NodeId, i64),
}

impl ReadKey {
    /// The producer node behind this read.
    pub fn producer(&self) -> NodeId {
        match self {
            ReadKey::Node(id) => *id,
            ReadKey::Element(id, _) => *id,
        }
    }
}

/// The kind of a node, closed over all variable kinds of the component
/// language. Dispatch is by pattern match inside the graph's evaluation
/// routine; there is no open-ended dynamic dispatch across kinds.
pub enum NodeKind {
    /// An externally assignable source cell. The only kind a transaction
    /// may write to from the outside.
    Input,
    /// A derived value visible in the component's object shape.
    Property {
        /// The formula, as a closure over the evaluation context.
        expr: ExprFn,
    },
    /// A derived value private to the component body.
    Local {
        /// The formula, as a closure over the evaluation context.
        expr: ExprFn,
    },
    /// An index-parameterized (possibly inductive, possibly unbounded)
    /// sequence with a bounded sliding-window cache.
    Sequence(SequenceState),
    /// An edge-triggered predicate watcher. The armed latch lives in the
    /// observer engine, not here: it is transaction-scoped state, not part
    /// of the node's identity.
    Observer {
        /// The watched predicate.
        predicate: ExprFn,
    },
    /// A fire-and-forget message slot. Reads as the payload inside the
    /// transaction that fired it and `Nothing` otherwise.
    Event,
    /// A time-driven progressive reassignment of an input. The node's own
    /// value is the current progress in `0..=1`.
    Transition(TransitionSpec),
}

impl NodeKind {
    /// Whether this kind is a source cell whose memo is written by the
    /// transaction manager rather than computed from an expression.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            NodeKind::Input | NodeKind::Event | NodeKind::Transition(_)
        )
    }

    /// Whether this kind appears in the committed snapshot tree.
    pub fn is_exported(&self) -> bool {
        !matches!(self, NodeKind::Observer { .. } | NodeKind::Event)
    }

    /// A short name for diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Property { .. } => "property",
            NodeKind::Local { .. } => "local",
            NodeKind::Sequence(_) => "sequence",
            NodeKind::Observer { .. } => "observer",
            NodeKind::Event => "event",
            NodeKind::Transition(_) => "transition",
        }
    }
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A vertex in the dependency graph.
///
/// Edge lists are id sets stored inline (`SmallVec`; most nodes have only a
/// handful of edges). `seen` records what the last computation actually
/// read, observed value included, so a `MaybeDirty` node can check whether
/// any input really changed without recomputing itself.
pub struct Node {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) state: DirtyState,
    pub(crate) memo: Option<Value>,
    /// Reads performed by the last computation, with the observed values.
    pub(crate) seen: SmallVec<[(ReadKey, Value); 4]>,
    /// Producers this node read from last time.
    pub(crate) deps: SmallVec<[NodeId; 4]>,
    /// Consumers that have read from this node.
    pub(crate) dependents: SmallVec<[NodeId; 4]>,
    /// Re-entrancy guard for cycle detection during evaluation.
    pub(crate) in_eval: bool,
}

impl Node {
    pub(crate) fn new(name: String, kind: NodeKind) -> Self {
        let (state, memo) = match &kind {
            // Sources start clean; their memo is written directly.
            NodeKind::Input => (DirtyState::Clean, None),
            NodeKind::Event => (DirtyState::Clean, Some(Value::Nothing)),
            NodeKind::Transition(_) => (DirtyState::Clean, Some(Value::Float(0.0))),
            // Everything derived starts dirty to force a first computation.
            _ => (DirtyState::Dirty, None),
        };
        Self {
            name,
            kind,
            state,
            memo,
            seen: SmallVec::new(),
            deps: SmallVec::new(),
            dependents: SmallVec::new(),
            in_eval: false,
        }
    }

    /// The node's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node's kind.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// The current validity state.
    pub fn dirty_state(&self) -> DirtyState {
        self.state
    }

    /// Producers this node read during its last computation.
    pub fn dependencies(&self) -> &[NodeId] {
        &self.deps
    }

    /// Consumers that read this node.
    pub fn dependents(&self) -> &[NodeId] {
        &self.dependents
    }

    pub(crate) fn add_dependent(&mut self, id: NodeId) {
        if !self.dependents.contains(&id) {
            self.dependents.push(id);
        }
    }

    pub(crate) fn remove_dependent(&mut self, id: NodeId) {
        self.dependents.retain(|d| *d != id);
    }

    pub(crate) fn add_dependency(&mut self, id: NodeId) {
        if !self.deps.contains(&id) {
            self.deps.push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_nodes_start_clean() {
        let node = Node::new("x".into(), NodeKind::Input);
        assert_eq!(node.dirty_state(), DirtyState::Clean);

        let node = Node::new("clicked".into(), NodeKind::Event);
        assert_eq!(node.dirty_state(), DirtyState::Clean);
        assert_eq!(node.memo, Some(Value::Nothing));
    }

    #[test]
    fn derived_nodes_start_dirty() {
        let expr: ExprFn = std::sync::Arc::new(|_| Ok(Value::Int(1)));
        let node = Node::new("y".into(), NodeKind::Property { expr });
        assert_eq!(node.dirty_state(), DirtyState::Dirty);
        assert!(node.memo.is_none());
    }

    #[test]
    fn edge_lists_deduplicate() {
        let mut node = Node::new("x".into(), NodeKind::Input);
        let a = NodeId::from_index(1);

        node.add_dependent(a);
        node.add_dependent(a);
        assert_eq!(node.dependents(), &[a]);

        node.remove_dependent(a);
        assert!(node.dependents().is_empty());
    }

    #[test]
    fn read_key_producer() {
        let id = NodeId::from_index(7);
        assert_eq!(ReadKey::Node(id).producer(), id);
        assert_eq!(ReadKey::Element(id, 3).producer(), id);
    }
}
