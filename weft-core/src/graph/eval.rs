//! Lazy Pull-Based Evaluation
//!
//! The [`Graph`] owns the node arena and runs memoized evaluation over it.
//!
//! # How a Read Works
//!
//! 1. If the node is mid-evaluation, fail with `CyclicEvaluation`.
//!
//! 2. If the node is `Clean`, return the memoized value.
//!
//! 3. If the node is `MaybeDirty`, re-read everything the last computation
//!    observed (through the same memoizing path) and compare values. If
//!    nothing actually changed, mark clean without recomputing.
//!
//! 4. Otherwise re-run the formula. Every nested read is recorded on an
//!    evaluation frame, so the dependency edges and the observed values are
//!    rebuilt from what the computation really consumed.
//!
//! Invalidation only flips dirty flags; recomputation never happens outside
//! a read. Laziness is a hard requirement, not an optimization.

use std::collections::VecDeque;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::node::{DirtyState, Node, NodeId, NodeKind, ReadKey};
use crate::error::EngineError;
use crate::value::Value;

/// A formula: a closure over the evaluation context. The front end compiles
/// every property, local, predicate, and sequence body into one of these.
pub type ExprFn = Arc<dyn Fn(&mut EvalCtx<'_>) -> Result<Value, EngineError> + Send + Sync>;

/// One in-flight computation: the node being computed and the reads it has
/// performed so far.
struct Frame {
    node: NodeId,
    reads: SmallVec<[(ReadKey, Value); 4]>,
}

/// The dependency graph for one component instance.
///
/// Owns every node in an arena addressed by [`NodeId`] and exposes the
/// lazy evaluation contract: `read`, `invalidate`, and (for sources)
/// `assign`. Sequence element access lives in [`crate::sequence`].
pub struct Graph {
    nodes: Vec<Node>,
    stack: Vec<Frame>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Add a node to the arena and return its id.
    pub(crate) fn add_node(&mut self, name: String, kind: NodeKind) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::new(name, kind));
        id
    }

    /// The number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Borrow a node for inspection.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// The declared name of a node.
    pub fn name_of(&self, id: NodeId) -> &str {
        self.nodes
            .get(id.index())
            .map(|n| n.name.as_str())
            .unwrap_or("<unknown>")
    }

    /// The kind of a node.
    pub(crate) fn kind_of(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.index()].kind
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Iterate all node ids in declaration order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::from_index)
    }

    /// Write a source node's memo directly, invalidating dependents when
    /// the value actually changed. Returns whether it changed.
    ///
    /// Only the transaction manager calls this, and only on source kinds
    /// (inputs, events, transition progress).
    pub(crate) fn assign(&mut self, id: NodeId, value: Value) -> bool {
        debug_assert!(self.nodes[id.index()].kind.is_source());
        let node = &mut self.nodes[id.index()];
        if node.memo.as_ref() == Some(&value) {
            return false;
        }
        node.memo = Some(value);
        self.invalidate(id);
        true
    }

    /// Mark every transitive dependent of `id` as possibly stale, without
    /// recomputing anything.
    pub fn invalidate(&mut self, id: NodeId) {
        let mut queue: VecDeque<NodeId> =
            self.nodes[id.index()].dependents.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            let node = &mut self.nodes[next.index()];
            // An already-flagged node has already propagated.
            if node.state == DirtyState::Clean {
                node.state = DirtyState::MaybeDirty;
                queue.extend(node.dependents.iter().copied());
            }
        }
    }

    /// Read a node's value, recording a dependency edge onto the
    /// computation currently in flight (if any).
    pub fn read(&mut self, id: NodeId) -> Result<Value, EngineError> {
        self.ensure_valid(id)?;
        let value = self.nodes[id.index()]
            .memo
            .clone()
            .unwrap_or(Value::Nothing);
        self.note_read(ReadKey::Node(id), value.clone());
        Ok(value)
    }

    /// Read a node's value without recording a dependency edge.
    pub fn value(&mut self, id: NodeId) -> Result<Value, EngineError> {
        self.ensure_valid(id)?;
        Ok(self.nodes[id.index()]
            .memo
            .clone()
            .unwrap_or(Value::Nothing))
    }

    /// Record a read against the innermost evaluation frame and mirror the
    /// edge in both nodes' edge lists.
    pub(crate) fn note_read(&mut self, key: ReadKey, value: Value) {
        let consumer = match self.stack.last() {
            Some(frame) => frame.node,
            None => return,
        };
        let producer = key.producer();
        if let Some(frame) = self.stack.last_mut() {
            if !frame.reads.iter().any(|(k, _)| *k == key) {
                frame.reads.push((key, value));
            }
        }
        self.nodes[producer.index()].add_dependent(consumer);
        self.nodes[consumer.index()].add_dependency(producer);
    }

    /// Make a node's memo valid, verifying or recomputing as needed.
    pub(crate) fn ensure_valid(&mut self, id: NodeId) -> Result<(), EngineError> {
        let node = &self.nodes[id.index()];
        if node.in_eval {
            return Err(EngineError::CyclicEvaluation {
                name: node.name.clone(),
            });
        }
        match node.state {
            DirtyState::Clean => {
                if node.memo.is_some() {
                    return Ok(());
                }
                self.recompute(id)
            }
            DirtyState::Dirty => self.recompute(id),
            DirtyState::MaybeDirty => {
                if self.inputs_changed(id)? {
                    self.recompute(id)
                } else {
                    self.nodes[id.index()].state = DirtyState::Clean;
                    Ok(())
                }
            }
        }
    }

    /// Re-read everything the node observed last time and compare values.
    fn inputs_changed(&mut self, id: NodeId) -> Result<bool, EngineError> {
        let seen = self.nodes[id.index()].seen.clone();
        for (key, before) in &seen {
            let now = match key {
                ReadKey::Node(dep) => {
                    self.ensure_valid(*dep)?;
                    self.nodes[dep.index()]
                        .memo
                        .clone()
                        .unwrap_or(Value::Nothing)
                }
                ReadKey::Element(seq, index) => self.element_value(*seq, *index)?,
            };
            if now != *before {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Re-run a node's formula, rebuilding its edges from the reads the
    /// formula actually performs.
    fn recompute(&mut self, id: NodeId) -> Result<(), EngineError> {
        trace!(node = self.nodes[id.index()].name.as_str(), "recompute");

        // Detach from previous producers; edges re-form during evaluation.
        let old_deps: SmallVec<[NodeId; 4]> = std::mem::take(&mut self.nodes[id.index()].deps);
        for dep in old_deps {
            self.nodes[dep.index()].remove_dependent(id);
        }
        self.nodes[id.index()].seen.clear();

        self.nodes[id.index()].in_eval = true;
        self.stack.push(Frame {
            node: id,
            reads: SmallVec::new(),
        });
        let result = self.eval_kind(id);
        let frame = self.stack.pop().expect("evaluation stack underflow");
        self.nodes[id.index()].in_eval = false;

        match result {
            Ok(value) => {
                let node = &mut self.nodes[id.index()];
                node.seen = frame.reads;
                node.memo = Some(value);
                node.state = DirtyState::Clean;
                Ok(())
            }
            Err(err) => {
                // Leave the node dirty so a later read retries.
                self.nodes[id.index()].state = DirtyState::Dirty;
                Err(err)
            }
        }
    }

    /// Evaluate a node according to its kind.
    fn eval_kind(&mut self, id: NodeId) -> Result<Value, EngineError> {
        let expr = match &mut self.nodes[id.index()].kind {
            NodeKind::Property { expr } | NodeKind::Local { expr } => expr.clone(),
            NodeKind::Observer { predicate } => predicate.clone(),
            NodeKind::Sequence(state) => {
                // An upstream change invalidates every cached element.
                state.window.clear();
                return Ok(Value::Sequence(id));
            }
            // Sources never recompute; their memo is authoritative.
            _ => {
                let memo = self.nodes[id.index()].memo.clone();
                return Ok(memo.unwrap_or(Value::Nothing));
            }
        };
        let mut ctx = EvalCtx {
            graph: self,
            seq: None,
        };
        expr(&mut ctx)
    }

    /// Open an evaluation frame for `node`. The sequence engine uses this
    /// to attribute the reads of element bodies to the sequence node.
    pub(crate) fn begin_frame(&mut self, node: NodeId) {
        self.stack.push(Frame {
            node,
            reads: SmallVec::new(),
        });
    }

    /// Close the innermost frame and return the reads it collected.
    pub(crate) fn end_frame(&mut self) -> SmallVec<[(ReadKey, Value); 4]> {
        self.stack.pop().map(|f| f.reads).unwrap_or_default()
    }

    pub(crate) fn set_in_eval(&mut self, id: NodeId, flag: bool) {
        self.nodes[id.index()].in_eval = flag;
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequence-element evaluation state visible to a formula through the
/// context: the element index being computed and the sliding window the
/// inductive `prior` references resolve against.
pub(crate) struct SeqFrame<'w> {
    pub(crate) name: &'w str,
    pub(crate) index: i64,
    pub(crate) start: i64,
    pub(crate) offsets: &'w [i64],
    pub(crate) window: &'w VecDeque<(i64, Value)>,
}

/// The evaluation context handed to every formula.
///
/// All reads go through here so the graph can record what the computation
/// consumed. Inside a sequence body the context additionally exposes the
/// element index and the sanctioned inductive self-reference.
pub struct EvalCtx<'g> {
    pub(crate) graph: &'g mut Graph,
    pub(crate) seq: Option<SeqFrame<'g>>,
}

impl<'g> EvalCtx<'g> {
    pub(crate) fn new(graph: &'g mut Graph) -> Self {
        Self { graph, seq: None }
    }

    /// Read a node, recording a dependency on it.
    pub fn read(&mut self, id: NodeId) -> Result<Value, EngineError> {
        self.graph.read(id)
    }

    /// Read a node without recording a dependency.
    pub fn read_untracked(&mut self, id: NodeId) -> Result<Value, EngineError> {
        self.graph.value(id)
    }

    /// Force one element of a sequence, recording a dependency on exactly
    /// that element.
    pub fn element(&mut self, seq: NodeId, index: i64) -> Result<Value, EngineError> {
        self.graph.element(seq, index)
    }

    /// The index of the sequence element currently being computed, if this
    /// formula is a sequence body.
    pub fn index(&self) -> Option<i64> {
        self.seq.as_ref().map(|f| f.index)
    }

    /// The sanctioned inductive self-reference: the value of this sequence
    /// at `index - offset`.
    ///
    /// The offset must be one of the positive constants declared with the
    /// sequence; anything else is an `InvalidInductiveReference`. An offset
    /// that lands before the sequence start is an `IndexOutOfRange`.
    pub fn prior(&self, offset: i64) -> Result<Value, EngineError> {
        let frame = match self.seq.as_ref() {
            Some(frame) => frame,
            None => {
                return Err(EngineError::InvalidInductiveReference {
                    name: "<not a sequence>".into(),
                    offset,
                })
            }
        };
        if offset <= 0 || !frame.offsets.contains(&offset) {
            return Err(EngineError::InvalidInductiveReference {
                name: frame.name.to_string(),
                offset,
            });
        }
        let target = frame.index - offset;
        if target < frame.start {
            return Err(EngineError::IndexOutOfRange {
                name: frame.name.to_string(),
                index: target,
            });
        }
        frame
            .window
            .iter()
            .rev()
            .find(|(i, _)| *i == target)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| EngineError::IndexOutOfRange {
                name: frame.name.to_string(),
                index: target,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_input(graph: &mut Graph, name: &str, value: i64) -> NodeId {
        let id = graph.add_node(name.into(), NodeKind::Input);
        graph.node_mut(id).memo = Some(Value::Int(value));
        id
    }

    #[test]
    fn read_memoizes_and_tracks_edges() {
        let mut graph = Graph::new();
        let x = int_input(&mut graph, "x", 1);
        let y = graph.add_node(
            "y".into(),
            NodeKind::Property {
                expr: Arc::new(move |ctx| {
                    Ok(Value::Int(ctx.read(x)?.as_int().unwrap_or(0) + 1))
                }),
            },
        );

        assert_eq!(graph.read(y).unwrap(), Value::Int(2));
        assert_eq!(graph.node(y).unwrap().dependencies(), &[x]);
        assert_eq!(graph.node(x).unwrap().dependents(), &[y]);
        assert_eq!(graph.node(y).unwrap().dirty_state(), DirtyState::Clean);
    }

    #[test]
    fn assign_invalidates_lazily() {
        let mut graph = Graph::new();
        let x = int_input(&mut graph, "x", 1);
        let y = graph.add_node(
            "y".into(),
            NodeKind::Property {
                expr: Arc::new(move |ctx| {
                    Ok(Value::Int(ctx.read(x)?.as_int().unwrap_or(0) + 1))
                }),
            },
        );

        assert_eq!(graph.read(y).unwrap(), Value::Int(2));

        assert!(graph.assign(x, Value::Int(5)));
        // Invalidation must not recompute; only flag.
        assert_eq!(graph.node(y).unwrap().dirty_state(), DirtyState::MaybeDirty);

        assert_eq!(graph.read(y).unwrap(), Value::Int(6));
        assert_eq!(graph.node(y).unwrap().dirty_state(), DirtyState::Clean);
    }

    #[test]
    fn unchanged_inputs_skip_recompute() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut graph = Graph::new();
        let x = int_input(&mut graph, "x", 4);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_expr = runs.clone();
        // Collapses to a coarse value; recomputes of `gate` do not imply
        // recomputes of nodes downstream of it.
        let gate = graph.add_node(
            "gate".into(),
            NodeKind::Property {
                expr: Arc::new(move |ctx| {
                    Ok(Value::Bool(ctx.read(x)?.as_int().unwrap_or(0) > 0))
                }),
            },
        );
        let downstream = graph.add_node(
            "downstream".into(),
            NodeKind::Property {
                expr: Arc::new(move |ctx| {
                    runs_in_expr.fetch_add(1, Ordering::SeqCst);
                    ctx.read(gate)
                }),
            },
        );

        assert_eq!(graph.read(downstream).unwrap(), Value::Bool(true));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Still positive: `gate` recomputes to the same value, so
        // `downstream` verifies clean without re-running.
        graph.assign(x, Value::Int(9));
        assert_eq!(graph.read(downstream).unwrap(), Value::Bool(true));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        graph.assign(x, Value::Int(-1));
        assert_eq!(graph.read(downstream).unwrap(), Value::Bool(false));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reentrant_evaluation_fails() {
        let mut graph = Graph::new();
        // `a` reads itself through a pre-wired id; the front end would
        // normally reject this, the engine must not recurse forever.
        let a = graph.add_node(
            "a".into(),
            NodeKind::Property {
                expr: Arc::new(|_| unreachable!()),
            },
        );
        graph.node_mut(a).kind = NodeKind::Property {
            expr: Arc::new(move |ctx| ctx.read(a)),
        };

        let err = graph.read(a).unwrap_err();
        assert_eq!(err, EngineError::CyclicEvaluation { name: "a".into() });

        // The graph stays usable for other nodes.
        let x = int_input(&mut graph, "x", 3);
        assert_eq!(graph.read(x).unwrap(), Value::Int(3));
    }

    #[test]
    fn stale_edges_are_dropped_on_recompute() {
        let mut graph = Graph::new();
        let flag = int_input(&mut graph, "flag", 0);
        let a = int_input(&mut graph, "a", 10);
        let b = int_input(&mut graph, "b", 20);
        let pick = graph.add_node(
            "pick".into(),
            NodeKind::Property {
                expr: Arc::new(move |ctx| {
                    if ctx.read(flag)?.as_int().unwrap_or(0) == 0 {
                        ctx.read(a)
                    } else {
                        ctx.read(b)
                    }
                }),
            },
        );

        assert_eq!(graph.read(pick).unwrap(), Value::Int(10));
        assert!(graph.node(a).unwrap().dependents().contains(&pick));

        graph.assign(flag, Value::Int(1));
        assert_eq!(graph.read(pick).unwrap(), Value::Int(20));

        // `a` is no longer read, so changing it must not dirty `pick`.
        assert!(!graph.node(a).unwrap().dependents().contains(&pick));
        graph.assign(a, Value::Int(99));
        assert_eq!(graph.node(pick).unwrap().dirty_state(), DirtyState::Clean);
    }
}
