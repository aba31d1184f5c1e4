//! Inductive Sequence Engine
//!
//! Sequences are index-parameterized values: `seq[k]` is produced by a
//! formula over the element index, and the formula may reference the
//! sequence's own earlier elements through `prior(c)` for a declared
//! positive constant offset `c`. That strictly-decreasing self-reference is
//! the only sanctioned form of recursion in the graph; it is what keeps
//! evaluation terminating and boundable.
//!
//! # Caching Strategy
//!
//! Each sequence keeps a sliding window of the most recently computed
//! contiguous elements. The window is exactly as deep as the largest
//! declared offset, so:
//!
//! - Ascending, contiguous access is O(1) amortized per element: every new
//!   element finds all its `prior` references in the window.
//!
//! - Random access to index `k` with a cold (or overshot) window recomputes
//!   the chain from the sequence start, which is O(k). This is a documented,
//!   acceptable cost, not an error.
//!
//! Unbounded sequences are legal values; only `element` forces computation
//! and nothing is ever eagerly materialized.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::error::EngineError;
use crate::graph::{EvalCtx, ExprFn, Graph, NodeId, NodeKind, ReadKey, SeqFrame};
use crate::value::Value;

/// The registered shape of a sequence: its index range, base-case bodies,
/// step body, and the declared inductive offsets.
#[derive(Clone)]
pub struct SequenceSpec {
    /// First index of the sequence.
    pub(crate) start: i64,
    /// Last index (inclusive), or `None` for an unbounded sequence.
    pub(crate) end: Option<i64>,
    /// Bodies for the leading elements `start .. start + base.len()`.
    pub(crate) base: Vec<ExprFn>,
    /// The declared `prior` offsets the step body may use.
    pub(crate) offsets: SmallVec<[i64; 2]>,
    /// Body for every element past the base region.
    pub(crate) step: ExprFn,
}

impl SequenceSpec {
    /// Build a spec. Shape validation happens in [`SequenceSpec::validate`]
    /// when the sequence is registered with a component.
    pub fn new(
        start: i64,
        end: Option<i64>,
        base: Vec<ExprFn>,
        offsets: impl IntoIterator<Item = i64>,
        step: ExprFn,
    ) -> Self {
        Self {
            start,
            end,
            base,
            offsets: offsets.into_iter().collect(),
            step,
        }
    }

    /// Reject statically invalid shapes as soon as the formula is
    /// registered: non-positive offsets, and a base region too shallow for
    /// the deepest declared offset (the first step element would reach
    /// before the sequence start).
    pub(crate) fn validate(&self, name: &str) -> Result<(), EngineError> {
        for &offset in &self.offsets {
            if offset <= 0 {
                return Err(EngineError::InvalidInductiveReference {
                    name: name.to_string(),
                    offset,
                });
            }
        }
        let deepest = self.max_offset();
        if deepest > self.base.len() as i64 {
            return Err(EngineError::InvalidInductiveReference {
                name: name.to_string(),
                offset: deepest,
            });
        }
        Ok(())
    }

    fn max_offset(&self) -> i64 {
        self.offsets.iter().copied().max().unwrap_or(0)
    }

    /// Window depth: the deepest offset, with a floor of one so repeated
    /// reads of the same index stay cached.
    fn window_capacity(&self) -> usize {
        self.max_offset().max(1) as usize
    }

    fn contains(&self, index: i64) -> bool {
        index >= self.start && self.end.map_or(true, |end| index <= end)
    }

    fn body_for(&self, index: i64) -> &ExprFn {
        let base_len = self.base.len() as i64;
        if index < self.start + base_len {
            &self.base[(index - self.start) as usize]
        } else {
            &self.step
        }
    }
}

/// Per-node runtime state of a sequence: its spec plus the sliding window
/// of `(index, value)` pairs, contiguous and ascending.
pub struct SequenceState {
    pub(crate) spec: SequenceSpec,
    pub(crate) window: VecDeque<(i64, Value)>,
}

impl SequenceState {
    pub(crate) fn new(spec: SequenceSpec) -> Self {
        Self {
            spec,
            window: VecDeque::new(),
        }
    }
}

impl Graph {
    /// Force one element of a sequence, recording a dependency on exactly
    /// that element for the computation in flight.
    pub fn element(&mut self, seq: NodeId, index: i64) -> Result<Value, EngineError> {
        let value = self.element_value(seq, index)?;
        self.note_read(ReadKey::Element(seq, index), value.clone());
        Ok(value)
    }

    /// Force one element without recording a dependency. Also used when
    /// re-verifying a `MaybeDirty` consumer of an element read.
    pub(crate) fn element_value(&mut self, seq: NodeId, index: i64) -> Result<Value, EngineError> {
        let name = match self.node(seq).map(|n| n.kind()) {
            Some(NodeKind::Sequence(_)) => self.name_of(seq).to_string(),
            _ => {
                return Err(EngineError::UnresolvedDependency {
                    name: format!("node #{} is not a sequence", seq.raw()),
                })
            }
        };
        if self.node_ref(seq).in_eval {
            // A sequence body reaching back into its own sequence other
            // than through `prior` is a cycle.
            return Err(EngineError::CyclicEvaluation { name });
        }

        // Validates upstream reads; clears the window if anything changed.
        self.ensure_valid(seq)?;

        let (spec, mut window) = match &mut self.node_mut(seq).kind {
            NodeKind::Sequence(state) => {
                if !state.spec.contains(index) {
                    return Err(EngineError::IndexOutOfRange { name, index });
                }
                if let Some((_, v)) = state.window.iter().find(|(i, _)| *i == index) {
                    return Ok(v.clone());
                }
                (state.spec.clone(), std::mem::take(&mut state.window))
            }
            _ => unreachable!("kind checked above"),
        };

        self.set_in_eval(seq, true);
        let result = self.run_chain(seq, &name, &spec, &mut window, index);
        self.set_in_eval(seq, false);

        if let NodeKind::Sequence(state) = &mut self.node_mut(seq).kind {
            state.window = window;
        }
        result
    }

    /// Compute elements up to `index`, resuming from the window when it
    /// ends just below `index` and restarting from the sequence start
    /// otherwise.
    fn run_chain(
        &mut self,
        seq: NodeId,
        name: &str,
        spec: &SequenceSpec,
        window: &mut VecDeque<(i64, Value)>,
        index: i64,
    ) -> Result<Value, EngineError> {
        let cap = spec.window_capacity();
        let resume = match window.back() {
            Some((hi, _)) if *hi < index => *hi + 1,
            Some(_) => {
                // The window is past the requested index: cold restart.
                window.clear();
                spec.start
            }
            None => spec.start,
        };

        let mut out = Value::Nothing;
        for i in resume..=index {
            let body = spec.body_for(i).clone();
            self.begin_frame(seq);
            let result = {
                let mut ctx = EvalCtx {
                    graph: &mut *self,
                    seq: Some(SeqFrame {
                        name,
                        index: i,
                        start: spec.start,
                        offsets: &spec.offsets,
                        window: &*window,
                    }),
                };
                body(&mut ctx)
            };
            let reads = self.end_frame();
            let value = result?;

            // Element bodies may read other nodes; those reads belong to
            // the sequence node so upstream changes invalidate the window.
            for (key, v) in reads {
                let node = self.node_mut(seq);
                if !node.seen.iter().any(|(k, _)| *k == key) {
                    node.seen.push((key, v));
                }
            }

            window.push_back((i, value.clone()));
            while window.len() > cap {
                window.pop_front();
            }
            out = value;
        }
        Ok(out)
    }
}
