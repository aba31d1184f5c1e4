//! Transition Scheduler
//!
//! A transition progressively reassigns one input toward a target value,
//! driven by host-supplied clock ticks. The engine never consults a wall
//! clock: `advance(delta)` is the only source of time, which keeps replays
//! deterministic.
//!
//! Each tick computes `position = clamp(elapsed / duration, 0, 1)`, applies
//! the interpolation function to the captured start and end values, and
//! hands the result back as an ordinary input assignment for the tick's
//! transaction. At `position >= 1` the transition resolves to its end value
//! exactly and unregisters; any spawned task blocked on it is released.
//!
//! Interpolation functions are pure and may operate over arbitrary value
//! shapes, not only numbers.

use std::sync::Arc;

use tracing::debug;

use crate::graph::NodeId;
use crate::value::Value;

/// A pure interpolation function: `f(start, end, position)` with position
/// in `0..=1`.
pub type InterpFn = Arc<dyn Fn(&Value, &Value, f64) -> Value + Send + Sync>;

/// The declared shape of a transition node: which input it drives, how
/// long it runs, and how it interpolates.
#[derive(Clone)]
pub struct TransitionSpec {
    /// The input node this transition reassigns.
    pub(crate) target: NodeId,
    /// Duration in host time units. A non-positive duration completes on
    /// the first tick.
    pub(crate) duration: f64,
    /// The interpolation function.
    pub(crate) interpolate: InterpFn,
}

impl TransitionSpec {
    /// Build a spec with the default shape-generic linear interpolation.
    pub fn linear(target: NodeId, duration: f64) -> Self {
        Self {
            target,
            duration,
            interpolate: Arc::new(lerp),
        }
    }

    /// Build a spec with a custom interpolation function.
    pub fn with_interpolation(target: NodeId, duration: f64, interpolate: InterpFn) -> Self {
        Self {
            target,
            duration,
            interpolate,
        }
    }

    /// The input this transition drives.
    pub fn target(&self) -> NodeId {
        self.target
    }
}

/// A transition that has been started and is being driven by ticks.
#[derive(Clone)]
pub(crate) struct ActiveTransition {
    /// The transition node (its value is the current progress).
    pub(crate) node: NodeId,
    /// The input being driven.
    pub(crate) target: NodeId,
    /// Value of the input when the transition started.
    pub(crate) from: Value,
    /// Value the input is driven toward.
    pub(crate) to: Value,
    pub(crate) duration: f64,
    pub(crate) interpolate: InterpFn,
    pub(crate) elapsed: f64,
}

/// One tick's worth of output from the scheduler.
pub(crate) struct TickOutput {
    /// Input assignments, in transition start order: the driven inputs
    /// plus each transition node's own progress value.
    pub(crate) assigns: Vec<(NodeId, Value)>,
    /// Transition nodes that completed on this tick.
    pub(crate) finished: Vec<NodeId>,
}

/// Time-driven producer of input reassignments.
///
/// Owns the set of running transitions. Start order is preserved so the
/// assignments of one tick are deterministic.
#[derive(Default, Clone)]
pub(crate) struct TransitionScheduler {
    active: Vec<ActiveTransition>,
}

impl TransitionScheduler {
    pub(crate) fn new() -> Self {
        Self { active: Vec::new() }
    }

    /// Register a transition. Restarting a transition that is already
    /// running replaces it.
    pub(crate) fn start(
        &mut self,
        node: NodeId,
        spec: &TransitionSpec,
        from: Value,
        to: Value,
    ) {
        debug!(node = node.raw(), "transition started");
        self.active.retain(|t| t.node != node);
        self.active.push(ActiveTransition {
            node,
            target: spec.target,
            from,
            to,
            duration: spec.duration,
            interpolate: spec.interpolate.clone(),
            elapsed: 0.0,
        });
    }

    /// Whether the given transition node is currently running.
    pub(crate) fn is_running(&self, node: NodeId) -> bool {
        self.active.iter().any(|t| t.node == node)
    }

    /// The number of running transitions.
    pub(crate) fn running_count(&self) -> usize {
        self.active.len()
    }

    /// Drop every running transition (component teardown).
    pub(crate) fn cancel_all(&mut self) {
        self.active.clear();
    }

    /// Advance all running transitions by `delta` and collect the input
    /// assignments for this tick's transaction.
    pub(crate) fn advance(&mut self, delta: f64) -> TickOutput {
        let mut assigns = Vec::new();
        let mut finished = Vec::new();

        for transition in &mut self.active {
            transition.elapsed += delta;
            let position = if transition.duration <= 0.0 {
                1.0
            } else {
                (transition.elapsed / transition.duration).clamp(0.0, 1.0)
            };

            let value = if position >= 1.0 {
                // Resolve to the end value exactly, not an interpolant.
                transition.to.clone()
            } else {
                (transition.interpolate)(&transition.from, &transition.to, position)
            };

            assigns.push((transition.target, value));
            assigns.push((transition.node, Value::Float(position)));

            if position >= 1.0 {
                debug!(node = transition.node.raw(), "transition finished");
                finished.push(transition.node);
            }
        }

        self.active.retain(|t| !finished.contains(&t.node));
        TickOutput { assigns, finished }
    }
}

/// Shape-generic linear interpolation.
///
/// Numbers interpolate numerically (integers round), lists and records
/// interpolate element-wise and field-wise, and any other pair degrades to
/// a step: the start value until the end of the transition.
pub fn lerp(from: &Value, to: &Value, position: f64) -> Value {
    match (from, to) {
        (Value::Int(a), Value::Int(b)) => {
            // Interpolate in f64 so extreme endpoints cannot overflow the
            // intermediate difference; the cast back saturates.
            let x = *a as f64 + (*b as f64 - *a as f64) * position;
            Value::Int(x.round() as i64)
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Float(x + (y - x) * position),
            _ => lerp_structural(from, to, position),
        },
    }
}

fn lerp_structural(from: &Value, to: &Value, position: f64) -> Value {
    match (from, to) {
        (Value::List(a), Value::List(b)) if a.len() == b.len() => Value::list(
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| lerp(x, y, position))
                .collect::<Vec<_>>(),
        ),
        (Value::Record(a), Value::Record(b)) => Value::record(b.iter().map(|(name, end)| {
            let value = match a.get(name) {
                Some(start) => lerp(start, end, position),
                None => end.clone(),
            };
            (name.clone(), value)
        })),
        _ => {
            if position >= 1.0 {
                to.clone()
            } else {
                from.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    fn id(n: usize) -> NodeId {
        NodeId::from_index(n)
    }

    #[test]
    fn lerp_scalars() {
        assert_eq!(lerp(&Value::Float(0.0), &Value::Float(10.0), 0.25), Value::Float(2.5));
        assert_eq!(lerp(&Value::Int(0), &Value::Int(10), 0.25), Value::Int(3));
        // Mixed numeric widths interpolate as floats.
        assert_eq!(lerp(&Value::Int(0), &Value::Float(1.0), 0.5), Value::Float(0.5));
    }

    /// Endpoints at the edges of the integer range must not overflow the
    /// intermediate difference.
    #[test]
    fn lerp_extreme_integers() {
        let lo = Value::Int(i64::MIN);
        let hi = Value::Int(i64::MAX);
        assert_eq!(lerp(&lo, &hi, 0.0), Value::Int(i64::MIN));
        assert_eq!(lerp(&lo, &hi, 0.5), Value::Int(0));
        assert_eq!(lerp(&hi, &lo, 0.5), Value::Int(0));
    }

    #[test]
    fn lerp_compound_shapes() {
        let a = Value::record([("x", Value::Float(0.0)), ("y", Value::Float(4.0))]);
        let b = Value::record([("x", Value::Float(2.0)), ("y", Value::Float(0.0))]);
        assert_eq!(
            lerp(&a, &b, 0.5),
            Value::record([("x", Value::Float(1.0)), ("y", Value::Float(2.0))])
        );

        let a = Value::list([Value::Int(0), Value::Int(100)]);
        let b = Value::list([Value::Int(10), Value::Int(0)]);
        assert_eq!(
            lerp(&a, &b, 0.5),
            Value::list([Value::Int(5), Value::Int(50)])
        );
    }

    #[test]
    fn lerp_non_numeric_steps() {
        let a = Value::text("before");
        let b = Value::text("after");
        assert_eq!(lerp(&a, &b, 0.99), a);
        assert_eq!(lerp(&a, &b, 1.0), b);
    }

    #[test]
    fn advance_interpolates_and_finishes() {
        let mut scheduler = TransitionScheduler::new();
        let spec = TransitionSpec::linear(id(0), 2.0);
        scheduler.start(id(1), &spec, Value::Float(0.0), Value::Float(10.0));

        let out = scheduler.advance(1.0);
        assert_eq!(out.assigns[0], (id(0), Value::Float(5.0)));
        assert_eq!(out.assigns[1], (id(1), Value::Float(0.5)));
        assert!(out.finished.is_empty());

        let out = scheduler.advance(1.0);
        assert_eq!(out.assigns[0], (id(0), Value::Float(10.0)));
        assert_eq!(out.assigns[1], (id(1), Value::Float(1.0)));
        assert_eq!(out.finished, vec![id(1)]);
        assert_eq!(scheduler.running_count(), 0);
    }

    #[test]
    fn overshoot_clamps_to_end_value() {
        let mut scheduler = TransitionScheduler::new();
        let spec = TransitionSpec::linear(id(0), 0.5);
        scheduler.start(id(1), &spec, Value::Int(0), Value::Int(8));

        let out = scheduler.advance(10.0);
        assert_eq!(out.assigns[0], (id(0), Value::Int(8)));
        assert_eq!(out.finished, vec![id(1)]);
    }

    #[test]
    fn restart_replaces_running_transition() {
        let mut scheduler = TransitionScheduler::new();
        let spec = TransitionSpec::linear(id(0), 1.0);
        scheduler.start(id(1), &spec, Value::Float(0.0), Value::Float(1.0));
        scheduler.start(id(1), &spec, Value::Float(5.0), Value::Float(6.0));
        assert!(scheduler.is_running(id(1)));
        assert_eq!(scheduler.running_count(), 1);

        let out = scheduler.advance(0.5);
        assert_eq!(out.assigns[0], (id(0), Value::Float(5.5)));
    }
}
