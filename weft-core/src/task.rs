//! Actions and Spawned Task Streams
//!
//! An action is a straight-line sequence of operations: input assignments,
//! event triggers, transition starts, stream advances, and task spawns.
//! Observers run actions inline, folding their operations into the current
//! transaction (`do`-style). A `spawn`-declared body instead becomes an
//! independent, cooperatively interleaved task stream.
//!
//! # Tasks as Resumable Step Sequences
//!
//! There are no native coroutines here. A running task is an explicit
//! resumable state: the task definition plus a program-counter-like step
//! index and an optional "waiting on transition X" marker. On each tick the
//! transaction manager resumes every runnable task in spawn order (FIFO),
//! executes steps until the task finishes or hits a blocking transition
//! start (`wait: true`), and batches everything the resumed tasks produced
//! into that tick's single transaction. Ordering between streams is fixed
//! by spawn order, so output is reproducible given identical tick timings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::graph::{ExprFn, NodeId};
use crate::value::Value;

/// Identifier of a task definition within one component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub(crate) usize);

/// One operation inside an action or task body.
#[derive(Clone)]
pub enum ActionOp {
    /// Assign a value (computed against the current state) to an input.
    Assign {
        /// The input to write.
        input: NodeId,
        /// The value formula, evaluated when the operation executes.
        value: ExprFn,
    },
    /// Fire an event with a payload for the current transaction.
    Trigger {
        /// The event node.
        event: NodeId,
        /// The payload formula.
        payload: ExprFn,
    },
    /// Start a transition toward a computed end value. `wait` only matters
    /// inside a task body, where it suspends the task until the transition
    /// completes; observers ignore it.
    Start {
        /// The transition node to start.
        transition: NodeId,
        /// The end-value formula.
        to: ExprFn,
        /// Whether a task executing this step blocks on completion.
        wait: bool,
    },
    /// Register a new run of a spawned task stream.
    Spawn {
        /// The task definition to start.
        task: TaskId,
    },
    /// Advance a deterministic random stream by one draw.
    AdvanceStream {
        /// The stream's input node.
        stream: NodeId,
    },
}

impl ActionOp {
    /// Assign a constant value to an input.
    pub fn set(input: NodeId, value: Value) -> Self {
        ActionOp::Assign {
            input,
            value: constant(value),
        }
    }

    /// Assign a computed value to an input.
    pub fn assign(input: NodeId, value: ExprFn) -> Self {
        ActionOp::Assign { input, value }
    }

    /// Fire an event with a constant payload.
    pub fn trigger(event: NodeId, payload: Value) -> Self {
        ActionOp::Trigger {
            event,
            payload: constant(payload),
        }
    }

    /// Start a transition toward a constant end value.
    pub fn start(transition: NodeId, to: Value, wait: bool) -> Self {
        ActionOp::Start {
            transition,
            to: constant(to),
            wait,
        }
    }

    /// Spawn a task stream.
    pub fn spawn(task: TaskId) -> Self {
        ActionOp::Spawn { task }
    }

    /// Advance a random stream.
    pub fn advance_stream(stream: NodeId) -> Self {
        ActionOp::AdvanceStream { stream }
    }
}

/// A straight-line operation sequence, shared between its declaration and
/// every run of it.
pub type Action = Arc<Vec<ActionOp>>;

/// Wrap a constant value as a value formula.
pub fn constant(value: Value) -> ExprFn {
    Arc::new(move |_| Ok(value.clone()))
}

/// A declared spawned body.
pub struct TaskDef {
    pub(crate) name: String,
    pub(crate) steps: Action,
}

impl TaskDef {
    pub(crate) fn new(name: String, steps: Action) -> Self {
        Self { name, steps }
    }

    /// The task's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One live run of a task: definition, resume point, and the transition it
/// is blocked on, if any.
#[derive(Clone)]
pub(crate) struct RunningTask {
    pub(crate) def: TaskId,
    pub(crate) pc: usize,
    pub(crate) waiting_on: Option<NodeId>,
}

/// The component's task streams: declarations plus the FIFO of live runs.
#[derive(Default)]
pub(crate) struct TaskRunner {
    pub(crate) defs: Vec<TaskDef>,
    pub(crate) running: Vec<RunningTask>,
}

impl TaskRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_def(&mut self, def: TaskDef) -> TaskId {
        self.defs.push(def);
        TaskId(self.defs.len() - 1)
    }

    /// Enqueue a new run of `task` at the end of the FIFO.
    pub(crate) fn spawn(&mut self, task: TaskId) {
        self.running.push(RunningTask {
            def: task,
            pc: 0,
            waiting_on: None,
        });
    }

    /// Unblock every run waiting on one of the finished transitions.
    pub(crate) fn release(&mut self, finished: &[NodeId]) {
        for run in &mut self.running {
            if let Some(node) = run.waiting_on {
                if finished.contains(&node) {
                    run.waiting_on = None;
                }
            }
        }
    }

    /// Drop runs that have executed all their steps.
    pub(crate) fn retire_finished(&mut self) {
        let defs = &self.defs;
        self.running
            .retain(|run| run.pc < defs[run.def.0].steps.len());
    }

    /// Drop every live run (component teardown).
    pub(crate) fn cancel_all(&mut self) {
        self.running.clear();
    }

    pub(crate) fn running_count(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> NodeId {
        NodeId::from_index(n)
    }

    fn two_step_def() -> TaskDef {
        TaskDef::new(
            "steps".into(),
            Arc::new(vec![
                ActionOp::set(id(0), Value::Int(1)),
                ActionOp::set(id(0), Value::Int(2)),
            ]),
        )
    }

    #[test]
    fn spawn_is_fifo() {
        let mut runner = TaskRunner::new();
        let a = runner.add_def(two_step_def());
        let b = runner.add_def(two_step_def());

        runner.spawn(b);
        runner.spawn(a);
        assert_eq!(runner.running[0].def, b);
        assert_eq!(runner.running[1].def, a);
    }

    #[test]
    fn release_clears_matching_waits() {
        let mut runner = TaskRunner::new();
        let t = runner.add_def(two_step_def());
        runner.spawn(t);
        runner.running[0].waiting_on = Some(id(9));

        runner.release(&[id(3)]);
        assert_eq!(runner.running[0].waiting_on, Some(id(9)));

        runner.release(&[id(9)]);
        assert_eq!(runner.running[0].waiting_on, None);
    }

    #[test]
    fn retire_drops_completed_runs() {
        let mut runner = TaskRunner::new();
        let t = runner.add_def(two_step_def());
        runner.spawn(t);
        runner.spawn(t);
        runner.running[0].pc = 2;

        runner.retire_finished();
        assert_eq!(runner.running_count(), 1);
        assert_eq!(runner.running[0].pc, 0);
    }
}
