//! Transaction Manager
//!
//! A transaction is an atomic batch of input reassignments and event
//! firings plus everything they cascade into: dirty propagation, observer
//! firings, and the assignments those enqueue. No node ever observes a
//! partially applied batch; invalidation is deferred until commit begins.
//!
//! # Commit Algorithm
//!
//! 1. Apply all pending input reassignments and event payloads.
//! 2. Invalidate transitive dependents (flags only, no recomputation).
//! 3. Run one observer pass; firing observers enqueue further assignments
//!    and events into the same transaction.
//! 4. Repeat from 1 until a fixed point (no observer fires) or the
//!    configured iteration ceiling is hit.
//! 5. Export the component's value tree for the next snapshot.
//!
//! Exceeding the ceiling aborts with `FeedbackLoopDetected` instead of
//! hanging; every runtime abort restores the engine to the state of the
//! last committed snapshot, so the pre-transaction snapshot stays current.
//!
//! # Ticks
//!
//! `tick(delta)` is the transaction stream of continuous time: running
//! transitions produce their interpolated assignments, blocked task
//! streams whose transitions completed resume, runnable tasks execute
//! their next steps, and everything lands in one transaction.

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

use crate::component::ComponentDef;
use crate::error::EngineError;
use crate::graph::{EvalCtx, ExprFn, Graph, NodeId, NodeKind};
use crate::observer::ObserverSet;
use crate::random::DeterministicRng;
use crate::task::{ActionOp, RunningTask, TaskId, TaskRunner};
use crate::transition::TransitionScheduler;
use crate::value::Value;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many apply-and-observe passes one commit may take before it is
    /// declared a feedback loop. The source language treats this as a
    /// quality-of-implementation constant, not a guarantee.
    pub observer_iteration_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            observer_iteration_limit: 100,
        }
    }
}

/// A pending batch of input reassignments and event firings.
///
/// Within one batch the last write to an input wins; events accumulate in
/// trigger order.
#[derive(Default)]
pub struct Transaction {
    pub(crate) assigns: IndexMap<NodeId, Value>,
    pub(crate) events: Vec<(NodeId, Value)>,
}

impl Transaction {
    /// Start an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the batch holds nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.assigns.is_empty() && self.events.is_empty()
    }

    pub(crate) fn assign(&mut self, id: NodeId, value: Value) {
        self.assigns.insert(id, value);
    }

    pub(crate) fn trigger(&mut self, id: NodeId, payload: Value) {
        self.events.push((id, payload));
    }
}

/// Pre-transaction state captured for rollback: source memos, observer
/// latches, and the scheduler/task/stream state.
struct Backup {
    sources: Vec<(NodeId, Option<Value>)>,
    latches: Vec<bool>,
    transitions: TransitionScheduler,
    running: Vec<RunningTask>,
    streams: IndexMap<NodeId, DeterministicRng>,
}

/// The evaluation engine for one component instance: the graph plus the
/// transactional machinery around it.
///
/// Single-threaded by construction. During a commit the engine exclusively
/// owns every memo slot and observer latch; nothing in here is visible to
/// the host until the commit exports a snapshot.
pub(crate) struct Engine {
    name: String,
    graph: Graph,
    index: IndexMap<String, NodeId>,
    export_ids: Arc<IndexMap<String, NodeId>>,
    observers: ObserverSet,
    transitions: TransitionScheduler,
    tasks: TaskRunner,
    streams: IndexMap<NodeId, DeterministicRng>,
    config: EngineConfig,
}

impl Engine {
    /// Build an engine from a validated definition, applying initial input
    /// overrides and deriving the initial observer latches.
    pub(crate) fn from_def(
        def: ComponentDef,
        initial: Vec<(String, Value)>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let ComponentDef {
            name,
            mut graph,
            index,
            observers,
            tasks,
            streams,
        } = def;

        for (input, value) in initial {
            let id = index
                .get(&input)
                .copied()
                .ok_or_else(|| EngineError::UnresolvedDependency {
                    name: input.clone(),
                })?;
            if !matches!(graph.kind_of(id), NodeKind::Input) {
                return Err(EngineError::UnresolvedDependency {
                    name: format!("`{input}` is not an input"),
                });
            }
            graph.assign(id, value);
        }

        let mut observer_set = ObserverSet::new();
        for (node, action) in observers {
            observer_set.add(node, action);
        }
        observer_set.rearm(&mut graph)?;

        let export_ids = Arc::new(
            index
                .iter()
                .filter(|(_, id)| graph.kind_of(**id).is_exported())
                .map(|(name, id)| (name.clone(), *id))
                .collect::<IndexMap<_, _>>(),
        );

        Ok(Self {
            name,
            graph,
            index,
            export_ids,
            observers: observer_set,
            transitions: TransitionScheduler::new(),
            tasks,
            streams,
            config,
        })
    }

    pub(crate) fn export_ids(&self) -> Arc<IndexMap<String, NodeId>> {
        self.export_ids.clone()
    }

    pub(crate) fn resolve(&self, name: &str) -> Result<NodeId, EngineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnresolvedDependency {
                name: name.to_string(),
            })
    }

    pub(crate) fn kind_of(&self, id: NodeId) -> &NodeKind {
        self.graph.kind_of(id)
    }

    /// Force one element of a sequence, outside any transaction.
    pub(crate) fn element(&mut self, seq: NodeId, index: i64) -> Result<Value, EngineError> {
        self.graph.element_value(seq, index)
    }

    /// Enqueue a run of a spawned task; it first executes on the next tick.
    pub(crate) fn spawn_task(&mut self, task: TaskId) -> Result<(), EngineError> {
        if task.0 >= self.tasks.defs.len() {
            return Err(EngineError::UnresolvedDependency {
                name: format!("task #{}", task.0),
            });
        }
        self.tasks.spawn(task);
        Ok(())
    }

    /// Draw the next value of a random stream into a pending batch.
    pub(crate) fn advance_stream(
        &mut self,
        id: NodeId,
        txn: &mut Transaction,
    ) -> Result<(), EngineError> {
        match self.streams.get_mut(&id) {
            Some(rng) => {
                txn.assign(id, rng.next_value());
                Ok(())
            }
            None => Err(EngineError::UnresolvedDependency {
                name: format!("`{}` is not a random stream", self.graph.name_of(id)),
            }),
        }
    }

    /// Commit a transaction: run the fixed-point loop and export the new
    /// value tree. On any runtime error the engine state is rolled back to
    /// the last committed snapshot and the error is surfaced.
    pub(crate) fn commit(
        &mut self,
        txn: Transaction,
    ) -> Result<IndexMap<String, Value>, EngineError> {
        debug!(component = self.name.as_str(), "transaction begin");
        let backup = self.backup();
        match self.commit_inner(txn) {
            Ok(values) => {
                debug!(component = self.name.as_str(), "transaction committed");
                Ok(values)
            }
            Err(err) => {
                self.restore(backup);
                debug!(component = self.name.as_str(), error = %err, "transaction aborted");
                Err(err)
            }
        }
    }

    /// Advance time: drive transitions, resume task streams, and commit
    /// the resulting batch as one transaction.
    pub(crate) fn tick(&mut self, delta: f64) -> Result<IndexMap<String, Value>, EngineError> {
        debug!(component = self.name.as_str(), delta, "tick");
        let backup = self.backup();
        match self.tick_inner(delta) {
            Ok(values) => Ok(values),
            Err(err) => {
                self.restore(backup);
                debug!(component = self.name.as_str(), error = %err, "tick aborted");
                Err(err)
            }
        }
    }

    fn tick_inner(&mut self, delta: f64) -> Result<IndexMap<String, Value>, EngineError> {
        let mut txn = Transaction::new();

        let out = self.transitions.advance(delta);
        for (id, value) in out.assigns {
            txn.assign(id, value);
        }
        self.tasks.release(&out.finished);
        self.run_tasks(&mut txn)?;

        self.commit_inner(txn)
    }

    fn commit_inner(
        &mut self,
        mut pending: Transaction,
    ) -> Result<IndexMap<String, Value>, EngineError> {
        let limit = self.config.observer_iteration_limit;
        let mut live_events: Vec<NodeId> = Vec::new();
        let mut passes = 0usize;

        loop {
            // Apply the whole batch before anything can observe it.
            for (id, value) in std::mem::take(&mut pending.assigns) {
                self.graph.assign(id, value);
            }
            for (id, payload) in std::mem::take(&mut pending.events) {
                self.graph.assign(id, payload);
                if !live_events.contains(&id) {
                    live_events.push(id);
                }
            }

            let fired = self.observers.scan(&mut self.graph)?;
            for action in &fired {
                self.execute_action(action, &mut pending)?;
            }

            if pending.is_empty() {
                break;
            }
            passes += 1;
            if passes >= limit {
                return Err(EngineError::FeedbackLoopDetected { limit });
            }
        }

        // Events are visible only within the transaction that fired them.
        // Resetting the payloads re-arms any observer whose predicate
        // depended on them, without firing on the falling edge.
        if !live_events.is_empty() {
            for id in live_events {
                self.graph.assign(id, Value::Nothing);
            }
            self.observers.rearm(&mut self.graph)?;
        }

        self.export()
    }

    /// Execute an action's operations in order, folding their effects into
    /// the pending batch (`do`-style).
    fn execute_action(
        &mut self,
        ops: &[ActionOp],
        pending: &mut Transaction,
    ) -> Result<(), EngineError> {
        for op in ops {
            self.execute_op(op, pending)?;
        }
        Ok(())
    }

    fn execute_op(&mut self, op: &ActionOp, pending: &mut Transaction) -> Result<(), EngineError> {
        match op {
            ActionOp::Assign { input, value } => {
                let value = self.eval_fn(value)?;
                pending.assign(*input, value);
            }
            ActionOp::Trigger { event, payload } => {
                let payload = self.eval_fn(payload)?;
                pending.trigger(*event, payload);
            }
            ActionOp::Start { transition, to, .. } => {
                self.start_transition(*transition, to, pending)?;
            }
            ActionOp::Spawn { task } => {
                self.tasks.spawn(*task);
            }
            ActionOp::AdvanceStream { stream } => {
                self.advance_stream(*stream, pending)?;
            }
        }
        Ok(())
    }

    /// Evaluate a value formula against the current state, without
    /// creating dependency edges: actions are consumers of a moment, not
    /// persistent dependents.
    fn eval_fn(&mut self, f: &ExprFn) -> Result<Value, EngineError> {
        let mut ctx = EvalCtx::new(&mut self.graph);
        f(&mut ctx)
    }

    /// Start (or restart) a transition toward a computed end value. The
    /// driven input's current value is the start point; progress resets
    /// to zero in the pending batch.
    pub(crate) fn start_transition(
        &mut self,
        node: NodeId,
        to: &ExprFn,
        pending: &mut Transaction,
    ) -> Result<(), EngineError> {
        let to = self.eval_fn(to)?;
        let spec = match self.graph.kind_of(node) {
            NodeKind::Transition(spec) => spec.clone(),
            _ => {
                return Err(EngineError::UnresolvedDependency {
                    name: format!("`{}` is not a transition", self.graph.name_of(node)),
                })
            }
        };
        let from = self.graph.value(spec.target())?;
        self.transitions.start(node, &spec, from, to);
        pending.assign(node, Value::Float(0.0));
        Ok(())
    }

    /// Resume every runnable task stream in spawn order. Each executes
    /// steps until it finishes or blocks on a `wait: true` transition
    /// start. Tasks spawned during this pass first run on the next tick.
    fn run_tasks(&mut self, txn: &mut Transaction) -> Result<(), EngineError> {
        let resumable = self.tasks.running.len();
        for i in 0..resumable {
            loop {
                let run = &self.tasks.running[i];
                if run.waiting_on.is_some() {
                    break;
                }
                let steps = self.tasks.defs[run.def.0].steps.clone();
                let pc = run.pc;
                if pc >= steps.len() {
                    break;
                }
                self.tasks.running[i].pc += 1;

                match &steps[pc] {
                    ActionOp::Start {
                        transition,
                        to,
                        wait,
                    } => {
                        self.start_transition(*transition, to, txn)?;
                        if *wait {
                            self.tasks.running[i].waiting_on = Some(*transition);
                            break;
                        }
                    }
                    other => self.execute_op(other, txn)?,
                }
            }
        }
        self.tasks.retire_finished();
        Ok(())
    }

    /// Evaluate the exported value tree: every input, property, local,
    /// sequence handle, and transition progress, by declared name.
    pub(crate) fn export(&mut self) -> Result<IndexMap<String, Value>, EngineError> {
        let mut values = IndexMap::with_capacity(self.export_ids.len());
        let ids = self.export_ids.clone();
        for (name, id) in ids.iter() {
            values.insert(name.clone(), self.graph.value(*id)?);
        }
        Ok(values)
    }

    /// Whether anything time-driven is still live.
    pub(crate) fn idle(&self) -> bool {
        self.transitions.running_count() == 0 && self.tasks.running_count() == 0
    }

    /// Drop all pending time-driven work (component teardown).
    pub(crate) fn cancel_pending(&mut self) {
        self.transitions.cancel_all();
        self.tasks.cancel_all();
    }

    fn backup(&self) -> Backup {
        let sources = self
            .graph
            .node_ids()
            .filter(|id| self.graph.kind_of(*id).is_source())
            .map(|id| (id, self.graph.node_ref(id).memo.clone()))
            .collect();
        Backup {
            sources,
            latches: self.observers.latches(),
            transitions: self.transitions.clone(),
            running: self.tasks.running.clone(),
            streams: self.streams.clone(),
        }
    }

    fn restore(&mut self, backup: Backup) {
        for (id, memo) in backup.sources {
            if self.graph.node_ref(id).memo != memo {
                self.graph.node_mut(id).memo = memo;
                self.graph.invalidate(id);
            }
        }
        self.observers.restore_latches(&backup.latches);
        self.transitions = backup.transitions;
        self.tasks.running = backup.running;
        self.streams = backup.streams;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::component::ComponentBuilder;
    use crate::task::constant;

    fn engine_of(builder: ComponentBuilder) -> Engine {
        Engine::from_def(builder.build().unwrap(), Vec::new(), EngineConfig::default()).unwrap()
    }

    #[test]
    fn commit_applies_batch_atomically() {
        let mut b = ComponentBuilder::new("pair");
        let x = b.input("x", Value::Int(0));
        let y = b.input("y", Value::Int(0));
        b.property("sum", move |ctx| {
            let x = ctx.read(x)?.as_int().unwrap_or(0);
            let y = ctx.read(y)?.as_int().unwrap_or(0);
            Ok(Value::Int(x + y))
        });
        let mut engine = engine_of(b);

        let mut txn = Transaction::new();
        txn.assign(x, Value::Int(3));
        txn.assign(y, Value::Int(4));
        let values = engine.commit(txn).unwrap();
        assert_eq!(values["sum"], Value::Int(7));
    }

    #[test]
    fn observer_cascade_folds_into_same_commit() {
        let mut b = ComponentBuilder::new("cascade");
        let x = b.input("x", Value::Int(0));
        let y = b.input("y", Value::Int(100));
        b.observer(
            "clamp_y",
            move |ctx| Ok(Value::Bool(ctx.read(x)?.as_int().unwrap_or(0) >= 10)),
            vec![ActionOp::set(y, Value::Int(0))],
        );
        let mut engine = engine_of(b);

        let mut txn = Transaction::new();
        txn.assign(x, Value::Int(12));
        let values = engine.commit(txn).unwrap();
        assert_eq!(values["y"], Value::Int(0));
    }

    #[test]
    fn oscillating_observers_abort_with_feedback_loop() {
        // Each firing re-creates the other's rising edge: x ping-pongs
        // between 0 and 1 forever.
        let mut b = ComponentBuilder::new("loop");
        let x = b.input("x", Value::Int(0));
        b.observer(
            "at_one",
            move |ctx| Ok(Value::Bool(ctx.read(x)?.as_int() == Some(1))),
            vec![ActionOp::set(x, Value::Int(0))],
        );
        b.observer(
            "at_zero",
            move |ctx| Ok(Value::Bool(ctx.read(x)?.as_int() == Some(0))),
            vec![ActionOp::set(x, Value::Int(1))],
        );
        let mut engine = Engine::from_def(
            b.build().unwrap(),
            Vec::new(),
            EngineConfig {
                observer_iteration_limit: 16,
            },
        )
        .unwrap();

        let mut txn = Transaction::new();
        txn.assign(x, Value::Int(1));
        let err = engine.commit(txn).unwrap_err();
        assert_eq!(err, EngineError::FeedbackLoopDetected { limit: 16 });

        // Rolled back: the pre-transaction state is still current.
        let values = engine.export().unwrap();
        assert_eq!(values["x"], Value::Int(0));
    }

    #[test]
    fn events_are_transaction_scoped() {
        let mut b = ComponentBuilder::new("evented");
        let count = b.input("count", Value::Int(0));
        let ping = b.event("ping");
        b.observer(
            "on_ping",
            move |ctx| Ok(Value::Bool(ctx.read(ping)? != Value::Nothing)),
            vec![ActionOp::assign(
                count,
                Arc::new(move |ctx| {
                    Ok(Value::Int(
                        ctx.read_untracked(count)?.as_int().unwrap_or(0) + 1,
                    ))
                }),
            )],
        );
        let mut engine = engine_of(b);

        let mut txn = Transaction::new();
        txn.trigger(ping, Value::Int(1));
        let values = engine.commit(txn).unwrap();
        assert_eq!(values["count"], Value::Int(1));

        // The payload does not persist past its transaction.
        assert_eq!(engine.graph.value(ping).unwrap(), Value::Nothing);

        // A second trigger fires the observer again (the predicate fell
        // back to false when the payload cleared).
        let mut txn = Transaction::new();
        txn.trigger(ping, Value::Int(1));
        let values = engine.commit(txn).unwrap();
        assert_eq!(values["count"], Value::Int(2));
    }

    #[test]
    fn tick_drives_transition_to_completion() {
        let mut b = ComponentBuilder::new("fade");
        let opacity = b.input("opacity", Value::Float(0.0));
        let fade = b.transition("fade", crate::transition::TransitionSpec::linear(opacity, 2.0));
        let go = b.input("go", Value::Bool(false));
        b.observer(
            "on_go",
            move |ctx| ctx.read(go),
            vec![ActionOp::start(fade, Value::Float(1.0), false)],
        );
        let mut engine = engine_of(b);

        let mut txn = Transaction::new();
        txn.assign(go, Value::Bool(true));
        engine.commit(txn).unwrap();
        assert!(!engine.idle());

        let values = engine.tick(1.0).unwrap();
        assert_eq!(values["opacity"], Value::Float(0.5));
        assert_eq!(values["fade"], Value::Float(0.5));

        let values = engine.tick(1.0).unwrap();
        assert_eq!(values["opacity"], Value::Float(1.0));
        assert!(engine.idle());
    }

    #[test]
    fn waiting_task_resumes_after_transition() {
        let mut b = ComponentBuilder::new("staged");
        let pos = b.input("pos", Value::Float(0.0));
        let slide = b.transition("slide", crate::transition::TransitionSpec::linear(pos, 1.0));
        let done = b.input("done", Value::Bool(false));
        let script = b.task(
            "script",
            vec![
                ActionOp::Start {
                    transition: slide,
                    to: constant(Value::Float(4.0)),
                    wait: true,
                },
                ActionOp::set(done, Value::Bool(true)),
            ],
        );
        let mut engine = engine_of(b);
        engine.spawn_task(script).unwrap();

        // First tick starts the transition and blocks the task.
        let values = engine.tick(0.5).unwrap();
        assert_eq!(values["done"], Value::Bool(false));
        // The transition started mid-tick; it advances from the next tick.
        let values = engine.tick(0.5).unwrap();
        assert_eq!(values["pos"], Value::Float(2.0));
        assert_eq!(values["done"], Value::Bool(false));

        // Completion releases the task within the same tick, so its final
        // step lands in that tick's transaction.
        let values = engine.tick(0.5).unwrap();
        assert_eq!(values["pos"], Value::Float(4.0));
        assert_eq!(values["done"], Value::Bool(true));
        assert!(engine.idle());
    }

    #[test]
    fn stream_advance_is_replayable() {
        let build = || {
            let mut b = ComponentBuilder::new("rolls");
            let roll = b.random_stream("roll", 42);
            let bump = b.input("bump", Value::Bool(false));
            b.observer(
                "on_bump",
                move |ctx| ctx.read(bump),
                vec![ActionOp::advance_stream(roll)],
            );
            (b, bump)
        };

        let run = || {
            let (b, bump) = build();
            let mut engine = engine_of(b);
            let mut txn = Transaction::new();
            txn.assign(bump, Value::Bool(true));
            engine.commit(txn).unwrap()["roll"].clone()
        };

        // Identical seed and advance sequence: identical draw.
        assert_eq!(run(), run());
    }
}
