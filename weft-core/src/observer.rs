//! Responsive Observer Engine
//!
//! An observer is a persistent predicate watcher with an action attached.
//! It is edge-triggered: the action fires exactly when the predicate is
//! observed transitioning false to true, and cannot fire again until the
//! predicate has been observed false once more (the armed latch).
//!
//! # State Machine
//!
//! `Unarmed(false) -> fire, Armed(true) -> Unarmed(false) -> ...`, with the
//! initial latch derived from the predicate's value at component
//! construction (a predicate that is already true at build time does not
//! fire).
//!
//! # Ordering
//!
//! Within one transaction pass every observer's predicate is re-read
//! through the graph, so unchanged predicates cost nothing thanks to
//! memoization. When several predicates become true in the same pass, their
//! actions run in declaration order. The source language leaves this
//! ordering unspecified; declaration order is this engine's documented,
//! deterministic choice.
//!
//! Edge-triggering plus the transaction manager's iteration ceiling is the
//! system's whole defense against user-written feedback loops: no static
//! cycle proof is attempted.

use tracing::debug;

use crate::error::EngineError;
use crate::graph::{Graph, NodeId};
use crate::task::Action;

/// One registered observer: its predicate node, its action, and the armed
/// latch. The latch is transaction-scoped mutable state owned here, not
/// part of the node.
pub(crate) struct ObserverEntry {
    pub(crate) node: NodeId,
    pub(crate) action: Action,
    pub(crate) armed: bool,
}

/// All observers of one component, in declaration order.
#[derive(Default)]
pub(crate) struct ObserverSet {
    entries: Vec<ObserverEntry>,
}

impl ObserverSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, node: NodeId, action: Action) {
        self.entries.push(ObserverEntry {
            node,
            action,
            armed: false,
        });
    }

    /// Silently refresh every latch from its predicate's current value.
    /// Used at construction, and again after event payloads reset at the
    /// end of a commit so a later firing of the same event re-arms its
    /// observers.
    pub(crate) fn rearm(&mut self, graph: &mut Graph) -> Result<(), EngineError> {
        for entry in &mut self.entries {
            entry.armed = graph.value(entry.node)?.is_truthy();
        }
        Ok(())
    }

    /// One observer pass: re-read every predicate against the current
    /// state and collect the actions of observers that transitioned
    /// false to true, in declaration order.
    pub(crate) fn scan(&mut self, graph: &mut Graph) -> Result<Vec<Action>, EngineError> {
        let mut fired = Vec::new();
        for entry in &mut self.entries {
            let now = graph.value(entry.node)?.is_truthy();
            match (entry.armed, now) {
                (false, true) => {
                    debug!(observer = graph.name_of(entry.node), "observer fired");
                    entry.armed = true;
                    fired.push(entry.action.clone());
                }
                (true, false) => {
                    // Re-arm silently; no action on the falling edge.
                    entry.armed = false;
                }
                _ => {}
            }
        }
        Ok(fired)
    }

    /// Latch states in declaration order, for transaction rollback.
    pub(crate) fn latches(&self) -> Vec<bool> {
        self.entries.iter().map(|e| e.armed).collect()
    }

    /// Restore latch states captured by [`ObserverSet::latches`].
    pub(crate) fn restore_latches(&mut self, latches: &[bool]) {
        for (entry, &armed) in self.entries.iter_mut().zip(latches) {
            entry.armed = armed;
        }
    }

    #[cfg(test)]
    pub(crate) fn armed(&self, node: NodeId) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.node == node)
            .map(|e| e.armed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::graph::NodeKind;
    use crate::value::Value;

    /// Build a graph with a bool input, an observer on it, and an empty
    /// action; returns (graph, set, input, observer).
    fn watcher() -> (Graph, ObserverSet, NodeId, NodeId) {
        let mut graph = Graph::new();
        let flag = graph.add_node("flag".into(), NodeKind::Input);
        graph.node_mut(flag).memo = Some(Value::Bool(false));
        let obs = graph.add_node(
            "on_flag".into(),
            NodeKind::Observer {
                predicate: Arc::new(move |ctx| ctx.read(flag)),
            },
        );
        let mut set = ObserverSet::new();
        set.add(obs, Arc::new(Vec::new()));
        set.rearm(&mut graph).unwrap();
        (graph, set, flag, obs)
    }

    #[test]
    fn fires_only_on_rising_edges() {
        let (mut graph, mut set, flag, _) = watcher();

        // Observed predicate trace: false, true, true, false, true.
        let trace = [false, true, true, false, true];
        let mut fires = 0;
        for step in trace {
            graph.assign(flag, Value::Bool(step));
            fires += set.scan(&mut graph).unwrap().len();
        }
        // Rising edges at positions 2 and 5 only.
        assert_eq!(fires, 2);
    }

    #[test]
    fn initially_true_predicate_starts_armed() {
        let mut graph = Graph::new();
        let flag = graph.add_node("flag".into(), NodeKind::Input);
        graph.node_mut(flag).memo = Some(Value::Bool(true));
        let obs = graph.add_node(
            "on_flag".into(),
            NodeKind::Observer {
                predicate: Arc::new(move |ctx| ctx.read(flag)),
            },
        );
        let mut set = ObserverSet::new();
        set.add(obs, Arc::new(Vec::new()));
        set.rearm(&mut graph).unwrap();

        // Already true at construction: no fire until it goes false first.
        assert!(set.scan(&mut graph).unwrap().is_empty());
        graph.assign(flag, Value::Bool(false));
        assert!(set.scan(&mut graph).unwrap().is_empty());
        graph.assign(flag, Value::Bool(true));
        assert_eq!(set.scan(&mut graph).unwrap().len(), 1);
    }

    #[test]
    fn falling_edge_rearms_without_firing() {
        let (mut graph, mut set, flag, obs) = watcher();

        graph.assign(flag, Value::Bool(true));
        assert_eq!(set.scan(&mut graph).unwrap().len(), 1);
        assert_eq!(set.armed(obs), Some(true));

        graph.assign(flag, Value::Bool(false));
        assert!(set.scan(&mut graph).unwrap().is_empty());
        assert_eq!(set.armed(obs), Some(false));
    }

    #[test]
    fn latch_backup_round_trips() {
        let (mut graph, mut set, flag, obs) = watcher();
        let saved = set.latches();

        graph.assign(flag, Value::Bool(true));
        set.scan(&mut graph).unwrap();
        assert_eq!(set.armed(obs), Some(true));

        set.restore_latches(&saved);
        assert_eq!(set.armed(obs), Some(false));
    }
}
