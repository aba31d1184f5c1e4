//! Committed Snapshots
//!
//! A snapshot is the immutable, fully-resolved view of a component's
//! exported state at one transaction boundary. Host reads always see a
//! snapshot, never in-progress engine state; each commit replaces the
//! published snapshot wholesale.
//!
//! Snapshots share structure: the value tree is behind `Arc` and individual
//! values share their compound contents, so an unchanged subtree costs a
//! pointer, not a copy.
//!
//! Every snapshot carries a change-set: the ids of the nodes whose value
//! differs from the previous snapshot. Hosts use it to re-bind only what
//! moved.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::graph::NodeId;
use crate::value::Value;

/// An immutable view of a component's exported state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    revision: u64,
    /// Exported values by declared name, in declaration order.
    values: Arc<IndexMap<String, Value>>,
    /// Name-to-id map for the exported nodes.
    ids: Arc<IndexMap<String, NodeId>>,
    /// Nodes whose value changed since the previous snapshot.
    changed: Arc<Vec<NodeId>>,
}

impl Snapshot {
    /// Build the first snapshot of an instance. Everything counts as
    /// changed.
    pub(crate) fn initial(
        values: IndexMap<String, Value>,
        ids: Arc<IndexMap<String, NodeId>>,
    ) -> Self {
        let changed = ids.values().copied().collect();
        Self {
            revision: 0,
            values: Arc::new(values),
            ids,
            changed: Arc::new(changed),
        }
    }

    /// Build the snapshot following `prev`, deriving the change-set by
    /// value comparison.
    pub(crate) fn next(prev: &Snapshot, values: IndexMap<String, Value>) -> Self {
        let ids = prev.ids.clone();
        let changed = ids
            .iter()
            .filter(|(name, _)| values.get(*name) != prev.values.get(*name))
            .map(|(_, id)| *id)
            .collect();
        Self {
            revision: prev.revision + 1,
            values: Arc::new(values),
            ids,
            changed: Arc::new(changed),
        }
    }

    /// The commit counter. Snapshots of one instance are totally ordered
    /// by revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The exported value of a node, by declared name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// The id of an exported node, by declared name.
    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.ids.get(name).copied()
    }

    /// Iterate `(name, value)` pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Ids of nodes whose value changed since the previous snapshot.
    pub fn changed(&self) -> &[NodeId] {
        &self.changed
    }

    /// Whether a node changed in this snapshot.
    pub fn has_changed(&self, id: NodeId) -> bool {
        self.changed.contains(&id)
    }

    /// Whether a node changed, by declared name.
    pub fn has_changed_name(&self, name: &str) -> bool {
        self.id_of(name).is_some_and(|id| self.has_changed(id))
    }

    /// The exported value tree as JSON, for host-side binding layers.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(&*self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Arc<IndexMap<String, NodeId>> {
        Arc::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), NodeId::from_index(i)))
                .collect(),
        )
    }

    fn values(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn initial_snapshot_marks_everything_changed() {
        let snap = Snapshot::initial(
            values(&[("x", Value::Int(1)), ("y", Value::Int(2))]),
            ids(&["x", "y"]),
        );
        assert_eq!(snap.revision(), 0);
        assert_eq!(snap.changed().len(), 2);
        assert_eq!(snap.get("x"), Some(&Value::Int(1)));
    }

    #[test]
    fn change_set_is_by_value_comparison() {
        let first = Snapshot::initial(
            values(&[("x", Value::Int(1)), ("y", Value::Int(2))]),
            ids(&["x", "y"]),
        );
        let second = Snapshot::next(&first, values(&[("x", Value::Int(1)), ("y", Value::Int(9))]));

        assert_eq!(second.revision(), 1);
        assert!(!second.has_changed_name("x"));
        assert!(second.has_changed_name("y"));
        assert_eq!(second.changed(), &[NodeId::from_index(1)]);
    }

    #[test]
    fn json_export_mirrors_value_tree() {
        let snap = Snapshot::initial(
            values(&[("pos", Value::record([("x", Value::Float(1.5))]))]),
            ids(&["pos"]),
        );
        let json = snap.to_json().unwrap();
        assert_eq!(json["pos"]["x"], serde_json::json!(1.5));
    }
}
