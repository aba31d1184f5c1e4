//! Value Model
//!
//! `Value` is the immutable tagged data unit that flows through the
//! dependency graph. Every node's memoized result, every input assignment,
//! and every event payload is a `Value`.
//!
//! # Immutability and Sharing
//!
//! Values are never mutated in place. Compound shapes (lists, records,
//! choice payloads) hold their contents behind `Arc`, so cloning a value is
//! cheap and snapshots share unchanged subtrees structurally instead of
//! copying them.
//!
//! # Sequences
//!
//! An unbounded sequence is a legal value: `Value::Sequence` is only a
//! handle to the generating node. Nothing is materialized until an element
//! is forced through the graph's `element` operation.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::graph::NodeId;

/// An immutable tagged data unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The absent value. Events read as `Nothing` outside the transaction
    /// in which they fire.
    Nothing,
    /// A boolean scalar.
    Bool(bool),
    /// An integer scalar.
    Int(i64),
    /// A floating-point scalar.
    Float(f64),
    /// A text scalar.
    Text(Arc<str>),
    /// A finite list of values.
    List(Arc<Vec<Value>>),
    /// A record of named fields, in declaration order.
    Record(Arc<IndexMap<String, Value>>),
    /// A choice (tagged variant) with a payload.
    Choice {
        /// The variant tag.
        tag: Arc<str>,
        /// The variant payload.
        payload: Arc<Value>,
    },
    /// A handle to a (possibly unbounded) sequence node. Elements are
    /// forced individually through the graph; the handle itself never
    /// materializes anything.
    Sequence(NodeId),
}

impl Value {
    /// Build a text value.
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(Arc::from(s.as_ref()))
    }

    /// Build a list value.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    /// Build a record value from `(name, value)` pairs, keeping order.
    pub fn record<K>(fields: impl IntoIterator<Item = (K, Value)>) -> Self
    where
        K: Into<String>,
    {
        Value::Record(Arc::new(
            fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Build a choice value.
    pub fn choice(tag: impl AsRef<str>, payload: Value) -> Self {
        Value::Choice {
            tag: Arc::from(tag.as_ref()),
            payload: Arc::new(payload),
        }
    }

    /// The integer content, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// The numeric content as `f64`, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// The boolean content, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The text content, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// A field of a record value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Predicate truth: `Bool(true)` is true, everything else is false.
    ///
    /// Observer predicates are expected to produce booleans; a non-boolean
    /// predicate value never fires an observer.
    pub fn is_truthy(&self) -> bool {
        matches!(self, Value::Bool(true))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::text(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nothing => write!(f, "nothing"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Value::Choice { tag, payload } => write!(f, "{tag}({payload})"),
            Value::Sequence(id) => write!(f, "<sequence #{}>", id.raw()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_compound_contents() {
        let list = Value::list([Value::Int(1), Value::Int(2)]);
        let copy = list.clone();

        match (&list, &copy) {
            (Value::List(a), Value::List(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected lists"),
        }
    }

    #[test]
    fn equality_is_by_content() {
        let a = Value::record([("x", Value::Int(1))]);
        let b = Value::record([("x", Value::Int(1))]);
        assert_eq!(a, b);

        let c = Value::record([("x", Value::Int(2))]);
        assert_ne!(a, c);
    }

    #[test]
    fn truthiness_is_strict() {
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(1).is_truthy());
        assert!(!Value::Nothing.is_truthy());
    }

    #[test]
    fn record_field_access() {
        let v = Value::record([("pos", Value::Float(0.5)), ("done", Value::Bool(false))]);
        assert_eq!(v.field("pos"), Some(&Value::Float(0.5)));
        assert_eq!(v.field("missing"), None);
    }

    #[test]
    fn serde_round_trip() {
        let v = Value::record([
            ("label", Value::text("hello")),
            ("items", Value::list([Value::Int(1), Value::Float(2.5)])),
            ("pick", Value::choice("some", Value::Bool(true))),
        ]);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
