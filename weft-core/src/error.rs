//! Engine Error Taxonomy
//!
//! Errors fall into two families with different propagation policies:
//!
//! - Structural errors (`UnresolvedDependency`, `InvalidInductiveReference`)
//!   come from a malformed component definition. They are detected while the
//!   definition is registered and abort instantiation. They are programmer
//!   errors and are not recoverable at runtime.
//!
//! - Runtime errors (`CyclicEvaluation`, `FeedbackLoopDetected`) abort the
//!   current transaction only. The engine rolls back to the last committed
//!   snapshot and surfaces the error as a diagnostic; the instance stays
//!   usable.
//!
//! `IndexOutOfRange` sits apart: it is a normal value-level failure returned
//! to the reading expression, which may handle it (for example by
//! substituting a default) instead of letting it abort the transaction.

use thiserror::Error;

/// Errors produced by the evaluation core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Evaluation re-entered a node that is already mid-evaluation.
    ///
    /// The front end is expected to reject cyclic definitions statically;
    /// this is the runtime backstop that turns a missed cycle into an
    /// aborted transaction instead of unbounded recursion.
    #[error("cyclic evaluation: node `{name}` was re-entered while already being computed")]
    CyclicEvaluation {
        /// Name of the node that was re-entered.
        name: String,
    },

    /// A sequence formula referenced itself with an offset that is not a
    /// positive constant, or with an offset that was not declared.
    #[error("invalid inductive reference in sequence `{name}`: offset {offset}")]
    InvalidInductiveReference {
        /// Name of the sequence with the bad self-reference.
        name: String,
        /// The offending offset.
        offset: i64,
    },

    /// The observer pass did not reach a fixed point within the configured
    /// iteration ceiling. The transaction is aborted and rolled back.
    #[error("feedback loop detected: observer passes exceeded the limit of {limit}")]
    FeedbackLoopDetected {
        /// The configured iteration ceiling that was exceeded.
        limit: usize,
    },

    /// A definition referenced a name or id that does not resolve, or used
    /// a node in a role its kind does not support (for example assigning to
    /// a property). Fatal at registration time.
    #[error("unresolved dependency: {name}")]
    UnresolvedDependency {
        /// Description of the unresolved reference.
        name: String,
    },

    /// A sequence element was requested outside the sequence's index range.
    #[error("index {index} is out of range for sequence `{name}`")]
    IndexOutOfRange {
        /// Name of the sequence.
        name: String,
        /// The requested index.
        index: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = EngineError::IndexOutOfRange {
            name: "fib".into(),
            index: -3,
        };
        let text = err.to_string();
        assert!(text.contains("fib"));
        assert!(text.contains("-3"));
    }
}
