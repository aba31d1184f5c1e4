//! Weft Core
//!
//! The evaluation core of the Weft reactive component runtime. A component
//! is a set of named formulas over a dependency graph: inputs and events
//! feed properties, locals, and inductively defined sequences; observers
//! watch predicates and fire actions; transitions and spawned tasks drive
//! state through time. The engine keeps everything consistent with lazy,
//! memoized pull evaluation and atomic transactions.
//!
//! # Architecture
//!
//! - [`graph`]: the arena-allocated dependency graph and its pull-based
//!   evaluator with adaptive memoization
//! - [`sequence`]: inductively defined sequences with a sliding-window
//!   element cache
//! - [`component`]: building and validating component definitions
//! - [`observer`], [`transition`], [`task`]: edge-triggered observers,
//!   tick-driven transitions, and cooperative task streams
//! - [`transaction`]: atomic batches with observer fixed-point resolution
//!   and rollback
//! - [`instance`], [`snapshot`]: the host-facing surface, publishing
//!   immutable snapshots with per-commit change-sets
//!
//! # Example
//!
//! ```
//! use weft_core::{ComponentBuilder, ComponentInstance, Value};
//!
//! let mut builder = ComponentBuilder::new("counter");
//! let count = builder.input("count", Value::Int(0));
//! builder.property("doubled", move |ctx| {
//!     Ok(Value::Int(ctx.read(count)?.as_int().unwrap_or(0) * 2))
//! });
//!
//! let instance = ComponentInstance::instantiate(builder.build()?)?;
//! let snapshot = instance.reassign_input("count", Value::Int(4))?;
//! assert_eq!(snapshot.get("doubled"), Some(&Value::Int(8)));
//! # Ok::<(), weft_core::EngineError>(())
//! ```

pub mod component;
pub mod error;
pub mod graph;
pub mod instance;
pub mod observer;
pub mod random;
pub mod sequence;
pub mod snapshot;
pub mod task;
pub mod transaction;
pub mod transition;
pub mod value;

pub use component::{ComponentBuilder, ComponentDef};
pub use error::EngineError;
pub use graph::{DirtyState, EvalCtx, ExprFn, Graph, NodeId, NodeKind, ReadKey};
pub use instance::{ComponentInstance, SubscriptionId, TransactionBuilder};
pub use random::DeterministicRng;
pub use sequence::SequenceSpec;
pub use snapshot::Snapshot;
pub use task::{constant, Action, ActionOp, TaskDef, TaskId};
pub use transaction::{EngineConfig, Transaction};
pub use transition::{lerp, InterpFn, TransitionSpec};
pub use value::Value;
