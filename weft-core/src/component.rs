//! Component Definitions
//!
//! A [`ComponentDef`] is the compiled form a front end hands to the
//! evaluator: the node list, expressions as closures over node ids,
//! observers with their actions, task bodies, and random streams. The
//! front end has already type-checked everything; the builder here still
//! performs the registration-time shape validation the evaluator owns:
//! name resolution, action targets matching node kinds, and inductive
//! sequence shapes.
//!
//! Structural errors (`UnresolvedDependency`, `InvalidInductiveReference`)
//! surface from [`ComponentBuilder::build`] or from the registering call
//! itself, and abort instantiation; they are never deferred to runtime.

use indexmap::IndexMap;

use crate::error::EngineError;
use crate::graph::{EvalCtx, Graph, NodeId, NodeKind};
use crate::random::DeterministicRng;
use crate::sequence::{SequenceSpec, SequenceState};
use crate::task::{Action, ActionOp, TaskDef, TaskId, TaskRunner};
use crate::transition::TransitionSpec;
use crate::value::Value;

/// Builder for a component definition.
///
/// Declaration methods hand back the [`NodeId`] the expression closures
/// capture, so references are resolved by construction; dangling references
/// can only enter through raw ids, and those are checked at build time.
pub struct ComponentBuilder {
    name: String,
    graph: Graph,
    index: IndexMap<String, NodeId>,
    observers: Vec<(NodeId, Action)>,
    tasks: TaskRunner,
    streams: IndexMap<NodeId, DeterministicRng>,
    error: Option<EngineError>,
}

impl ComponentBuilder {
    /// Start a definition for a component with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            graph: Graph::new(),
            index: IndexMap::new(),
            observers: Vec::new(),
            tasks: TaskRunner::new(),
            streams: IndexMap::new(),
            error: None,
        }
    }

    fn declare(&mut self, name: &str, kind: NodeKind) -> NodeId {
        if self.index.contains_key(name) && self.error.is_none() {
            self.error = Some(EngineError::UnresolvedDependency {
                name: format!("duplicate declaration of `{name}`"),
            });
        }
        let id = self.graph.add_node(name.to_string(), kind);
        self.index.insert(name.to_string(), id);
        id
    }

    /// Declare an input with its initial value.
    pub fn input(&mut self, name: &str, initial: Value) -> NodeId {
        let id = self.declare(name, NodeKind::Input);
        self.graph.node_mut(id).memo = Some(initial);
        id
    }

    /// Declare a property: a derived value visible in the exported shape.
    pub fn property<F>(&mut self, name: &str, expr: F) -> NodeId
    where
        F: Fn(&mut EvalCtx<'_>) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.declare(
            name,
            NodeKind::Property {
                expr: std::sync::Arc::new(expr),
            },
        )
    }

    /// Declare a local: a derived value private to the component body.
    pub fn local<F>(&mut self, name: &str, expr: F) -> NodeId
    where
        F: Fn(&mut EvalCtx<'_>) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        self.declare(
            name,
            NodeKind::Local {
                expr: std::sync::Arc::new(expr),
            },
        )
    }

    /// Declare a sequence. Its shape is validated immediately; a
    /// non-positive offset or a base region too shallow for the deepest
    /// offset rejects the registration.
    pub fn sequence(&mut self, name: &str, spec: SequenceSpec) -> Result<NodeId, EngineError> {
        spec.validate(name)?;
        Ok(self.declare(name, NodeKind::Sequence(SequenceState::new(spec))))
    }

    /// Declare an observer: an edge-triggered predicate with an action.
    pub fn observer<F>(&mut self, name: &str, predicate: F, action: Vec<ActionOp>) -> NodeId
    where
        F: Fn(&mut EvalCtx<'_>) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        let id = self.declare(
            name,
            NodeKind::Observer {
                predicate: std::sync::Arc::new(predicate),
            },
        );
        self.observers.push((id, std::sync::Arc::new(action)));
        id
    }

    /// Declare an event slot.
    pub fn event(&mut self, name: &str) -> NodeId {
        self.declare(name, NodeKind::Event)
    }

    /// Declare a transition node.
    pub fn transition(&mut self, name: &str, spec: TransitionSpec) -> NodeId {
        self.declare(name, NodeKind::Transition(spec))
    }

    /// Declare a spawned task body.
    pub fn task(&mut self, name: &str, steps: Vec<ActionOp>) -> TaskId {
        self.tasks
            .add_def(TaskDef::new(name.to_string(), std::sync::Arc::new(steps)))
    }

    /// Declare a deterministic random stream as an input. Its first draw
    /// is the initial value; later draws happen only through explicit
    /// stream-advance operations.
    pub fn random_stream(&mut self, name: &str, seed: u64) -> NodeId {
        let mut rng = DeterministicRng::new(seed);
        let initial = rng.next_value();
        let id = self.input(name, initial);
        self.streams.insert(id, rng);
        id
    }

    /// Resolve a declared name.
    pub fn resolve(&self, name: &str) -> Result<NodeId, EngineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnresolvedDependency {
                name: name.to_string(),
            })
    }

    /// Finish the definition, validating every cross-reference.
    pub fn build(self) -> Result<ComponentDef, EngineError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        for (id, action) in &self.observers {
            validate_ops(&self.graph, &self.tasks, &self.streams, action).map_err(|e| {
                annotate(e, self.graph.name_of(*id))
            })?;
        }
        for def in &self.tasks.defs {
            validate_ops(&self.graph, &self.tasks, &self.streams, &def.steps)
                .map_err(|e| annotate(e, def.name()))?;
        }
        for id in self.graph.node_ids().collect::<Vec<_>>() {
            if let NodeKind::Transition(spec) = self.graph.kind_of(id) {
                require_kind(&self.graph, spec.target(), "input", |k| {
                    matches!(k, NodeKind::Input)
                })
                .map_err(|e| annotate(e, self.graph.name_of(id)))?;
            }
        }

        Ok(ComponentDef {
            name: self.name,
            graph: self.graph,
            index: self.index,
            observers: self.observers,
            tasks: self.tasks,
            streams: self.streams,
        })
    }
}

fn annotate(err: EngineError, context: &str) -> EngineError {
    match err {
        EngineError::UnresolvedDependency { name } => EngineError::UnresolvedDependency {
            name: format!("{name} (in `{context}`)"),
        },
        other => other,
    }
}

fn require_kind(
    graph: &Graph,
    id: NodeId,
    expected: &str,
    check: impl Fn(&NodeKind) -> bool,
) -> Result<(), EngineError> {
    match graph.node(id) {
        Some(node) if check(node.kind()) => Ok(()),
        Some(node) => Err(EngineError::UnresolvedDependency {
            name: format!("`{}` is not an {expected}", node.name()),
        }),
        None => Err(EngineError::UnresolvedDependency {
            name: format!("node #{}", id.raw()),
        }),
    }
}

/// Check every operation of an action against the node kinds it targets.
fn validate_ops(
    graph: &Graph,
    tasks: &TaskRunner,
    streams: &IndexMap<NodeId, DeterministicRng>,
    ops: &[ActionOp],
) -> Result<(), EngineError> {
    for op in ops {
        match op {
            ActionOp::Assign { input, .. } => {
                require_kind(graph, *input, "input", |k| matches!(k, NodeKind::Input))?;
            }
            ActionOp::Trigger { event, .. } => {
                require_kind(graph, *event, "event", |k| matches!(k, NodeKind::Event))?;
            }
            ActionOp::Start { transition, .. } => {
                require_kind(graph, *transition, "transition", |k| {
                    matches!(k, NodeKind::Transition(_))
                })?;
            }
            ActionOp::Spawn { task } => {
                if task.0 >= tasks.defs.len() {
                    return Err(EngineError::UnresolvedDependency {
                        name: format!("task #{}", task.0),
                    });
                }
            }
            ActionOp::AdvanceStream { stream } => {
                if !streams.contains_key(stream) {
                    return Err(EngineError::UnresolvedDependency {
                        name: format!("`{}` is not a random stream", graph.name_of(*stream)),
                    });
                }
            }
        }
    }
    Ok(())
}

/// A validated, ready-to-instantiate component definition.
pub struct ComponentDef {
    pub(crate) name: String,
    pub(crate) graph: Graph,
    pub(crate) index: IndexMap<String, NodeId>,
    pub(crate) observers: Vec<(NodeId, Action)>,
    pub(crate) tasks: TaskRunner,
    pub(crate) streams: IndexMap<NodeId, DeterministicRng>,
}

impl std::fmt::Debug for ComponentDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDef")
            .field("name", &self.name)
            .field("node_count", &self.graph.node_count())
            .finish_non_exhaustive()
    }
}

impl ComponentDef {
    /// The component's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of declared nodes.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = ComponentBuilder::new("demo");
        b.input("x", Value::Int(1));
        b.input("x", Value::Int(2));
        assert!(matches!(
            b.build(),
            Err(EngineError::UnresolvedDependency { .. })
        ));
    }

    #[test]
    fn assign_target_must_be_an_input() {
        let mut b = ComponentBuilder::new("demo");
        let x = b.input("x", Value::Int(0));
        let y = b.property("y", move |ctx| ctx.read(x));
        b.observer(
            "bad",
            move |ctx| Ok(Value::Bool(ctx.read(x)?.as_int().unwrap_or(0) > 0)),
            vec![ActionOp::set(y, Value::Int(0))],
        );
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("not an input"));
    }

    #[test]
    fn transition_target_must_be_an_input() {
        let mut b = ComponentBuilder::new("demo");
        let x = b.input("x", Value::Float(0.0));
        let y = b.property("y", move |ctx| ctx.read(x));
        b.transition("slide", TransitionSpec::linear(y, 1.0));
        assert!(b.build().is_err());
    }

    #[test]
    fn bad_sequence_shape_fails_at_registration() {
        let mut b = ComponentBuilder::new("demo");
        let spec = SequenceSpec::new(
            1,
            None,
            vec![],
            [1],
            Arc::new(|ctx: &mut EvalCtx<'_>| ctx.prior(1)),
        );
        let err = b.sequence("s", spec).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidInductiveReference { .. }
        ));
    }

    #[test]
    fn spawn_of_unknown_task_is_rejected() {
        let mut b = ComponentBuilder::new("demo");
        let x = b.input("x", Value::Int(0));
        b.observer(
            "spawner",
            move |ctx| Ok(Value::Bool(ctx.read(x)?.as_int().unwrap_or(0) > 0)),
            vec![ActionOp::spawn(TaskId(7))],
        );
        assert!(b.build().is_err());
    }

    #[test]
    fn valid_definition_builds() {
        let mut b = ComponentBuilder::new("demo");
        let x = b.input("x", Value::Int(1));
        b.property("y", move |ctx| {
            Ok(Value::Int(ctx.read(x)?.as_int().unwrap_or(0) + 1))
        });
        let def = b.build().unwrap();
        assert_eq!(def.name(), "demo");
        assert_eq!(def.node_count(), 2);
    }
}
