//! Component Instances
//!
//! The host-facing surface of the runtime. A [`ComponentInstance`] owns one
//! engine and publishes its state as a chain of immutable [`Snapshot`]s:
//! the host reads snapshots freely from any thread, while all mutation
//! funnels through transactions on the instance.
//!
//! # Why Snapshots
//!
//! Rendering and logic must not race. A renderer that walks a snapshot
//! mid-transaction would see half a batch applied; instead every commit
//! produces a complete new snapshot and swaps it in atomically. Holding an
//! old snapshot is always safe, it just describes an earlier revision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::component::ComponentDef;
use crate::error::EngineError;
use crate::graph::{NodeId, NodeKind};
use crate::snapshot::Snapshot;
use crate::task::TaskId;
use crate::transaction::{Engine, EngineConfig, Transaction};
use crate::value::Value;

/// Handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    node: Option<NodeId>,
    callback: ChangeCallback,
}

/// A live component: engine state plus the published snapshot chain.
pub struct ComponentInstance {
    engine: Mutex<Engine>,
    published: RwLock<Arc<Snapshot>>,
    subscribers: RwLock<Vec<Subscription>>,
    next_sub: AtomicU64,
}

impl ComponentInstance {
    /// Instantiate a component with its declared initial values.
    pub fn instantiate(def: ComponentDef) -> Result<Self, EngineError> {
        Self::instantiate_with(def, Vec::new(), EngineConfig::default())
    }

    /// Instantiate with input overrides and engine configuration. The
    /// overrides apply before the initial snapshot, so revision zero
    /// already reflects them.
    pub fn instantiate_with(
        def: ComponentDef,
        initial: Vec<(String, Value)>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let name = def.name().to_string();
        let mut engine = Engine::from_def(def, initial, config)?;
        let values = engine.export()?;
        let snapshot = Snapshot::initial(values, engine.export_ids());
        debug!(component = name.as_str(), "component instantiated");
        Ok(Self {
            engine: Mutex::new(engine),
            published: RwLock::new(Arc::new(snapshot)),
            subscribers: RwLock::new(Vec::new()),
            next_sub: AtomicU64::new(0),
        })
    }

    /// The current published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.published.read().clone()
    }

    /// Resolve a declared name to its node.
    pub fn node_id(&self, name: &str) -> Result<NodeId, EngineError> {
        self.engine.lock().resolve(name)
    }

    /// Run a batch of reassignments and triggers as one transaction and
    /// publish the resulting snapshot.
    pub fn transaction<F>(&self, build: F) -> Result<Arc<Snapshot>, EngineError>
    where
        F: FnOnce(&mut TransactionBuilder<'_>) -> Result<(), EngineError>,
    {
        let mut engine = self.engine.lock();
        let mut txn = Transaction::new();
        build(&mut TransactionBuilder {
            engine: &mut *engine,
            txn: &mut txn,
        })?;
        let values = engine.commit(txn)?;
        let next = self.install(values);
        drop(engine);
        self.notify(&next);
        Ok(next)
    }

    /// Reassign one input in its own transaction.
    pub fn reassign_input(&self, name: &str, value: Value) -> Result<Arc<Snapshot>, EngineError> {
        self.transaction(|txn| txn.assign(name, value))
    }

    /// Fire one event in its own transaction.
    pub fn trigger_event(&self, name: &str, payload: Value) -> Result<Arc<Snapshot>, EngineError> {
        self.transaction(|txn| txn.trigger(name, payload))
    }

    /// Draw the next value of a random stream in its own transaction.
    pub fn advance_stream(&self, name: &str) -> Result<Arc<Snapshot>, EngineError> {
        self.transaction(|txn| txn.advance_stream(name))
    }

    /// Start a transition toward `to`, in its own transaction.
    pub fn start_transition(&self, name: &str, to: Value) -> Result<Arc<Snapshot>, EngineError> {
        self.transaction(|txn| txn.start_transition(name, to))
    }

    /// Enqueue a run of a spawned task; it first executes on the next tick.
    pub fn spawn_task(&self, task: TaskId) -> Result<(), EngineError> {
        self.engine.lock().spawn_task(task)
    }

    /// Advance time by `delta` seconds: transitions interpolate, blocked
    /// tasks resume, and the combined effects commit as one transaction.
    pub fn tick(&self, delta: f64) -> Result<Arc<Snapshot>, EngineError> {
        let mut engine = self.engine.lock();
        let values = engine.tick(delta)?;
        let next = self.install(values);
        drop(engine);
        self.notify(&next);
        Ok(next)
    }

    /// Whether no transitions or task runs are pending.
    pub fn idle(&self) -> bool {
        self.engine.lock().idle()
    }

    /// Force one element of a named sequence. Elements outside the cached
    /// window are recomputed from the start of the sequence.
    pub fn element(&self, name: &str, index: i64) -> Result<Value, EngineError> {
        let mut engine = self.engine.lock();
        let id = engine.resolve(name)?;
        engine.element(id, index)
    }

    /// Register a callback invoked after every commit that changed `node`
    /// (or after every commit at all, when `node` is `None`). The callback
    /// receives the freshly published snapshot.
    pub fn subscribe<F>(&self, node: Option<NodeId>, callback: F) -> SubscriptionId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_sub.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscription {
            id,
            node,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscription. Removing an unknown id is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Cancel all pending transitions and task runs (teardown).
    pub fn cancel_pending(&self) {
        self.engine.lock().cancel_pending();
    }

    /// Swap the published snapshot. Callers hold the engine lock across
    /// this swap, so publication order matches commit order and each
    /// snapshot's change-set is diffed against its true predecessor.
    fn install(&self, values: indexmap::IndexMap<String, Value>) -> Arc<Snapshot> {
        let mut published = self.published.write();
        let next = Arc::new(Snapshot::next(&published, values));
        *published = next.clone();
        next
    }

    fn notify(&self, next: &Arc<Snapshot>) {
        // Collect matching callbacks under the read lock, invoke outside
        // it so a callback may subscribe or unsubscribe.
        let to_call: Vec<ChangeCallback> = {
            let subs = self.subscribers.read();
            subs.iter()
                .filter(|s| match s.node {
                    Some(node) => next.has_changed(node),
                    None => true,
                })
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in to_call {
            callback(next);
        }
    }
}

/// Mutation surface handed to [`ComponentInstance::transaction`] closures.
pub struct TransactionBuilder<'a> {
    engine: &'a mut Engine,
    txn: &'a mut Transaction,
}

impl TransactionBuilder<'_> {
    /// Queue a reassignment of the named input.
    pub fn assign(&mut self, name: &str, value: Value) -> Result<(), EngineError> {
        let id = self.engine.resolve(name)?;
        if !matches!(self.engine.kind_of(id), NodeKind::Input) {
            return Err(EngineError::UnresolvedDependency {
                name: format!("`{name}` is not an input"),
            });
        }
        self.txn.assign(id, value);
        Ok(())
    }

    /// Queue a firing of the named event.
    pub fn trigger(&mut self, name: &str, payload: Value) -> Result<(), EngineError> {
        let id = self.engine.resolve(name)?;
        if !matches!(self.engine.kind_of(id), NodeKind::Event) {
            return Err(EngineError::UnresolvedDependency {
                name: format!("`{name}` is not an event"),
            });
        }
        self.txn.trigger(id, payload);
        Ok(())
    }

    /// Queue the next draw of the named random stream.
    pub fn advance_stream(&mut self, name: &str) -> Result<(), EngineError> {
        let id = self.engine.resolve(name)?;
        self.engine.advance_stream(id, self.txn)
    }

    /// Start the named transition toward a constant end value.
    pub fn start_transition(&mut self, name: &str, to: Value) -> Result<(), EngineError> {
        let id = self.engine.resolve(name)?;
        let to = crate::task::constant(to);
        self.engine.start_transition(id, &to, self.txn)
    }
}
