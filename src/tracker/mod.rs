//! Tracker
//!
//! The single in-memory view of the tree. Owns the backend, the node handle
//! cache, every subscription and the query cache. All state sits behind one
//! mutex that is never held across an await point; query runs happen in
//! spawned tasks and report back through [`Tracker::publish_query`].

mod checks;
pub mod handle;
pub mod query;
pub mod subscription;
pub mod transaction;

pub use query::{QueryKey, QueryOutcome, QueryRunner};
pub use subscription::{Delivery, Event, Sink, SubscriptionId};

use crate::backend::{Backend, SqliteBackend};
use crate::error::VelesError;
use crate::schema::{Check, Node, Operation, PosFilter, Value};
use crate::types::NodeID;
use bytes::Bytes;
use handle::HandleCache;
use parking_lot::{Mutex, RwLock};
use query::{QueryManager, QueryRun};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use subscription::{SubEntry, SubKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default number of unsubscribed nodes kept in memory
pub const DEFAULT_HANDLE_CACHE_SIZE: usize = 1024;

/// Trigger state change produced by a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// Trigger became pending and needs a handler run
    Pending { node: NodeID, trigger: String },
    /// Pending trigger was removed; any in-flight run is moot
    Obsolete { node: NodeID, trigger: String },
}

struct TrackerState {
    backend: Box<dyn Backend>,
    handles: HandleCache,
    subs: HashMap<SubscriptionId, SubEntry>,
    /// Node, data and bindata subscriptions by node
    node_subs: HashMap<NodeID, BTreeSet<SubscriptionId>>,
    /// List subscriptions by parent
    list_subs: HashMap<NodeID, BTreeSet<SubscriptionId>>,
    queries: HashMap<QueryKey, QueryManager>,
    query_deps: HashMap<NodeID, HashSet<QueryKey>>,
    query_list_deps: HashMap<NodeID, HashSet<QueryKey>>,
    next_sub: SubscriptionId,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    runner: RwLock<Option<Weak<dyn QueryRunner>>>,
    triggers: RwLock<Option<mpsc::UnboundedSender<TriggerEvent>>>,
}

/// Shared handle to the tracker
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    pub fn new(backend: Box<dyn Backend>, handle_cache_size: usize) -> Self {
        let state = TrackerState {
            backend,
            handles: HandleCache::new(handle_cache_size),
            subs: HashMap::new(),
            node_subs: HashMap::new(),
            list_subs: HashMap::new(),
            queries: HashMap::new(),
            query_deps: HashMap::new(),
            query_list_deps: HashMap::new(),
            next_sub: 0,
        };
        Tracker {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(state),
                runner: RwLock::new(None),
                triggers: RwLock::new(None),
            }),
        }
    }

    /// Tracker over a fresh in-memory database.
    pub fn in_memory() -> Result<Self, VelesError> {
        Ok(Self::new(
            Box::new(SqliteBackend::in_memory()?),
            DEFAULT_HANDLE_CACHE_SIZE,
        ))
    }

    /// Install the component that executes queries for the query cache.
    pub fn set_query_runner(&self, runner: Weak<dyn QueryRunner>) {
        *self.inner.runner.write() = Some(runner);
    }

    /// Install the receiver of trigger state changes.
    pub fn set_trigger_sink(&self, sink: mpsc::UnboundedSender<TriggerEvent>) {
        *self.inner.triggers.write() = Some(sink);
    }

    // Reads

    pub fn get_node(&self, id: &NodeID) -> Result<Option<Node>, VelesError> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        state.handles.get(id, &*state.backend)
    }

    pub fn get_data(&self, id: &NodeID, key: &str) -> Result<Option<Value>, VelesError> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        let node = state
            .handles
            .get(id, &*state.backend)?
            .ok_or_else(|| VelesError::gone(id))?;
        state.read_data(&node, id, key)
    }

    pub fn get_bindata(
        &self,
        id: &NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Bytes, VelesError> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        if state.handles.get(id, &*state.backend)?.is_none() {
            return Err(VelesError::gone(id));
        }
        Ok(Bytes::from(state.backend.get_bindata(id, key, start, end)?))
    }

    pub fn get_list(
        &self,
        parent: &NodeID,
        tags: &BTreeSet<String>,
        pos_filter: &PosFilter,
    ) -> Result<Vec<Node>, VelesError> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        if !parent.is_root() && state.handles.get(parent, &*state.backend)?.is_none() {
            return Err(VelesError::gone(parent));
        }
        let ids = state.backend.list(parent, tags, pos_filter)?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = state.handles.get(&id, &*state.backend)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Whether a check holds against committed state.
    pub fn check(&self, check: &Check) -> Result<bool, VelesError> {
        self.inner.state.lock().check_holds(check)
    }

    pub fn pending_triggers(&self, trigger: &str) -> Result<Vec<NodeID>, VelesError> {
        Ok(self.inner.state.lock().backend.pending_triggers(trigger)?)
    }

    // Writes

    /// Verify `checks`, then apply `ops` atomically and notify subscribers.
    pub fn transaction(&self, checks: &[Check], ops: Vec<Operation>) -> Result<(), VelesError> {
        let (runs, triggers) = {
            let mut state = self.inner.state.lock();
            for check in checks {
                if !state.check_holds(check)? {
                    debug!(check = check.object_type(), node = %check.subject(), "Precondition failed");
                    return Err(VelesError::PreconditionFailed(format!(
                        "{} check on {}",
                        check.object_type(),
                        check.subject()
                    )));
                }
            }
            let ctx = state.run_transaction(ops)?;
            for (id, node) in ctx.nodes() {
                state.handles.store(*id, node.clone());
            }
            state.dispatch(&ctx)?;
            let runs = state.invalidate_queries(&ctx)?;
            (runs, ctx.triggers)
        };
        self.spawn_runs(runs);
        if !triggers.is_empty() {
            if let Some(sink) = self.inner.triggers.read().as_ref() {
                for event in triggers {
                    let _ = sink.send(event);
                }
            }
        }
        Ok(())
    }

    // Subscriptions

    pub fn subscribe_node(&self, id: NodeID, sink: Sink) -> Result<SubscriptionId, VelesError> {
        self.inner
            .state
            .lock()
            .subscribe(SubKind::Node { node: id }, sink)
    }

    pub fn subscribe_data(&self, id: NodeID, key: &str, sink: Sink) -> Result<SubscriptionId, VelesError> {
        self.inner.state.lock().subscribe(
            SubKind::Data {
                node: id,
                key: key.to_string(),
            },
            sink,
        )
    }

    pub fn subscribe_bindata(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
        sink: Sink,
    ) -> Result<SubscriptionId, VelesError> {
        self.inner.state.lock().subscribe(
            SubKind::Bindata {
                node: id,
                key: key.to_string(),
                start,
                end,
            },
            sink,
        )
    }

    pub fn subscribe_list(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
        sink: Sink,
    ) -> Result<SubscriptionId, VelesError> {
        self.inner.state.lock().subscribe(
            SubKind::List {
                parent,
                tags,
                pos_filter,
                members: BTreeSet::new(),
            },
            sink,
        )
    }

    pub fn subscribe_query(
        &self,
        node: NodeID,
        name: &str,
        params: Value,
        sink: Sink,
    ) -> Result<SubscriptionId, VelesError> {
        let key = QueryKey::new(node, name, &params);
        let (sub, run) = self.inner.state.lock().subscribe_query(key, params, sink)?;
        self.spawn_runs(run.into_iter().collect());
        Ok(sub)
    }

    /// Cancel a live subscription; its sink receives exactly one `Cancelled`.
    pub fn cancel(&self, sub: SubscriptionId) -> Result<(), VelesError> {
        let mut state = self.inner.state.lock();
        match state.remove_sub(sub) {
            Some(entry) => {
                entry.send(sub, Event::Cancelled);
                debug!(sub, "Subscription cancelled");
                Ok(())
            }
            None => Err(VelesError::UnknownSubscription(sub.to_string())),
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subs.len()
    }

    // Query cache

    /// Published result of a settled query manager, if one exists.
    pub fn cached_query(&self, node: NodeID, name: &str, params: &Value) -> Option<QueryOutcome> {
        let key = QueryKey::new(node, name, params);
        self.inner.state.lock().cached_query(&key)
    }

    /// Re-run every cached query named `name`.
    pub fn refresh_queries(&self, name: &str) {
        let runs = self.inner.state.lock().refresh_queries(name);
        self.spawn_runs(runs);
    }

    fn publish_query(&self, run: QueryRun, outcome: QueryOutcome) {
        let result = self.inner.state.lock().publish_query(run, outcome);
        match result {
            Ok(runs) => self.spawn_runs(runs),
            Err(err) => warn!(error = %err, "Failed to publish query result"),
        }
    }

    fn spawn_runs(&self, runs: Vec<QueryRun>) {
        if runs.is_empty() {
            return;
        }
        let runner = self.inner.runner.read().as_ref().and_then(Weak::upgrade);
        for run in runs {
            let tracker = self.clone();
            match runner.clone() {
                Some(runner) => {
                    tokio::spawn(async move {
                        let outcome = runner
                            .run_query(run.key.node, &run.key.name, run.params.clone())
                            .await;
                        tracker.publish_query(run, outcome);
                    });
                }
                None => {
                    let outcome = QueryOutcome {
                        result: Err(VelesError::QueryNotFound(run.key.name.clone())),
                        checks: Vec::new(),
                    };
                    tracker.publish_query(run, outcome);
                }
            }
        }
    }
}
