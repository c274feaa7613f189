//! In-process connection backed directly by a tracker.

use super::plugin::{HandlerKind, Plugins};
use super::triggers::TriggerDispatcher;
use super::{
    BroadcastHandler, Connection, HandlerId, MethodHandler, QueryHandler, Subscription, TriggerHandler,
};
use crate::error::VelesError;
use crate::schema::{Check, ConnectionInfo, Node, Operation, PosFilter, Value};
use crate::tracer::Tracer;
use crate::tracker::{Delivery, Event, QueryOutcome, QueryRunner, Sink, SubscriptionId, Tracker};
use crate::types::NodeID;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Connection that talks to a tracker in the same process
///
/// Hosts the plug-in registries, runs queries for the tracker's query cache
/// and owns the trigger dispatcher. Must be created inside a tokio runtime.
pub struct LocalConnection {
    tracker: Tracker,
    me: Weak<LocalConnection>,
    plugins: Mutex<Plugins>,
    next_handler: AtomicU64,
    next_connection: AtomicU64,
    connections: watch::Sender<BTreeMap<u64, ConnectionInfo>>,
    pub(super) triggers: TriggerDispatcher,
}

impl LocalConnection {
    pub fn new(tracker: Tracker) -> Arc<Self> {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        tracker.set_trigger_sink(trigger_tx.clone());
        let (connections, _) = watch::channel(BTreeMap::new());
        let conn = Arc::new_cyclic(|me| LocalConnection {
            tracker,
            me: me.clone(),
            plugins: Mutex::new(Plugins::new()),
            next_handler: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            connections,
            triggers: TriggerDispatcher::new(trigger_tx),
        });
        let weak = Arc::downgrade(&conn);
        let runner: Weak<dyn QueryRunner> = weak.clone();
        conn.tracker.set_query_runner(runner);
        TriggerDispatcher::spawn(weak, trigger_rx);
        conn
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub(super) fn plugins(&self) -> parking_lot::MutexGuard<'_, Plugins> {
        self.plugins.lock()
    }

    pub(super) fn strong(&self) -> Result<Arc<LocalConnection>, VelesError> {
        self.me
            .upgrade()
            .ok_or_else(|| VelesError::ConnectionLost("local connection closed".to_string()))
    }

    fn shared(&self) -> Result<Arc<dyn Connection>, VelesError> {
        Ok(self.strong()? as Arc<dyn Connection>)
    }

    /// Record a connected client; returns its connection id.
    pub fn open_connection(&self, mut info: ConnectionInfo) -> u64 {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        info.id = id;
        self.connections.send_modify(|table| {
            table.insert(id, info);
        });
        id
    }

    pub fn close_connection(&self, id: u64) {
        self.connections.send_if_modified(|table| table.remove(&id).is_some());
    }

    fn allocate_handler(&self) -> HandlerId {
        self.next_handler.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(
        &self,
        register: impl FnOnce(Sink) -> Result<SubscriptionId, VelesError>,
    ) -> Result<Subscription, VelesError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = register(tx)?;
        let tracker = self.tracker.clone();
        Ok(Subscription::new(rx, move || {
            // Already gone when the tracker ended it first.
            let _ = tracker.cancel(sub);
        }))
    }

    async fn traced_query(
        &self,
        tracer: &mut Tracer,
        node: NodeID,
        name: &str,
        params: Value,
    ) -> Result<Value, VelesError> {
        let tags = tracer.get_tags(node).await?;
        let handler = self
            .plugins
            .lock()
            .queries
            .find(name, &tags)?
            .ok_or_else(|| VelesError::QueryNotFound(name.to_string()))?;
        handler.get(tracer, node, params).await
    }
}

fn connection_list(table: &BTreeMap<u64, ConnectionInfo>) -> Vec<ConnectionInfo> {
    table.values().cloned().collect()
}

#[async_trait]
impl QueryRunner for LocalConnection {
    async fn run_query(&self, node: NodeID, name: &str, params: Value) -> QueryOutcome {
        let conn = match self.shared() {
            Ok(conn) => conn,
            Err(err) => {
                return QueryOutcome {
                    result: Err(err),
                    checks: Vec::new(),
                }
            }
        };
        let mut tracer = Tracer::new(conn);
        let result = self.traced_query(&mut tracer, node, name, params).await;
        QueryOutcome {
            result,
            checks: tracer.into_checks(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn get_node(&self, id: NodeID) -> Result<Node, VelesError> {
        self.tracker.get_node(&id)?.ok_or_else(|| VelesError::gone(id))
    }

    async fn get_node_sub(&self, id: NodeID) -> Result<Subscription, VelesError> {
        self.subscribe(|sink| self.tracker.subscribe_node(id, sink))
    }

    async fn get_data(&self, id: NodeID, key: &str) -> Result<Option<Value>, VelesError> {
        self.tracker.get_data(&id, key)
    }

    async fn get_data_sub(&self, id: NodeID, key: &str) -> Result<Subscription, VelesError> {
        self.subscribe(|sink| self.tracker.subscribe_data(id, key, sink))
    }

    async fn get_bindata(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Bytes, VelesError> {
        self.tracker.get_bindata(&id, key, start, end)
    }

    async fn get_bindata_sub(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Subscription, VelesError> {
        self.subscribe(|sink| self.tracker.subscribe_bindata(id, key, start, end, sink))
    }

    async fn get_list(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Vec<Node>, VelesError> {
        self.tracker.get_list(&parent, &tags, &pos_filter)
    }

    async fn get_list_sub(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Subscription, VelesError> {
        self.subscribe(|sink| self.tracker.subscribe_list(parent, tags, pos_filter, sink))
    }

    async fn get_query(&self, node: NodeID, name: &str, params: Value) -> QueryOutcome {
        if let Some(outcome) = self.tracker.cached_query(node, name, &params) {
            return outcome;
        }
        self.run_query(node, name, params).await
    }

    async fn get_query_sub(
        &self,
        node: NodeID,
        name: &str,
        params: Value,
    ) -> Result<Subscription, VelesError> {
        self.subscribe(|sink| self.tracker.subscribe_query(node, name, params, sink))
    }

    async fn transaction(&self, checks: Vec<Check>, ops: Vec<Operation>) -> Result<(), VelesError> {
        self.tracker.transaction(&checks, ops)
    }

    async fn run_method(&self, node: NodeID, name: &str, params: Value) -> Result<Value, VelesError> {
        let target = self.get_node(node).await?;
        let handler = self
            .plugins
            .lock()
            .methods
            .find(name, &target.tags)?
            .ok_or_else(|| VelesError::MethodNotFound(name.to_string()))?;
        debug!(method = name, node = %node, "Running method");
        handler.run(self.shared()?, node, params).await
    }

    async fn run_broadcast(&self, name: &str, params: Value) -> Result<Vec<Value>, VelesError> {
        let handlers = self.plugins.lock().broadcasts(name);
        debug!(broadcast = name, handlers = handlers.len(), "Running broadcast");
        let conn = self.shared()?;
        let runs = handlers
            .iter()
            .map(|handler| handler.run(conn.clone(), params.clone()));
        let mut results = Vec::new();
        for outcome in join_all(runs).await {
            results.extend(outcome?);
        }
        Ok(results)
    }

    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, VelesError> {
        Ok(connection_list(&self.connections.borrow()))
    }

    async fn list_connections_sub(&self) -> Result<Subscription, VelesError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut table = self.connections.subscribe();
        tokio::spawn(async move {
            let send = |event: Event| tx.send(Delivery { sub: 0, event }).is_ok();
            let initial = connection_list(&table.borrow_and_update());
            if !send(Event::Connections(initial)) {
                return;
            }
            loop {
                tokio::select! {
                    changed = table.changed() => {
                        if changed.is_err() {
                            send(Event::Error(VelesError::ConnectionLost("server shut down".into())));
                            return;
                        }
                        let current = connection_list(&table.borrow_and_update());
                        if !send(Event::Connections(current)) {
                            return;
                        }
                    }
                    _ = &mut stop_rx => {
                        send(Event::Cancelled);
                        return;
                    }
                }
            }
        });
        Ok(Subscription::new(rx, move || {
            let _ = stop_tx.send(());
        }))
    }

    async fn register_method(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<HandlerId, VelesError> {
        let id = self.allocate_handler();
        self.plugins.lock().methods.insert(id, name, tags, handler)?;
        info!(handler = id, method = name, "Registered method handler");
        Ok(id)
    }

    async fn register_query(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<HandlerId, VelesError> {
        let id = self.allocate_handler();
        self.plugins.lock().queries.insert(id, name, tags, handler)?;
        info!(handler = id, query = name, "Registered query handler");
        self.tracker.refresh_queries(name);
        Ok(id)
    }

    async fn register_broadcast(
        &self,
        name: &str,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Result<HandlerId, VelesError> {
        let id = self.allocate_handler();
        self.plugins.lock().add_broadcast(id, name, handler);
        info!(handler = id, broadcast = name, "Registered broadcast handler");
        Ok(id)
    }

    async fn register_trigger(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<HandlerId, VelesError> {
        let id = self.allocate_handler();
        self.plugins.lock().triggers.insert(id, name, tags, handler)?;
        info!(handler = id, trigger = name, "Registered trigger handler");
        for node in self.tracker.pending_triggers(name)? {
            self.triggers.kick(node, name);
        }
        Ok(id)
    }

    async fn unregister(&self, handler: HandlerId) -> Result<(), VelesError> {
        let removed = self.plugins.lock().remove(handler);
        match removed {
            Some((kind, name)) => {
                info!(handler, kind = %kind, name = %name, "Unregistered handler");
                if kind == HandlerKind::Query {
                    self.tracker.refresh_queries(&name);
                }
                Ok(())
            }
            None => Err(VelesError::gone(format!("handler {}", handler))),
        }
    }
}
