//! Async connection layer
//!
//! [`Connection`] is the handle-oriented API shared by the in-process
//! [`LocalConnection`] and the network [`crate::client::Client`]. Plug-in
//! handlers are registered through the same trait, so a single connection
//! can both consume and provide queries, methods, broadcasts and triggers.

pub mod local;
pub mod plugin;
pub mod triggers;

pub use local::LocalConnection;
pub use plugin::{BroadcastHandler, HandlerId, HandlerKind, MethodHandler, QueryHandler, TriggerHandler};

use crate::error::VelesError;
use crate::schema::{Check, ConnectionInfo, NewNode, Node, Operation, PosFilter, Value};
use crate::tracker::{Delivery, Event, QueryOutcome};
use crate::types::NodeID;
use async_trait::async_trait;
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Live stream of events for one subscription
///
/// Dropping the subscription cancels it.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
    done: bool,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            rx,
            cancel: Some(Box::new(cancel)),
            done: false,
        }
    }

    /// Next event; `None` once a terminal event has been returned.
    pub async fn next(&mut self) -> Option<Event> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(delivery) => {
                if delivery.event.is_terminal() {
                    self.done = true;
                    self.cancel = None;
                }
                Some(delivery.event)
            }
            None => {
                self.done = true;
                self.cancel = None;
                Some(Event::Error(VelesError::ConnectionLost(
                    "subscription source went away".to_string(),
                )))
            }
        }
    }

    /// Hand the cancellation over to the caller; dropping the subscription
    /// then no longer cancels it.
    pub(crate) fn take_canceller(&mut self) -> Option<Box<dyn FnOnce() + Send>> {
        self.cancel.take()
    }

    /// Request cancellation; the stream ends with [`Event::Cancelled`].
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Handle-oriented access to a Veles store
#[async_trait]
pub trait Connection: Send + Sync {
    async fn get_node(&self, id: NodeID) -> Result<Node, VelesError>;
    async fn get_node_sub(&self, id: NodeID) -> Result<Subscription, VelesError>;

    async fn get_data(&self, id: NodeID, key: &str) -> Result<Option<Value>, VelesError>;
    async fn get_data_sub(&self, id: NodeID, key: &str) -> Result<Subscription, VelesError>;

    async fn get_bindata(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Bytes, VelesError>;
    async fn get_bindata_sub(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Subscription, VelesError>;

    async fn get_list(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Vec<Node>, VelesError>;
    async fn get_list_sub(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Subscription, VelesError>;

    /// Run (or fetch the cached result of) a query. Errors come back inside the outcome.
    async fn get_query(&self, node: NodeID, name: &str, params: Value) -> QueryOutcome;
    async fn get_query_sub(
        &self,
        node: NodeID,
        name: &str,
        params: Value,
    ) -> Result<Subscription, VelesError>;

    async fn transaction(&self, checks: Vec<Check>, ops: Vec<Operation>) -> Result<(), VelesError>;

    async fn run_method(&self, node: NodeID, name: &str, params: Value) -> Result<Value, VelesError>;
    async fn run_broadcast(&self, name: &str, params: Value) -> Result<Vec<Value>, VelesError>;

    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, VelesError>;
    async fn list_connections_sub(&self) -> Result<Subscription, VelesError>;

    async fn register_method(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<HandlerId, VelesError>;
    async fn register_query(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<HandlerId, VelesError>;
    async fn register_broadcast(
        &self,
        name: &str,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Result<HandlerId, VelesError>;
    async fn register_trigger(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<HandlerId, VelesError>;
    async fn unregister(&self, handler: HandlerId) -> Result<(), VelesError>;

    // Single-operation conveniences

    async fn create(&self, node: NewNode) -> Result<NodeID, VelesError> {
        let id = node.id;
        self.transaction(Vec::new(), vec![node.into_operation()]).await?;
        Ok(id)
    }

    async fn delete(&self, node: NodeID) -> Result<(), VelesError> {
        self.transaction(Vec::new(), vec![Operation::Delete { node }]).await
    }

    async fn set_parent(&self, node: NodeID, parent: NodeID) -> Result<(), VelesError> {
        self.transaction(Vec::new(), vec![Operation::SetParent { node, parent }])
            .await
    }

    async fn set_pos(
        &self,
        node: NodeID,
        pos_start: Option<BigInt>,
        pos_end: Option<BigInt>,
    ) -> Result<(), VelesError> {
        self.transaction(
            Vec::new(),
            vec![Operation::SetPos { node, pos_start, pos_end }],
        )
        .await
    }

    async fn add_tag(&self, node: NodeID, tag: &str) -> Result<(), VelesError> {
        let tag = tag.to_string();
        self.transaction(Vec::new(), vec![Operation::AddTag { node, tag }])
            .await
    }

    async fn del_tag(&self, node: NodeID, tag: &str) -> Result<(), VelesError> {
        let tag = tag.to_string();
        self.transaction(Vec::new(), vec![Operation::DelTag { node, tag }])
            .await
    }

    async fn set_attr(&self, node: NodeID, key: &str, data: Option<Value>) -> Result<(), VelesError> {
        let key = key.to_string();
        self.transaction(Vec::new(), vec![Operation::SetAttr { node, key, data }])
            .await
    }

    async fn set_data(&self, node: NodeID, key: &str, data: Option<Value>) -> Result<(), VelesError> {
        let key = key.to_string();
        self.transaction(Vec::new(), vec![Operation::SetData { node, key, data }])
            .await
    }

    async fn set_bindata(
        &self,
        node: NodeID,
        key: &str,
        start: u64,
        data: Bytes,
        truncate: bool,
    ) -> Result<(), VelesError> {
        let key = key.to_string();
        self.transaction(
            Vec::new(),
            vec![Operation::SetBindata { node, key, start, data, truncate }],
        )
        .await
    }

    async fn add_trigger(&self, node: NodeID, trigger: &str) -> Result<(), VelesError> {
        let trigger = trigger.to_string();
        self.transaction(Vec::new(), vec![Operation::AddTrigger { node, trigger }])
            .await
    }

    async fn del_trigger(&self, node: NodeID, trigger: &str) -> Result<(), VelesError> {
        let trigger = trigger.to_string();
        self.transaction(Vec::new(), vec![Operation::DelTrigger { node, trigger }])
            .await
    }
}
