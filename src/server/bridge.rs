//! Plug-in bridge: handlers hosted by a remote client.
//!
//! A [`RemoteHandler`] is registered with the local connection like any
//! in-process handler. Invoking it sends a `plugin_*` dispatch message to the
//! owning client and waits for the reply with the same plug-in id.

use super::session::Outbox;
use crate::conn::{BroadcastHandler, Connection, MethodHandler, QueryHandler, TriggerHandler};
use crate::error::VelesError;
use crate::proto::pending::{wait, Pending};
use crate::proto::Message;
use crate::schema::{Check, Operation, Value};
use crate::tracer::Tracer;
use crate::types::NodeID;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type QueryReply = (Result<Value, VelesError>, Vec<Check>);
type TriggerReply = Result<(Vec<Operation>, Vec<Check>), VelesError>;

/// Per-session tables of plug-in calls awaiting a client reply
pub(crate) struct Bridge {
    out: Outbox,
    closed: AtomicBool,
    next_id: AtomicU64,
    methods: Pending<Result<Value, VelesError>>,
    queries: Pending<QueryReply>,
    broadcasts: Pending<Result<Vec<Value>, VelesError>>,
    triggers: Pending<TriggerReply>,
}

impl Bridge {
    pub fn new(out: Outbox) -> Arc<Self> {
        Arc::new(Bridge {
            out,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            methods: Pending::default(),
            queries: Pending::default(),
            broadcasts: Pending::default(),
            triggers: Pending::default(),
        })
    }

    async fn call<T>(&self, table: &Pending<T>, build: impl FnOnce(u64) -> Message) -> Result<T, VelesError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VelesError::ConnectionLost("plug-in client disconnected".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = table.open(id);
        if self.out.send(build(id)).is_err() {
            table.forget(id);
            return Err(VelesError::ConnectionLost("plug-in client disconnected".to_string()));
        }
        wait(rx).await
    }

    /// Route a plug-in reply; returns the message back if it is not one.
    pub fn complete(&self, msg: Message) -> Result<(), Message> {
        let delivered = match msg {
            Message::PluginMethodResult { pmid, result } => self.methods.complete(pmid, Ok(result)),
            Message::PluginMethodError { pmid, err } => self.methods.complete(pmid, Err(err)),
            Message::PluginQueryResult { pqid, result, checks } => {
                self.queries.complete(pqid, (Ok(result), checks))
            }
            Message::PluginQueryError { pqid, err, checks } => self.queries.complete(pqid, (Err(err), checks)),
            Message::PluginBroadcastResult { pbid, results } => self.broadcasts.complete(pbid, Ok(results)),
            Message::PluginBroadcastError { pbid, err } => self.broadcasts.complete(pbid, Err(err)),
            Message::PluginTriggerDone { ptid, ops, checks } => self.triggers.complete(ptid, Ok((ops, checks))),
            Message::PluginTriggerError { ptid, err } => self.triggers.complete(ptid, Err(err)),
            other => return Err(other),
        };
        if !delivered {
            debug!("Dropped plug-in reply nobody waits for");
        }
        Ok(())
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.methods.clear();
        self.queries.clear();
        self.broadcasts.clear();
        self.triggers.clear();
    }
}

/// Handler living on the other end of a session
pub(crate) struct RemoteHandler {
    bridge: Arc<Bridge>,
    phid: u64,
}

impl RemoteHandler {
    pub fn new(bridge: Arc<Bridge>, phid: u64) -> Arc<Self> {
        Arc::new(RemoteHandler { bridge, phid })
    }
}

#[async_trait]
impl MethodHandler for RemoteHandler {
    async fn run(&self, _conn: Arc<dyn Connection>, node: NodeID, params: Value) -> Result<Value, VelesError> {
        let phid = self.phid;
        self.bridge
            .call(&self.bridge.methods, |pmid| Message::PluginMethodRun { pmid, phid, node, params })
            .await?
    }
}

#[async_trait]
impl QueryHandler for RemoteHandler {
    async fn get(&self, tracer: &mut Tracer, node: NodeID, params: Value) -> Result<Value, VelesError> {
        let phid = self.phid;
        let (result, checks) = self
            .bridge
            .call(&self.bridge.queries, |pqid| Message::PluginQueryGet { pqid, phid, node, params })
            .await?;
        tracer.extend_checks(checks);
        result
    }
}

#[async_trait]
impl BroadcastHandler for RemoteHandler {
    async fn run(&self, _conn: Arc<dyn Connection>, params: Value) -> Result<Vec<Value>, VelesError> {
        let phid = self.phid;
        self.bridge
            .call(&self.bridge.broadcasts, |pbid| Message::PluginBroadcastRun { pbid, phid, params })
            .await?
    }
}

#[async_trait]
impl TriggerHandler for RemoteHandler {
    async fn run(&self, tracer: &mut Tracer, node: NodeID) -> Result<Vec<Operation>, VelesError> {
        let phid = self.phid;
        let (ops, checks) = self
            .bridge
            .call(&self.bridge.triggers, |ptid| Message::PluginTriggerRun { ptid, phid, node })
            .await??;
        tracer.extend_checks(checks);
        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_remote_method_round_trip() {
        let (out, mut rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(out);
        let handler = RemoteHandler::new(bridge.clone(), 4);
        let node = NodeID::random();

        let client = tokio::spawn(async move {
            match rx.recv().await {
                Some(Message::PluginMethodRun { pmid, phid, params, .. }) => {
                    assert_eq!(phid, 4);
                    bridge.complete(Message::PluginMethodResult { pmid, result: params }).unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        });
        let conn = crate::conn::LocalConnection::new(crate::tracker::Tracker::in_memory().unwrap());
        let result = MethodHandler::run(&*handler, conn, node, Value::from(3i64)).await.unwrap();
        assert_eq!(result, Value::from(3i64));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (out, _rx) = mpsc::unbounded_channel();
        let bridge = Bridge::new(out);
        let handler = RemoteHandler::new(bridge.clone(), 1);
        let call = tokio::spawn(async move {
            let conn = crate::conn::LocalConnection::new(crate::tracker::Tracker::in_memory().unwrap());
            BroadcastHandler::run(&*handler, conn, Value::Nil).await
        });
        while bridge.broadcasts.is_empty() {
            tokio::task::yield_now().await;
        }
        bridge.close();
        assert_eq!(call.await.unwrap().unwrap_err().code(), "connection_lost");
        assert!(bridge.complete(Message::RequestAck { rid: 1 }).is_err());
    }
}
