//! Protocol client
//!
//! [`Client`] speaks the wire protocol to a Veles server and implements
//! [`Connection`], so code written against a local connection runs
//! unchanged over the network. Handlers registered on a client are hosted
//! here: the server forwards `plugin_*` dispatch messages and the client
//! answers them using the same correlation id.

use crate::conn::{
    BroadcastHandler, Connection, HandlerId, MethodHandler, QueryHandler, Subscription, TriggerHandler,
};
use crate::error::VelesError;
use crate::proto::pending::{wait, Pending};
use crate::proto::{read_message, write_message, Endpoint, Message, VelesUrl, DEFAULT_MAX_FRAME_SIZE, KEY_SIZE, PROTO_VERSION};
use crate::schema::{Check, ConnectionInfo, NewNode, Node, Operation, PosFilter, Value};
use crate::tracer::Tracer;
use crate::tracker::{Delivery, Event, QueryOutcome};
use crate::types::NodeID;
use async_trait::async_trait;
use bytes::Bytes;
use num_bigint::BigInt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Receiver of replies for one qid
enum Slot {
    Once(oneshot::Sender<Message>),
    Sub(mpsc::UnboundedSender<Delivery>),
}

#[derive(Clone)]
enum LocalHandler {
    Method(Arc<dyn MethodHandler>),
    Query(Arc<dyn QueryHandler>),
    Broadcast(Arc<dyn BroadcastHandler>),
    Trigger(Arc<dyn TriggerHandler>),
}

fn lost(why: &str) -> VelesError {
    VelesError::ConnectionLost(why.to_string())
}

fn unexpected(msg: &Message) -> VelesError {
    VelesError::schema(format!("unexpected {} reply", msg.object_type()))
}

/// Subscription event carried by a qid-tagged reply.
fn message_event(msg: Message) -> Option<Event> {
    let event = match msg {
        Message::GetReply { obj, .. } => Event::Node(obj),
        Message::GetDataReply { data, .. } => Event::Data(data),
        Message::GetBindataReply { data, .. } => Event::Bindata(data),
        Message::GetListReply { objs, gone, .. } => Event::List { changed: objs, gone },
        Message::GetQueryReply { result, checks, .. } => Event::Query { result, checks },
        Message::QueryError {
            err,
            checks,
            terminal,
            ..
        } => {
            if terminal {
                Event::Error(err)
            } else {
                Event::QueryError { err, checks }
            }
        }
        Message::ConnectionsReply { connections, .. } => Event::Connections(connections),
        Message::SubscriptionCancelled { .. } => Event::Cancelled,
        _ => return None,
    };
    Some(event)
}

fn reply_qid(msg: &Message) -> Option<u64> {
    match msg {
        Message::GetReply { qid, .. }
        | Message::GetDataReply { qid, .. }
        | Message::GetBindataReply { qid, .. }
        | Message::GetListReply { qid, .. }
        | Message::GetQueryReply { qid, .. }
        | Message::QueryError { qid, .. }
        | Message::ConnectionsReply { qid, .. }
        | Message::SubscriptionCancelled { qid } => Some(*qid),
        _ => None,
    }
}

pub struct Client {
    me: Weak<Client>,
    out: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    closed: AtomicBool,
    requests: Pending<Result<(), VelesError>>,
    methods: Pending<Result<Value, VelesError>>,
    broadcasts: Pending<Result<Vec<Value>, VelesError>>,
    registrations: Pending<Result<(), VelesError>>,
    queries: Mutex<HashMap<u64, Slot>>,
    handlers: Mutex<HashMap<u64, LocalHandler>>,
    server_version: String,
}

impl Client {
    /// Open a connection described by a `veles://` URL.
    pub async fn connect_url(url: &VelesUrl, info: ConnectionInfo) -> Result<Arc<Client>, VelesError> {
        match &url.endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Self::connect(stream, &url.key(), info).await
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Self::connect(stream, &url.key(), info).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(VelesError::Unsupported("unix sockets on this platform".to_string())),
            Endpoint::Ssl { .. } => Err(VelesError::Unsupported("TLS transport".to_string())),
        }
    }

    /// Authenticate and handshake over an established stream.
    pub async fn connect<S>(stream: S, key: &[u8; KEY_SIZE], info: ConnectionInfo) -> Result<Arc<Client>, VelesError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        let (mut reader, mut writer) = tokio::io::split(stream);
        writer.write_all(key).await?;
        let hello = Message::Connect {
            proto_version: PROTO_VERSION,
            client_name: info.client_name,
            client_version: info.client_version,
            client_description: info.client_description,
            client_type: info.client_type,
        };
        write_message(&mut writer, hello).await?;

        let server_version = match read_message(&mut reader, max_frame_size).await? {
            Some(Message::Connected {
                proto_version,
                server_version,
                ..
            }) => {
                if proto_version != PROTO_VERSION {
                    return Err(VelesError::ProtocolMismatch(format!(
                        "server speaks version {}, client speaks {}",
                        proto_version, PROTO_VERSION
                    )));
                }
                server_version
            }
            Some(Message::ConnectionError { err }) => return Err(err),
            Some(other) => return Err(unexpected(&other)),
            None => return Err(lost("server closed the connection during handshake")),
        };
        info!(server_version = %server_version, "Connected to server");

        let (out, mut outgoing) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing.recv().await {
                if let Err(err) = write_message(&mut writer, msg).await {
                    debug!(error = %err, "Dropping outgoing messages");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let client = Arc::new_cyclic(|me| Client {
            me: me.clone(),
            out,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            requests: Pending::default(),
            methods: Pending::default(),
            broadcasts: Pending::default(),
            registrations: Pending::default(),
            queries: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            server_version,
        });

        let weak = Arc::downgrade(&client);
        tokio::spawn(async move {
            let reason = loop {
                let msg = match read_message(&mut reader, max_frame_size).await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break "server closed the connection".to_string(),
                    Err(err) => break err.to_string(),
                };
                let Some(client) = weak.upgrade() else {
                    return;
                };
                client.route(msg);
            };
            if let Some(client) = weak.upgrade() {
                client.fail_all(&reason);
            }
        });
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn shared(&self) -> Result<Arc<Client>, VelesError> {
        self.me.upgrade().ok_or_else(|| lost("client dropped"))
    }

    fn send(&self, msg: Message) -> Result<(), VelesError> {
        if self.is_closed() {
            return Err(lost("connection closed"));
        }
        self.out.send(msg).map_err(|_| lost("connection closed"))
    }

    /// Send a write and wait for its ack.
    async fn request(&self, build: impl FnOnce(u64) -> Message) -> Result<(), VelesError> {
        let rid = self.next_id();
        let rx = self.requests.open(rid);
        if let Err(err) = self.send(build(rid)) {
            self.requests.forget(rid);
            return Err(err);
        }
        wait(rx).await?
    }

    /// Send a one-shot read and wait for its single reply.
    async fn query(&self, build: impl FnOnce(u64) -> Message) -> Result<Message, VelesError> {
        let qid = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.queries.lock().insert(qid, Slot::Once(tx));
        if let Err(err) = self.send(build(qid)) {
            self.queries.lock().remove(&qid);
            return Err(err);
        }
        match wait(rx).await? {
            Message::QueryError { err, .. } => Err(err),
            reply => Ok(reply),
        }
    }

    fn subscribe(&self, build: impl FnOnce(u64) -> Message) -> Result<Subscription, VelesError> {
        let qid = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.queries.lock().insert(qid, Slot::Sub(tx));
        if let Err(err) = self.send(build(qid)) {
            self.queries.lock().remove(&qid);
            return Err(err);
        }
        let out = self.out.clone();
        Ok(Subscription::new(rx, move || {
            let _ = out.send(Message::CancelSubscription { qid });
        }))
    }

    /// Host a handler and wait for the server to accept it.
    async fn register(&self, handler: LocalHandler, build: impl FnOnce(u64) -> Message) -> Result<HandlerId, VelesError> {
        let phid = self.next_id();
        self.handlers.lock().insert(phid, handler);
        let rx = self.registrations.open(phid);
        if let Err(err) = self.send(build(phid)) {
            self.registrations.forget(phid);
            self.handlers.lock().remove(&phid);
            return Err(err);
        }
        let accepted = wait(rx).await.and_then(|result| result);
        if accepted.is_err() {
            self.handlers.lock().remove(&phid);
        }
        accepted.map(|()| phid)
    }

    fn handler(&self, phid: u64) -> Option<LocalHandler> {
        self.handlers.lock().get(&phid).cloned()
    }

    fn route(self: &Arc<Self>, msg: Message) {
        match msg {
            Message::RequestAck { rid } => {
                self.requests.complete(rid, Ok(()));
            }
            Message::RequestError { rid, err } => {
                self.requests.complete(rid, Err(err));
            }
            Message::MethodResult { mid, result } => {
                self.methods.complete(mid, Ok(result));
            }
            Message::MethodError { mid, err } => {
                self.methods.complete(mid, Err(err));
            }
            Message::BroadcastResult { bid, results } => {
                self.broadcasts.complete(bid, Ok(results));
            }
            Message::BroadcastError { bid, err } => {
                self.broadcasts.complete(bid, Err(err));
            }
            Message::PluginMethodRun { .. }
            | Message::PluginQueryGet { .. }
            | Message::PluginBroadcastRun { .. }
            | Message::PluginTriggerRun { .. } => {
                let client = self.clone();
                tokio::spawn(async move {
                    let reply = client.clone().run_plugin(msg).await;
                    if let Err(err) = client.send(reply) {
                        debug!(error = %err, "Could not answer plug-in call");
                    }
                });
            }
            Message::PluginHandlerRegistered { phid } => {
                self.registrations.complete(phid, Ok(()));
            }
            Message::PluginHandlerUnregistered { phid, err } => {
                self.handlers.lock().remove(&phid);
                if let Some(err) = err {
                    if !self.registrations.complete(phid, Err(err.clone())) {
                        warn!(phid, error = %err, "Server dropped plug-in handler");
                    }
                }
            }
            Message::ProtoError { err } => {
                warn!(error = %err, "Server reported a protocol error");
            }
            msg => match reply_qid(&msg) {
                Some(qid) => self.deliver(qid, msg),
                None => debug!(object_type = msg.object_type(), "Ignoring unexpected message"),
            },
        }
    }

    fn deliver(&self, qid: u64, msg: Message) {
        let mut queries = self.queries.lock();
        match queries.remove(&qid) {
            Some(Slot::Once(tx)) => {
                let _ = tx.send(msg);
            }
            Some(Slot::Sub(tx)) => {
                let Some(event) = message_event(msg) else {
                    return;
                };
                if !event.is_terminal() {
                    queries.insert(qid, Slot::Sub(tx.clone()));
                }
                let _ = tx.send(Delivery { sub: qid, event });
            }
            None => debug!(qid, "Reply for an unknown qid"),
        }
    }

    async fn run_plugin(self: Arc<Self>, msg: Message) -> Message {
        let conn: Arc<dyn Connection> = self.clone();
        let gone = |phid: u64| VelesError::gone(format!("plug-in handler {}", phid));
        match msg {
            Message::PluginMethodRun {
                pmid,
                phid,
                node,
                params,
            } => {
                let result = match self.handler(phid) {
                    Some(LocalHandler::Method(handler)) => handler.run(conn, node, params).await,
                    _ => Err(gone(phid)),
                };
                match result {
                    Ok(result) => Message::PluginMethodResult { pmid, result },
                    Err(err) => Message::PluginMethodError { pmid, err },
                }
            }
            Message::PluginQueryGet {
                pqid,
                phid,
                node,
                params,
            } => {
                let mut tracer = Tracer::new(conn);
                let result = match self.handler(phid) {
                    Some(LocalHandler::Query(handler)) => handler.get(&mut tracer, node, params).await,
                    _ => Err(gone(phid)),
                };
                let checks = tracer.into_checks();
                match result {
                    Ok(result) => Message::PluginQueryResult { pqid, result, checks },
                    Err(err) => Message::PluginQueryError { pqid, err, checks },
                }
            }
            Message::PluginBroadcastRun { pbid, phid, params } => {
                let result = match self.handler(phid) {
                    Some(LocalHandler::Broadcast(handler)) => handler.run(conn, params).await,
                    _ => Err(gone(phid)),
                };
                match result {
                    Ok(results) => Message::PluginBroadcastResult { pbid, results },
                    Err(err) => Message::PluginBroadcastError { pbid, err },
                }
            }
            Message::PluginTriggerRun { ptid, phid, node } => {
                let mut tracer = Tracer::new(conn);
                let result = match self.handler(phid) {
                    Some(LocalHandler::Trigger(handler)) => handler.run(&mut tracer, node).await,
                    _ => Err(gone(phid)),
                };
                match result {
                    Ok(ops) => Message::PluginTriggerDone {
                        ptid,
                        ops,
                        checks: tracer.into_checks(),
                    },
                    Err(err) => Message::PluginTriggerError { ptid, err },
                }
            }
            other => Message::ProtoError {
                err: unexpected(&other),
            },
        }
    }

    /// Fail everything in flight after the connection dropped.
    fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        warn!(reason, "Connection to server lost");
        self.requests.clear();
        self.methods.clear();
        self.broadcasts.clear();
        self.registrations.clear();
        let slots: Vec<(u64, Slot)> = self.queries.lock().drain().collect();
        for (qid, slot) in slots {
            if let Slot::Sub(tx) = slot {
                let _ = tx.send(Delivery {
                    sub: qid,
                    event: Event::Error(lost(reason)),
                });
            }
        }
        self.handlers.lock().clear();
    }
}

#[async_trait]
impl Connection for Client {
    async fn get_node(&self, id: NodeID) -> Result<Node, VelesError> {
        match self.query(|qid| Message::Get { qid, id, sub: false }).await? {
            Message::GetReply { obj, .. } => Ok(obj),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_node_sub(&self, id: NodeID) -> Result<Subscription, VelesError> {
        self.subscribe(|qid| Message::Get { qid, id, sub: true })
    }

    async fn get_data(&self, id: NodeID, key: &str) -> Result<Option<Value>, VelesError> {
        let key = key.to_string();
        match self.query(|qid| Message::GetData { qid, id, key, sub: false }).await? {
            Message::GetDataReply { data, .. } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_data_sub(&self, id: NodeID, key: &str) -> Result<Subscription, VelesError> {
        let key = key.to_string();
        self.subscribe(|qid| Message::GetData { qid, id, key, sub: true })
    }

    async fn get_bindata(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Bytes, VelesError> {
        let key = key.to_string();
        let build = |qid| Message::GetBindata {
            qid,
            id,
            key,
            start,
            end,
            sub: false,
        };
        match self.query(build).await? {
            Message::GetBindataReply { data, .. } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_bindata_sub(
        &self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Subscription, VelesError> {
        let key = key.to_string();
        self.subscribe(|qid| Message::GetBindata {
            qid,
            id,
            key,
            start,
            end,
            sub: true,
        })
    }

    async fn get_list(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Vec<Node>, VelesError> {
        let build = |qid| Message::GetList {
            qid,
            parent,
            tags,
            pos_filter,
            sub: false,
        };
        match self.query(build).await? {
            Message::GetListReply { objs, .. } => Ok(objs),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_list_sub(
        &self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Subscription, VelesError> {
        self.subscribe(|qid| Message::GetList {
            qid,
            parent,
            tags,
            pos_filter,
            sub: true,
        })
    }

    async fn get_query(&self, node: NodeID, name: &str, params: Value) -> QueryOutcome {
        let qid = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.queries.lock().insert(qid, Slot::Once(tx));
        let sent = self.send(Message::GetQuery {
            qid,
            node,
            query: name.to_string(),
            params,
            sub: false,
        });
        let reply = match sent {
            Ok(()) => wait(rx).await,
            Err(err) => {
                self.queries.lock().remove(&qid);
                Err(err)
            }
        };
        match reply {
            Ok(Message::GetQueryReply { result, checks, .. }) => QueryOutcome {
                result: Ok(result),
                checks,
            },
            Ok(Message::QueryError { err, checks, .. }) => QueryOutcome {
                result: Err(err),
                checks,
            },
            Ok(other) => QueryOutcome {
                result: Err(unexpected(&other)),
                checks: Vec::new(),
            },
            Err(err) => QueryOutcome {
                result: Err(err),
                checks: Vec::new(),
            },
        }
    }

    async fn get_query_sub(
        &self,
        node: NodeID,
        name: &str,
        params: Value,
    ) -> Result<Subscription, VelesError> {
        let query = name.to_string();
        self.subscribe(|qid| Message::GetQuery {
            qid,
            node,
            query,
            params,
            sub: true,
        })
    }

    async fn transaction(&self, checks: Vec<Check>, ops: Vec<Operation>) -> Result<(), VelesError> {
        self.request(|rid| Message::Transaction { rid, checks, ops }).await
    }

    async fn run_method(&self, node: NodeID, name: &str, params: Value) -> Result<Value, VelesError> {
        let mid = self.next_id();
        let rx = self.methods.open(mid);
        let msg = Message::MethodRun {
            mid,
            node,
            method: name.to_string(),
            params,
        };
        if let Err(err) = self.send(msg) {
            self.methods.forget(mid);
            return Err(err);
        }
        wait(rx).await?
    }

    async fn run_broadcast(&self, name: &str, params: Value) -> Result<Vec<Value>, VelesError> {
        let bid = self.next_id();
        let rx = self.broadcasts.open(bid);
        let msg = Message::BroadcastRun {
            bid,
            broadcast: name.to_string(),
            params,
        };
        if let Err(err) = self.send(msg) {
            self.broadcasts.forget(bid);
            return Err(err);
        }
        wait(rx).await?
    }

    async fn list_connections(&self) -> Result<Vec<ConnectionInfo>, VelesError> {
        match self.query(|qid| Message::ListConnections { qid, sub: false }).await? {
            Message::ConnectionsReply { connections, .. } => Ok(connections),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_connections_sub(&self) -> Result<Subscription, VelesError> {
        self.subscribe(|qid| Message::ListConnections { qid, sub: true })
    }

    async fn register_method(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<HandlerId, VelesError> {
        let name = name.to_string();
        self.register(LocalHandler::Method(handler), |phid| Message::PluginMethodRegister {
            phid,
            name,
            tags,
        })
        .await
    }

    async fn register_query(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<HandlerId, VelesError> {
        let name = name.to_string();
        self.register(LocalHandler::Query(handler), |phid| Message::PluginQueryRegister {
            phid,
            name,
            tags,
        })
        .await
    }

    async fn register_broadcast(
        &self,
        name: &str,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Result<HandlerId, VelesError> {
        let name = name.to_string();
        self.register(LocalHandler::Broadcast(handler), |phid| Message::PluginBroadcastRegister {
            phid,
            name,
        })
        .await
    }

    async fn register_trigger(
        &self,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<HandlerId, VelesError> {
        let name = name.to_string();
        self.register(LocalHandler::Trigger(handler), |phid| Message::PluginTriggerRegister {
            phid,
            name,
            tags,
        })
        .await
    }

    async fn unregister(&self, handler: HandlerId) -> Result<(), VelesError> {
        if self.handlers.lock().remove(&handler).is_none() {
            return Err(VelesError::gone(format!("handler {}", handler)));
        }
        self.send(Message::PluginHandlerUnregister { phid: handler })
    }

    // Convenience writes travel as their own messages.

    async fn create(&self, node: NewNode) -> Result<NodeID, VelesError> {
        let id = node.id;
        self.request(|rid| Message::Create {
            rid,
            id,
            parent: node.parent,
            pos_start: node.pos_start,
            pos_end: node.pos_end,
            tags: node.tags,
            attr: node.attr,
            data: node.data,
            bindata: node.bindata,
            triggers: node.triggers,
        })
        .await?;
        Ok(id)
    }

    async fn delete(&self, node: NodeID) -> Result<(), VelesError> {
        self.request(|rid| Message::Delete { rid, id: node }).await
    }

    async fn set_parent(&self, node: NodeID, parent: NodeID) -> Result<(), VelesError> {
        self.request(|rid| Message::SetParent { rid, id: node, parent })
            .await
    }

    async fn set_pos(
        &self,
        node: NodeID,
        pos_start: Option<BigInt>,
        pos_end: Option<BigInt>,
    ) -> Result<(), VelesError> {
        self.request(|rid| Message::SetPos {
            rid,
            id: node,
            pos_start,
            pos_end,
        })
        .await
    }

    async fn add_tag(&self, node: NodeID, tag: &str) -> Result<(), VelesError> {
        let tag = tag.to_string();
        self.request(|rid| Message::AddTag { rid, id: node, tag }).await
    }

    async fn del_tag(&self, node: NodeID, tag: &str) -> Result<(), VelesError> {
        let tag = tag.to_string();
        self.request(|rid| Message::DelTag { rid, id: node, tag }).await
    }

    async fn set_attr(&self, node: NodeID, key: &str, data: Option<Value>) -> Result<(), VelesError> {
        let key = key.to_string();
        self.request(|rid| Message::SetAttr { rid, id: node, key, data })
            .await
    }

    async fn set_data(&self, node: NodeID, key: &str, data: Option<Value>) -> Result<(), VelesError> {
        let key = key.to_string();
        self.request(|rid| Message::SetData { rid, id: node, key, data })
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
        self.request(|rid| Message::SetBindata {
            rid,
            id: node,
            key,
            start,
            data,
            truncate,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_to_event_mapping() {
        let err = VelesError::gone("x");
        let soft = Message::QueryError { qid: 1, err: err.clone(), checks: vec![], terminal: false };
        assert_eq!(
            message_event(soft),
            Some(Event::QueryError { err: err.clone(), checks: vec![] })
        );
        let hard = Message::QueryError { qid: 1, err: err.clone(), checks: vec![], terminal: true };
        assert_eq!(message_event(hard), Some(Event::Error(err)));
        assert_eq!(message_event(Message::SubscriptionCancelled { qid: 1 }), Some(Event::Cancelled));
        assert_eq!(message_event(Message::RequestAck { rid: 1 }), None);
        assert_eq!(reply_qid(&Message::GetDataReply { qid: 8, data: None }), Some(8));
    }
}
