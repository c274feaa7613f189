//! One client session: handshake, request dispatch and cleanup.

use super::bridge::{Bridge, RemoteHandler};
use crate::conn::{Connection, HandlerId, LocalConnection, Subscription};
use crate::error::VelesError;
use crate::proto::framing::{keys_match, KEY_SIZE};
use crate::proto::{read_message, write_message, Message, PROTO_VERSION};
use crate::schema::{Check, ConnectionInfo};
use crate::tracker::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Queue of messages to the client, drained by the writer task
pub(crate) type Outbox = mpsc::UnboundedSender<Message>;

/// In-flight qids; subscriptions carry their stop handle
type QidTable = Arc<Mutex<HashMap<u64, Option<Stop>>>>;

/// Stop handle of a forwarded subscription
///
/// Firing it marks the subscription stopped before anything else is read
/// off the socket, so no event queued after a `cancel_subscription` can
/// reach the client ahead of `subscription_cancelled`.
struct Stop {
    stopped: Arc<Mutex<bool>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Stop {
    fn fire(self) {
        *self.stopped.lock() = true;
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

fn query_error(qid: u64, err: VelesError, checks: Vec<Check>, terminal: bool) -> Message {
    Message::QueryError {
        qid,
        err,
        checks,
        terminal,
    }
}

/// Wire form of one subscription event.
fn event_message(qid: u64, event: Event) -> Message {
    match event {
        Event::Node(obj) => Message::GetReply { qid, obj },
        Event::Data(data) => Message::GetDataReply { qid, data },
        Event::Bindata(data) => Message::GetBindataReply { qid, data },
        Event::List { changed, gone } => Message::GetListReply {
            qid,
            objs: changed,
            gone,
        },
        Event::Query { result, checks } => Message::GetQueryReply { qid, result, checks },
        Event::QueryError { err, checks } => query_error(qid, err, checks, false),
        Event::Connections(connections) => Message::ConnectionsReply { qid, connections },
        Event::Error(err) => query_error(qid, err, Vec::new(), true),
        Event::Cancelled => Message::SubscriptionCancelled { qid },
    }
}

/// Check the key and the connect message.
async fn handshake<R>(reader: &mut R, key: &[u8; KEY_SIZE], max_frame_size: usize) -> Result<ConnectionInfo, VelesError>
where
    R: AsyncRead + Unpin,
{
    let mut offered = [0u8; KEY_SIZE];
    reader.read_exact(&mut offered).await?;
    if !keys_match(&offered, key) {
        return Err(VelesError::Authentication("invalid key".to_string()));
    }
    let Some(msg) = read_message(reader, max_frame_size).await? else {
        return Err(VelesError::ConnectionLost("closed during handshake".to_string()));
    };
    match &msg {
        Message::Connect { proto_version, .. } if *proto_version != PROTO_VERSION => {
            Err(VelesError::ProtocolMismatch(format!(
                "client speaks version {}, server speaks {}",
                proto_version, PROTO_VERSION
            )))
        }
        Message::Connect { .. } => Ok(ConnectionInfo::from(&msg)),
        other => Err(VelesError::ProtocolMismatch(format!(
            "expected connect, got {}",
            other.object_type()
        ))),
    }
}

/// Serve one client until it disconnects.
pub(crate) async fn serve<S>(
    conn: Arc<LocalConnection>,
    stream: S,
    key: [u8; KEY_SIZE],
    max_frame_size: usize,
) -> Result<(), VelesError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let info = match handshake(&mut reader, &key, max_frame_size).await {
        Ok(info) => info,
        Err(err) => {
            warn!(error = %err, "Rejected connection");
            // Best effort; the peer may already be gone.
            let _ = write_message(&mut writer, Message::ConnectionError { err: err.clone() }).await;
            let _ = writer.shutdown().await;
            return Err(err);
        }
    };
    write_message(&mut writer, Message::connected()).await?;

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

    let conn_id = conn.open_connection(info.clone());
    info!(connection = conn_id, client = %info.client_name, "Client connected");
    let mut session = Session {
        bridge: Bridge::new(out.clone()),
        conn,
        out,
        qids: Arc::new(Mutex::new(HashMap::new())),
        handlers: HashMap::new(),
        conn_id,
    };

    let result = loop {
        match read_message(&mut reader, max_frame_size).await {
            Ok(Some(msg)) => session.handle(msg).await,
            Ok(None) => break Ok(()),
            Err(VelesError::Schema(msg)) => {
                let err = VelesError::Schema(msg);
                warn!(connection = conn_id, error = %err, "Malformed frame");
                session.send(Message::ProtoError { err: err.clone() });
                break Err(err);
            }
            Err(err) => break Err(err),
        }
    };
    session.close().await;
    result
}

struct Session {
    conn: Arc<LocalConnection>,
    out: Outbox,
    bridge: Arc<Bridge>,
    qids: QidTable,
    /// Plug-in handler id chosen by the client to the local registration
    handlers: HashMap<u64, HandlerId>,
    conn_id: u64,
}

impl Session {
    fn send(&self, msg: Message) {
        // The writer only stops once the peer is gone.
        let _ = self.out.send(msg);
    }

    /// Reserve a qid; reports `subscription_in_use` when taken.
    fn claim(&self, qid: u64) -> bool {
        let mut qids = self.qids.lock();
        if qids.contains_key(&qid) {
            drop(qids);
            let err = VelesError::SubscriptionInUse(format!("qid {}", qid));
            self.send(query_error(qid, err, Vec::new(), false));
            return false;
        }
        qids.insert(qid, None);
        true
    }

    fn release(&self, qid: u64) {
        self.qids.lock().remove(&qid);
    }

    /// Finish a one-shot read claimed with [`Session::claim`].
    fn reply(&self, qid: u64, result: Result<Message, VelesError>) {
        self.release(qid);
        match result {
            Ok(msg) => self.send(msg),
            Err(err) => self.send(query_error(qid, err, Vec::new(), true)),
        }
    }

    /// Attach a subscription to a claimed qid and forward its events.
    fn forward(&self, qid: u64, sub: Result<Subscription, VelesError>) {
        let mut sub = match sub {
            Ok(sub) => sub,
            Err(err) => return self.reply(qid, Err(err)),
        };
        let stopped = Arc::new(Mutex::new(false));
        let stop = Stop {
            stopped: stopped.clone(),
            cancel: sub.take_canceller(),
        };
        self.qids.lock().insert(qid, Some(stop));
        let qids = self.qids.clone();
        let out = self.out.clone();
        tokio::spawn(async move {
            while let Some(event) = sub.next().await {
                let terminal = event.is_terminal();
                let msg = {
                    // Held across the send so a stop cannot slip in between.
                    let stopped = stopped.lock();
                    let event = match (*stopped, terminal) {
                        (false, _) => event,
                        (true, true) => Event::Cancelled,
                        (true, false) => continue,
                    };
                    if terminal {
                        qids.lock().remove(&qid);
                    }
                    out.send(event_message(qid, event))
                };
                if msg.is_err() || terminal {
                    break;
                }
            }
        });
    }

    fn write(&self, rid: u64, result: Result<(), VelesError>) {
        match result {
            Ok(()) => self.send(Message::RequestAck { rid }),
            Err(err) => {
                debug!(rid, error = %err, "Transaction failed");
                self.send(Message::RequestError { rid, err })
            }
        }
    }

    async fn handle(&mut self, msg: Message) {
        let conn = self.conn.clone();
        match msg {
            Message::Get { qid, id, sub } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.get_node_sub(id).await);
                } else {
                    let reply = conn.get_node(id).await.map(|obj| Message::GetReply { qid, obj });
                    self.reply(qid, reply);
                }
            }
            Message::GetData { qid, id, key, sub } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.get_data_sub(id, &key).await);
                } else {
                    let reply = conn
                        .get_data(id, &key)
                        .await
                        .map(|data| Message::GetDataReply { qid, data });
                    self.reply(qid, reply);
                }
            }
            Message::GetBindata {
                qid,
                id,
                key,
                start,
                end,
                sub,
            } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.get_bindata_sub(id, &key, start, end).await);
                } else {
                    let reply = conn
                        .get_bindata(id, &key, start, end)
                        .await
                        .map(|data| Message::GetBindataReply { qid, data });
                    self.reply(qid, reply);
                }
            }
            Message::GetList {
                qid,
                parent,
                tags,
                pos_filter,
                sub,
            } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.get_list_sub(parent, tags, pos_filter).await);
                } else {
                    let reply = conn
                        .get_list(parent, tags, pos_filter)
                        .await
                        .map(|objs| Message::GetListReply { qid, objs, gone: Vec::new() });
                    self.reply(qid, reply);
                }
            }
            Message::GetQuery {
                qid,
                node,
                query,
                params,
                sub,
            } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.get_query_sub(node, &query, params).await);
                    return;
                }
                let qids = self.qids.clone();
                let out = self.out.clone();
                tokio::spawn(async move {
                    let outcome = conn.get_query(node, &query, params).await;
                    qids.lock().remove(&qid);
                    let msg = match outcome.result {
                        Ok(result) => Message::GetQueryReply {
                            qid,
                            result,
                            checks: outcome.checks,
                        },
                        Err(err) => query_error(qid, err, outcome.checks, true),
                    };
                    let _ = out.send(msg);
                });
            }
            Message::ListConnections { qid, sub } => {
                if !self.claim(qid) {
                    return;
                }
                if sub {
                    self.forward(qid, conn.list_connections_sub().await);
                } else {
                    let reply = conn
                        .list_connections()
                        .await
                        .map(|connections| Message::ConnectionsReply { qid, connections });
                    self.reply(qid, reply);
                }
            }
            Message::CancelSubscription { qid } => {
                let stop = self.qids.lock().get_mut(&qid).map(Option::take);
                match stop {
                    Some(Some(stop)) => stop.fire(),
                    // One-shot read still running, or a cancel already on its way.
                    Some(None) => {}
                    None => {
                        let err = VelesError::UnknownSubscription(format!("qid {}", qid));
                        self.send(query_error(qid, err, Vec::new(), true));
                    }
                }
            }

            Message::Transaction { rid, checks, ops } => {
                let result = conn.transaction(checks, ops).await;
                self.write(rid, result);
            }

            Message::MethodRun {
                mid,
                node,
                method,
                params,
            } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let msg = match conn.run_method(node, &method, params).await {
                        Ok(result) => Message::MethodResult { mid, result },
                        Err(err) => Message::MethodError { mid, err },
                    };
                    let _ = out.send(msg);
                });
            }
            Message::BroadcastRun { bid, broadcast, params } => {
                let out = self.out.clone();
                tokio::spawn(async move {
                    let msg = match conn.run_broadcast(&broadcast, params).await {
                        Ok(results) => Message::BroadcastResult { bid, results },
                        Err(err) => Message::BroadcastError { bid, err },
                    };
                    let _ = out.send(msg);
                });
            }

            Message::PluginMethodRegister { phid, name, tags } => {
                let handler = RemoteHandler::new(self.bridge.clone(), phid);
                let result = conn.register_method(&name, tags, handler).await;
                self.registered(phid, result);
            }
            Message::PluginQueryRegister { phid, name, tags } => {
                let handler = RemoteHandler::new(self.bridge.clone(), phid);
                let result = conn.register_query(&name, tags, handler).await;
                self.registered(phid, result);
            }
            Message::PluginBroadcastRegister { phid, name } => {
                let handler = RemoteHandler::new(self.bridge.clone(), phid);
                let result = conn.register_broadcast(&name, handler).await;
                self.registered(phid, result);
            }
            Message::PluginTriggerRegister { phid, name, tags } => {
                let handler = RemoteHandler::new(self.bridge.clone(), phid);
                let result = conn.register_trigger(&name, tags, handler).await;
                self.registered(phid, result);
            }
            Message::PluginHandlerUnregister { phid } => {
                let err = match self.handlers.remove(&phid) {
                    Some(handler) => conn.unregister(handler).await.err(),
                    None => Some(VelesError::gone(format!("plug-in handler {}", phid))),
                };
                self.send(Message::PluginHandlerUnregistered { phid, err });
            }

            other => {
                let other = match other.into_operation() {
                    Ok((rid, op)) => {
                        let result = conn.transaction(Vec::new(), vec![op]).await;
                        return self.write(rid, result);
                    }
                    Err(other) => other,
                };
                if let Err(other) = self.bridge.complete(other) {
                    let err = VelesError::schema(format!("unexpected {} message", other.object_type()));
                    warn!(connection = self.conn_id, error = %err, "Ignoring message");
                    self.send(Message::ProtoError { err });
                }
            }
        }
    }

    fn registered(&mut self, phid: u64, result: Result<HandlerId, VelesError>) {
        match result {
            Ok(handler) => {
                if let Some(previous) = self.handlers.insert(phid, handler) {
                    warn!(phid, "Client reused a plug-in handler id");
                    let conn = self.conn.clone();
                    tokio::spawn(async move {
                        let _ = conn.unregister(previous).await;
                    });
                }
                self.send(Message::PluginHandlerRegistered { phid });
            }
            Err(err) => {
                debug!(phid, error = %err, "Plug-in registration refused");
                self.send(Message::PluginHandlerUnregistered { phid, err: Some(err) });
            }
        }
    }

    /// Cancel subscriptions, drop handlers and leave the connection table.
    async fn close(mut self) {
        let stops: Vec<_> = self
            .qids
            .lock()
            .drain()
            .filter_map(|(_, stop)| stop)
            .collect();
        for stop in stops {
            stop.fire();
        }
        for (_, handler) in self.handlers.drain() {
            let _ = self.conn.unregister(handler).await;
        }
        self.bridge.close();
        self.conn.close_connection(self.conn_id);
        info!(connection = self.conn_id, "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeID;

    #[test]
    fn test_terminal_events_free_the_qid() {
        match event_message(3, Event::Error(VelesError::gone("x"))) {
            Message::QueryError { qid, terminal, .. } => {
                assert_eq!(qid, 3);
                assert!(terminal);
            }
            other => panic!("unexpected {:?}", other),
        }
        match event_message(3, Event::QueryError { err: VelesError::gone("x"), checks: vec![] }) {
            Message::QueryError { terminal, .. } => assert!(!terminal),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(event_message(4, Event::Cancelled), Message::SubscriptionCancelled { qid: 4 });
        let gone = NodeID::random();
        assert_eq!(
            event_message(5, Event::List { changed: vec![], gone: vec![gone] }),
            Message::GetListReply { qid: 5, objs: vec![], gone: vec![gone] }
        );
    }
}
