//! Protocol messages
//!
//! Every frame carries one [`Message`], tagged by `object_type`. Correlation
//! ids: `rid` for writes, `qid` for reads and subscriptions, `mid` / `bid`
//! for method and broadcast calls, and `phid`, `pmid`, `pqid`, `pbid`,
//! `ptid` for the plug-in bridge.

use crate::error::VelesError;
use crate::schema::{Check, ConnectionInfo, Node, Operation, PosFilter, Value};
use crate::types::NodeID;
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet};

crate::tagged_enum! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum Message {
        // Session
        Connect = "connect" {
            proto_version: u64,
            client_name: String,
            client_version: String,
            client_description: String,
            client_type: String,
        },
        Connected = "connected" { proto_version: u64, server_name: String, server_version: String },
        ConnectionError = "connection_error" { err: VelesError },
        ProtoError = "proto_error" { err: VelesError },

        // Reads
        Get = "get" { qid: u64, id: NodeID, sub: bool },
        GetReply = "get_reply" { qid: u64, obj: Node },
        GetData = "get_data" { qid: u64, id: NodeID, key: String, sub: bool },
        GetDataReply = "get_data_reply" { qid: u64, data: Option<Value> },
        GetBindata = "get_bindata" { qid: u64, id: NodeID, key: String, start: u64, end: Option<u64>, sub: bool },
        GetBindataReply = "get_bindata_reply" { qid: u64, data: Bytes },
        GetList = "get_list" { qid: u64, parent: NodeID, tags: BTreeSet<String>, pos_filter: PosFilter, sub: bool },
        GetListReply = "get_list_reply" { qid: u64, objs: Vec<Node>, gone: Vec<NodeID> },
        GetQuery = "get_query" { qid: u64, node: NodeID, query: String, params: Value, sub: bool },
        GetQueryReply = "get_query_reply" { qid: u64, result: Value, checks: Vec<Check> },
        /// Read or query failure; `terminal` frees the qid
        QueryError = "query_error" { qid: u64, err: VelesError, checks: Vec<Check>, terminal: bool },

        // Subscription control
        CancelSubscription = "cancel_subscription" { qid: u64 },
        SubscriptionCancelled = "subscription_cancelled" { qid: u64 },

        // Writes
        Transaction = "transaction" { rid: u64, checks: Vec<Check>, ops: Vec<Operation> },
        RequestAck = "request_ack" { rid: u64 },
        RequestError = "request_error" { rid: u64, err: VelesError },
        Create = "create" {
            rid: u64,
            id: NodeID,
            parent: NodeID,
            pos_start: Option<BigInt>,
            pos_end: Option<BigInt>,
            tags: BTreeSet<String>,
            attr: BTreeMap<String, Value>,
            data: BTreeMap<String, Value>,
            bindata: BTreeMap<String, Bytes>,
            triggers: BTreeSet<String>,
        },
        Delete = "delete" { rid: u64, id: NodeID },
        SetParent = "set_parent" { rid: u64, id: NodeID, parent: NodeID },
        SetPos = "set_pos" { rid: u64, id: NodeID, pos_start: Option<BigInt>, pos_end: Option<BigInt> },
        AddTag = "add_tag" { rid: u64, id: NodeID, tag: String },
        DelTag = "del_tag" { rid: u64, id: NodeID, tag: String },
        SetAttr = "set_attr" { rid: u64, id: NodeID, key: String, data: Option<Value> },
        SetData = "set_data" { rid: u64, id: NodeID, key: String, data: Option<Value> },
        SetBindata = "set_bindata" { rid: u64, id: NodeID, key: String, start: u64, data: Bytes, truncate: bool },

        // RPC
        MethodRun = "method_run" { mid: u64, node: NodeID, method: String, params: Value },
        MethodResult = "method_result" { mid: u64, result: Value },
        MethodError = "method_error" { mid: u64, err: VelesError },
        BroadcastRun = "broadcast_run" { bid: u64, broadcast: String, params: Value },
        BroadcastResult = "broadcast_result" { bid: u64, results: Vec<Value> },
        BroadcastError = "broadcast_error" { bid: u64, err: VelesError },

        // Plug-in registration
        PluginMethodRegister = "plugin_method_register" { phid: u64, name: String, tags: BTreeSet<String> },
        PluginQueryRegister = "plugin_query_register" { phid: u64, name: String, tags: BTreeSet<String> },
        PluginBroadcastRegister = "plugin_broadcast_register" { phid: u64, name: String },
        PluginTriggerRegister = "plugin_trigger_register" { phid: u64, name: String, tags: BTreeSet<String> },
        PluginHandlerUnregister = "plugin_handler_unregister" { phid: u64 },
        /// Server accepted a handler; sent before any dispatch to it
        PluginHandlerRegistered = "plugin_handler_registered" { phid: u64 },
        /// Server dropped a handler, e.g. because registration failed
        PluginHandlerUnregistered = "plugin_handler_unregistered" { phid: u64, err: Option<VelesError> },

        // Plug-in dispatch
        PluginMethodRun = "plugin_method_run" { pmid: u64, phid: u64, node: NodeID, params: Value },
        PluginMethodResult = "plugin_method_result" { pmid: u64, result: Value },
        PluginMethodError = "plugin_method_error" { pmid: u64, err: VelesError },
        PluginQueryGet = "plugin_query_get" { pqid: u64, phid: u64, node: NodeID, params: Value },
        PluginQueryResult = "plugin_query_result" { pqid: u64, result: Value, checks: Vec<Check> },
        PluginQueryError = "plugin_query_error" { pqid: u64, err: VelesError, checks: Vec<Check> },
        PluginBroadcastRun = "plugin_broadcast_run" { pbid: u64, phid: u64, params: Value },
        PluginBroadcastResult = "plugin_broadcast_result" { pbid: u64, results: Vec<Value> },
        PluginBroadcastError = "plugin_broadcast_error" { pbid: u64, err: VelesError },
        PluginTriggerRun = "plugin_trigger_run" { ptid: u64, phid: u64, node: NodeID },
        PluginTriggerDone = "plugin_trigger_done" { ptid: u64, ops: Vec<Operation>, checks: Vec<Check> },
        PluginTriggerError = "plugin_trigger_error" { ptid: u64, err: VelesError },

        // Introspection
        ListConnections = "list_connections" { qid: u64, sub: bool },
        ConnectionsReply = "connections_reply" { qid: u64, connections: Vec<ConnectionInfo> },
    }
}

impl Message {
    /// The single operation a convenience write stands for; other messages come back unchanged.
    pub fn into_operation(self) -> Result<(u64, Operation), Message> {
        let op = match self {
            Message::Create {
                rid,
                id,
                parent,
                pos_start,
                pos_end,
                tags,
                attr,
                data,
                bindata,
                triggers,
            } => (
                rid,
                Operation::Create {
                    node: id,
                    parent,
                    pos_start,
                    pos_end,
                    tags,
                    attr,
                    data,
                    bindata,
                    triggers,
                },
            ),
            Message::Delete { rid, id } => (rid, Operation::Delete { node: id }),
            Message::SetParent { rid, id, parent } => (rid, Operation::SetParent { node: id, parent }),
            Message::SetPos { rid, id, pos_start, pos_end } => (
                rid,
                Operation::SetPos {
                    node: id,
                    pos_start,
                    pos_end,
                },
            ),
            Message::AddTag { rid, id, tag } => (rid, Operation::AddTag { node: id, tag }),
            Message::DelTag { rid, id, tag } => (rid, Operation::DelTag { node: id, tag }),
            Message::SetAttr { rid, id, key, data } => (rid, Operation::SetAttr { node: id, key, data }),
            Message::SetData { rid, id, key, data } => (rid, Operation::SetData { node: id, key, data }),
            Message::SetBindata {
                rid,
                id,
                key,
                start,
                data,
                truncate,
            } => (
                rid,
                Operation::SetBindata {
                    node: id,
                    key,
                    start,
                    data,
                    truncate,
                },
            ),
            other => return Err(other),
        };
        Ok(op)
    }

    pub fn connected() -> Self {
        Message::Connected {
            proto_version: super::PROTO_VERSION,
            server_name: "veles".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl From<&Message> for ConnectionInfo {
    fn from(msg: &Message) -> Self {
        match msg {
            Message::Connect {
                client_name,
                client_version,
                client_description,
                client_type,
                ..
            } => ConnectionInfo {
                id: 0,
                client_name: client_name.clone(),
                client_version: client_version.clone(),
                client_description: client_description.clone(),
                client_type: client_type.clone(),
            },
            _ => ConnectionInfo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FromValue, IntoValue};

    #[test]
    fn test_message_tags_are_contractual() {
        let qid = 7;
        assert_eq!(Message::CancelSubscription { qid }.object_type(), "cancel_subscription");
        let get = Message::PluginQueryGet { pqid: 1, phid: 2, node: NodeID::random(), params: Value::Nil };
        assert_eq!(get.object_type(), "plugin_query_get");
    }

    #[test]
    fn test_transaction_message_wire_form() {
        let node = NodeID::random();
        let msg = Message::Transaction {
            rid: 3,
            checks: vec![Check::Gone { node }],
            ops: vec![Operation::AddTag { node, tag: "x".into() }],
        };
        let value = msg.clone().into_value();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("object_type"), Some(&Value::from("transaction")));
        assert_eq!(Message::from_value(value).unwrap(), msg);
    }

    #[test]
    fn test_convenience_write_maps_to_operation() {
        let id = NodeID::random();
        let msg = Message::SetAttr { rid: 9, id, key: "x".into(), data: None };
        assert_eq!(
            msg.into_operation(),
            Ok((9, Operation::SetAttr { node: id, key: "x".into(), data: None }))
        );
        let ack = Message::RequestAck { rid: 9 };
        assert_eq!(ack.clone().into_operation(), Err(ack));
    }

    #[test]
    fn test_optional_sub_flag_defaults_off() {
        let id = NodeID::random();
        let value = Value::map([
            ("object_type", Value::from("get")),
            ("qid", Value::from(1u64)),
            ("id", Value::from(id)),
        ]);
        assert_eq!(Message::from_value(value).unwrap(), Message::Get { qid: 1, id, sub: false });
    }
}
