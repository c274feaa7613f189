use bytes::Bytes;
use num_bigint::BigInt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use veles::proto::{read_message, write_message, Message, DEFAULT_MAX_FRAME_SIZE, KEY_SIZE, PROTO_VERSION};
use veles::{Client, Connection, Event, NewNode, NodeID, Value};

use crate::support::{info, next_event, query_value, tags, SumPosStart, TestServer, KEY};

fn connect_message(proto_version: u64) -> Message {
    Message::Connect {
        proto_version,
        client_name: "raw".to_string(),
        client_version: "0".to_string(),
        client_description: String::new(),
        client_type: "test".to_string(),
    }
}

async fn recv(stream: &mut tokio::io::DuplexStream) -> Message {
    read_message(stream, DEFAULT_MAX_FRAME_SIZE)
        .await
        .unwrap()
        .expect("server reply")
}

/// Raw session past the handshake.
async fn raw_session(server: &TestServer) -> tokio::io::DuplexStream {
    let mut stream = server.pipe();
    stream.write_all(&KEY).await.unwrap();
    write_message(&mut stream, connect_message(PROTO_VERSION)).await.unwrap();
    match recv(&mut stream).await {
        Message::Connected { proto_version, .. } => assert_eq!(proto_version, PROTO_VERSION),
        other => panic!("unexpected {:?}", other),
    }
    stream
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    let server = TestServer::new();
    let err = Client::connect(server.pipe(), &[0u8; KEY_SIZE], info("intruder"))
        .await
        .err()
        .expect("handshake fails");
    assert_eq!(err.code(), "authentication_error");
}

#[tokio::test]
async fn protocol_version_mismatch_is_rejected() {
    let server = TestServer::new();
    let mut stream = server.pipe();
    stream.write_all(&KEY).await.unwrap();
    write_message(&mut stream, connect_message(PROTO_VERSION + 1)).await.unwrap();
    match recv(&mut stream).await {
        Message::ConnectionError { err } => assert_eq!(err.code(), "protocol_mismatch"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(read_message(&mut stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap().is_none());
}

#[tokio::test]
async fn reads_and_writes_round_trip() {
    let server = TestServer::new();
    let client = server.client("rw").await;

    let node = client
        .create(
            NewNode::new(NodeID::root())
                .with_tag("file")
                .with_pos(Some(BigInt::from(-3)), None)
                .with_attr("name", Value::from("a.out")),
        )
        .await
        .unwrap();
    client.set_data(node, "blob", Some(Value::from(42i64))).await.unwrap();
    client
        .set_bindata(node, "raw", 0, Bytes::from_static(b"\x7fELF"), false)
        .await
        .unwrap();

    let local = server.local();
    let seen = local.get_node(node).await.unwrap();
    assert!(seen.tags.contains("file"));
    assert_eq!(seen.pos_start, Some(BigInt::from(-3)));

    let fetched = client.get_node(node).await.unwrap();
    assert_eq!(fetched, seen);
    assert_eq!(client.get_data(node, "blob").await.unwrap(), Some(Value::from(42i64)));
    assert_eq!(
        client.get_bindata(node, "raw", 1, None).await.unwrap(),
        Bytes::from_static(b"ELF")
    );

    let missing = client.get_node(NodeID::random()).await.unwrap_err();
    assert_eq!(missing.code(), "object_gone");
    let cycle = client.set_parent(NodeID::root(), node).await;
    assert!(cycle.is_err());
}

#[tokio::test]
async fn query_subscription_over_the_wire() {
    let server = TestServer::new();
    server
        .local()
        .register_query("sum_pos_start", tags(&["group"]), Arc::new(SumPosStart))
        .await
        .unwrap();
    let client = server.client("viewer").await;
    let group = client.create(NewNode::new(NodeID::root()).with_tag("group")).await.unwrap();

    let mut sub = client.get_query_sub(group, "sum_pos_start", Value::Nil).await.unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(0i64));

    let first = client
        .create(NewNode::new(group).with_pos(Some(BigInt::from(5)), None))
        .await
        .unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(5i64));
    client
        .create(NewNode::new(group).with_pos(Some(BigInt::from(7)), None))
        .await
        .unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(12i64));
    client.delete(first).await.unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(7i64));

    sub.cancel();
    assert_eq!(next_event(&mut sub).await, Event::Cancelled);
    assert!(sub.next().await.is_none());
}

#[tokio::test]
async fn node_subscription_ends_when_node_is_deleted() {
    let server = TestServer::new();
    let client = server.client("watcher").await;
    let node = client.create(NewNode::new(NodeID::root())).await.unwrap();

    let mut sub = client.get_node_sub(node).await.unwrap();
    assert!(matches!(next_event(&mut sub).await, Event::Node(n) if n.id == node));
    client.add_tag(node, "seen").await.unwrap();
    match next_event(&mut sub).await {
        Event::Node(n) => assert!(n.tags.contains("seen")),
        other => panic!("unexpected {:?}", other),
    }
    server.local().delete(node).await.unwrap();
    match next_event(&mut sub).await {
        Event::Error(err) => assert_eq!(err.code(), "object_gone"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(sub.next().await.is_none());
}

#[tokio::test]
async fn reused_qid_is_reported_as_in_use() {
    let server = TestServer::new();
    let node = server.local().create(NewNode::new(NodeID::root())).await.unwrap();
    let mut stream = raw_session(&server).await;

    let get = Message::Get { qid: 1, id: node, sub: true };
    write_message(&mut stream, get.clone()).await.unwrap();
    write_message(&mut stream, get).await.unwrap();

    let mut replied = false;
    let mut refused = false;
    while !(replied && refused) {
        match recv(&mut stream).await {
            Message::GetReply { qid: 1, obj } => {
                assert_eq!(obj.id, node);
                replied = true;
            }
            Message::QueryError { qid: 1, err, terminal, .. } => {
                assert_eq!(err.code(), "subscription_in_use");
                assert!(!terminal);
                refused = true;
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    write_message(&mut stream, Message::CancelSubscription { qid: 1 }).await.unwrap();
    loop {
        match recv(&mut stream).await {
            Message::SubscriptionCancelled { qid } => {
                assert_eq!(qid, 1);
                break;
            }
            Message::GetReply { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    write_message(&mut stream, Message::CancelSubscription { qid: 1 }).await.unwrap();
    match recv(&mut stream).await {
        Message::QueryError { qid, err, terminal, .. } => {
            assert_eq!(qid, 1);
            assert_eq!(err.code(), "unknown_subscription");
            assert!(terminal);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn no_events_follow_a_cancel_request() {
    let server = TestServer::new();
    let node = server.local().create(NewNode::new(NodeID::root())).await.unwrap();
    let mut stream = raw_session(&server).await;

    write_message(&mut stream, Message::Get { qid: 1, id: node, sub: true }).await.unwrap();
    match recv(&mut stream).await {
        Message::GetReply { qid: 1, obj } => assert_eq!(obj.id, node),
        other => panic!("unexpected {:?}", other),
    }

    write_message(&mut stream, Message::CancelSubscription { qid: 1 }).await.unwrap();
    write_message(
        &mut stream,
        Message::AddTag {
            rid: 10,
            id: node,
            tag: "late".to_string(),
        },
    )
    .await
    .unwrap();
    write_message(&mut stream, Message::Get { qid: 2, id: node, sub: false }).await.unwrap();

    let mut cancelled = false;
    let mut acked = false;
    let mut fetched = false;
    while !(cancelled && fetched) {
        match recv(&mut stream).await {
            Message::SubscriptionCancelled { qid: 1 } => cancelled = true,
            Message::RequestAck { rid: 10 } => acked = true,
            Message::GetReply { qid: 2, obj } => {
                assert!(acked);
                assert!(obj.tags.contains("late"));
                fetched = true;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn malformed_message_gets_proto_error() {
    let server = TestServer::new();
    let mut stream = raw_session(&server).await;
    let payload = rmpv::Value::Map(vec![(rmpv::Value::from("object_type"), rmpv::Value::from("no_such_message"))]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &payload).unwrap();
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await.unwrap();
    stream.write_all(&bytes).await.unwrap();
    match recv(&mut stream).await {
        Message::ProtoError { err } => assert_eq!(err.code(), "schema_error"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn connection_table_lists_clients() {
    let server = TestServer::new();
    let first = server.client("first").await;
    let mut sub = first.list_connections_sub().await.unwrap();
    match next_event(&mut sub).await {
        Event::Connections(list) => assert_eq!(list.len(), 1),
        other => panic!("unexpected {:?}", other),
    }

    let second = server.client("second").await;
    match next_event(&mut sub).await {
        Event::Connections(list) => {
            let names: Vec<&str> = list.iter().map(|c| c.client_name.as_str()).collect();
            assert_eq!(names, vec!["first", "second"]);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(second.list_connections().await.unwrap().len(), 2);
}
