use bytes::Bytes;
use num_bigint::BigInt;
use std::sync::Arc;
use tempfile::TempDir;
use veles::backend::SqliteBackend;
use veles::{Check, Connection, LocalConnection, NewNode, NodeID, Operation, PosFilter, Tracker, Value};

use crate::support::tags;

fn open(dir: &TempDir) -> Arc<LocalConnection> {
    let backend = SqliteBackend::open(dir.path().join("veles.db")).unwrap();
    LocalConnection::new(Tracker::new(Box::new(backend), 64))
}

#[tokio::test]
async fn list_filters_children_by_tag_and_position() {
    let conn = LocalConnection::new(Tracker::in_memory().unwrap());
    let a = conn.create(NewNode::new(NodeID::root()).with_tag("file")).await.unwrap();
    let b = conn
        .create(
            NewNode::new(a)
                .with_tag("chunk")
                .with_pos(Some(BigInt::from(0)), Some(BigInt::from(10))),
        )
        .await
        .unwrap();

    let early = PosFilter {
        start_to: Some(BigInt::from(5)),
        ..PosFilter::all()
    };
    let ids: Vec<NodeID> = conn
        .get_list(a, tags(&["chunk"]), early)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ids, vec![b]);

    let late = PosFilter {
        start_from: Some(BigInt::from(6)),
        ..PosFilter::all()
    };
    assert!(conn.get_list(a, tags(&["chunk"]), late).await.unwrap().is_empty());
}

#[tokio::test]
async fn bindata_overwrite_across_page_boundary() {
    let conn = LocalConnection::new(Tracker::in_memory().unwrap());
    let node = conn.create(NewNode::new(NodeID::root())).await.unwrap();
    conn.set_bindata(node, "raw", 0, Bytes::from(vec![b'A'; 70000]), false)
        .await
        .unwrap();
    conn.set_bindata(node, "raw", 65530, Bytes::from(vec![b'B'; 10]), false)
        .await
        .unwrap();

    let mut expected = vec![b'A'; 65530];
    expected.extend_from_slice(&[b'B'; 10]);
    expected.extend(std::iter::repeat(b'A').take(70000 - 65540));
    let data = conn.get_bindata(node, "raw", 0, Some(70000)).await.unwrap();
    assert_eq!(data.as_ref(), expected.as_slice());
    assert_eq!(conn.get_node(node).await.unwrap().bindata_len("raw"), 70000);

    let err = conn
        .set_bindata(node, "raw", 70001, Bytes::from_static(b"x"), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "write_past_end");
}

#[tokio::test]
async fn failed_check_rolls_back_transaction() {
    let conn = LocalConnection::new(Tracker::in_memory().unwrap());
    let node = conn
        .create(NewNode::new(NodeID::root()).with_attr("x", Value::from(1i64)))
        .await
        .unwrap();
    let set_x = |v: i64| Operation::SetAttr {
        node,
        key: "x".to_string(),
        data: Some(Value::from(v)),
    };
    let check_x = |v: i64| Check::Attr {
        node,
        key: "x".to_string(),
        data: Some(Value::from(v)),
    };

    let err = conn.transaction(vec![check_x(2)], vec![set_x(3)]).await.unwrap_err();
    assert_eq!(err.code(), "precondition_failed");
    let attr = conn.get_node(node).await.unwrap().attr;
    assert_eq!(attr.get("x"), Some(&Value::from(1i64)));

    conn.transaction(vec![check_x(1)], vec![set_x(3)]).await.unwrap();
    let attr = conn.get_node(node).await.unwrap().attr;
    assert_eq!(attr.get("x"), Some(&Value::from(3i64)));
}

#[tokio::test]
async fn reparenting_under_own_descendant_is_rejected() {
    let conn = LocalConnection::new(Tracker::in_memory().unwrap());
    let a = conn.create(NewNode::new(NodeID::root())).await.unwrap();
    let b = conn.create(NewNode::new(a)).await.unwrap();
    let err = conn.set_parent(a, b).await.unwrap_err();
    assert_eq!(err.code(), "parent_cycle");
    assert_eq!(conn.get_node(a).await.unwrap().parent, NodeID::root());
}

#[tokio::test]
async fn store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let node = {
        let conn = open(&dir);
        conn.create(
                NewNode::new(NodeID::root())
                    .with_tag("file")
                    .with_data("meta", Value::from("kept"))
                    .with_bindata("raw", Bytes::from_static(b"hello")),
            )
            .await
            .unwrap()
    };

    let conn = open(&dir);
    let stored = conn.get_node(node).await.unwrap();
    assert!(stored.tags.contains("file"));
    assert_eq!(conn.get_data(node, "meta").await.unwrap(), Some(Value::from("kept")));
    assert_eq!(
        conn.get_bindata(node, "raw", 0, None).await.unwrap(),
        Bytes::from_static(b"hello")
    );
}

#[tokio::test]
async fn delete_removes_descendants() {
    let conn = LocalConnection::new(Tracker::in_memory().unwrap());
    let a = conn.create(NewNode::new(NodeID::root())).await.unwrap();
    let b = conn.create(NewNode::new(a)).await.unwrap();
    conn.delete(a).await.unwrap();
    assert_eq!(conn.get_node(b).await.unwrap_err().code(), "object_gone");
}
