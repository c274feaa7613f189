use async_trait::async_trait;
use num_bigint::BigInt;
use std::collections::BTreeSet;
use std::sync::Arc;
use veles::conn::{BroadcastHandler, MethodHandler, TriggerHandler};
use veles::tracer::Tracer;
use veles::types::TriggerState;
use veles::{Connection, Event, NewNode, NodeID, Operation, Value, VelesError};

use crate::support::{next_event, query_value, tags, SumPosStart, TestServer};

/// Returns the node's `name` attribute with a prefix taken from the params.
struct Greet;

#[async_trait]
impl MethodHandler for Greet {
    async fn run(&self, conn: Arc<dyn Connection>, node: NodeID, params: Value) -> Result<Value, VelesError> {
        let node = conn.get_node(node).await?;
        let name = match node.attr.get("name") {
            Some(Value::Str(name)) => name.clone(),
            _ => return Err(VelesError::Handler("node has no name".to_string())),
        };
        match params {
            Value::Str(prefix) => Ok(Value::from(format!("{}{}", prefix, name))),
            _ => Ok(Value::from(name)),
        }
    }
}

struct Census(&'static str);

#[async_trait]
impl BroadcastHandler for Census {
    async fn run(&self, _conn: Arc<dyn Connection>, _params: Value) -> Result<Vec<Value>, VelesError> {
        Ok(vec![Value::from(self.0)])
    }
}

/// Copies the `name` attribute into the `name` data slot.
struct CopyName;

#[async_trait]
impl TriggerHandler for CopyName {
    async fn run(&self, tracer: &mut Tracer, node: NodeID) -> Result<Vec<Operation>, VelesError> {
        let name = tracer.get_attr(node, "name").await?;
        Ok(vec![Operation::SetData {
            node,
            key: "name".to_string(),
            data: name,
        }])
    }
}

#[tokio::test]
async fn query_hosted_by_another_client() {
    let server = TestServer::new();
    let host = server.client("host").await;
    host.register_query("sum_pos_start", tags(&["group"]), Arc::new(SumPosStart))
        .await
        .unwrap();

    let user = server.client("user").await;
    let group = user.create(NewNode::new(NodeID::root()).with_tag("group")).await.unwrap();
    let mut sub = user.get_query_sub(group, "sum_pos_start", Value::Nil).await.unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(0i64));

    user.create(NewNode::new(group).with_pos(Some(BigInt::from(4)), None))
        .await
        .unwrap();
    assert_eq!(query_value(next_event(&mut sub).await), Value::from(4i64));

    let outcome = user.get_query(group, "sum_pos_start", Value::Nil).await;
    assert_eq!(outcome.result, Ok(Value::from(4i64)));
    assert!(!outcome.checks.is_empty());
}

#[tokio::test]
async fn method_hosted_by_another_client() {
    let server = TestServer::new();
    let host = server.client("host").await;
    let handler = host
        .register_method("greet", tags(&["person"]), Arc::new(Greet))
        .await
        .unwrap();

    let user = server.client("user").await;
    let node = user
        .create(
            NewNode::new(NodeID::root())
                .with_tag("person")
                .with_attr("name", Value::from("Mokosh")),
        )
        .await
        .unwrap();
    let result = user.run_method(node, "greet", Value::from("hi ")).await.unwrap();
    assert_eq!(result, Value::from("hi Mokosh"));

    let bare = user.create(NewNode::new(NodeID::root())).await.unwrap();
    let err = user.run_method(bare, "greet", Value::Nil).await.unwrap_err();
    assert_eq!(err.code(), "method_not_found");

    host.unregister(handler).await.unwrap();
    host.list_connections().await.unwrap();
    let err = user.run_method(node, "greet", Value::Nil).await.unwrap_err();
    assert_eq!(err.code(), "method_not_found");
}

#[tokio::test]
async fn handlers_vanish_with_their_client() {
    let server = TestServer::new();
    let host = server.client("host").await;
    host.register_method("greet", BTreeSet::new(), Arc::new(Greet)).await.unwrap();
    drop(host);

    let user = server.client("user").await;
    let node = user
        .create(NewNode::new(NodeID::root()).with_attr("name", Value::from("x")))
        .await
        .unwrap();
    // The session notices the hang-up asynchronously.
    let mut code = String::new();
    for _ in 0..100 {
        match user.run_method(node, "greet", Value::Nil).await {
            Err(err) if err.code() == "method_not_found" => {
                code = err.code().to_string();
                break;
            }
            _ => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
        }
    }
    assert_eq!(code, "method_not_found");
}

#[tokio::test]
async fn broadcast_collects_every_client() {
    let server = TestServer::new();
    let a = server.client("a").await;
    let b = server.client("b").await;
    a.register_broadcast("census", Arc::new(Census("a"))).await.unwrap();
    b.register_broadcast("census", Arc::new(Census("b"))).await.unwrap();

    let mut results = a.run_broadcast("census", Value::Nil).await.unwrap();
    results.sort_by_key(|v| format!("{:?}", v));
    assert_eq!(results, vec![Value::from("a"), Value::from("b")]);
    assert!(a.run_broadcast("nobody", Value::Nil).await.unwrap().is_empty());
}

#[tokio::test]
async fn trigger_hosted_by_a_client_completes() {
    let server = TestServer::new();
    let worker = server.client("worker").await;
    worker
        .register_trigger("copy_name", BTreeSet::new(), Arc::new(CopyName))
        .await
        .unwrap();

    let user = server.client("user").await;
    let node = user
        .create(
            NewNode::new(NodeID::root())
                .with_attr("name", Value::from("Perun"))
                .with_trigger("copy_name"),
        )
        .await
        .unwrap();

    let mut sub = user.get_node_sub(node).await.unwrap();
    loop {
        match next_event(&mut sub).await {
            Event::Node(n) if n.triggers.get("copy_name") == Some(&TriggerState::Done) => break,
            Event::Node(_) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(
        user.get_data(node, "name").await.unwrap(),
        Some(Value::from("Perun"))
    );
}

#[tokio::test]
async fn overlapping_remote_registration_is_refused() {
    let server = TestServer::new();
    let host = server.client("host").await;
    host.register_method("greet", tags(&["person"]), Arc::new(Greet))
        .await
        .unwrap();

    let err = host
        .register_method("greet", tags(&["person", "admin"]), Arc::new(Greet))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "tags_ambiguous");

    let local_err = server
        .local()
        .register_method("greet", BTreeSet::new(), Arc::new(Greet))
        .await
        .unwrap_err();
    assert_eq!(local_err.code(), err.code());

    let user = server.client("user").await;
    let node = user
        .create(
            NewNode::new(NodeID::root())
                .with_tag("person")
                .with_tag("admin")
                .with_attr("name", Value::from("Veles")),
        )
        .await
        .unwrap();
    let result = user.run_method(node, "greet", Value::Nil).await.unwrap();
    assert_eq!(result, Value::from("Veles"));
}
