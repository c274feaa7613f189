use async_trait::async_trait;
use num_bigint::BigInt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use veles::conn::QueryHandler;
use veles::proto::KEY_SIZE;
use veles::schema::ConnectionInfo;
use veles::tracer::Tracer;
use veles::{Client, Event, LocalConnection, NodeID, PosFilter, Server, Subscription, Tracker, Value, VelesError};

pub const KEY: [u8; KEY_SIZE] = [7u8; KEY_SIZE];

pub fn tags(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn info(name: &str) -> ConnectionInfo {
    ConnectionInfo {
        client_name: name.to_string(),
        client_version: "0.1".to_string(),
        client_type: "test".to_string(),
        ..ConnectionInfo::default()
    }
}

pub async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("event in time")
        .expect("live subscription")
}

pub fn query_value(event: Event) -> Value {
    match event {
        Event::Query { result, .. } => result,
        other => panic!("unexpected {:?}", other),
    }
}

/// Server over an in-memory store; sessions ride on in-process pipes.
pub struct TestServer {
    pub server: Arc<Server>,
}

impl TestServer {
    pub fn new() -> Self {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        TestServer {
            server: Arc::new(Server::new(conn, KEY)),
        }
    }

    pub fn local(&self) -> Arc<LocalConnection> {
        self.server.connection().clone()
    }

    /// Raw stream with a session already serving the other end.
    pub fn pipe(&self) -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let server = self.server.clone();
        tokio::spawn(async move {
            let _ = server.serve(theirs).await;
        });
        ours
    }

    pub async fn client(&self, name: &str) -> Arc<Client> {
        Client::connect(self.pipe(), &KEY, info(name)).await.unwrap()
    }
}

/// Sums `pos_start` over the children of the queried node.
pub struct SumPosStart;

#[async_trait]
impl QueryHandler for SumPosStart {
    async fn get(&self, tracer: &mut Tracer, node: NodeID, _params: Value) -> Result<Value, VelesError> {
        let children = tracer.get_list(node, BTreeSet::new(), PosFilter::all()).await?;
        let mut sum = BigInt::from(0);
        for child in children {
            if let (Some(start), _) = tracer.get_pos(child.id).await? {
                sum += start;
            }
        }
        Ok(Value::Int(sum))
    }
}
