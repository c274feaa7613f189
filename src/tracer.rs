//! Tracer: a read-recording view of a connection.
//!
//! Query and trigger handlers read the store only through a tracer. Every
//! helper returns the value read and appends a [`Check`] describing exactly
//! what was observed, so the result can be cached and invalidated precisely.

use crate::conn::Connection;
use crate::error::VelesError;
use crate::schema::{Check, Node, PosFilter, Value};
use crate::types::{NodeID, TriggerState};
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub struct Tracer {
    conn: Arc<dyn Connection>,
    nodes: HashMap<NodeID, Option<Node>>,
    checks: Vec<Check>,
}

impl Tracer {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Tracer {
            conn,
            nodes: HashMap::new(),
            checks: Vec::new(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn into_checks(self) -> Vec<Check> {
        self.checks
    }

    /// Record checks gathered elsewhere, e.g. by a remote handler.
    pub fn extend_checks(&mut self, checks: impl IntoIterator<Item = Check>) {
        self.checks.extend(checks);
    }

    /// Load a node once per trace. A missing node records a `gone` check.
    pub async fn get_node(&mut self, id: NodeID) -> Result<Node, VelesError> {
        if let Some(cached) = self.nodes.get(&id) {
            return cached.clone().ok_or_else(|| VelesError::gone(id));
        }
        match self.conn.get_node(id).await {
            Ok(node) => {
                self.nodes.insert(id, Some(node.clone()));
                Ok(node)
            }
            Err(VelesError::ObjectGone(msg)) => {
                self.nodes.insert(id, None);
                self.checks.push(Check::Gone { node: id });
                Err(VelesError::ObjectGone(msg))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get_parent(&mut self, id: NodeID) -> Result<NodeID, VelesError> {
        let node = self.get_node(id).await?;
        self.checks.push(Check::Parent {
            node: id,
            parent: node.parent,
        });
        Ok(node.parent)
    }

    pub async fn get_pos(&mut self, id: NodeID) -> Result<(Option<BigInt>, Option<BigInt>), VelesError> {
        let node = self.get_node(id).await?;
        self.checks.push(Check::Pos {
            node: id,
            pos_start: node.pos_start.clone(),
            pos_end: node.pos_end.clone(),
        });
        Ok((node.pos_start, node.pos_end))
    }

    pub async fn get_tags(&mut self, id: NodeID) -> Result<BTreeSet<String>, VelesError> {
        let node = self.get_node(id).await?;
        self.checks.push(Check::Tags {
            node: id,
            tags: node.tags.clone(),
        });
        Ok(node.tags)
    }

    pub async fn has_tag(&mut self, id: NodeID, tag: &str) -> Result<bool, VelesError> {
        let node = self.get_node(id).await?;
        let present = node.tags.contains(tag);
        self.checks.push(Check::Tag {
            node: id,
            tag: tag.to_string(),
            present,
        });
        Ok(present)
    }

    pub async fn get_attr(&mut self, id: NodeID, key: &str) -> Result<Option<Value>, VelesError> {
        let node = self.get_node(id).await?;
        let data = node.attr.get(key).cloned();
        self.checks.push(Check::Attr {
            node: id,
            key: key.to_string(),
            data: data.clone(),
        });
        Ok(data)
    }

    pub async fn get_data(&mut self, id: NodeID, key: &str) -> Result<Option<Value>, VelesError> {
        self.get_node(id).await?;
        let data = self.conn.get_data(id, key).await?;
        self.checks.push(Check::Data {
            node: id,
            key: key.to_string(),
            data: data.clone(),
        });
        Ok(data)
    }

    pub async fn get_bindata_size(&mut self, id: NodeID, key: &str) -> Result<u64, VelesError> {
        let node = self.get_node(id).await?;
        let size = node.bindata_len(key);
        self.checks.push(Check::BindataSize {
            node: id,
            key: key.to_string(),
            size,
        });
        Ok(size)
    }

    pub async fn get_bindata(
        &mut self,
        id: NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Bytes, VelesError> {
        self.get_node(id).await?;
        let data = self.conn.get_bindata(id, key, start, end).await?;
        self.checks.push(Check::Bindata {
            node: id,
            key: key.to_string(),
            start,
            end,
            data: data.clone(),
        });
        Ok(data)
    }

    pub async fn get_trigger(&mut self, id: NodeID, key: &str) -> Result<Option<TriggerState>, VelesError> {
        let node = self.get_node(id).await?;
        let state = node.triggers.get(key).copied();
        self.checks.push(Check::Trigger {
            node: id,
            key: key.to_string(),
            state,
        });
        Ok(state)
    }

    pub async fn get_list(
        &mut self,
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
    ) -> Result<Vec<Node>, VelesError> {
        if !parent.is_root() {
            self.get_node(parent).await?;
        }
        let nodes = self
            .conn
            .get_list(parent, tags.clone(), pos_filter.clone())
            .await?;
        for node in &nodes {
            self.nodes.insert(node.id, Some(node.clone()));
        }
        self.checks.push(Check::List {
            parent,
            tags,
            pos_filter,
            nodes: nodes.iter().map(|n| n.id).collect(),
        });
        Ok(nodes)
    }

    /// Run a nested query; its checks become part of this trace.
    pub async fn get_query(&mut self, node: NodeID, name: &str, params: Value) -> Result<Value, VelesError> {
        let outcome = self.conn.get_query(node, name, params).await;
        self.checks.extend(outcome.checks);
        outcome.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::LocalConnection;
    use crate::schema::NewNode;
    use crate::tracker::Tracker;

    #[tokio::test]
    async fn test_reads_record_checks() {
        let conn = LocalConnection::new(Tracker::in_memory().unwrap());
        let file = NewNode::new(NodeID::root())
            .with_tag("file")
            .with_attr("name", Value::from("a.bin"))
            .with_bindata("code", vec![1u8, 2, 3]);
        let file_id = conn.create(file).await.unwrap();
        let chunk = NewNode::new(file_id).with_pos(Some(BigInt::from(0)), Some(BigInt::from(2)));
        let chunk_id = conn.create(chunk).await.unwrap();

        let mut tracer = Tracer::new(conn.clone());
        assert_eq!(tracer.get_attr(file_id, "name").await.unwrap(), Some(Value::from("a.bin")));
        assert!(tracer.has_tag(file_id, "file").await.unwrap());
        assert_eq!(tracer.get_bindata(file_id, "code", 1, None).await.unwrap().as_ref(), &[2, 3]);
        let children = tracer
            .get_list(file_id, BTreeSet::new(), PosFilter::all())
            .await
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(tracer.get_parent(chunk_id).await.unwrap(), file_id);

        let missing = NodeID::random();
        assert_eq!(tracer.get_node(missing).await.unwrap_err().code(), "object_gone");

        let checks = tracer.into_checks();
        let kinds: Vec<&str> = checks.iter().map(|c| c.object_type()).collect();
        assert_eq!(kinds, vec!["attr", "tag", "bindata", "list", "parent", "gone"]);
        for check in &checks {
            assert!(conn.tracker().check(check).unwrap());
        }
    }
}
