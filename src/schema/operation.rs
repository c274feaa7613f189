//! Transaction operations.

use crate::schema::value::Value;
use crate::types::NodeID;
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet};

crate::tagged_enum! {
    /// A single mutation applied inside a transaction
    #[derive(Debug, Clone, PartialEq)]
    pub enum Operation {
        Create = "create" {
            node: NodeID,
            parent: NodeID,
            pos_start: Option<BigInt>,
            pos_end: Option<BigInt>,
            tags: BTreeSet<String>,
            attr: BTreeMap<String, Value>,
            data: BTreeMap<String, Value>,
            bindata: BTreeMap<String, Bytes>,
            triggers: BTreeSet<String>,
        },
        /// Removes the node and, recursively, all of its descendants
        Delete = "delete" { node: NodeID },
        SetParent = "set_parent" { node: NodeID, parent: NodeID },
        SetPos = "set_pos" { node: NodeID, pos_start: Option<BigInt>, pos_end: Option<BigInt> },
        AddTag = "add_tag" { node: NodeID, tag: String },
        DelTag = "del_tag" { node: NodeID, tag: String },
        /// `None` deletes the key
        SetAttr = "set_attr" { node: NodeID, key: String, data: Option<Value> },
        SetData = "set_data" { node: NodeID, key: String, data: Option<Value> },
        SetBindata = "set_bindata" { node: NodeID, key: String, start: u64, data: Bytes, truncate: bool },
        AddTrigger = "add_trigger" { node: NodeID, trigger: String },
        DelTrigger = "del_trigger" { node: NodeID, trigger: String },
        FinishTrigger = "finish_trigger" { node: NodeID, trigger: String },
    }
}

impl Operation {
    /// Node this operation mutates.
    pub fn node(&self) -> NodeID {
        match self {
            Operation::Create { node, .. }
            | Operation::Delete { node }
            | Operation::SetParent { node, .. }
            | Operation::SetPos { node, .. }
            | Operation::AddTag { node, .. }
            | Operation::DelTag { node, .. }
            | Operation::SetAttr { node, .. }
            | Operation::SetData { node, .. }
            | Operation::SetBindata { node, .. }
            | Operation::AddTrigger { node, .. }
            | Operation::DelTrigger { node, .. }
            | Operation::FinishTrigger { node, .. } => *node,
        }
    }
}

/// Builder for `Operation::Create`
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub id: NodeID,
    pub parent: NodeID,
    pub pos_start: Option<BigInt>,
    pub pos_end: Option<BigInt>,
    pub tags: BTreeSet<String>,
    pub attr: BTreeMap<String, Value>,
    pub data: BTreeMap<String, Value>,
    pub bindata: BTreeMap<String, Bytes>,
    pub triggers: BTreeSet<String>,
}

impl NewNode {
    /// New node with a random id under `parent`.
    pub fn new(parent: NodeID) -> Self {
        NewNode {
            id: NodeID::random(),
            parent,
            pos_start: None,
            pos_end: None,
            tags: BTreeSet::new(),
            attr: BTreeMap::new(),
            data: BTreeMap::new(),
            bindata: BTreeMap::new(),
            triggers: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: NodeID) -> Self {
        self.id = id;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_pos(mut self, start: Option<BigInt>, end: Option<BigInt>) -> Self {
        self.pos_start = start;
        self.pos_end = end;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attr.insert(key.into(), value);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_bindata(mut self, key: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        self.bindata.insert(key.into(), bytes.into());
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.insert(trigger.into());
        self
    }

    pub fn into_operation(self) -> Operation {
        Operation::Create {
            node: self.id,
            parent: self.parent,
            pos_start: self.pos_start,
            pos_end: self.pos_end,
            tags: self.tags,
            attr: self.attr,
            data: self.data,
            bindata: self.bindata,
            triggers: self.triggers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fields::{FromValue, IntoValue};

    #[test]
    fn test_builder_produces_create() {
        let parent = NodeID::random();
        let op = NewNode::new(parent)
            .with_tag("file")
            .with_pos(Some(BigInt::from(0)), Some(BigInt::from(10)))
            .with_bindata("code", vec![1u8, 2, 3])
            .into_operation();
        assert_eq!(op.object_type(), "create");
        match &op {
            Operation::Create { parent: p, tags, bindata, .. } => {
                assert_eq!(*p, parent);
                assert!(tags.contains("file"));
                assert_eq!(bindata["code"].as_ref(), &[1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Operation::from_value(op.clone().into_value()).unwrap(), op);
    }

    #[test]
    fn test_set_attr_none_is_nil_on_wire() {
        let op = Operation::SetAttr { node: NodeID::random(), key: "x".into(), data: None };
        let value = op.into_value();
        assert_eq!(value.as_map().unwrap().get("data"), Some(&Value::Nil));
    }
}
