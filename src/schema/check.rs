//! Checks: captured reads, replayable against live state.
//!
//! A check names a subject node and the value that was observed. The tracker
//! uses them as transaction preconditions and as query-cache dependencies.

use crate::schema::node::PosFilter;
use crate::schema::value::Value;
use crate::types::{NodeID, TriggerState};
use bytes::Bytes;
use num_bigint::BigInt;
use std::collections::{BTreeSet, HashSet};

crate::tagged_enum! {
    /// Closed set of precondition kinds
    #[derive(Debug, Clone, PartialEq)]
    pub enum Check {
        /// Node does not exist
        Gone = "gone" { node: NodeID },
        Parent = "parent" { node: NodeID, parent: NodeID },
        Pos = "pos" { node: NodeID, pos_start: Option<BigInt>, pos_end: Option<BigInt> },
        Tags = "tags" { node: NodeID, tags: BTreeSet<String> },
        Tag = "tag" { node: NodeID, tag: String, present: bool },
        /// `data` of `None` means the key is absent
        Attr = "attr" { node: NodeID, key: String, data: Option<Value> },
        Data = "data" { node: NodeID, key: String, data: Option<Value> },
        BindataSize = "bindata_size" { node: NodeID, key: String, size: u64 },
        Bindata = "bindata" { node: NodeID, key: String, start: u64, end: Option<u64>, data: Bytes },
        Trigger = "trigger" { node: NodeID, key: String, state: Option<TriggerState> },
        /// Exact id set of `parent`'s children matching `tags` and `pos_filter`
        List = "list" { parent: NodeID, tags: BTreeSet<String>, pos_filter: PosFilter, nodes: BTreeSet<NodeID> },
    }
}

impl Check {
    /// Node whose state this check observes; for list checks, the parent.
    pub fn subject(&self) -> NodeID {
        match self {
            Check::Gone { node }
            | Check::Parent { node, .. }
            | Check::Pos { node, .. }
            | Check::Tags { node, .. }
            | Check::Tag { node, .. }
            | Check::Attr { node, .. }
            | Check::Data { node, .. }
            | Check::BindataSize { node, .. }
            | Check::Bindata { node, .. }
            | Check::Trigger { node, .. } => *node,
            Check::List { parent, .. } => *parent,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Check::List { .. })
    }
}

/// Nodes touched by a set of checks, split by how a change reaches them.
pub fn check_subjects(checks: &[Check]) -> (HashSet<NodeID>, HashSet<NodeID>) {
    let mut nodes = HashSet::new();
    let mut lists = HashSet::new();
    for check in checks {
        if check.is_list() {
            lists.insert(check.subject());
        } else {
            nodes.insert(check.subject());
        }
    }
    (nodes, lists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fields::{FromValue, IntoValue};

    #[test]
    fn test_check_tag_names() {
        let id = NodeID::random();
        assert_eq!(Check::Gone { node: id }.object_type(), "gone");
        let check = Check::BindataSize { node: id, key: "code".into(), size: 3 };
        assert_eq!(check.object_type(), "bindata_size");
        assert_eq!(check.subject(), id);
    }

    #[test]
    fn test_list_check_wire_form() {
        let parent = NodeID::random();
        let check = Check::List {
            parent,
            tags: ["chunk".to_string()].into_iter().collect(),
            pos_filter: PosFilter::intersecting(BigInt::from(0), BigInt::from(8)),
            nodes: [NodeID::random()].into_iter().collect(),
        };
        let back = Check::from_value(check.clone().into_value()).unwrap();
        assert_eq!(back, check);
        let (nodes, lists) = check_subjects(&[check]);
        assert!(nodes.is_empty());
        assert!(lists.contains(&parent));
    }
}
