//! Replaying checks against committed state.

use super::TrackerState;
use crate::error::VelesError;
use crate::schema::Check;

impl TrackerState {
    /// Whether `check` still describes the current state.
    pub(super) fn check_holds(&mut self, check: &Check) -> Result<bool, VelesError> {
        if let Check::Gone { node } = check {
            return Ok(!node.is_root() && self.handles.get(node, &*self.backend)?.is_none());
        }
        if let Check::List { parent, tags, pos_filter, nodes } = check {
            if !parent.is_root() && self.handles.get(parent, &*self.backend)?.is_none() {
                return Ok(false);
            }
            return Ok(self.backend.list(parent, tags, pos_filter)? == *nodes);
        }

        let Some(node) = self.handles.get(&check.subject(), &*self.backend)? else {
            return Ok(false);
        };
        let holds = match check {
            Check::Parent { parent, .. } => node.parent == *parent,
            Check::Pos { pos_start, pos_end, .. } => {
                node.pos_start == *pos_start && node.pos_end == *pos_end
            }
            Check::Tags { tags, .. } => node.tags == *tags,
            Check::Tag { tag, present, .. } => node.tags.contains(tag) == *present,
            Check::Attr { key, data, .. } => node.attr.get(key) == data.as_ref(),
            Check::Data { key, data, .. } => self.read_data(&node, &node.id, key)? == *data,
            Check::BindataSize { key, size, .. } => node.bindata_len(key) == *size,
            Check::Bindata { key, start, end, data, .. } => {
                self.backend.get_bindata(&node.id, key, *start, *end)?[..] == data[..]
            }
            Check::Trigger { key, state, .. } => node.triggers.get(key) == state.as_ref(),
            Check::Gone { .. } | Check::List { .. } => false,
        };
        Ok(holds)
    }

    pub(super) fn all_hold(&mut self, checks: &[Check]) -> Result<bool, VelesError> {
        for check in checks {
            if !self.check_holds(check)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{Check, NewNode, Operation, PosFilter, Value};
    use crate::tracker::Tracker;
    use crate::types::{NodeID, TriggerState};
    use bytes::Bytes;
    use num_bigint::BigInt;
    use std::collections::BTreeSet;

    #[test]
    fn test_checks_against_live_state() {
        let tracker = Tracker::in_memory().unwrap();
        let create = NewNode::new(NodeID::root())
            .with_tag("file")
            .with_pos(Some(BigInt::from(3)), None)
            .with_attr("x", Value::from(1i64))
            .with_data("d", Value::from("v"))
            .with_bindata("code", vec![1u8, 2, 3, 4])
            .with_trigger("parse");
        let id = create.id;
        tracker.transaction(&[], vec![create.into_operation()]).unwrap();

        let holding = vec![
            Check::Parent { node: id, parent: NodeID::root() },
            Check::Pos { node: id, pos_start: Some(BigInt::from(3)), pos_end: None },
            Check::Tags { node: id, tags: ["file".to_string()].into_iter().collect() },
            Check::Tag { node: id, tag: "chunk".into(), present: false },
            Check::Attr { node: id, key: "x".into(), data: Some(Value::from(1i64)) },
            Check::Attr { node: id, key: "y".into(), data: None },
            Check::Data { node: id, key: "d".into(), data: Some(Value::from("v")) },
            Check::BindataSize { node: id, key: "code".into(), size: 4 },
            Check::Bindata {
                node: id,
                key: "code".into(),
                start: 1,
                end: Some(3),
                data: Bytes::from_static(&[2, 3]),
            },
            Check::Trigger { node: id, key: "parse".into(), state: Some(TriggerState::Pending) },
            Check::Gone { node: NodeID::random() },
            Check::List {
                parent: NodeID::root(),
                tags: BTreeSet::new(),
                pos_filter: PosFilter::all(),
                nodes: [id].into_iter().collect(),
            },
        ];
        for check in &holding {
            assert!(tracker.check(check).unwrap(), "{:?} should hold", check);
        }

        assert!(!tracker.check(&Check::Gone { node: id }).unwrap());
        assert!(!tracker.check(&Check::Gone { node: NodeID::root() }).unwrap());
        tracker
            .transaction(&[], vec![Operation::Delete { node: id }])
            .unwrap();
        assert!(tracker.check(&Check::Gone { node: id }).unwrap());
        assert!(!tracker
            .check(&Check::Attr { node: id, key: "y".into(), data: None })
            .unwrap());
    }
}
