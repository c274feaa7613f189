//! The node record and position filters.

use crate::error::VelesError;
use crate::schema::fields::{expect_map, take_field, FromValue, IntoValue};
use crate::schema::value::Value;
use crate::types::{NodeID, TriggerState};
use num_bigint::BigInt;
use std::collections::{BTreeMap, BTreeSet};

/// Node: the single structural entity of the store
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeID,
    /// Root id when the node is top-level
    pub parent: NodeID,
    pub pos_start: Option<BigInt>,
    pub pos_end: Option<BigInt>,
    pub tags: BTreeSet<String>,
    pub attr: BTreeMap<String, Value>,
    /// Keys present in the scalar data store
    pub data: BTreeSet<String>,
    /// Key to current byte length of each bindata stream
    pub bindata: BTreeMap<String, u64>,
    pub triggers: BTreeMap<String, TriggerState>,
}

impl Node {
    /// Empty node under `parent`.
    pub fn new(id: NodeID, parent: NodeID) -> Self {
        Node {
            id,
            parent,
            pos_start: None,
            pos_end: None,
            tags: BTreeSet::new(),
            attr: BTreeMap::new(),
            data: BTreeSet::new(),
            bindata: BTreeMap::new(),
            triggers: BTreeMap::new(),
        }
    }

    pub fn has_tags(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_subset(&self.tags)
    }

    pub fn bindata_len(&self, key: &str) -> u64 {
        self.bindata.get(key).copied().unwrap_or(0)
    }
}

impl IntoValue for Node {
    fn into_value(self) -> Value {
        Value::map([
            ("id", self.id.into_value()),
            ("parent", self.parent.into_value()),
            ("pos_start", self.pos_start.into_value()),
            ("pos_end", self.pos_end.into_value()),
            ("tags", self.tags.into_value()),
            ("attr", self.attr.into_value()),
            ("data", self.data.into_value()),
            ("bindata", self.bindata.into_value()),
            ("triggers", self.triggers.into_value()),
        ])
    }
}

impl FromValue for Node {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        let mut map = expect_map(value)?;
        Ok(Node {
            id: take_field(&mut map, "id")?,
            parent: take_field(&mut map, "parent")?,
            pos_start: take_field(&mut map, "pos_start")?,
            pos_end: take_field(&mut map, "pos_end")?,
            tags: take_field(&mut map, "tags")?,
            attr: take_field(&mut map, "attr")?,
            data: take_field(&mut map, "data")?,
            bindata: take_field(&mut map, "bindata")?,
            triggers: take_field(&mut map, "triggers")?,
        })
    }
}

/// Inclusive range predicate over a node's `pos_start` / `pos_end`
///
/// Missing bounds are unbounded. A node whose position field is unset never
/// satisfies a bound on that field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PosFilter {
    pub start_from: Option<BigInt>,
    pub start_to: Option<BigInt>,
    pub end_from: Option<BigInt>,
    pub end_to: Option<BigInt>,
}

impl PosFilter {
    /// Filter accepting every node.
    pub fn all() -> Self {
        PosFilter::default()
    }

    /// Nodes whose `[pos_start, pos_end)` range intersects `[start, end)`.
    pub fn intersecting(start: BigInt, end: BigInt) -> Self {
        PosFilter {
            start_from: None,
            start_to: Some(end - 1),
            end_from: Some(start + 1),
            end_to: None,
        }
    }

    pub fn is_all(&self) -> bool {
        *self == PosFilter::default()
    }

    pub fn matches(&self, node: &Node) -> bool {
        fn at_least(value: &Option<BigInt>, bound: &Option<BigInt>) -> bool {
            match (value, bound) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(v), Some(b)) => v >= b,
            }
        }
        fn at_most(value: &Option<BigInt>, bound: &Option<BigInt>) -> bool {
            match (value, bound) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(v), Some(b)) => v <= b,
            }
        }
        at_least(&node.pos_start, &self.start_from)
            && at_most(&node.pos_start, &self.start_to)
            && at_least(&node.pos_end, &self.end_from)
            && at_most(&node.pos_end, &self.end_to)
    }
}

impl IntoValue for PosFilter {
    fn into_value(self) -> Value {
        Value::map([
            ("start_from", self.start_from.into_value()),
            ("start_to", self.start_to.into_value()),
            ("end_from", self.end_from.into_value()),
            ("end_to", self.end_to.into_value()),
        ])
    }
}

impl FromValue for PosFilter {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        if value.is_nil() {
            return Ok(PosFilter::all());
        }
        let mut map = expect_map(value)?;
        Ok(PosFilter {
            start_from: take_field(&mut map, "start_from")?,
            start_to: take_field(&mut map, "start_to")?,
            end_from: take_field(&mut map, "end_from")?,
            end_to: take_field(&mut map, "end_to")?,
        })
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(PosFilter::all())
    }
}
