//! Subscriptions and post-commit event dispatch.

use super::query::QueryKey;
use super::transaction::TransactionContext;
use super::TrackerState;
use crate::error::VelesError;
use crate::schema::{Check, ConnectionInfo, Node, PosFilter, Value};
use crate::types::NodeID;
use bytes::Bytes;
use std::collections::{BTreeSet, HashSet};
use tokio::sync::mpsc;
use tracing::debug;

pub type SubscriptionId = u64;

/// Callback payload delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Node(Node),
    Data(Option<Value>),
    Bindata(Bytes),
    /// Members whose node changed (or newly matching), and members that no longer match
    List { changed: Vec<Node>, gone: Vec<NodeID> },
    Query { result: Value, checks: Vec<Check> },
    /// Handler failure; the subscription stays armed
    QueryError { err: VelesError, checks: Vec<Check> },
    /// Current connection table
    Connections(Vec<ConnectionInfo>),
    /// Terminal error
    Error(VelesError),
    /// Terminal acknowledgement of a cancel
    Cancelled,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error(_) | Event::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub sub: SubscriptionId,
    pub event: Event,
}

pub type Sink = mpsc::UnboundedSender<Delivery>;

#[derive(Debug, Clone)]
pub(crate) enum SubKind {
    Node {
        node: NodeID,
    },
    Data {
        node: NodeID,
        key: String,
    },
    Bindata {
        node: NodeID,
        key: String,
        start: u64,
        end: Option<u64>,
    },
    List {
        parent: NodeID,
        tags: BTreeSet<String>,
        pos_filter: PosFilter,
        members: BTreeSet<NodeID>,
    },
    Query {
        key: QueryKey,
    },
}

impl SubKind {
    fn anchor(&self) -> NodeID {
        match self {
            SubKind::Node { node }
            | SubKind::Data { node, .. }
            | SubKind::Bindata { node, .. } => *node,
            SubKind::List { parent, .. } => *parent,
            SubKind::Query { key } => key.node,
        }
    }
}

pub(crate) struct SubEntry {
    pub kind: SubKind,
    pub sink: Sink,
}

impl SubEntry {
    pub fn send(&self, sub: SubscriptionId, event: Event) {
        // A closed receiver means the owner is going away and will cancel.
        let _ = self.sink.send(Delivery { sub, event });
    }
}

fn overlaps(start: u64, end: u64, sub_start: u64, sub_end: Option<u64>) -> bool {
    start < sub_end.unwrap_or(u64::MAX) && end > sub_start
}

impl TrackerState {
    pub(super) fn allocate_sub(&mut self) -> SubscriptionId {
        self.next_sub += 1;
        self.next_sub
    }

    /// Register a node, data, bindata or list subscription and deliver its initial event.
    pub(super) fn subscribe(&mut self, kind: SubKind, sink: Sink) -> Result<SubscriptionId, VelesError> {
        let sub = self.allocate_sub();
        let anchor = kind.anchor();
        let node = self.handles.get(&anchor, &*self.backend)?;
        let exists = node.is_some() || (anchor.is_root() && matches!(kind, SubKind::List { .. }));
        if !exists {
            let _ = sink.send(Delivery {
                sub,
                event: Event::Error(VelesError::gone(anchor)),
            });
            return Ok(sub);
        }

        let mut kind = kind;
        let initial = match (&mut kind, node) {
            (SubKind::Node { .. }, Some(node)) => Event::Node(node),
            (SubKind::Data { node, key }, Some(current)) => {
                Event::Data(self.read_data(&current, node, key)?)
            }
            (SubKind::Bindata { node, key, start, end }, _) => Event::Bindata(Bytes::from(
                self.backend.get_bindata(node, key, *start, *end)?,
            )),
            (SubKind::List { parent, tags, pos_filter, members }, _) => {
                *members = self.backend.list(parent, tags, pos_filter)?;
                let mut changed = Vec::with_capacity(members.len());
                for id in members.iter() {
                    if let Some(child) = self.handles.get(id, &*self.backend)? {
                        changed.push(child);
                    }
                }
                Event::List { changed, gone: Vec::new() }
            }
            _ => return Err(VelesError::gone(anchor)),
        };

        match &kind {
            SubKind::List { parent, .. } => {
                self.list_subs.entry(*parent).or_default().insert(sub);
            }
            _ => {
                self.node_subs.entry(anchor).or_default().insert(sub);
            }
        }
        self.handles.pin(&anchor, &*self.backend)?;
        let entry = SubEntry { kind, sink };
        entry.send(sub, initial);
        self.subs.insert(sub, entry);
        debug!(sub, node = %anchor, "Subscribed");
        Ok(sub)
    }

    pub(super) fn read_data(
        &self,
        current: &Node,
        node: &NodeID,
        key: &str,
    ) -> Result<Option<Value>, VelesError> {
        if !current.data.contains(key) {
            return Ok(None);
        }
        Ok(self.backend.get_data(node, key)?)
    }

    /// Drop a subscription and its index entries.
    pub(super) fn remove_sub(&mut self, sub: SubscriptionId) -> Option<SubEntry> {
        let entry = self.subs.remove(&sub)?;
        match &entry.kind {
            SubKind::Node { node } | SubKind::Data { node, .. } | SubKind::Bindata { node, .. } => {
                if let Some(set) = self.node_subs.get_mut(node) {
                    set.remove(&sub);
                    if set.is_empty() {
                        self.node_subs.remove(node);
                    }
                }
                self.handles.unpin(node);
            }
            SubKind::List { parent, .. } => {
                if let Some(set) = self.list_subs.get_mut(parent) {
                    set.remove(&sub);
                    if set.is_empty() {
                        self.list_subs.remove(parent);
                    }
                }
                self.handles.unpin(parent);
            }
            SubKind::Query { key } => {
                let key = key.clone();
                self.detach_query_sub(&key, sub);
            }
        }
        Some(entry)
    }

    /// Remove a subscription, delivering a terminal error.
    pub(super) fn terminate(&mut self, sub: SubscriptionId, err: VelesError) {
        if let Some(entry) = self.remove_sub(sub) {
            debug!(sub, error = %err, "Subscription terminated");
            entry.send(sub, Event::Error(err));
        }
    }

    /// Deliver the events of a committed transaction.
    ///
    /// Node events first, then list, data and bindata events.
    pub(super) fn dispatch(&mut self, ctx: &TransactionContext) -> Result<(), VelesError> {
        for id in &ctx.node_changed {
            let Some(subs) = self.node_subs.get(id).cloned() else {
                continue;
            };
            let node = self.handles.get(id, &*self.backend)?;
            for sub in subs {
                match &node {
                    None => self.terminate(sub, VelesError::gone(id)),
                    Some(node) => {
                        if let Some(entry) = self.subs.get(&sub) {
                            if matches!(entry.kind, SubKind::Node { .. }) {
                                entry.send(sub, Event::Node(node.clone()));
                            }
                        }
                    }
                }
            }
        }

        for parent in &ctx.list_changed {
            let Some(subs) = self.list_subs.get(parent).cloned() else {
                continue;
            };
            if !parent.is_root() && self.handles.get(parent, &*self.backend)?.is_none() {
                for sub in subs {
                    self.terminate(sub, VelesError::gone(parent));
                }
                continue;
            }
            for sub in subs {
                let Some(entry) = self.subs.get_mut(&sub) else {
                    continue;
                };
                let SubKind::List { tags, pos_filter, members, .. } = &mut entry.kind else {
                    continue;
                };
                let now = self.backend.list(parent, tags, pos_filter)?;
                let gone: Vec<NodeID> = members.difference(&now).copied().collect();
                let mut changed = Vec::new();
                for id in &now {
                    if members.contains(id) && !ctx.touched(id) {
                        continue;
                    }
                    if let Some(child) = self.handles.get(id, &*self.backend)? {
                        changed.push(child);
                    }
                }
                *members = now;
                if !changed.is_empty() || !gone.is_empty() {
                    entry.send(sub, Event::List { changed, gone });
                }
            }
        }

        let mut seen = HashSet::new();
        for (id, key) in &ctx.data_changed {
            if !seen.insert((*id, key.as_str())) {
                continue;
            }
            let Some(subs) = self.node_subs.get(id).cloned() else {
                continue;
            };
            let Some(current) = self.handles.get(id, &*self.backend)? else {
                continue;
            };
            let mut value = None;
            for sub in subs {
                let Some(entry) = self.subs.get(&sub) else {
                    continue;
                };
                if let SubKind::Data { key: wanted, .. } = &entry.kind {
                    if wanted == key {
                        if value.is_none() {
                            value = Some(self.read_data(&current, id, key)?);
                        }
                        entry.send(sub, Event::Data(value.clone().flatten()));
                    }
                }
            }
        }

        for change in &ctx.bindata_changed {
            let Some(subs) = self.node_subs.get(&change.node).cloned() else {
                continue;
            };
            if self.handles.get(&change.node, &*self.backend)?.is_none() {
                continue;
            }
            for sub in subs {
                let Some(entry) = self.subs.get(&sub) else {
                    continue;
                };
                if let SubKind::Bindata { key, start, end, .. } = &entry.kind {
                    if *key == change.key && overlaps(change.start, change.end, *start, *end) {
                        let bytes = self.backend.get_bindata(&change.node, key, *start, *end)?;
                        entry.send(sub, Event::Bindata(Bytes::from(bytes)));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        assert!(overlaps(0, 10, 5, Some(6)));
        assert!(overlaps(0, 10, 9, None));
        assert!(!overlaps(0, 10, 10, None));
        assert!(!overlaps(10, 20, 0, Some(10)));
    }

    #[test]
    fn test_terminal_events() {
        assert!(Event::Cancelled.is_terminal());
        assert!(Event::Error(VelesError::gone("x")).is_terminal());
        assert!(!Event::QueryError { err: VelesError::gone("x"), checks: vec![] }.is_terminal());
    }
}
