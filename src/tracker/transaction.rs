//! Transaction application.
//!
//! Operations are applied against the backend inside one backend
//! transaction. Working copies of touched nodes live in the context; the
//! handle cache only sees them after a successful commit, so a rollback
//! leaves nothing to restore.

use super::{TrackerState, TriggerEvent};
use crate::error::VelesError;
use crate::schema::{Node, Operation, PosFilter};
use crate::types::{NodeID, TriggerState};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

/// Byte range of a bindata stream touched by a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BindataChange {
    pub node: NodeID,
    pub key: String,
    pub start: u64,
    pub end: u64,
}

#[derive(Default)]
pub(crate) struct TransactionContext {
    nodes: HashMap<NodeID, Option<Node>>,
    touched: HashSet<NodeID>,
    listed: HashSet<NodeID>,
    pub node_changed: Vec<NodeID>,
    pub list_changed: Vec<NodeID>,
    pub data_changed: Vec<(NodeID, String)>,
    pub bindata_changed: Vec<BindataChange>,
    pub triggers: Vec<TriggerEvent>,
}

impl TransactionContext {
    pub fn touched(&self, id: &NodeID) -> bool {
        self.touched.contains(id)
    }

    /// Working copies of every node the transaction changed.
    pub fn nodes(&self) -> impl Iterator<Item = (&NodeID, &Option<Node>)> {
        self.nodes.iter()
    }

    fn put(&mut self, node: Node) {
        let id = node.id;
        let parent = node.parent;
        self.nodes.insert(id, Some(node));
        self.mark(id, parent);
    }

    fn put_gone(&mut self, id: NodeID, parent: NodeID) {
        self.nodes.insert(id, None);
        self.mark(id, parent);
    }

    fn mark(&mut self, id: NodeID, parent: NodeID) {
        if self.touched.insert(id) {
            self.node_changed.push(id);
        }
        self.mark_list(parent);
    }

    fn mark_list(&mut self, parent: NodeID) {
        if self.listed.insert(parent) {
            self.list_changed.push(parent);
        }
    }
}

impl TrackerState {
    /// Apply `ops` atomically. On error the backend is rolled back.
    pub(super) fn run_transaction(&mut self, ops: Vec<Operation>) -> Result<TransactionContext, VelesError> {
        self.backend.begin()?;
        let mut ctx = TransactionContext::default();
        for op in ops {
            let kind = op.object_type();
            if let Err(err) = self.apply(&mut ctx, op) {
                debug!(op = kind, error = %err, "Operation failed, rolling back");
                if let Err(rb) = self.backend.rollback() {
                    warn!(error = %rb, "Rollback failed");
                }
                return Err(err);
            }
        }
        if let Err(err) = self.backend.commit() {
            if let Err(rb) = self.backend.rollback() {
                warn!(error = %rb, "Rollback after failed commit failed");
            }
            return Err(err.into());
        }
        Ok(ctx)
    }

    fn node(&mut self, ctx: &TransactionContext, id: &NodeID) -> Result<Option<Node>, VelesError> {
        if let Some(node) = ctx.nodes.get(id) {
            return Ok(node.clone());
        }
        self.handles.get(id, &*self.backend)
    }

    fn existing(&mut self, ctx: &TransactionContext, id: &NodeID) -> Result<Node, VelesError> {
        self.node(ctx, id)?.ok_or_else(|| VelesError::gone(id))
    }

    fn require_parent(&mut self, ctx: &TransactionContext, parent: &NodeID) -> Result<(), VelesError> {
        if parent.is_null() {
            return Err(VelesError::schema("the null id cannot be a parent"));
        }
        if !parent.is_root() {
            self.existing(ctx, parent)?;
        }
        Ok(())
    }

    fn apply(&mut self, ctx: &mut TransactionContext, op: Operation) -> Result<(), VelesError> {
        match op {
            Operation::Create {
                node,
                parent,
                pos_start,
                pos_end,
                tags,
                attr,
                data,
                bindata,
                triggers,
            } => {
                if node.is_null() {
                    return Err(VelesError::schema("cannot create the null id"));
                }
                if node.is_root() || self.node(ctx, &node)?.is_some() || self.backend.was_deleted(&node)? {
                    return Err(VelesError::ObjectExists(node.to_string()));
                }
                self.require_parent(ctx, &parent)?;

                let mut created = Node::new(node, parent);
                created.pos_start = pos_start;
                created.pos_end = pos_end;
                created.tags = tags;
                created.attr = attr;
                created.triggers = triggers
                    .iter()
                    .map(|name| (name.clone(), TriggerState::Pending))
                    .collect();
                self.backend.create(&created)?;
                for (key, value) in &data {
                    self.backend.set_data(&node, key, Some(value))?;
                    created.data.insert(key.clone());
                }
                for (key, bytes) in &bindata {
                    if bytes.is_empty() {
                        continue;
                    }
                    self.backend.set_bindata(&node, key, 0, bytes, false)?;
                    created.bindata.insert(key.clone(), bytes.len() as u64);
                }
                for trigger in triggers {
                    ctx.triggers.push(TriggerEvent::Pending { node, trigger });
                }
                ctx.put(created);
            }

            Operation::Delete { node } => self.delete_node(ctx, node)?,

            Operation::SetParent { node, parent } => {
                let mut current = self.existing(ctx, &node)?;
                if current.parent == parent {
                    return Ok(());
                }
                self.require_parent(ctx, &parent)?;
                let mut cursor = parent;
                while !cursor.is_root() {
                    if cursor == node {
                        return Err(VelesError::ParentCycle(format!(
                            "{} cannot become a descendant of itself via {}",
                            node, parent
                        )));
                    }
                    cursor = self.existing(ctx, &cursor)?.parent;
                }
                self.backend.set_parent(&node, &parent)?;
                ctx.mark_list(current.parent);
                current.parent = parent;
                ctx.put(current);
            }

            Operation::SetPos { node, pos_start, pos_end } => {
                let mut current = self.existing(ctx, &node)?;
                if current.pos_start == pos_start && current.pos_end == pos_end {
                    return Ok(());
                }
                self.backend.set_pos(&node, &pos_start, &pos_end)?;
                current.pos_start = pos_start;
                current.pos_end = pos_end;
                ctx.put(current);
            }

            Operation::AddTag { node, tag } => {
                let mut current = self.existing(ctx, &node)?;
                if current.tags.contains(&tag) {
                    return Ok(());
                }
                self.backend.add_tag(&node, &tag)?;
                current.tags.insert(tag);
                ctx.put(current);
            }

            Operation::DelTag { node, tag } => {
                let mut current = self.existing(ctx, &node)?;
                if !current.tags.remove(&tag) {
                    return Ok(());
                }
                self.backend.del_tag(&node, &tag)?;
                ctx.put(current);
            }

            Operation::SetAttr { node, key, data } => {
                let mut current = self.existing(ctx, &node)?;
                if current.attr.get(&key) == data.as_ref() {
                    return Ok(());
                }
                self.backend.set_attr(&node, &key, data.as_ref())?;
                match data {
                    Some(value) => current.attr.insert(key, value),
                    None => current.attr.remove(&key),
                };
                ctx.put(current);
            }

            Operation::SetData { node, key, data } => {
                let mut current = self.existing(ctx, &node)?;
                let old = self.read_data(&current, &node, &key)?;
                if old == data {
                    return Ok(());
                }
                self.backend.set_data(&node, &key, data.as_ref())?;
                let key_set_changed = match data {
                    Some(_) => current.data.insert(key.clone()),
                    None => current.data.remove(&key),
                };
                if key_set_changed {
                    ctx.put(current);
                } else {
                    ctx.nodes.insert(node, Some(current));
                }
                ctx.data_changed.push((node, key));
            }

            Operation::SetBindata { node, key, start, data, truncate } => {
                let mut current = self.existing(ctx, &node)?;
                let old_len = current.bindata_len(&key);
                if start > old_len {
                    return Err(VelesError::WritePastEnd(format!(
                        "write at {} past the end of {} ({} bytes) on {}",
                        start, key, old_len, node
                    )));
                }
                self.backend.set_bindata(&node, &key, start, &data, truncate)?;
                let end = start + data.len() as u64;
                let new_len = if truncate { end } else { old_len.max(end) };
                let changed_end = old_len.max(end);
                if new_len == 0 {
                    current.bindata.remove(&key);
                } else {
                    current.bindata.insert(key.clone(), new_len);
                }
                if new_len != old_len {
                    ctx.put(current);
                } else {
                    ctx.nodes.insert(node, Some(current));
                }
                if changed_end > start {
                    ctx.bindata_changed.push(BindataChange {
                        node,
                        key,
                        start,
                        end: changed_end,
                    });
                }
            }

            Operation::AddTrigger { node, trigger } => {
                let mut current = self.existing(ctx, &node)?;
                if current.triggers.contains_key(&trigger) {
                    return Ok(());
                }
                self.backend.set_trigger(&node, &trigger, Some(TriggerState::Pending))?;
                current.triggers.insert(trigger.clone(), TriggerState::Pending);
                ctx.triggers.push(TriggerEvent::Pending { node, trigger });
                ctx.put(current);
            }

            Operation::DelTrigger { node, trigger } => {
                let mut current = self.existing(ctx, &node)?;
                let Some(state) = current.triggers.remove(&trigger) else {
                    return Ok(());
                };
                self.backend.set_trigger(&node, &trigger, None)?;
                if state == TriggerState::Pending {
                    ctx.triggers.push(TriggerEvent::Obsolete { node, trigger });
                }
                ctx.put(current);
            }

            Operation::FinishTrigger { node, trigger } => {
                let mut current = self.existing(ctx, &node)?;
                match current.triggers.get(&trigger) {
                    None => {
                        return Err(VelesError::ObjectGone(format!(
                            "trigger {} on {}",
                            trigger, node
                        )))
                    }
                    Some(TriggerState::Done) => return Ok(()),
                    Some(TriggerState::Pending) => {}
                }
                self.backend.set_trigger(&node, &trigger, Some(TriggerState::Done))?;
                current.triggers.insert(trigger, TriggerState::Done);
                ctx.put(current);
            }
        }
        Ok(())
    }

    /// Delete `id` and, depth first, all of its descendants.
    fn delete_node(&mut self, ctx: &mut TransactionContext, id: NodeID) -> Result<(), VelesError> {
        let existing = self.existing(ctx, &id)?;
        let children = self.backend.list(&id, &BTreeSet::new(), &PosFilter::all())?;
        for child in children {
            self.delete_node(ctx, child)?;
        }
        self.backend.delete(&id)?;
        for (trigger, state) in &existing.triggers {
            if *state == TriggerState::Pending {
                ctx.triggers.push(TriggerEvent::Obsolete {
                    node: id,
                    trigger: trigger.clone(),
                });
            }
        }
        ctx.put_gone(id, existing.parent);
        // List subscriptions on the deleted node itself must see it go.
        ctx.mark_list(id);
        Ok(())
    }
}
