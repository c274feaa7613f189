//! Node handle cache.
//!
//! Nodes with live subscribers are pinned and never evicted. Everything else
//! sits in a bounded LRU and is reloaded from the backend on a miss. A cached
//! `None` records that the node is gone.

use crate::backend::Backend;
use crate::error::VelesError;
use crate::schema::Node;
use crate::types::NodeID;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;

struct Pinned {
    pins: usize,
    node: Option<Node>,
}

pub(crate) struct HandleCache {
    pinned: HashMap<NodeID, Pinned>,
    lru: LruCache<NodeID, Option<Node>>,
}

impl HandleCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        HandleCache {
            pinned: HashMap::new(),
            lru: LruCache::new(capacity),
        }
    }

    /// Current committed state of `id`. The root and null ids never have a node.
    pub fn get(&mut self, id: &NodeID, backend: &dyn Backend) -> Result<Option<Node>, VelesError> {
        if id.is_root() || id.is_null() {
            return Ok(None);
        }
        if let Some(pinned) = self.pinned.get(id) {
            return Ok(pinned.node.clone());
        }
        if let Some(node) = self.lru.get(id) {
            return Ok(node.clone());
        }
        let node = backend.get(id)?;
        self.lru.put(*id, node.clone());
        Ok(node)
    }

    /// Replace the cached state after a commit.
    pub fn store(&mut self, id: NodeID, node: Option<Node>) {
        match self.pinned.get_mut(&id) {
            Some(pinned) => pinned.node = node,
            None => {
                self.lru.put(id, node);
            }
        }
    }

    pub fn pin(&mut self, id: &NodeID, backend: &dyn Backend) -> Result<(), VelesError> {
        if id.is_root() || id.is_null() {
            return Ok(());
        }
        if let Some(pinned) = self.pinned.get_mut(id) {
            pinned.pins += 1;
            return Ok(());
        }
        let node = match self.lru.pop(id) {
            Some(node) => node,
            None => backend.get(id)?,
        };
        self.pinned.insert(*id, Pinned { pins: 1, node });
        Ok(())
    }

    pub fn unpin(&mut self, id: &NodeID) {
        let Some(pinned) = self.pinned.get_mut(id) else {
            return;
        };
        pinned.pins -= 1;
        if pinned.pins == 0 {
            if let Some(pinned) = self.pinned.remove(id) {
                self.lru.put(*id, pinned.node);
            }
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;

    #[test]
    fn test_pinned_nodes_survive_eviction() {
        let mut backend = SqliteBackend::in_memory().unwrap();
        let a = Node::new(NodeID::random(), NodeID::root());
        let b = Node::new(NodeID::random(), NodeID::root());
        backend.create(&a).unwrap();
        backend.create(&b).unwrap();

        let mut cache = HandleCache::new(1);
        cache.pin(&a.id, &backend).unwrap();
        assert!(cache.get(&b.id, &backend).unwrap().is_some());

        // A pinned entry is authoritative even when the backend disagrees.
        cache.store(a.id, None);
        assert!(cache.get(&a.id, &backend).unwrap().is_none());
        assert_eq!(cache.pinned_count(), 1);

        cache.unpin(&a.id);
        assert_eq!(cache.pinned_count(), 0);
    }

    #[test]
    fn test_root_is_never_loaded() {
        let backend = SqliteBackend::in_memory().unwrap();
        let mut cache = HandleCache::new(4);
        assert!(cache.get(&NodeID::root(), &backend).unwrap().is_none());
        cache.pin(&NodeID::root(), &backend).unwrap();
        assert_eq!(cache.pinned_count(), 0);
    }
}
