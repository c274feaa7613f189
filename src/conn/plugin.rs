//! Plug-in handler traits and the registries that dispatch to them.
//!
//! Methods, queries and triggers are registered under a name plus a tag
//! set; a handler applies to a node when its tag set is a subset of the
//! node's tags. Broadcasts are registered by name only and all run.

use crate::conn::Connection;
use crate::error::VelesError;
use crate::schema::{Operation, Value};
use crate::tracer::Tracer;
use crate::types::NodeID;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identifier handed out on registration, used to unregister
pub type HandlerId = u64;

/// Method handler: an RPC targeted at one node
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn run(&self, conn: Arc<dyn Connection>, node: NodeID, params: Value) -> Result<Value, VelesError>;
}

/// Query handler: a pure function of store state, read through the tracer
#[async_trait]
pub trait QueryHandler: Send + Sync {
    async fn get(&self, tracer: &mut Tracer, node: NodeID, params: Value) -> Result<Value, VelesError>;
}

/// Broadcast handler: contributes a list of results to a broadcast
#[async_trait]
pub trait BroadcastHandler: Send + Sync {
    async fn run(&self, conn: Arc<dyn Connection>, params: Value) -> Result<Vec<Value>, VelesError>;
}

/// Trigger handler: turns a pending trigger into operations
///
/// The returned operations are committed together with `finish_trigger`,
/// guarded by every read recorded on the tracer.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn run(&self, tracer: &mut Tracer, node: NodeID) -> Result<Vec<Operation>, VelesError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Method,
    Query,
    Broadcast,
    Trigger,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandlerKind::Method => "method",
            HandlerKind::Query => "query",
            HandlerKind::Broadcast => "broadcast",
            HandlerKind::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

struct Registered<H: ?Sized> {
    id: HandlerId,
    tags: BTreeSet<String>,
    handler: Arc<H>,
}

/// Registrations under one name, bucketed by their smallest tag
///
/// A handler applies only if its smallest tag is on the node, so a lookup
/// visits the untagged bucket plus one bucket per node tag.
struct NameIndex<H: ?Sized> {
    untagged: Vec<Registered<H>>,
    by_first_tag: HashMap<String, Vec<Registered<H>>>,
}

impl<H: ?Sized> NameIndex<H> {
    fn new() -> Self {
        NameIndex {
            untagged: Vec::new(),
            by_first_tag: HashMap::new(),
        }
    }

    fn entries(&self) -> impl Iterator<Item = &Registered<H>> {
        self.untagged.iter().chain(self.by_first_tag.values().flatten())
    }

    fn candidates<'a>(&'a self, node_tags: &'a BTreeSet<String>) -> impl Iterator<Item = &'a Registered<H>> {
        let tagged = node_tags
            .iter()
            .filter_map(|tag| self.by_first_tag.get(tag.as_str()))
            .flatten();
        self.untagged.iter().chain(tagged)
    }

    fn bucket(&mut self, first: Option<&String>) -> &mut Vec<Registered<H>> {
        match first {
            Some(tag) => self.by_first_tag.entry(tag.clone()).or_default(),
            None => &mut self.untagged,
        }
    }

    fn remove(&mut self, id: HandlerId, first: Option<&str>) {
        match first {
            Some(tag) => {
                if let Some(bucket) = self.by_first_tag.get_mut(tag) {
                    bucket.retain(|e| e.id != id);
                    if bucket.is_empty() {
                        self.by_first_tag.remove(tag);
                    }
                }
            }
            None => self.untagged.retain(|e| e.id != id),
        }
    }

    fn is_empty(&self) -> bool {
        self.untagged.is_empty() && self.by_first_tag.is_empty()
    }
}

/// Handlers of one kind, keyed by name and tag set
pub(crate) struct TaggedRegistry<H: ?Sized> {
    by_name: HashMap<String, NameIndex<H>>,
    /// Handler id to its name and smallest tag
    locations: HashMap<HandlerId, (String, Option<String>)>,
}

impl<H: ?Sized> TaggedRegistry<H> {
    pub fn new() -> Self {
        TaggedRegistry {
            by_name: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    /// Add a handler; nested tag sets under one name are rejected.
    pub fn insert(
        &mut self,
        id: HandlerId,
        name: &str,
        tags: BTreeSet<String>,
        handler: Arc<H>,
    ) -> Result<(), VelesError> {
        let index = self.by_name.entry(name.to_string()).or_insert_with(NameIndex::new);
        if let Some(clash) = index
            .entries()
            .find(|e| e.tags.is_subset(&tags) || tags.is_subset(&e.tags))
        {
            return Err(VelesError::TagsAmbiguous(format!(
                "{} with tags {:?} overlaps handler {} with tags {:?}",
                name, tags, clash.id, clash.tags
            )));
        }
        let first = tags.iter().next().cloned();
        index.bucket(first.as_ref()).push(Registered { id, tags, handler });
        self.locations.insert(id, (name.to_string(), first));
        Ok(())
    }

    /// The single handler applicable to a node with `node_tags`.
    pub fn find(&self, name: &str, node_tags: &BTreeSet<String>) -> Result<Option<Arc<H>>, VelesError> {
        let Some(index) = self.by_name.get(name) else {
            return Ok(None);
        };
        let mut matching = index.candidates(node_tags).filter(|e| e.tags.is_subset(node_tags));
        let Some(first) = matching.next() else {
            return Ok(None);
        };
        if let Some(second) = matching.next() {
            return Err(VelesError::TagsAmbiguous(format!(
                "{}: handlers {} and {} both apply",
                name, first.id, second.id
            )));
        }
        Ok(Some(first.handler.clone()))
    }

    /// Remove a handler, returning the name it was registered under.
    pub fn remove(&mut self, id: HandlerId) -> Option<String> {
        let (name, first) = self.locations.remove(&id)?;
        if let Some(index) = self.by_name.get_mut(&name) {
            index.remove(id, first.as_deref());
            if index.is_empty() {
                self.by_name.remove(&name);
            }
        }
        Some(name)
    }
}

/// Every handler known to a local connection
pub(crate) struct Plugins {
    pub methods: TaggedRegistry<dyn MethodHandler>,
    pub queries: TaggedRegistry<dyn QueryHandler>,
    pub triggers: TaggedRegistry<dyn TriggerHandler>,
    broadcasts: HashMap<String, Vec<(HandlerId, Arc<dyn BroadcastHandler>)>>,
}

impl Plugins {
    pub fn new() -> Self {
        Plugins {
            methods: TaggedRegistry::new(),
            queries: TaggedRegistry::new(),
            triggers: TaggedRegistry::new(),
            broadcasts: HashMap::new(),
        }
    }

    pub fn add_broadcast(&mut self, id: HandlerId, name: &str, handler: Arc<dyn BroadcastHandler>) {
        self.broadcasts
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
    }

    pub fn broadcasts(&self, name: &str) -> Vec<Arc<dyn BroadcastHandler>> {
        self.broadcasts
            .get(name)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, id: HandlerId) -> Option<(HandlerKind, String)> {
        if let Some(name) = self.methods.remove(id) {
            return Some((HandlerKind::Method, name));
        }
        if let Some(name) = self.queries.remove(id) {
            return Some((HandlerKind::Query, name));
        }
        if let Some(name) = self.triggers.remove(id) {
            return Some((HandlerKind::Trigger, name));
        }
        let name = self
            .broadcasts
            .iter()
            .find(|(_, handlers)| handlers.iter().any(|(hid, _)| *hid == id))
            .map(|(name, _)| name.clone())?;
        if let Some(handlers) = self.broadcasts.get_mut(&name) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                self.broadcasts.remove(&name);
            }
        }
        Some((HandlerKind::Broadcast, name))
    }
}
