//! Storage Backend
//!
//! Durable store of nodes, tags, attributes, scalar data, paged bindata and
//! triggers. The backend is a single-writer resource: only the tracker
//! mutates it, and only between `begin` and `commit`/`rollback`.

pub mod sqlite;

pub use sqlite::SqliteBackend;

use crate::error::StorageError;
use crate::schema::{Node, PosFilter, Value};
use crate::types::{NodeID, TriggerState};
use num_bigint::BigInt;
use std::collections::BTreeSet;

/// Bindata page size in bytes
pub const PAGE_SIZE: u64 = 0x10000;

/// Backend interface
///
/// Writes outside an explicit transaction autocommit.
pub trait Backend: Send {
    fn begin(&mut self) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
    fn rollback(&mut self) -> Result<(), StorageError>;

    /// Load a node with its tags, attributes, data keys, bindata lengths and triggers.
    fn get(&self, id: &NodeID) -> Result<Option<Node>, StorageError>;

    /// Insert the node row with its tags, attributes and triggers.
    ///
    /// Scalar data and bindata are written separately.
    fn create(&mut self, node: &Node) -> Result<(), StorageError>;
    /// Remove the node row and everything attached to it. Children must already be gone.
    ///
    /// The id is remembered so [`Backend::was_deleted`] reports it from then on.
    fn delete(&mut self, id: &NodeID) -> Result<(), StorageError>;
    fn was_deleted(&self, id: &NodeID) -> Result<bool, StorageError>;
    fn set_parent(&mut self, id: &NodeID, parent: &NodeID) -> Result<(), StorageError>;
    fn set_pos(
        &mut self,
        id: &NodeID,
        pos_start: &Option<BigInt>,
        pos_end: &Option<BigInt>,
    ) -> Result<(), StorageError>;
    fn add_tag(&mut self, id: &NodeID, tag: &str) -> Result<(), StorageError>;
    fn del_tag(&mut self, id: &NodeID, tag: &str) -> Result<(), StorageError>;
    fn set_attr(&mut self, id: &NodeID, key: &str, value: Option<&Value>) -> Result<(), StorageError>;
    fn get_data(&self, id: &NodeID, key: &str) -> Result<Option<Value>, StorageError>;
    fn set_data(&mut self, id: &NodeID, key: &str, value: Option<&Value>) -> Result<(), StorageError>;
    fn set_trigger(
        &mut self,
        id: &NodeID,
        name: &str,
        state: Option<TriggerState>,
    ) -> Result<(), StorageError>;

    /// Current logical length of a bindata stream.
    fn bindata_len(&self, id: &NodeID, key: &str) -> Result<u64, StorageError>;
    /// Bytes `[start, end)` of a bindata stream, clipped to its length; `None` reads to the end.
    fn get_bindata(
        &self,
        id: &NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, StorageError>;
    /// Splice `data` in at `start`.
    ///
    /// `start` must not exceed the current length. With `truncate`, everything
    /// after the written range is dropped.
    fn set_bindata(
        &mut self,
        id: &NodeID,
        key: &str,
        start: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<(), StorageError>;

    /// Ids of `parent`'s children carrying every tag in `tags` and matching `pos_filter`.
    fn list(
        &self,
        parent: &NodeID,
        tags: &BTreeSet<String>,
        pos_filter: &PosFilter,
    ) -> Result<BTreeSet<NodeID>, StorageError>;

    /// Nodes whose trigger `name` is pending.
    fn pending_triggers(&self, name: &str) -> Result<Vec<NodeID>, StorageError>;
}
