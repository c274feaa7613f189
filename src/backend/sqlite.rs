//! SQLite storage backend.
//!
//! Tables: `node`, `node_tag`, `node_attr`, `node_data`, `node_bindata`,
//! `node_trigger`, plus `node_deleted` holding the id of every node ever
//! deleted so ids are never handed out twice. Top-level nodes store a NULL parent so the parent
//! foreign key never references the implicit root. Positions are stored in
//! the order-preserving encoding of [`crate::codec::pos`].

use crate::backend::{Backend, PAGE_SIZE};
use crate::codec;
use crate::error::StorageError;
use crate::schema::{Node, PosFilter, Value};
use crate::types::{NodeID, TriggerState};
use num_bigint::BigInt;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// `"veles"` read as a base-36 integer
pub const APPLICATION_ID: i64 = 52_749_028;
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE node (
    id BLOB PRIMARY KEY,
    parent BLOB REFERENCES node(id),
    pos_start BLOB,
    pos_end BLOB
);
CREATE INDEX node_parent_pos ON node(parent, pos_start);

CREATE TABLE node_tag (
    id BLOB NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    PRIMARY KEY (id, name)
);
CREATE INDEX node_tag_name ON node_tag(name);

CREATE TABLE node_attr (
    id BLOB NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (id, name)
);

CREATE TABLE node_data (
    id BLOB NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (id, name)
);

CREATE TABLE node_bindata (
    id BLOB NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    page INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (id, name, page)
);

CREATE TABLE node_trigger (
    id BLOB NOT NULL REFERENCES node(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (id, name)
);
CREATE INDEX node_trigger_state ON node_trigger(name, state);

CREATE TABLE node_deleted (
    id BLOB PRIMARY KEY
);
"#;

/// SQLite-backed node store
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or initialise) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        let backend = Self::from_connection(conn)?;
        info!(path = %path.display(), "Opened database");
        Ok(backend)
    }

    /// Fresh in-memory database, gone when dropped.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let app_id: i64 = conn.query_row("PRAGMA application_id", [], |row| row.get(0))?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if app_id == 0 && version == 0 {
            let objects: i64 =
                conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))?;
            if objects != 0 {
                return Err(StorageError::ForeignDatabase(0));
            }
            conn.execute_batch(&format!(
                "BEGIN;\n{}\nPRAGMA application_id = {};\nPRAGMA user_version = {};\nCOMMIT;",
                SCHEMA, APPLICATION_ID, SCHEMA_VERSION
            ))?;
            debug!(version = SCHEMA_VERSION, "Initialised empty database");
        } else if app_id != APPLICATION_ID {
            return Err(StorageError::ForeignDatabase(app_id));
        } else if version != SCHEMA_VERSION {
            return Err(StorageError::UnknownVersion(version));
        }

        Ok(SqliteBackend { conn })
    }
}

fn id_param(id: &NodeID) -> &[u8] {
    &id.as_bytes()[..]
}

fn parent_param(parent: &NodeID) -> Option<&[u8]> {
    if parent.is_root() {
        None
    } else {
        Some(id_param(parent))
    }
}

fn decode_id(raw: &[u8]) -> Result<NodeID, StorageError> {
    NodeID::from_bytes(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn decode_pos(raw: Option<Vec<u8>>) -> Result<Option<BigInt>, StorageError> {
    codec::pos::decode_opt(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn decode_value(raw: &[u8]) -> Result<Value, StorageError> {
    codec::decode(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn ceil_page(offset: u64) -> u64 {
    offset.div_ceil(PAGE_SIZE)
}

impl SqliteBackend {
    fn read_pages(
        &self,
        id: &NodeID,
        key: &str,
        first_page: u64,
        last_page: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT data FROM node_bindata
             WHERE id = ?1 AND name = ?2 AND page BETWEEN ?3 AND ?4
             ORDER BY page",
        )?;
        let pages = stmt.query_map(
            params![id_param(id), key, first_page as i64, last_page as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )?;
        let mut buf = Vec::new();
        for page in pages {
            buf.extend_from_slice(&page?);
        }
        Ok(buf)
    }
}

impl Backend for SqliteBackend {
    fn begin(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn get(&self, id: &NodeID) -> Result<Option<Node>, StorageError> {
        let row = self
            .conn
            .prepare_cached("SELECT parent, pos_start, pos_end FROM node WHERE id = ?1")?
            .query_row(params![id_param(id)], |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            })
            .optional()?;
        let Some((parent, pos_start, pos_end)) = row else {
            return Ok(None);
        };

        let parent = match parent {
            Some(raw) => decode_id(&raw)?,
            None => NodeID::root(),
        };
        let mut node = Node::new(*id, parent);
        node.pos_start = decode_pos(pos_start)?;
        node.pos_end = decode_pos(pos_end)?;

        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM node_tag WHERE id = ?1")?;
        for tag in stmt.query_map(params![id_param(id)], |row| row.get::<_, String>(0))? {
            node.tags.insert(tag?);
        }

        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, data FROM node_attr WHERE id = ?1")?;
        let rows = stmt.query_map(params![id_param(id)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (name, raw) = row?;
            node.attr.insert(name, decode_value(&raw)?);
        }

        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM node_data WHERE id = ?1")?;
        for key in stmt.query_map(params![id_param(id)], |row| row.get::<_, String>(0))? {
            node.data.insert(key?);
        }

        // Only the last page of each stream can be short, so its length plus
        // the full pages before it is the stream length.
        let mut stmt = self.conn.prepare_cached(
            "SELECT b.name, b.page, length(b.data) FROM node_bindata AS b
             WHERE b.id = ?1 AND b.page = (
                 SELECT MAX(page) FROM node_bindata WHERE id = b.id AND name = b.name
             )",
        )?;
        let rows = stmt.query_map(params![id_param(id)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (name, page, len) = row?;
            node.bindata.insert(name, page as u64 * PAGE_SIZE + len as u64);
        }

        let mut stmt = self
            .conn
            .prepare_cached("SELECT name, state FROM node_trigger WHERE id = ?1")?;
        let rows = stmt.query_map(params![id_param(id)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (name, state) = row?;
            let state =
                TriggerState::parse(&state).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            node.triggers.insert(name, state);
        }

        Ok(Some(node))
    }

    fn create(&mut self, node: &Node) -> Result<(), StorageError> {
        self.conn
            .prepare_cached(
                "INSERT INTO node (id, parent, pos_start, pos_end) VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![
                id_param(&node.id),
                parent_param(&node.parent),
                codec::pos::encode_opt(&node.pos_start),
                codec::pos::encode_opt(&node.pos_end),
            ])?;
        for tag in &node.tags {
            self.add_tag(&node.id, tag)?;
        }
        for (key, value) in &node.attr {
            self.set_attr(&node.id, key, Some(value))?;
        }
        for (name, state) in &node.triggers {
            self.set_trigger(&node.id, name, Some(*state))?;
        }
        Ok(())
    }

    fn delete(&mut self, id: &NodeID) -> Result<(), StorageError> {
        self.conn
            .prepare_cached("DELETE FROM node WHERE id = ?1")?
            .execute(params![id_param(id)])?;
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO node_deleted (id) VALUES (?1)")?
            .execute(params![id_param(id)])?;
        Ok(())
    }

    fn was_deleted(&self, id: &NodeID) -> Result<bool, StorageError> {
        let found = self
            .conn
            .prepare_cached("SELECT 1 FROM node_deleted WHERE id = ?1")?
            .query_row(params![id_param(id)], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    fn set_parent(&mut self, id: &NodeID, parent: &NodeID) -> Result<(), StorageError> {
        self.conn
            .prepare_cached("UPDATE node SET parent = ?2 WHERE id = ?1")?
            .execute(params![id_param(id), parent_param(parent)])?;
        Ok(())
    }

    fn set_pos(
        &mut self,
        id: &NodeID,
        pos_start: &Option<BigInt>,
        pos_end: &Option<BigInt>,
    ) -> Result<(), StorageError> {
        self.conn
            .prepare_cached("UPDATE node SET pos_start = ?2, pos_end = ?3 WHERE id = ?1")?
            .execute(params![
                id_param(id),
                codec::pos::encode_opt(pos_start),
                codec::pos::encode_opt(pos_end),
            ])?;
        Ok(())
    }

    fn add_tag(&mut self, id: &NodeID, tag: &str) -> Result<(), StorageError> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO node_tag (id, name) VALUES (?1, ?2)")?
            .execute(params![id_param(id), tag])?;
        Ok(())
    }

    fn del_tag(&mut self, id: &NodeID, tag: &str) -> Result<(), StorageError> {
        self.conn
            .prepare_cached("DELETE FROM node_tag WHERE id = ?1 AND name = ?2")?
            .execute(params![id_param(id), tag])?;
        Ok(())
    }

    fn set_attr(&mut self, id: &NodeID, key: &str, value: Option<&Value>) -> Result<(), StorageError> {
        match value {
            Some(value) => {
                self.conn
                    .prepare_cached(
                        "INSERT OR REPLACE INTO node_attr (id, name, data) VALUES (?1, ?2, ?3)",
                    )?
                    .execute(params![id_param(id), key, codec::encode(value)])?;
            }
            None => {
                self.conn
                    .prepare_cached("DELETE FROM node_attr WHERE id = ?1 AND name = ?2")?
                    .execute(params![id_param(id), key])?;
            }
        }
        Ok(())
    }

    fn get_data(&self, id: &NodeID, key: &str) -> Result<Option<Value>, StorageError> {
        let raw = self
            .conn
            .prepare_cached("SELECT data FROM node_data WHERE id = ?1 AND name = ?2")?
            .query_row(params![id_param(id), key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        raw.map(|raw| decode_value(&raw)).transpose()
    }

    fn set_data(&mut self, id: &NodeID, key: &str, value: Option<&Value>) -> Result<(), StorageError> {
        match value {
            Some(value) => {
                self.conn
                    .prepare_cached(
                        "INSERT OR REPLACE INTO node_data (id, name, data) VALUES (?1, ?2, ?3)",
                    )?
                    .execute(params![id_param(id), key, codec::encode(value)])?;
            }
            None => {
                self.conn
                    .prepare_cached("DELETE FROM node_data WHERE id = ?1 AND name = ?2")?
                    .execute(params![id_param(id), key])?;
            }
        }
        Ok(())
    }

    fn set_trigger(
        &mut self,
        id: &NodeID,
        name: &str,
        state: Option<TriggerState>,
    ) -> Result<(), StorageError> {
        match state {
            Some(state) => {
                self.conn
                    .prepare_cached(
                        "INSERT OR REPLACE INTO node_trigger (id, name, state) VALUES (?1, ?2, ?3)",
                    )?
                    .execute(params![id_param(id), name, state.as_str()])?;
            }
            None => {
                self.conn
                    .prepare_cached("DELETE FROM node_trigger WHERE id = ?1 AND name = ?2")?
                    .execute(params![id_param(id), name])?;
            }
        }
        Ok(())
    }

    fn bindata_len(&self, id: &NodeID, key: &str) -> Result<u64, StorageError> {
        let last = self
            .conn
            .prepare_cached(
                "SELECT page, length(data) FROM node_bindata
                 WHERE id = ?1 AND name = ?2
                 ORDER BY page DESC LIMIT 1",
            )?
            .query_row(params![id_param(id), key], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        Ok(last.map_or(0, |(page, len)| page as u64 * PAGE_SIZE + len as u64))
    }

    fn get_bindata(
        &self,
        id: &NodeID,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<u8>, StorageError> {
        let len = self.bindata_len(id, key)?;
        let end = end.map_or(len, |end| end.min(len));
        if start >= end {
            return Ok(Vec::new());
        }
        let first_page = start / PAGE_SIZE;
        let last_page = (end - 1) / PAGE_SIZE;
        let buf = self.read_pages(id, key, first_page, last_page)?;

        let offset = (start - first_page * PAGE_SIZE) as usize;
        let want = (end - start) as usize;
        if buf.len() < offset + want {
            return Err(StorageError::Corrupt(format!(
                "bindata {} of {} is missing pages",
                key, id
            )));
        }
        Ok(buf[offset..offset + want].to_vec())
    }

    fn set_bindata(
        &mut self,
        id: &NodeID,
        key: &str,
        start: u64,
        data: &[u8],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let len = self.bindata_len(id, key)?;
        if start > len {
            return Err(StorageError::WritePastEnd { start, len });
        }
        if data.is_empty() && !truncate {
            return Ok(());
        }

        let end = start + data.len() as u64;
        let first_page = start / PAGE_SIZE;
        let region_start = first_page * PAGE_SIZE;
        // With truncate everything from the first touched page onward is
        // rewritten; otherwise only the pages the new bytes land in.
        let region_end = if truncate {
            end
        } else {
            (ceil_page(end) * PAGE_SIZE).min(len.max(end))
        };

        let old_end = region_end.min(len).max(start);
        let mut buf = if old_end > region_start {
            let mut old = self.read_pages(id, key, first_page, (old_end - 1) / PAGE_SIZE)?;
            old.truncate((old_end - region_start) as usize);
            old
        } else {
            Vec::new()
        };
        buf.resize((region_end - region_start) as usize, 0);
        let splice_at = (start - region_start) as usize;
        buf[splice_at..splice_at + data.len()].copy_from_slice(data);

        if truncate {
            self.conn
                .prepare_cached("DELETE FROM node_bindata WHERE id = ?1 AND name = ?2 AND page >= ?3")?
                .execute(params![id_param(id), key, first_page as i64])?;
        } else {
            self.conn
                .prepare_cached(
                    "DELETE FROM node_bindata
                     WHERE id = ?1 AND name = ?2 AND page >= ?3 AND page < ?4",
                )?
                .execute(params![
                    id_param(id),
                    key,
                    first_page as i64,
                    ceil_page(region_end) as i64
                ])?;
        }

        let mut insert = self.conn.prepare_cached(
            "INSERT INTO node_bindata (id, name, page, data) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (i, chunk) in buf.chunks(PAGE_SIZE as usize).enumerate() {
            insert.execute(params![
                id_param(id),
                key,
                (first_page + i as u64) as i64,
                chunk
            ])?;
        }
        Ok(())
    }

    fn list(
        &self,
        parent: &NodeID,
        tags: &BTreeSet<String>,
        pos_filter: &PosFilter,
    ) -> Result<BTreeSet<NodeID>, StorageError> {
        let mut sql = String::from("SELECT n.id FROM node AS n WHERE n.parent IS ?");
        let mut args: Vec<SqlValue> = vec![match parent_param(parent) {
            Some(raw) => SqlValue::Blob(raw.to_vec()),
            None => SqlValue::Null,
        }];

        let bounds = [
            ("n.pos_start >= ?", &pos_filter.start_from),
            ("n.pos_start <= ?", &pos_filter.start_to),
            ("n.pos_end >= ?", &pos_filter.end_from),
            ("n.pos_end <= ?", &pos_filter.end_to),
        ];
        for (clause, bound) in bounds {
            if let Some(bound) = bound {
                sql.push_str(" AND ");
                sql.push_str(clause);
                args.push(SqlValue::Blob(codec::pos::encode(bound)));
            }
        }
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM node_tag AS t WHERE t.id = n.id AND t.name = ?)");
            args.push(SqlValue::Text(tag.clone()));
        }

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = BTreeSet::new();
        for raw in rows {
            out.insert(decode_id(&raw?)?);
        }
        Ok(out)
    }

    fn pending_triggers(&self, name: &str) -> Result<Vec<NodeID>, StorageError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM node_trigger WHERE name = ?1 AND state = ?2")?;
        let rows = stmt.query_map(params![name, TriggerState::Pending.as_str()], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(decode_id(&raw?)?);
        }
        Ok(out)
    }
}
