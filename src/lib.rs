//! Veles: a hierarchical object store.
//!
//! Nodes live in a SQLite database behind a [`tracker::Tracker`], which
//! applies atomic transactions and pushes changes to live subscriptions and
//! cached derived queries. A [`conn::Connection`] is the uniform API over
//! either an in-process store or a remote server reached through
//! [`client::Client`].

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod proto;
pub mod schema;
pub mod server;
pub mod tracer;
pub mod tracker;
pub mod types;

pub use client::Client;
pub use conn::{Connection, LocalConnection, Subscription};
pub use error::VelesError;
pub use schema::{Check, NewNode, Node, Operation, PosFilter, Value};
pub use server::Server;
pub use tracker::{Event, Tracker};
pub use types::NodeID;
