//! Schema layer: dynamic values, typed fields and the tagged records built on them.

pub mod check;
pub mod connection;
pub mod fields;
pub mod node;
pub mod operation;
pub mod value;

pub use check::Check;
pub use connection::ConnectionInfo;
pub use fields::{FromValue, IntoValue};
pub use node::{Node, PosFilter};
pub use operation::{NewNode, Operation};
pub use value::{BinData, Value};
