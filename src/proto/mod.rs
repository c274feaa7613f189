//! Wire protocol: messages, framing and connection URLs.

pub mod framing;
pub mod messages;
pub mod pending;
pub mod url;

pub use framing::{read_message, write_message, DEFAULT_MAX_FRAME_SIZE, KEY_SIZE};
pub use messages::Message;
pub use url::{Endpoint, VelesUrl};

/// Version both ends must agree on in the connect handshake
pub const PROTO_VERSION: u64 = 1;
