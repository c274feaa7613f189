//! Core identifier types for the Veles object store.

use crate::error::VelesError;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

/// NodeID: 24-byte opaque node identifier
///
/// All-zero is the null id (never a valid node), all-0xFF is the implicit
/// root every top-level node hangs off.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeID([u8; NodeID::WIDTH]);

impl NodeID {
    pub const WIDTH: usize = 24;

    /// Fresh random id from the operating system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::WIDTH];
        OsRng.fill_bytes(&mut bytes);
        // Astronomically unlikely, but the reserved values must never be handed out.
        if bytes == [0u8; Self::WIDTH] || bytes == [0xffu8; Self::WIDTH] {
            return Self::random();
        }
        NodeID(bytes)
    }

    pub const fn null() -> Self {
        NodeID([0u8; Self::WIDTH])
    }

    pub const fn root() -> Self {
        NodeID([0xffu8; Self::WIDTH])
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    pub fn is_root(&self) -> bool {
        *self == Self::root()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VelesError> {
        let raw: [u8; Self::WIDTH] = bytes.try_into().map_err(|_| {
            VelesError::schema(format!(
                "node id must be {} bytes, got {}",
                Self::WIDTH,
                bytes.len()
            ))
        })?;
        Ok(NodeID(raw))
    }

    pub fn as_bytes(&self) -> &[u8; Self::WIDTH] {
        &self.0
    }

    pub fn from_hex(text: &str) -> Result<Self, VelesError> {
        let bytes = hex::decode(text)
            .map_err(|e| VelesError::schema(format!("invalid node id hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; NodeID::WIDTH]> for NodeID {
    fn from(bytes: [u8; NodeID::WIDTH]) -> Self {
        NodeID(bytes)
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

impl fmt::Debug for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeID({})", self)
    }
}

/// State of a named trigger on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerState {
    Pending,
    Done,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Pending => "pending",
            TriggerState::Done => "done",
        }
    }

    pub fn parse(text: &str) -> Result<Self, VelesError> {
        match text {
            "pending" => Ok(TriggerState::Pending),
            "done" => Ok(TriggerState::Done),
            other => Err(VelesError::schema(format!("unknown trigger state {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        assert!(NodeID::null().is_null());
        assert!(NodeID::root().is_root());
        assert_ne!(NodeID::null(), NodeID::root());
        assert_eq!(NodeID::root().to_string(), "root");
    }

    #[test]
    fn test_random_ids_are_distinct_and_valid() {
        let a = NodeID::random();
        let b = NodeID::random();
        assert_ne!(a, b);
        assert!(!a.is_null() && !a.is_root());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_width() {
        assert!(NodeID::from_bytes(&[1u8; 23]).is_err());
        let id = NodeID::from_bytes(&[7u8; 24]).unwrap();
        assert_eq!(NodeID::from_hex(&id.to_hex()).unwrap(), id);
    }
}
