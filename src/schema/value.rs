//! Dynamic attribute values.
//!
//! `Value` has one variant per codec type. Integers are always held as
//! arbitrary-precision `BigInt`; the codec decides between the inline and
//! the extension representation.

use crate::error::VelesError;
use crate::types::NodeID;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_bigint::{BigInt, BigUint};
use num_traits::ToPrimitive;
use std::collections::BTreeMap;

/// Uniform-width integer array with a packed little-endian representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BinData {
    width: u32,
    raw: Vec<u8>,
}

impl BinData {
    /// Wrap packed element bytes of the given bit width.
    pub fn from_raw(width: u32, raw: Vec<u8>) -> Result<Self, VelesError> {
        if width == 0 {
            return Err(VelesError::schema("BinData width must be positive"));
        }
        let octets = Self::octets_for(width);
        if raw.len() % octets != 0 {
            return Err(VelesError::schema(format!(
                "BinData of width {} needs a multiple of {} bytes, got {}",
                width,
                octets,
                raw.len()
            )));
        }
        Ok(BinData { width, raw })
    }

    /// 8-bit BinData over plain bytes.
    pub fn from_bytes(raw: Vec<u8>) -> Self {
        BinData { width: 8, raw }
    }

    /// Pack a list of elements; each must fit in `width` bits.
    pub fn from_elements(width: u32, elements: &[BigUint]) -> Result<Self, VelesError> {
        let octets = Self::octets_for(width);
        let mut raw = Vec::with_capacity(octets * elements.len());
        for element in elements {
            if element.bits() > u64::from(width) {
                return Err(VelesError::schema(format!(
                    "BinData element {} does not fit in {} bits",
                    element, width
                )));
            }
            let mut bytes = element.to_bytes_le();
            bytes.resize(octets, 0);
            raw.extend_from_slice(&bytes);
        }
        Ok(BinData { width, raw })
    }

    fn octets_for(width: u32) -> usize {
        ((width + 7) / 8) as usize
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn octets_per_element(&self) -> usize {
        Self::octets_for(self.width)
    }

    pub fn len(&self) -> usize {
        self.raw.len() / self.octets_per_element()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn element(&self, index: usize) -> Option<BigUint> {
        let octets = self.octets_per_element();
        let start = index.checked_mul(octets)?;
        let chunk = self.raw.get(start..start + octets)?;
        Some(BigUint::from_bytes_le(chunk))
    }
}

/// Dynamic value stored in attributes, scalar data and message fields
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    NodeId(NodeID),
    BinData(BinData),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::NodeId(_) => "node_id",
            Value::BinData(_) => "bindata",
            Value::Timestamp(_) => "timestamp",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => i.to_i64(),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Map-valued helper: build a string-keyed map from pairs.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(BigInt::from(v))
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<NodeID> for Value {
    fn from(v: NodeID) -> Self {
        Value::NodeId(v)
    }
}

impl From<BinData> for Value {
    fn from(v: BinData) -> Self {
        Value::BinData(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindata_elements() {
        let elements = vec![BigUint::from(1u32), BigUint::from(0x1ffu32), BigUint::from(0u32)];
        let bd = BinData::from_elements(9, &elements).unwrap();
        assert_eq!(bd.octets_per_element(), 2);
        assert_eq!(bd.len(), 3);
        assert_eq!(bd.raw(), &[1, 0, 0xff, 1, 0, 0]);
        assert_eq!(bd.element(1), Some(BigUint::from(0x1ffu32)));
        assert_eq!(bd.element(3), None);
    }

    #[test]
    fn test_bindata_rejects_oversized_element() {
        let err = BinData::from_elements(4, &[BigUint::from(16u32)]).unwrap_err();
        assert_eq!(err.code(), "schema_error");
    }

    #[test]
    fn test_bindata_rejects_ragged_raw() {
        assert!(BinData::from_raw(16, vec![1, 2, 3]).is_err());
        assert!(BinData::from_raw(0, vec![]).is_err());
    }
}
