//! Wire Codec
//!
//! Every stored value and every protocol message is one self-describing
//! MessagePack object. Veles-specific types travel as extensions:
//!
//! | ext | payload |
//! |-----|---------|
//! | 0 | 24-byte NodeID |
//! | 1 | u32 LE bit width, then packed element bytes (BinData) |
//! | 2 | LE magnitude of a positive integer too big for the inline forms |
//! | 3 | i64 LE milliseconds since the UNIX epoch (UTC timestamp) |
//! | 4 | LE magnitude of a negative integer too big for the inline forms |

pub mod pos;

use crate::error::VelesError;
use crate::schema::value::{BinData, Value};
use crate::types::NodeID;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use num_bigint::{BigInt, Sign};
use num_traits::ToPrimitive;
use rmpv::Value as MsgValue;
use std::collections::BTreeMap;

pub const EXT_NODE_ID: i8 = 0;
pub const EXT_BINDATA: i8 = 1;
pub const EXT_POSINT: i8 = 2;
pub const EXT_TIMESTAMP: i8 = 3;
pub const EXT_NEGINT: i8 = 4;

/// Serialize a value to MessagePack bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = rmpv::encode::write_value(&mut buf, &to_msgpack(value));
    buf
}

/// Deserialize exactly one MessagePack object.
pub fn decode(bytes: &[u8]) -> Result<Value, VelesError> {
    let mut cursor = bytes;
    let raw = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| VelesError::schema(format!("malformed msgpack: {}", e)))?;
    if !cursor.is_empty() {
        return Err(VelesError::schema(format!(
            "{} trailing bytes after msgpack object",
            cursor.len()
        )));
    }
    from_msgpack(raw)
}

/// Convert to the generic MessagePack tree.
pub fn to_msgpack(value: &Value) -> MsgValue {
    match value {
        Value::Nil => MsgValue::Nil,
        Value::Bool(b) => MsgValue::Boolean(*b),
        Value::Int(i) => int_to_msgpack(i),
        Value::Float(f) => MsgValue::F64(*f),
        Value::Str(s) => MsgValue::String(s.clone().into()),
        Value::Bytes(b) => MsgValue::Binary(b.to_vec()),
        Value::List(items) => MsgValue::Array(items.iter().map(to_msgpack).collect()),
        Value::Map(map) => MsgValue::Map(
            map.iter()
                .map(|(k, v)| (MsgValue::String(k.clone().into()), to_msgpack(v)))
                .collect(),
        ),
        Value::NodeId(id) => MsgValue::Ext(EXT_NODE_ID, id.as_bytes().to_vec()),
        Value::BinData(bd) => {
            let mut payload = Vec::with_capacity(4 + bd.raw().len());
            payload.extend_from_slice(&bd.width().to_le_bytes());
            payload.extend_from_slice(bd.raw());
            MsgValue::Ext(EXT_BINDATA, payload)
        }
        Value::Timestamp(ts) => {
            MsgValue::Ext(EXT_TIMESTAMP, ts.timestamp_millis().to_le_bytes().to_vec())
        }
    }
}

fn int_to_msgpack(i: &BigInt) -> MsgValue {
    if let Some(v) = i.to_i64() {
        return MsgValue::from(v);
    }
    if let Some(v) = i.to_u64() {
        return MsgValue::from(v);
    }
    let (sign, magnitude) = i.to_bytes_le();
    let code = if sign == Sign::Minus { EXT_NEGINT } else { EXT_POSINT };
    MsgValue::Ext(code, magnitude)
}

/// Convert from the generic MessagePack tree.
pub fn from_msgpack(raw: MsgValue) -> Result<Value, VelesError> {
    Ok(match raw {
        MsgValue::Nil => Value::Nil,
        MsgValue::Boolean(b) => Value::Bool(b),
        MsgValue::Integer(i) => {
            if let Some(v) = i.as_i64() {
                Value::Int(BigInt::from(v))
            } else if let Some(v) = i.as_u64() {
                Value::Int(BigInt::from(v))
            } else {
                return Err(VelesError::schema("unrepresentable integer"));
            }
        }
        MsgValue::F32(f) => Value::Float(f64::from(f)),
        MsgValue::F64(f) => Value::Float(f),
        MsgValue::String(s) => match s.into_str() {
            Some(s) => Value::Str(s),
            None => return Err(VelesError::schema("string is not valid UTF-8")),
        },
        MsgValue::Binary(b) => Value::Bytes(Bytes::from(b)),
        MsgValue::Array(items) => Value::List(
            items
                .into_iter()
                .map(from_msgpack)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        MsgValue::Map(pairs) => {
            let mut map = BTreeMap::new();
            for (k, v) in pairs {
                let key = match k {
                    MsgValue::String(s) => s
                        .into_str()
                        .ok_or_else(|| VelesError::schema("map key is not valid UTF-8"))?,
                    other => {
                        return Err(VelesError::schema(format!(
                            "map keys must be strings, got {}",
                            other
                        )))
                    }
                };
                map.insert(key, from_msgpack(v)?);
            }
            Value::Map(map)
        }
        MsgValue::Ext(code, payload) => ext_to_value(code, payload)?,
    })
}

fn ext_to_value(code: i8, payload: Vec<u8>) -> Result<Value, VelesError> {
    match code {
        EXT_NODE_ID => Ok(Value::NodeId(NodeID::from_bytes(&payload)?)),
        EXT_BINDATA => {
            if payload.len() < 4 {
                return Err(VelesError::schema("BinData payload shorter than its width header"));
            }
            let width = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            Ok(Value::BinData(BinData::from_raw(width, payload[4..].to_vec())?))
        }
        EXT_POSINT => Ok(Value::Int(BigInt::from_bytes_le(Sign::Plus, &payload))),
        EXT_NEGINT => Ok(Value::Int(BigInt::from_bytes_le(Sign::Minus, &payload))),
        EXT_TIMESTAMP => {
            let raw: [u8; 8] = payload
                .as_slice()
                .try_into()
                .map_err(|_| VelesError::schema("timestamp payload must be 8 bytes"))?;
            let millis = i64::from_le_bytes(raw);
            let ts = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| VelesError::schema(format!("timestamp {} out of range", millis)))?;
            Ok(Value::Timestamp(ts))
        }
        other => Err(VelesError::schema(format!("unknown extension type {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_ints_are_inline() {
        let bytes = encode(&Value::from(5i64));
        assert_eq!(bytes, vec![0x05]);
        let bytes = encode(&Value::from(u64::MAX));
        assert_eq!(bytes[0], 0xcf);
    }

    #[test]
    fn test_big_ints_use_extensions() {
        let big = BigInt::from(1u8) << 100usize;
        let value = Value::Int(big.clone());
        match to_msgpack(&value) {
            MsgValue::Ext(code, _) => assert_eq!(code, EXT_POSINT),
            other => panic!("expected ext, got {:?}", other),
        }
        assert_eq!(decode(&encode(&value)).unwrap(), value);

        let negative = Value::Int(-big);
        match to_msgpack(&negative) {
            MsgValue::Ext(code, _) => assert_eq!(code, EXT_NEGINT),
            other => panic!("expected ext, got {:?}", other),
        }
        assert_eq!(decode(&encode(&negative)).unwrap(), negative);
    }

    #[test]
    fn test_node_id_and_bindata_extensions() {
        let id = NodeID::random();
        let bd = BinData::from_raw(16, vec![1, 0, 2, 0]).unwrap();
        let value = Value::map([("id", Value::NodeId(id)), ("bd", Value::BinData(bd))]);
        let bytes = encode(&value);
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_timestamp_extension() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        let value = Value::Timestamp(ts);
        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_rejects_non_string_keys_and_trailing_bytes() {
        let raw = MsgValue::Map(vec![(MsgValue::from(1), MsgValue::Nil)]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &raw).unwrap();
        assert!(decode(&buf).is_err());

        let mut bytes = encode(&Value::Nil);
        bytes.push(0xc0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_unknown_extension_is_schema_error() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &MsgValue::Ext(42, vec![1])).unwrap();
        assert_eq!(decode(&buf).unwrap_err().code(), "schema_error");
    }
}
