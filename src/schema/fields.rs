//! Typed field system.
//!
//! `IntoValue` / `FromValue` convert Rust types to and from [`Value`]. The
//! `tagged_enum!` macro declares a polymorphic sum type whose wire form is a
//! map carrying an `object_type` discriminator plus one entry per field.
//! Missing fields decode through [`FromValue::from_missing`], which lets
//! `Option` fields be omitted on the wire.

use crate::error::VelesError;
use crate::schema::value::{BinData, Value};
use crate::types::{NodeID, TriggerState};
use bytes::Bytes;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::{BTreeMap, BTreeSet};

/// Conversion into a dynamic value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Conversion out of a dynamic value.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, VelesError>;

    /// Value used when a map field is absent.
    fn from_missing(field: &str) -> Result<Self, VelesError> {
        Err(VelesError::schema(format!("missing field {}", field)))
    }
}

/// Take a field out of a string-keyed map.
pub fn take_field<T: FromValue>(map: &mut BTreeMap<String, Value>, field: &str) -> Result<T, VelesError> {
    match map.remove(field) {
        Some(value) => T::from_value(value)
            .map_err(|e| VelesError::schema(format!("field {}: {}", field, e.message()))),
        None => T::from_missing(field),
    }
}

/// Unwrap a map value or fail with a schema error.
pub fn expect_map(value: Value) -> Result<BTreeMap<String, Value>, VelesError> {
    match value {
        Value::Map(map) => Ok(map),
        other => Err(VelesError::schema(format!("expected map, got {}", other.type_name()))),
    }
}

fn mismatch(expected: &str, got: &Value) -> VelesError {
    VelesError::schema(format!("expected {}, got {}", expected, got.type_name()))
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        Ok(value)
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(Value::Nil)
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch("bool", &other)),
        }
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(false)
    }
}

impl IntoValue for u64 {
    fn into_value(self) -> Value {
        Value::Int(BigInt::from(self))
    }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match &value {
            Value::Int(i) => i
                .to_u64()
                .ok_or_else(|| VelesError::schema(format!("{} out of range for u64", i))),
            other => Err(mismatch("int", other)),
        }
    }
}

impl IntoValue for BigInt {
    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl FromValue for BigInt {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Int(i) => Ok(i),
            other => Err(mismatch("int", &other)),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Str(self)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("str", &other)),
        }
    }
}

impl IntoValue for Bytes {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}

impl FromValue for Bytes {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl IntoValue for NodeID {
    fn into_value(self) -> Value {
        Value::NodeId(self)
    }
}

impl FromValue for NodeID {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::NodeId(id) => Ok(id),
            other => Err(mismatch("node_id", &other)),
        }
    }
}

impl IntoValue for BinData {
    fn into_value(self) -> Value {
        Value::BinData(self)
    }
}

impl FromValue for BinData {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::BinData(b) => Ok(b),
            other => Err(mismatch("bindata", &other)),
        }
    }
}

impl IntoValue for TriggerState {
    fn into_value(self) -> Value {
        Value::Str(self.as_str().to_string())
    }
}

impl FromValue for TriggerState {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        TriggerState::parse(&String::from_value(value)?)
    }
}

impl IntoValue for VelesError {
    fn into_value(self) -> Value {
        Value::map([
            ("code", Value::from(self.code())),
            ("msg", Value::from(self.message())),
        ])
    }
}

impl FromValue for VelesError {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        let mut map = expect_map(value)?;
        let code: String = take_field(&mut map, "code")?;
        let msg: Option<String> = take_field(&mut map, "msg")?;
        Ok(VelesError::from_code(&code, msg.unwrap_or_default()))
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Nil,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Nil => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(None)
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            Value::Nil => Ok(Vec::new()),
            other => Err(mismatch("list", &other)),
        }
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(Vec::new())
    }
}

impl<T: IntoValue + Ord> IntoValue for BTreeSet<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue + Ord> FromValue for BTreeSet<T> {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        Vec::<T>::from_value(value).map(|items| items.into_iter().collect())
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(BTreeSet::new())
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn into_value(self) -> Value {
        Value::Map(self.into_iter().map(|(k, v)| (k, v.into_value())).collect())
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        match value {
            Value::Map(map) => map
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            Value::Nil => Ok(BTreeMap::new()),
            other => Err(mismatch("map", &other)),
        }
    }

    fn from_missing(_field: &str) -> Result<Self, VelesError> {
        Ok(BTreeMap::new())
    }
}

/// Declare a polymorphic enum tagged by `object_type` on the wire.
///
/// ```ignore
/// tagged_enum! {
///     pub enum Shape {
///         Circle = "circle" { radius: u64 },
///         Dot = "dot" {},
///     }
/// }
/// ```
#[macro_export]
macro_rules! tagged_enum {
    (
        $(#[$enum_meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $tag:literal { $( $field:ident : $ty:ty ),* $(,)? }
            ),* $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        pub enum $name {
            $(
                $(#[$variant_meta])*
                $variant { $( $field: $ty ),* }
            ),*
        }

        impl $name {
            /// Wire discriminator of this variant.
            pub fn object_type(&self) -> &'static str {
                match self {
                    $( $name::$variant { .. } => $tag ),*
                }
            }
        }

        impl $crate::schema::fields::IntoValue for $name {
            #[allow(unused_mut)]
            fn into_value(self) -> $crate::schema::value::Value {
                match self {
                    $(
                        $name::$variant { $( $field ),* } => {
                            let mut map = ::std::collections::BTreeMap::new();
                            map.insert(
                                "object_type".to_string(),
                                $crate::schema::value::Value::Str($tag.to_string()),
                            );
                            $(
                                map.insert(
                                    stringify!($field).to_string(),
                                    $crate::schema::fields::IntoValue::into_value($field),
                                );
                            )*
                            $crate::schema::value::Value::Map(map)
                        }
                    ),*
                }
            }
        }

        impl $crate::schema::fields::FromValue for $name {
            #[allow(unused_mut, unused_variables)]
            fn from_value(
                value: $crate::schema::value::Value,
            ) -> ::std::result::Result<Self, $crate::error::VelesError> {
                let mut map = $crate::schema::fields::expect_map(value)?;
                let tag: String = $crate::schema::fields::take_field(&mut map, "object_type")?;
                match tag.as_str() {
                    $(
                        $tag => Ok($name::$variant {
                            $( $field: $crate::schema::fields::take_field(&mut map, stringify!($field))?, )*
                        }),
                    )*
                    other => Err($crate::error::VelesError::schema(format!(
                        "unknown {} object_type {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    tagged_enum! {
        #[derive(Debug, Clone, PartialEq)]
        pub enum Shape {
            Circle = "circle" { radius: u64, label: Option<String> },
            Dot = "dot" {},
        }
    }

    #[test]
    fn test_tagged_enum_wire_form() {
        let value = Shape::Circle { radius: 3, label: None }.into_value();
        let map = value.as_map().unwrap();
        assert_eq!(map.get("object_type"), Some(&Value::from("circle")));
        assert_eq!(map.get("radius"), Some(&Value::from(3u64)));
        assert_eq!(Shape::from_value(value).unwrap(), Shape::Circle { radius: 3, label: None });
    }

    #[test]
    fn test_optional_fields_may_be_omitted() {
        let value = Value::map([("object_type", Value::from("circle")), ("radius", Value::from(1u64))]);
        assert_eq!(Shape::from_value(value).unwrap(), Shape::Circle { radius: 1, label: None });
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let value = Value::map([("object_type", Value::from("circle"))]);
        let err = Shape::from_value(value).unwrap_err();
        assert_eq!(err.code(), "schema_error");
        assert!(err.message().contains("radius"));
    }

    #[test]
    fn test_unknown_tag_is_schema_error() {
        let value = Value::map([("object_type", Value::from("square"))]);
        assert_eq!(Shape::from_value(value).unwrap_err().code(), "schema_error");
    }

    #[test]
    fn test_error_wire_form() {
        let err = VelesError::ParentCycle("x".into());
        assert_eq!(VelesError::from_value(err.clone().into_value()).unwrap(), err);
    }
}
