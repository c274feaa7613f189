//! Connected client descriptions for `list_connections`.

use crate::error::VelesError;
use crate::schema::fields::{expect_map, take_field, FromValue, IntoValue};
use crate::schema::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    pub id: u64,
    pub client_name: String,
    pub client_version: String,
    pub client_description: String,
    pub client_type: String,
}

impl IntoValue for ConnectionInfo {
    fn into_value(self) -> Value {
        Value::map([
            ("id", self.id.into_value()),
            ("client_name", self.client_name.into_value()),
            ("client_version", self.client_version.into_value()),
            ("client_description", self.client_description.into_value()),
            ("client_type", self.client_type.into_value()),
        ])
    }
}

impl FromValue for ConnectionInfo {
    fn from_value(value: Value) -> Result<Self, VelesError> {
        let mut map = expect_map(value)?;
        Ok(ConnectionInfo {
            id: take_field(&mut map, "id")?,
            client_name: take_field(&mut map, "client_name")?,
            client_version: take_field(&mut map, "client_version")?,
            client_description: take_field(&mut map, "client_description")?,
            client_type: take_field(&mut map, "client_type")?,
        })
    }
}
