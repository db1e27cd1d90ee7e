use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dynamic value stored in maps and carried by operations.
///
/// Serializes to `MsgPack` via `rmp-serde`; the operation codec embeds the
/// encoded bytes as a length-prefixed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null. Maps reject it as a stored value.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    /// Uses `BTreeMap` for deterministic serialization order.
    Map(BTreeMap<String, Value>),
}

/// Failure to convert a [`Value`] to or from its binary form.
#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("value encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("value decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl Value {
    /// Short type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encodes the value as named `MsgPack`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Encode`] if serialization fails.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, ValueError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes a value previously produced by [`Value::to_msgpack`].
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Decode`] for malformed input.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, ValueError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
