//! Record keys and key paths

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use super::error::{Result, StoreError};

/// A primary or index key. Integers sort before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    /// Interpret a JSON value as a key, if it has a key type.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) => Some(Key::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::String(s.clone()),
        }
    }

    /// Stable text encoding, distinct for `1` and `"1"`.
    pub fn encode(&self) -> String {
        match self {
            Key::Int(i) => i.to_string(),
            Key::Text(s) => Value::String(s.clone()).to_string(),
        }
    }

    pub fn decode(encoded: &str) -> Result<Key> {
        let value: Value = serde_json::from_str(encoded)?;
        Key::from_value(&value)
            .ok_or_else(|| StoreError::Data(format!("not a key: {}", encoded)))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Int(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Int(v as i64)
    }
}

impl From<u32> for Key {
    fn from(v: u32) -> Self {
        Key::Int(v as i64)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Text(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Text(v)
    }
}

/// Resolve a dotted key path (`"id"`, `"meta.id"`) inside a record.
pub fn lookup<'a>(record: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// Extract the key at `key_path`. `Ok(None)` when the field is absent,
/// `Err(Data)` when it is present but not a valid key.
pub fn extract(record: &Value, key_path: &str) -> Result<Option<Key>> {
    match lookup(record, key_path) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => Key::from_value(value).map(Some).ok_or_else(|| {
            StoreError::Data(format!("value at key path '{}' is not a valid key", key_path))
        }),
    }
}

/// Write a generated key into the record, creating intermediate objects.
pub fn inject(record: &mut Value, key_path: &str, key: &Key) -> Result<()> {
    let mut segments = key_path.split('.').peekable();
    let mut current = record;

    while let Some(segment) = segments.next() {
        let map = current.as_object_mut().ok_or_else(|| {
            StoreError::Data(format!("cannot inject key at '{}' into a non-object", key_path))
        })?;

        if segments.peek().is_none() {
            map.insert(segment.to_string(), key.to_value());
            return Ok(());
        }

        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    Err(StoreError::Data("empty key path".to_string()))
}
