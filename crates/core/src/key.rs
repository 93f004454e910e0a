//! Collection item keys.

use crate::value::Value;
use alloc::string::String;
use core::fmt;

/// The primary key of a collection item.
///
/// Integer keys order before string keys so that mixed-key collections still
/// have a total, deterministic order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Converts a scalar value into a key. Only integers and strings are valid keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int64(i) => Some(Key::Int(*i)),
            Value::String(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }

    /// Returns the key as a `Value`.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::Int64(*i),
            Key::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{}", i),
            Key::Str(s) => write!(f, "{}", s),
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

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.into())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}
