//! A small dynamically-typed value used for RPC/publish payloads.
//!
//! The fabric routes arbitrary, serializable args/kwargs to handlers whose
//! shape isn't known at the routing layer — service and method are
//! hashable labels picked by the caller, not Rust types. `Value` is the
//! open payload type that crosses that boundary, analogous to the
//! untyped tuples/dicts `original_source/junction` passes around.

use serde::{Deserialize, Serialize};

/// A hashable, serializable label used for service/method names.
///
/// Mirrors the original's "anything hash-able" service/method keys without
/// requiring callers to define a new enum per deployment — an integer code
/// or a short string both work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    /// An integer service/method code.
    Int(i64),
    /// A textual service/method name.
    Text(String),
}

impl From<i64> for Label {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Label {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Label {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// An open payload value for args/kwargs and RPC results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A UTF-8 string.
    Text(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// An ordered list of values.
    List(Vec<Value>),
    /// An ordered association list (kwargs use this shape too).
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Shorthand for building a text value.
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Keyword arguments: an ordered association list, serialized the same way
/// as a `Value::Map` but kept as its own alias at call sites for clarity.
pub type KwArgs = Vec<(String, Value)>;
