//! The `Value` sum type and the `Entry` wrapper stored by every tier.

use crate::core::config::Category;
use crate::core::error::Error;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Concretizes the spec's "opaque value" as a closed sum type rather than a
/// dynamic top type, so a raw byte string or string value passes through
/// every tier unchanged and only structured values get JSON-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bytes(Vec<u8>),
    Str(String),
    Int64(i64),
    Json(serde_json::Value),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "string",
            Value::Int64(_) => "int64",
            Value::Json(_) => "json",
        }
    }

    /// Returns the value as an `i64`, treating a missing entry semantics as
    /// the caller's responsibility (callers of `Incr`/`IncrBy` pre-default a
    /// missing key to zero before calling this).
    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            Value::Int64(n) => Ok(*n),
            other => Err(Error::InvalidType {
                expected: "int64",
                actual: other.type_name(),
            }),
        }
    }

    /// Serializes to the raw bytes a persistent backend stores: `Bytes`
    /// passes through, `Str` as UTF-8 bytes, `Int64` as its decimal ASCII
    /// form, `Json` as its encoded form — never double-encoding an
    /// already-textual value.
    pub fn to_raw_json(&self) -> serde_json::Value {
        match self {
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int64(n) => serde_json::Value::Number((*n).into()),
            Value::Json(j) => j.clone(),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int64(n)
    }
}

/// A stored key/value pair plus the bookkeeping every tier needs.
///
/// `expires_at: None` means no expiry (persistent writes never set one, per
/// the spec's Entry invariant). `source` is diagnostic only — routing
/// decisions always re-derive category from the key and current config
/// rather than trusting a stored value, per Testable Property 4.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<Instant>,
    pub created_at: Instant,
    pub source: Option<Category>,
}

impl Entry {
    pub fn new(value: Value, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.filter(|d| !d.is_zero()).map(|d| now + d),
            created_at: now,
            source: None,
        }
    }

    pub fn with_source(mut self, category: Category) -> Self {
        self.source = Some(category);
        self
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}
