//! C5 TypedAdapter: generic type-safe façade and JSON façade over [`Hybrid`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{Error, Result};
use crate::storage::hybrid::Hybrid;
use crate::storage::value::Value;

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Json(serde_json::Value::Bool(b))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Json(serde_json::json!(f))
    }
}

impl TryFrom<Value> for String {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(Error::InvalidType {
                expected: "string",
                actual: other.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Int64(n) => Ok(n),
            other => Err(Error::InvalidType {
                expected: "int64",
                actual: other.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::InvalidType {
                expected: "bytes",
                actual: other.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Json(serde_json::Value::Bool(b)) => Ok(b),
            other => Err(Error::InvalidType {
                expected: "bool",
                actual: other.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Json(json) => json.as_f64().ok_or(Error::InvalidType {
                expected: "float64",
                actual: "json",
            }),
            other => Err(Error::InvalidType {
                expected: "float64",
                actual: other.type_name(),
            }),
        }
    }
}

/// Enforces a single value type `T` at compile time. Every `get` asserts
/// the underlying value is `T`, failing with `Error::InvalidType` carrying
/// expected/actual type names otherwise.
pub struct Typed<T> {
    hybrid: Arc<Hybrid>,
    prefix: Option<String>,
    _marker: PhantomData<T>,
}

impl<T> Typed<T>
where
    T: Into<Value> + TryFrom<Value, Error = Error>,
{
    pub fn new(hybrid: Arc<Hybrid>) -> Self {
        Self {
            hybrid,
            prefix: None,
            _marker: PhantomData,
        }
    }

    /// Scopes every key through a fixed prefix, e.g. for a `TypedString`
    /// façade dedicated to one logical namespace.
    pub fn with_prefix(hybrid: Arc<Hybrid>, prefix: impl Into<String>) -> Self {
        Self {
            hybrid,
            prefix: Some(prefix.into()),
            _marker: PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_string(),
        }
    }

    pub async fn set(&self, key: &str, value: T, ttl: Option<Duration>) -> Result<()> {
        self.hybrid.set(&self.full_key(key), value.into(), ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        match self.hybrid.get(&self.full_key(key)).await? {
            Some(value) => Ok(Some(T::try_from(value)?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.hybrid.delete(&self.full_key(key)).await
    }
}

pub type TypedString = Typed<String>;
pub type TypedInt64 = Typed<i64>;
pub type TypedBool = Typed<bool>;
pub type TypedBytes = Typed<Vec<u8>>;
pub type TypedFloat64 = Typed<f64>;

pub fn typed_string(hybrid: Arc<Hybrid>) -> TypedString {
    Typed::new(hybrid)
}

pub fn typed_int64(hybrid: Arc<Hybrid>) -> TypedInt64 {
    Typed::new(hybrid)
}

pub fn typed_bool(hybrid: Arc<Hybrid>) -> TypedBool {
    Typed::new(hybrid)
}

pub fn typed_bytes(hybrid: Arc<Hybrid>) -> TypedBytes {
    Typed::new(hybrid)
}

pub fn typed_float64(hybrid: Arc<Hybrid>) -> TypedFloat64 {
    Typed::new(hybrid)
}

/// JSON-serialization façade: marshals `T` to JSON on `set`, unmarshals on
/// `get`. Accepts either a byte-string or string value shape read back from
/// a tier that doesn't preserve the `Json` variant natively (e.g. a
/// persistent backend that round-tripped through text).
pub struct TypedJson<T> {
    hybrid: Arc<Hybrid>,
    _marker: PhantomData<T>,
}

impl<T> TypedJson<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(hybrid: Arc<Hybrid>) -> Self {
        Self {
            hybrid,
            _marker: PhantomData,
        }
    }

    pub async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let json = serde_json::to_value(value).map_err(|e| Error::Storage(format!("json encode: {e}")))?;
        self.hybrid.set(key, Value::Json(json), ttl).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        let decode_err = |e: serde_json::Error| Error::Storage(format!("json decode: {e}"));
        match self.hybrid.get(key).await? {
            Some(Value::Json(json)) => Ok(Some(serde_json::from_value(json).map_err(decode_err)?)),
            Some(Value::Str(s)) => Ok(Some(serde_json::from_str(&s).map_err(decode_err)?)),
            Some(Value::Bytes(b)) => Ok(Some(serde_json::from_slice(&b).map_err(decode_err)?)),
            Some(other) => Err(Error::InvalidType {
                expected: "json",
                actual: other.type_name(),
            }),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.hybrid.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::HybridConfig;
    use crate::storage::local::LocalCache;
    use crate::storage::persistent::NullPersistent;
    use serde::Deserialize;

    fn test_hybrid() -> Arc<Hybrid> {
        Hybrid::new(LocalCache::new(), None, Arc::new(NullPersistent), HybridConfig::default())
    }

    #[tokio::test]
    async fn typed_string_round_trips() {
        let typed = typed_string(test_hybrid());
        typed.set("k", "hello".to_string(), None).await.unwrap();
        assert_eq!(typed.get("k").await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn typed_mismatch_is_invalid_type() {
        let hybrid = test_hybrid();
        hybrid.set("k", Value::Int64(7), None).await.unwrap();
        let typed = typed_string(hybrid);
        let err = typed.get("k").await.unwrap_err();
        assert!(matches!(err, Error::InvalidType { expected: "string", .. }));
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn typed_json_round_trips_struct() {
        let typed: TypedJson<Widget> = TypedJson::new(test_hybrid());
        let widget = Widget {
            name: "gizmo".into(),
            count: 3,
        };
        typed.set("w", &widget, None).await.unwrap();
        assert_eq!(typed.get("w").await.unwrap(), Some(widget));
    }

    #[tokio::test]
    async fn typed_json_accepts_string_shaped_value() {
        let hybrid = test_hybrid();
        hybrid
            .set("w", Value::Str(r#"{"name":"gizmo","count":3}"#.to_string()), None)
            .await
            .unwrap();
        let typed: TypedJson<Widget> = TypedJson::new(hybrid);
        assert_eq!(
            typed.get("w").await.unwrap(),
            Some(Widget {
                name: "gizmo".into(),
                count: 3
            })
        );
    }
}
