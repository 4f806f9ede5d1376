//! Shared value model for RPC arguments, service bodies and gateway
//! payloads.
//!
//! [`RpcValue`] is the currency every subsystem trades in: the RPC codec
//! encodes it into wire envelopes, the registry stores service bodies as
//! value maps, and the HTTP gateway translates request bodies into it.
//! Callables embed directly in the tree so that a decoded `method` argument
//! can carry a live proxy back to the remote side.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Boxed future alias used throughout the broker.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type CallFn = dyn Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync;

/// A callable value: either a local handler (typed trampoline around a
/// registry operation) or a proxy that forwards the call to a remote peer.
#[derive(Clone)]
pub struct Callable {
    inner: Arc<CallFn>,
    name: Option<String>,
}

impl Callable {
    /// Wraps an async closure as a callable value.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            name: None,
        }
    }

    /// Wraps an async closure with a display name for introspection.
    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<RpcValue>) -> BoxFuture<'static, Result<RpcValue>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(f),
            name: Some(name.into()),
        }
    }

    /// Invokes the callable with positional arguments.
    pub async fn call(&self, args: Vec<RpcValue>) -> Result<RpcValue> {
        (self.inner)(args).await
    }

    /// Name the callable was exported under, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Identity comparison; two clones of the same callable are equal.
    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Callable({name})"),
            None => write!(f, "Callable(<anonymous>)"),
        }
    }
}

/// A dense multi-dimensional array transported as raw bytes plus shape
/// and dtype metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdArray {
    /// Row-major element bytes.
    pub data: Vec<u8>,
    /// Dimension sizes.
    pub shape: Vec<usize>,
    /// Element type name, e.g. `"float32"`.
    pub dtype: String,
}

/// The broker's value tree.
#[derive(Debug, Clone, Default)]
pub enum RpcValue {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes (non-UTF-8 payloads stay in this form).
    Bytes(Vec<u8>),
    /// Dense numeric array.
    NdArray(NdArray),
    /// Ordered list.
    List(Vec<RpcValue>),
    /// String-keyed map with stable iteration order.
    Map(BTreeMap<String, RpcValue>),
    /// Local handler or remote proxy.
    Callable(Callable),
    /// A transported error value.
    Fault(String),
}

impl RpcValue {
    /// Builds a map value from key/value pairs.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, RpcValue)>,
        K: Into<String>,
    {
        RpcValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    /// Returns the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an int.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RpcValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the map content, if this is a map.
    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match self {
            RpcValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the list content, if this is a list.
    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the callable content, if this is a callable.
    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            RpcValue::Callable(c) => Some(c),
            _ => None,
        }
    }

    /// Map lookup; `None` for missing keys and non-map values.
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Resolves a dotted path (`a.b.c`) via successive map lookups.
    pub fn lookup_path(&self, path: &str) -> Option<&RpcValue> {
        let mut current = self;
        for key in path.split('.') {
            current = current.get(key)?;
        }
        Some(current)
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, RpcValue::Null)
    }

    /// Converts a plain JSON value. Numbers become `Int` when integral.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RpcValue::Null,
            serde_json::Value::Bool(b) => RpcValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RpcValue::Int(i)
                } else {
                    RpcValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => RpcValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                RpcValue::List(items.iter().map(RpcValue::from_json).collect())
            }
            serde_json::Value::Object(map) => RpcValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), RpcValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to plain JSON. Callables render as `"<function: name>"`
    /// placeholders, bytes as arrays of numbers, ndarrays as metadata maps.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RpcValue::Null => serde_json::Value::Null,
            RpcValue::Bool(b) => serde_json::Value::Bool(*b),
            RpcValue::Int(i) => serde_json::Value::from(*i),
            RpcValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RpcValue::String(s) => serde_json::Value::String(s.clone()),
            RpcValue::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|x| serde_json::Value::from(*x)).collect(),
            ),
            RpcValue::NdArray(arr) => serde_json::json!({
                "shape": arr.shape,
                "dtype": arr.dtype,
                "length": arr.data.len(),
            }),
            RpcValue::List(items) => {
                serde_json::Value::Array(items.iter().map(RpcValue::to_json).collect())
            }
            RpcValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            RpcValue::Callable(c) => serde_json::Value::String(format!(
                "<function: {}>",
                c.name().unwrap_or("anonymous")
            )),
            RpcValue::Fault(msg) => serde_json::json!({ "error": msg }),
        }
    }

    /// Invokes this value as a callable, failing for non-callables.
    pub async fn invoke(&self, args: Vec<RpcValue>) -> Result<RpcValue> {
        match self {
            RpcValue::Callable(c) => c.call(args).await,
            other => Err(Error::BadRequest(format!(
                "value is not callable: {other:?}"
            ))),
        }
    }
}

impl PartialEq for RpcValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RpcValue::Null, RpcValue::Null) => true,
            (RpcValue::Bool(a), RpcValue::Bool(b)) => a == b,
            (RpcValue::Int(a), RpcValue::Int(b)) => a == b,
            (RpcValue::Float(a), RpcValue::Float(b)) => a == b,
            (RpcValue::String(a), RpcValue::String(b)) => a == b,
            (RpcValue::Bytes(a), RpcValue::Bytes(b)) => a == b,
            (RpcValue::NdArray(a), RpcValue::NdArray(b)) => a == b,
            (RpcValue::List(a), RpcValue::List(b)) => a == b,
            (RpcValue::Map(a), RpcValue::Map(b)) => a == b,
            (RpcValue::Callable(a), RpcValue::Callable(b)) => a.ptr_eq(b),
            (RpcValue::Fault(a), RpcValue::Fault(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<i64> for RpcValue {
    fn from(i: i64) -> Self {
        RpcValue::Int(i)
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_lookup_walks_nested_maps() {
        let value = RpcValue::map([(
            "a",
            RpcValue::map([("b", RpcValue::map([("c", RpcValue::Int(7))]))]),
        )]);
        assert_eq!(value.lookup_path("a.b.c"), Some(&RpcValue::Int(7)));
        assert_eq!(value.lookup_path("a.x"), None);
    }

    #[test]
    fn json_conversion_renders_callables_as_placeholders() {
        let value = RpcValue::map([(
            "echo",
            RpcValue::Callable(Callable::named("echo", |args| {
                Box::pin(async move { Ok(args.into_iter().next().unwrap_or_default()) })
            })),
        )]);
        let json = value.to_json();
        assert_eq!(json["echo"], serde_json::json!("<function: echo>"));
    }

    #[tokio::test]
    async fn callable_invocation_returns_result() {
        let echo = Callable::new(|args| {
            Box::pin(async move { Ok(args.into_iter().next().unwrap_or_default()) })
        });
        let out = echo.call(vec![RpcValue::from("hi")]).await.unwrap();
        assert_eq!(out, RpcValue::from("hi"));
    }

    #[test]
    fn callable_identity_survives_clone() {
        let f = Callable::new(|_| Box::pin(async { Ok(RpcValue::Null) }));
        let g = f.clone();
        assert!(f.ptr_eq(&g));
        let h = Callable::new(|_| Box::pin(async { Ok(RpcValue::Null) }));
        assert!(!f.ptr_eq(&h));
    }
}
