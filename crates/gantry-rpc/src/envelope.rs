//! Tagged value envelopes.
//!
//! Values cross the wire as `{"__jailed_type__": ..., "__value__": ...}`
//! envelopes inside JSON frames. Binary payloads (ndarray chunks and
//! non-UTF-8 bytes) are lifted out into indexed attachments so the JSON
//! side stays pure text; [`crate::wire`] pairs them back up.

use std::collections::BTreeMap;

use gantry_core::{Callable, Error, NdArray, Result, RpcValue};

use crate::interface::{LocalInterface, ProxyFactory};
use crate::store::ReferenceStore;

/// Chunk size for ndarray payloads, in bytes.
pub const ARRAY_CHUNK: usize = 1_000_000;

const TYPE_KEY: &str = "__jailed_type__";
const VALUE_KEY: &str = "__value__";

/// State threaded through one encode pass.
pub struct EncodeContext<'a> {
    /// Exported interface used to encode stable methods as `interface`
    /// envelopes instead of one-shot callbacks.
    pub interface: Option<&'a LocalInterface>,
    /// Reference store anonymous callables are parked in.
    pub store: &'a ReferenceStore,
    /// When set, callables are parked as shared references that live
    /// until disposed (used for long-lived interface bundles).
    pub shared_callbacks: bool,
    /// Binary payloads lifted out of the tree, in reference order.
    pub attachments: Vec<Vec<u8>>,
    /// Plugin-api bundles encountered while encoding: plugin id mapped to
    /// its callable slots.
    pub plugin_interfaces: Vec<(String, BTreeMap<String, Callable>)>,
    /// Ids parked during this pass (callers may dispose them on failure).
    pub stored_ids: Vec<u64>,
}

impl<'a> EncodeContext<'a> {
    /// Creates a context over a reference store.
    pub fn new(store: &'a ReferenceStore) -> Self {
        Self {
            interface: None,
            store,
            shared_callbacks: false,
            attachments: Vec::new(),
            plugin_interfaces: Vec::new(),
            stored_ids: Vec::new(),
        }
    }

    /// Attaches the exported interface for stable-method detection.
    pub fn with_interface(mut self, interface: &'a LocalInterface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Parks callables as shared (explicitly disposed) references.
    pub fn with_shared_callbacks(mut self) -> Self {
        self.shared_callbacks = true;
        self
    }

    fn park(&mut self, callable: Callable) -> u64 {
        let id = if self.shared_callbacks {
            self.store.put_shared(callable)
        } else {
            self.store.put(callable)
        };
        self.stored_ids.push(id);
        id
    }

    fn attach(&mut self, data: Vec<u8>) -> usize {
        self.attachments.push(data);
        self.attachments.len() - 1
    }
}

fn envelope(kind: &str, value: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ TYPE_KEY: kind, VALUE_KEY: value })
}

fn is_envelope(map: &BTreeMap<String, RpcValue>) -> bool {
    map.contains_key(TYPE_KEY) && map.contains_key(VALUE_KEY)
}

/// Encodes a value tree into its wire form.
pub fn encode(value: &RpcValue, ctx: &mut EncodeContext<'_>) -> serde_json::Value {
    match value {
        RpcValue::Null => serde_json::Value::Null,
        RpcValue::Bool(_) | RpcValue::Int(_) | RpcValue::Float(_) | RpcValue::String(_) => {
            envelope("argument", value.to_json())
        }
        RpcValue::Bytes(data) => match std::str::from_utf8(data) {
            // UTF-8 byte payloads travel as plain strings
            Ok(text) => envelope("argument", serde_json::Value::String(text.to_string())),
            Err(_) => {
                let index = ctx.attach(data.clone());
                serde_json::json!({ TYPE_KEY: "bytes", "__index__": index })
            }
        },
        RpcValue::NdArray(arr) => {
            let chunked: serde_json::Value = if arr.data.len() > ARRAY_CHUNK {
                let indices: Vec<serde_json::Value> = arr
                    .data
                    .chunks(ARRAY_CHUNK)
                    .map(|chunk| {
                        let index = ctx.attach(chunk.to_vec());
                        serde_json::json!({ "__index__": index })
                    })
                    .collect();
                serde_json::Value::Array(indices)
            } else {
                let index = ctx.attach(arr.data.clone());
                serde_json::json!({ "__index__": index })
            };
            serde_json::json!({
                TYPE_KEY: "ndarray",
                VALUE_KEY: chunked,
                "__shape__": arr.shape,
                "__dtype__": arr.dtype,
            })
        }
        RpcValue::List(items) => {
            serde_json::Value::Array(items.iter().map(|item| encode(item, ctx)).collect())
        }
        RpcValue::Map(map) => {
            // already-encoded envelopes pass through unchanged
            if is_envelope(map) {
                return value.to_json();
            }
            if map.get(TYPE_KEY).and_then(RpcValue::as_str) == Some("plugin_api") {
                if let Some(plugin_id) = map.get("__id__").and_then(RpcValue::as_str) {
                    return encode_plugin_api(plugin_id, map, ctx);
                }
            }
            // an `_rintf` bundle keeps its callables alive until disposed
            let shared_before = ctx.shared_callbacks;
            if matches!(map.get("_rintf"), Some(RpcValue::Bool(true))) {
                ctx.shared_callbacks = true;
            }
            let mut out = serde_json::Map::new();
            for (key, nested) in map {
                out.insert(key.clone(), encode(nested, ctx));
            }
            ctx.shared_callbacks = shared_before;
            serde_json::Value::Object(out)
        }
        RpcValue::Callable(callable) => {
            if let Some(name) = ctx
                .interface
                .and_then(|interface| interface.find_name(callable))
            {
                envelope("interface", serde_json::Value::String(name))
            } else {
                let id = ctx.park(callable.clone());
                serde_json::json!({ TYPE_KEY: "callback", VALUE_KEY: "f", "num": id })
            }
        }
        RpcValue::Fault(message) => envelope("error", serde_json::Value::String(message.clone())),
    }
}

fn encode_plugin_api(
    plugin_id: &str,
    map: &BTreeMap<String, RpcValue>,
    ctx: &mut EncodeContext<'_>,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    let mut slots = BTreeMap::new();
    for (key, nested) in map {
        if let RpcValue::Callable(callable) = nested {
            out.insert(
                key.clone(),
                serde_json::json!({
                    TYPE_KEY: "plugin_interface",
                    "__plugin_id__": plugin_id,
                    VALUE_KEY: key,
                    "num": serde_json::Value::Null,
                }),
            );
            slots.insert(key.clone(), callable.clone());
        }
    }
    ctx.plugin_interfaces.push((plugin_id.to_string(), slots));
    serde_json::Value::Object(out)
}

/// State for one decode pass.
pub struct DecodeContext<'a> {
    /// Factory for remote proxies.
    pub proxies: &'a dyn ProxyFactory,
    /// Binary payloads received alongside the frame.
    pub attachments: &'a [Vec<u8>],
    /// Whether decoded callback proxies await replies. Promise pairs are
    /// decoded without replies.
    pub with_reply: bool,
}

impl<'a> DecodeContext<'a> {
    /// Creates a decode context whose callback proxies await replies.
    pub fn new(proxies: &'a dyn ProxyFactory, attachments: &'a [Vec<u8>]) -> Self {
        Self {
            proxies,
            attachments,
            with_reply: true,
        }
    }

    /// Decodes callback proxies as fire-and-forget.
    pub fn without_reply(mut self) -> Self {
        self.with_reply = false;
        self
    }

    fn attachment(&self, value: &serde_json::Value) -> Result<Vec<u8>> {
        let index = value
            .get("__index__")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| Error::BadRequest("missing attachment index".into()))?;
        self.attachments
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::BadRequest(format!("missing attachment {index}")))
    }
}

/// Decodes a wire value into the local tree, synthesizing proxies for
/// callable envelopes.
pub fn decode(value: &serde_json::Value, ctx: &DecodeContext<'_>) -> Result<RpcValue> {
    match value {
        serde_json::Value::Object(map) if map.contains_key(TYPE_KEY) => {
            decode_envelope(map, ctx)
        }
        serde_json::Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, nested) in map {
                out.insert(key.clone(), decode(nested, ctx)?);
            }
            Ok(RpcValue::Map(out))
        }
        serde_json::Value::Array(items) => Ok(RpcValue::List(
            items
                .iter()
                .map(|item| decode(item, ctx))
                .collect::<Result<Vec<_>>>()?,
        )),
        scalar => Ok(RpcValue::from_json(scalar)),
    }
}

fn decode_envelope(
    map: &serde_json::Map<String, serde_json::Value>,
    ctx: &DecodeContext<'_>,
) -> Result<RpcValue> {
    let kind = map
        .get(TYPE_KEY)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default();
    let inner = map.get(VALUE_KEY).unwrap_or(&serde_json::Value::Null);
    match kind {
        "argument" => Ok(RpcValue::from_json(inner)),
        "error" => Ok(RpcValue::Fault(
            inner.as_str().unwrap_or("remote error").to_string(),
        )),
        "interface" => {
            let name = inner
                .as_str()
                .ok_or_else(|| Error::BadRequest("interface envelope without name".into()))?;
            Ok(RpcValue::Callable(ctx.proxies.remote_method(name, None)))
        }
        "plugin_interface" => {
            let name = inner
                .as_str()
                .ok_or_else(|| Error::BadRequest("plugin interface without name".into()))?;
            let plugin_id = map
                .get("__plugin_id__")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::BadRequest("plugin interface without plugin id".into()))?;
            Ok(RpcValue::Callable(
                ctx.proxies.remote_method(name, Some(plugin_id)),
            ))
        }
        "callback" => {
            let id = map
                .get("num")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| Error::BadRequest("callback envelope without id".into()))?;
            Ok(RpcValue::Callable(
                ctx.proxies.remote_callback(id, ctx.with_reply),
            ))
        }
        "ndarray" => {
            let data = match inner {
                serde_json::Value::Array(chunks) => {
                    let mut data = Vec::new();
                    for chunk in chunks {
                        data.extend(ctx.attachment(chunk)?);
                    }
                    data
                }
                single => ctx.attachment(single)?,
            };
            let shape: Vec<usize> = map
                .get("__shape__")
                .and_then(|s| serde_json::from_value(s.clone()).ok())
                .unwrap_or_default();
            let dtype = map
                .get("__dtype__")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("uint8")
                .to_string();
            Ok(RpcValue::NdArray(NdArray { data, shape, dtype }))
        }
        "bytes" => Ok(RpcValue::Bytes(
            ctx.attachment(&serde_json::Value::Object(map.clone()))?,
        )),
        other => {
            tracing::debug!(kind = %other, "Unknown envelope type, passing value through");
            Ok(RpcValue::from_json(inner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoProxies;

    impl ProxyFactory for NoProxies {
        fn remote_method(&self, name: &str, _plugin_id: Option<&str>) -> Callable {
            Callable::named(name, |_| Box::pin(async { Ok(RpcValue::Null) }))
        }

        fn remote_callback(&self, id: u64, _with_reply: bool) -> Callable {
            Callable::named(format!("callback-{id}"), |_| {
                Box::pin(async { Ok(RpcValue::Null) })
            })
        }
    }

    fn round_trip(value: &RpcValue) -> RpcValue {
        let store = ReferenceStore::new();
        let mut enc = EncodeContext::new(&store);
        let wire = encode(value, &mut enc);
        let dec = DecodeContext::new(&NoProxies, &enc.attachments);
        decode(&wire, &dec).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        let tree = RpcValue::map([
            ("s", RpcValue::from("hello")),
            ("i", RpcValue::Int(-3)),
            ("f", RpcValue::Float(2.5)),
            ("b", RpcValue::Bool(true)),
            (
                "list",
                RpcValue::List(vec![RpcValue::Int(1), RpcValue::from("two")]),
            ),
        ]);
        assert_eq!(round_trip(&tree), tree);
    }

    #[test]
    fn non_utf8_bytes_are_preserved() {
        let value = RpcValue::Bytes(vec![0xff, 0xfe, 0x00, 0x41]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn utf8_bytes_become_strings() {
        let value = RpcValue::Bytes(b"plain text".to_vec());
        assert_eq!(round_trip(&value), RpcValue::from("plain text"));
    }

    #[test]
    fn ndarray_round_trips() {
        let value = RpcValue::NdArray(NdArray {
            data: (0..=255u8).cycle().take(3000).collect(),
            shape: vec![30, 100],
            dtype: "uint8".into(),
        });
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn ndarray_chunk_boundary() {
        let store = ReferenceStore::new();
        let exact = RpcValue::NdArray(NdArray {
            data: vec![7u8; ARRAY_CHUNK],
            shape: vec![ARRAY_CHUNK],
            dtype: "uint8".into(),
        });
        let mut ctx = EncodeContext::new(&store);
        encode(&exact, &mut ctx);
        assert_eq!(ctx.attachments.len(), 1);

        let over = RpcValue::NdArray(NdArray {
            data: vec![7u8; ARRAY_CHUNK + 1],
            shape: vec![ARRAY_CHUNK + 1],
            dtype: "uint8".into(),
        });
        let mut ctx = EncodeContext::new(&store);
        encode(&over, &mut ctx);
        assert_eq!(ctx.attachments.len(), 2);
        assert_eq!(ctx.attachments[1].len(), 1);
        assert_eq!(round_trip(&over), over);
    }

    #[test]
    fn anonymous_callable_becomes_callback_envelope() {
        let store = ReferenceStore::new();
        let mut ctx = EncodeContext::new(&store);
        let value = RpcValue::Callable(Callable::new(|_| Box::pin(async { Ok(RpcValue::Null) })));
        let wire = encode(&value, &mut ctx);
        assert_eq!(wire[TYPE_KEY], "callback");
        assert_eq!(wire["num"], 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn exported_callable_becomes_interface_envelope() {
        let store = ReferenceStore::new();
        let callable = Callable::named("echo", |args| {
            Box::pin(async move { Ok(args.into_iter().next().unwrap_or_default()) })
        });
        let mut interface = LocalInterface::new();
        interface.register_fn("echo", callable.clone());
        let mut ctx = EncodeContext::new(&store).with_interface(&interface);
        let wire = encode(&RpcValue::Callable(callable), &mut ctx);
        assert_eq!(wire[TYPE_KEY], "interface");
        assert_eq!(wire[VALUE_KEY], "echo");
        assert!(store.is_empty());
    }

    #[test]
    fn already_encoded_envelopes_pass_through() {
        let store = ReferenceStore::new();
        let mut ctx = EncodeContext::new(&store);
        let pre = RpcValue::map([
            ("__jailed_type__", RpcValue::from("argument")),
            ("__value__", RpcValue::Int(42)),
        ]);
        let wire = encode(&pre, &mut ctx);
        assert_eq!(wire[TYPE_KEY], "argument");
        assert_eq!(wire[VALUE_KEY], 42);
    }

    #[test]
    fn plugin_api_slots_are_tagged_with_plugin_id() {
        let store = ReferenceStore::new();
        let mut ctx = EncodeContext::new(&store);
        let api = RpcValue::map([
            ("__jailed_type__", RpcValue::from("plugin_api")),
            ("__id__", RpcValue::from("plugin-7")),
            (
                "setup",
                RpcValue::Callable(Callable::new(|_| Box::pin(async { Ok(RpcValue::Null) }))),
            ),
        ]);
        let wire = encode(&api, &mut ctx);
        assert_eq!(wire["setup"][TYPE_KEY], "plugin_interface");
        assert_eq!(wire["setup"]["__plugin_id__"], "plugin-7");
        assert_eq!(ctx.plugin_interfaces.len(), 1);
        assert_eq!(ctx.plugin_interfaces[0].0, "plugin-7");
    }
}
