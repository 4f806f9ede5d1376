//! Interface publication and mirroring.
//!
//! A peer exports a set of named values — callables, data slots, or maps
//! mixing both. Publication flattens the set into `[{name, data}]` entries
//! where nested callables are marked with `"**@@FUNCTION@@**:<key>"`
//! strings; the receiving side mirrors the entries as a map whose function
//! slots are remote-method proxies.

use std::collections::BTreeMap;

use gantry_core::{Callable, Error, Result, RpcValue};

use crate::frame::InterfaceEntry;

/// Marker prefix for nested function slots in published interface data.
pub const FUNCTION_MARKER: &str = "**@@FUNCTION@@**:";

/// Synthesizes remote proxies while decoding envelopes or mirroring an
/// interface.
pub trait ProxyFactory: Send + Sync {
    /// Proxy for a named interface method on the remote side; `plugin_id`
    /// targets a specific plugin for plugin-interface envelopes.
    fn remote_method(&self, name: &str, plugin_id: Option<&str>) -> Callable;

    /// Proxy for an anonymous remote callback by reference-store id.
    /// `with_reply` decides whether invoking the proxy awaits a result or
    /// fires and forgets (promise surfaces must not expect replies, or
    /// every reply would spawn a reply of its own).
    fn remote_callback(&self, id: u64, with_reply: bool) -> Callable;
}

/// The set of currently exported named values on a peer.
#[derive(Default, Debug)]
pub struct LocalInterface {
    entries: BTreeMap<String, RpcValue>,
}

impl LocalInterface {
    /// Creates an empty interface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports a value under a name, replacing any previous export.
    pub fn register(&mut self, name: impl Into<String>, value: RpcValue) {
        self.entries.insert(name.into(), value);
    }

    /// Exports a callable under a name.
    pub fn register_fn(&mut self, name: impl Into<String>, callable: Callable) {
        self.register(name, RpcValue::Callable(callable));
    }

    /// Removes an export.
    pub fn unregister(&mut self, name: &str) -> Option<RpcValue> {
        self.entries.remove(name)
    }

    /// Resolves an exported value; dotted names address nested map slots.
    pub fn get(&self, name: &str) -> Option<&RpcValue> {
        match name.split_once('.') {
            Some((head, rest)) => self.entries.get(head)?.lookup_path(rest),
            None => self.entries.get(name),
        }
    }

    /// Resolves a callable export, failing for unknown or non-callable
    /// names.
    pub fn get_callable(&self, name: &str) -> Result<Callable> {
        match self.get(name) {
            Some(RpcValue::Callable(c)) => Ok(c.clone()),
            Some(_) => Err(Error::BadRequest(format!("{name} is not callable"))),
            None => Err(Error::NotFound(format!("method {name} is not found"))),
        }
    }

    /// Finds the exported name of a callable (dotted for nested slots).
    /// Used by the encoder to emit `interface` envelopes instead of
    /// one-shot callbacks for stable methods.
    pub fn find_name(&self, callable: &Callable) -> Option<String> {
        for (name, value) in &self.entries {
            match value {
                RpcValue::Callable(c) if c.ptr_eq(callable) => return Some(name.clone()),
                RpcValue::Map(map) => {
                    for (key, nested) in map {
                        if let RpcValue::Callable(c) = nested
                            && c.ptr_eq(callable)
                        {
                            return Some(format!("{name}.{key}"));
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Flattens the exports into publishable entries.
    pub fn publish(&self) -> Vec<InterfaceEntry> {
        let mut out = Vec::new();
        for (name, value) in &self.entries {
            match value {
                RpcValue::Callable(_) => out.push(InterfaceEntry {
                    name: name.clone(),
                    data: None,
                }),
                RpcValue::Map(map) => {
                    let mut data = serde_json::Map::new();
                    for (key, nested) in map {
                        match nested {
                            RpcValue::Callable(_) => {
                                data.insert(
                                    key.clone(),
                                    serde_json::Value::String(format!(
                                        "{FUNCTION_MARKER}{key}"
                                    )),
                                );
                            }
                            other => {
                                data.insert(key.clone(), other.to_json());
                            }
                        }
                    }
                    out.push(InterfaceEntry {
                        name: name.clone(),
                        data: Some(serde_json::Value::Object(data)),
                    });
                }
                RpcValue::String(_) | RpcValue::Int(_) | RpcValue::Float(_)
                | RpcValue::Bool(_) => out.push(InterfaceEntry {
                    name: name.clone(),
                    data: Some(value.to_json()),
                }),
                // other value shapes are not publishable
                _ => {}
            }
        }
        out
    }

    /// Number of exports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is exported.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exported names.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Mirrors published entries as a local map with remote-method proxies in
/// the function slots.
pub fn build_remote(entries: &[InterfaceEntry], proxies: &dyn ProxyFactory) -> RpcValue {
    let mut out = BTreeMap::new();
    for entry in entries {
        let value = match &entry.data {
            None => RpcValue::Callable(proxies.remote_method(&entry.name, None)),
            Some(serde_json::Value::Object(data)) => {
                let mut map = BTreeMap::new();
                for (key, nested) in data {
                    let marker = format!("{FUNCTION_MARKER}{key}");
                    if nested.as_str() == Some(marker.as_str()) {
                        map.insert(
                            key.clone(),
                            RpcValue::Callable(
                                proxies.remote_method(&format!("{}.{key}", entry.name), None),
                            ),
                        );
                    } else {
                        map.insert(key.clone(), RpcValue::from_json(nested));
                    }
                }
                RpcValue::Map(map)
            }
            Some(other) => RpcValue::from_json(other),
        };
        out.insert(entry.name.clone(), value);
    }
    RpcValue::Map(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Callable {
        Callable::named(name, |_| Box::pin(async { Ok(RpcValue::Null) }))
    }

    struct RecordingFactory;

    impl ProxyFactory for RecordingFactory {
        fn remote_method(&self, name: &str, _plugin_id: Option<&str>) -> Callable {
            noop(name)
        }

        fn remote_callback(&self, id: u64, _with_reply: bool) -> Callable {
            noop(&format!("callback-{id}"))
        }
    }

    #[test]
    fn publish_marks_nested_functions() {
        let mut interface = LocalInterface::new();
        interface.register_fn("run", noop("run"));
        interface.register(
            "utils",
            RpcValue::map([
                ("double", RpcValue::Callable(noop("double"))),
                ("version", RpcValue::from("1.0")),
            ]),
        );
        let entries = interface.publish();
        assert_eq!(entries.len(), 2);
        let utils = entries.iter().find(|e| e.name == "utils").unwrap();
        let data = utils.data.as_ref().unwrap();
        assert_eq!(data["double"], serde_json::json!("**@@FUNCTION@@**:double"));
        assert_eq!(data["version"], serde_json::json!("1.0"));
    }

    #[test]
    fn mirror_turns_markers_into_proxies() {
        let entries = vec![
            InterfaceEntry {
                name: "run".into(),
                data: None,
            },
            InterfaceEntry {
                name: "utils".into(),
                data: Some(serde_json::json!({
                    "double": "**@@FUNCTION@@**:double",
                    "version": "1.0",
                })),
            },
        ];
        let remote = build_remote(&entries, &RecordingFactory);
        assert!(remote.get("run").unwrap().as_callable().is_some());
        assert!(remote.lookup_path("utils.double").unwrap().as_callable().is_some());
        assert_eq!(
            remote.lookup_path("utils.version"),
            Some(&RpcValue::from("1.0"))
        );
    }

    #[test]
    fn dotted_lookup_reaches_nested_slots() {
        let mut interface = LocalInterface::new();
        let double = noop("double");
        interface.register(
            "utils",
            RpcValue::map([("double", RpcValue::Callable(double.clone()))]),
        );
        assert!(interface.get_callable("utils.double").is_ok());
        assert_eq!(interface.find_name(&double), Some("utils.double".into()));
        assert!(interface.get_callable("missing").is_err());
    }
}
