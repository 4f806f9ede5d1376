//! The broker's own exported interface.
//!
//! Every plugin peer receives this interface during the handshake; each
//! function is a trampoline around a registry or auth operation with the
//! plugin's [`CallContext`] baked in. Workspace views returned by
//! `get_workspace` carry the same operations re-bound to the target
//! workspace.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tracing::{error, info};

use gantry_auth::TokenConfig;
use gantry_core::{
    CallContext, Error, Event, LogRecord, Result, RpcValue, ServiceQuery, ServiceSpec,
    WorkspaceInfo,
};
use gantry_rpc::LocalInterface;

use crate::engine::Engine;

/// Builds the per-plugin exported interface.
pub fn workspace_api(engine: &Arc<Engine>, ctx: CallContext) -> LocalInterface {
    let mut interface = LocalInterface::new();
    let weak = Arc::downgrade(engine);

    interface.register_fn("log", log_fn(&ctx, "info"));
    interface.register_fn("error", log_fn(&ctx, "error"));
    interface.register_fn("register_service", register_service_fn(&weak, &ctx));
    interface.register_fn("registerService", register_service_fn(&weak, &ctx));
    interface.register_fn("list_services", list_services_fn(&weak, &ctx));
    interface.register_fn("listServices", list_services_fn(&weak, &ctx));
    interface.register_fn("get_service", get_service_fn(&weak, &ctx));
    interface.register_fn("getService", get_service_fn(&weak, &ctx));
    interface.register_fn("list_plugins", list_plugins_fn(&ctx));
    interface.register_fn("listPlugins", list_plugins_fn(&ctx));
    interface.register_fn("get_plugin", get_plugin_fn(&weak, &ctx));
    interface.register_fn("getPlugin", get_plugin_fn(&weak, &ctx));
    interface.register_fn("generate_token", generate_token_fn(&weak, &ctx));
    interface.register_fn("generateToken", generate_token_fn(&weak, &ctx));
    interface.register_fn("create_workspace", create_workspace_fn(&weak, &ctx));
    interface.register_fn("createWorkspace", create_workspace_fn(&weak, &ctx));
    interface.register_fn("get_workspace", get_workspace_fn(&weak, &ctx));
    interface.register_fn("getWorkspace", get_workspace_fn(&weak, &ctx));
    interface.register_fn("generate_credential", generate_credential_fn(&weak, &ctx));
    interface.register_fn("generate_presigned_url", presigned_url_fn(&weak, &ctx));
    interface.register_fn("disconnect", disconnect_fn(&weak, &ctx));
    interface
}

fn engine_of(weak: &Weak<Engine>) -> Result<Arc<Engine>> {
    weak.upgrade()
        .ok_or_else(|| Error::Internal("engine is shutting down".into()))
}

type Trampoline = gantry_core::Callable;

fn log_fn(ctx: &CallContext, kind: &'static str) -> Trampoline {
    let ctx = ctx.clone();
    gantry_core::Callable::named(kind, move |args| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let message = args
                .first()
                .and_then(RpcValue::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(plugin) = &ctx.plugin {
                if kind == "error" {
                    error!(plugin = %plugin.name, workspace = %ctx.workspace.name(), "{message}");
                } else {
                    info!(plugin = %plugin.name, workspace = %ctx.workspace.name(), "{message}");
                }
                plugin.push_log(LogRecord {
                    kind: kind.to_string(),
                    value: serde_json::Value::String(message),
                });
            }
            Ok(RpcValue::Null)
        })
    })
}

fn register_service_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("register_service", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let service = args
                .first()
                .ok_or_else(|| Error::BadRequest("register_service expects a service".into()))?;
            let spec = ServiceSpec::from_value(service)?;
            let id = engine.registry.register_service(&ctx, spec)?;
            Ok(RpcValue::String(id))
        })
    })
}

fn query_from_args(args: &[RpcValue]) -> ServiceQuery {
    let Some(map) = args.first().and_then(RpcValue::as_map) else {
        return ServiceQuery {
            workspace: Some("*".into()),
            filters: BTreeMap::new(),
        };
    };
    let mut query = ServiceQuery::default();
    for (key, value) in map {
        if key == "workspace" {
            query.workspace = value.as_str().map(String::from);
        } else {
            query.filters.insert(key.clone(), value.to_json());
        }
    }
    query
}

fn list_services_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("list_services", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let query = query_from_args(&args);
            let services = engine.registry.list_services(&ctx, &query)?;
            Ok(RpcValue::from_json(&serde_json::Value::Array(services)))
        })
    })
}

fn get_service_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("get_service", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let service_id = match args.first() {
                Some(RpcValue::String(id)) => id.clone(),
                Some(value) => value
                    .get("id")
                    .and_then(RpcValue::as_str)
                    .ok_or_else(|| Error::BadRequest("get_service expects a service id".into()))?
                    .to_string(),
                None => return Err(Error::BadRequest("get_service expects a service id".into())),
            };
            let service_id = if service_id.contains('/') {
                service_id
            } else {
                return Err(Error::BadRequest(
                    "invalid service id, expected <workspace>/<name>".into(),
                ));
            };
            let service = engine.registry.get_service(&ctx, &service_id)?;
            let mut body = match &service.body {
                RpcValue::Map(map) => map.clone(),
                other => {
                    let mut map = BTreeMap::new();
                    map.insert("value".to_string(), other.clone());
                    map
                }
            };
            body.insert(
                "config".to_string(),
                RpcValue::from_json(
                    &serde_json::to_value(&service.config).unwrap_or(serde_json::Value::Null),
                ),
            );
            // keep the service's callables alive across many invocations
            body.insert("_rintf".to_string(), RpcValue::Bool(true));
            Ok(RpcValue::Map(body))
        })
    })
}

fn list_plugins_fn(ctx: &CallContext) -> Trampoline {
    let ctx = ctx.clone();
    gantry_core::Callable::named("list_plugins", move |_| {
        let ctx = ctx.clone();
        Box::pin(async move {
            Ok(RpcValue::List(
                ctx.workspace
                    .plugin_names()
                    .into_iter()
                    .map(RpcValue::String)
                    .collect(),
            ))
        })
    })
}

fn get_plugin_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("get_plugin", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let name = args
                .first()
                .and_then(RpcValue::as_str)
                .ok_or_else(|| Error::BadRequest("get_plugin expects a plugin name".into()))?;
            let plugin = ctx
                .workspace
                .get_plugin(name)
                .ok_or_else(|| Error::NotFound(format!("plugin {name}")))?;
            let api = engine.plugin_api(&plugin.id).await?;
            Ok(api)
        })
    })
}

fn generate_token_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("generate_token", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let workspace = ctx.workspace.name().to_string();
            let mut config = TokenConfig {
                scopes: vec![workspace.clone()],
                expires_in: None,
                email: None,
            };
            if let Some(map) = args.first().and_then(RpcValue::as_map) {
                if let Some(scopes) = map.get("scopes").and_then(RpcValue::as_list) {
                    let requested: Vec<String> = scopes
                        .iter()
                        .filter_map(|s| s.as_str().map(String::from))
                        .collect();
                    if requested != vec![workspace.clone()] {
                        return Err(Error::Forbidden(
                            "scopes must be empty or contain only the workspace name".into(),
                        ));
                    }
                }
                config.expires_in = map
                    .get("expires_in")
                    .and_then(RpcValue::as_int)
                    .map(|v| v as u64);
                config.email = map
                    .get("email")
                    .and_then(RpcValue::as_str)
                    .map(String::from);
            }
            // token scopes are always pinned to the current workspace
            let mut user = ctx.user();
            if !user.scopes.iter().any(|s| s == &workspace) {
                user.scopes.push(workspace.clone());
            }
            let token = engine.auth.generate_presigned_token(&user, &config)?;
            Ok(RpcValue::String(token))
        })
    })
}

fn create_workspace_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("create_workspace", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let config = args
                .first()
                .ok_or_else(|| Error::BadRequest("create_workspace expects a config".into()))?;
            let info: WorkspaceInfo = serde_json::from_value(config.to_json())
                .map_err(|e| Error::BadRequest(format!("invalid workspace config: {e}")))?;
            let workspace = engine.registry.create_workspace(&ctx, info)?;
            let bound = ctx.for_workspace(Arc::clone(&workspace));
            Ok(workspace_view(&engine, bound))
        })
    })
}

fn get_workspace_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("get_workspace", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let name = args
                .first()
                .and_then(RpcValue::as_str)
                .ok_or_else(|| Error::BadRequest("get_workspace expects a name".into()))?;
            let workspace = engine
                .registry
                .get_workspace(name)
                .ok_or_else(|| Error::NotFound(format!("workspace {name}")))?;
            let user = ctx.user();
            if !workspace.check_permission(&user) {
                return Err(Error::Forbidden(format!("workspace {name}")));
            }
            engine.bus.emit(&Event::UserEnteredWorkspace {
                user: Arc::new(user),
                workspace: name.to_string(),
            });
            let bound = ctx.for_workspace(Arc::clone(&workspace));
            Ok(workspace_view(&engine, bound))
        })
    })
}

fn generate_credential_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("generate_credential", move |_| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let credential = engine.objectstore.generate_credential(&ctx).await?;
            Ok(RpcValue::from_json(
                &serde_json::to_value(&credential).unwrap_or(serde_json::Value::Null),
            ))
        })
    })
}

fn presigned_url_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("generate_presigned_url", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let map = args
                .first()
                .and_then(RpcValue::as_map)
                .ok_or_else(|| Error::BadRequest("generate_presigned_url expects options".into()))?;
            let bucket = map
                .get("bucket")
                .and_then(RpcValue::as_str)
                .unwrap_or("gantry");
            let object = map
                .get("object")
                .and_then(RpcValue::as_str)
                .ok_or_else(|| Error::BadRequest("an object name is required".into()))?;
            let method = map
                .get("method")
                .and_then(RpcValue::as_str)
                .unwrap_or("get_object");
            let expires = map
                .get("expires")
                .and_then(RpcValue::as_int)
                .unwrap_or(3600) as u64;
            let url = engine
                .objectstore
                .generate_presigned_url(&ctx, bucket, object, method, expires)
                .await?;
            Ok(RpcValue::String(url))
        })
    })
}

fn disconnect_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("disconnect", move |_| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            if let Some(plugin) = &ctx.plugin {
                let engine = Arc::clone(&engine);
                let plugin_id = plugin.id.clone();
                // detach: the peer asked for its own teardown
                tokio::spawn(async move {
                    let _ = engine.kill_plugin(&plugin_id).await;
                });
            }
            Ok(RpcValue::Null)
        })
    })
}

fn update_workspace_fn(weak: &Weak<Engine>, ctx: &CallContext) -> Trampoline {
    let weak = weak.clone();
    let ctx = ctx.clone();
    gantry_core::Callable::named("set", move |args| {
        let weak = weak.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            let engine = engine_of(&weak)?;
            let patch = args
                .first()
                .and_then(RpcValue::as_map)
                .ok_or_else(|| Error::BadRequest("set expects a config patch".into()))?;
            let json_patch: serde_json::Map<String, serde_json::Value> = patch
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            engine
                .registry
                .update_workspace(&ctx, ctx.workspace.name(), &json_patch)?;
            Ok(RpcValue::Null)
        })
    })
}

/// A bound workspace view: the same operations re-bound to `ctx`'s
/// workspace, plus `set` and a `config` block.
pub fn workspace_view(engine: &Arc<Engine>, ctx: CallContext) -> RpcValue {
    let weak = Arc::downgrade(engine);
    let mut map = BTreeMap::new();
    map.insert(
        "register_service".to_string(),
        RpcValue::Callable(register_service_fn(&weak, &ctx)),
    );
    map.insert(
        "list_services".to_string(),
        RpcValue::Callable(list_services_fn(&weak, &ctx)),
    );
    map.insert(
        "get_service".to_string(),
        RpcValue::Callable(get_service_fn(&weak, &ctx)),
    );
    map.insert(
        "list_plugins".to_string(),
        RpcValue::Callable(list_plugins_fn(&ctx)),
    );
    map.insert(
        "get_plugin".to_string(),
        RpcValue::Callable(get_plugin_fn(&weak, &ctx)),
    );
    map.insert(
        "generate_token".to_string(),
        RpcValue::Callable(generate_token_fn(&weak, &ctx)),
    );
    map.insert(
        "set".to_string(),
        RpcValue::Callable(update_workspace_fn(&weak, &ctx)),
    );
    map.insert(
        "config".to_string(),
        RpcValue::map([(
            "workspace",
            RpcValue::from(ctx.workspace.name().to_string()),
        )]),
    );
    map.insert("_rintf".to_string(), RpcValue::Bool(true));
    RpcValue::Map(map)
}
