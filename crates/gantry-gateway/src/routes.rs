//! Service introspection and invocation routes.
//!
//! | Path | Verb | Behaviour |
//! |---|---|---|
//! | `/services` | GET | List services visible to the caller. |
//! | `/{workspace}/services` | GET | List one workspace. |
//! | `/{workspace}/services/{service}` | GET | Introspect one service. |
//! | `/{workspace}/services/{service}/{keys}` | GET/POST | Invoke a function or read a nested value. |
//!
//! `keys` is a dotted path resolved against the service body; callables
//! are invoked with query-string (GET) or body (POST) keyword arguments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{debug, error};

use gantry_auth::Auth;
use gantry_core::{
    CallContext, Error, PUBLIC_WORKSPACE, Registry, Result, RpcValue, ServiceQuery, UserInfo,
};

use crate::asgi;
use crate::content::{BodyFormat, normalize};

/// Shared gateway state.
pub struct GatewayState {
    /// The registry services are looked up in.
    pub registry: Arc<Registry>,
    /// Token validation.
    pub auth: Arc<Auth>,
}

/// Builds the gateway router.
pub fn gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/services", get(list_all_services))
        .route("/{workspace}/services", get(list_workspace_services))
        .route("/{workspace}/services/{service}", get(service_info))
        .route(
            "/{workspace}/services/{service}/{keys}",
            get(call_service).post(call_service),
        )
        .route("/{workspace}/app/{app}", axum::routing::any(asgi::serve_app))
        .route(
            "/{workspace}/app/{app}/{*path}",
            axum::routing::any(asgi::serve_app),
        )
        .with_state(state)
}

/// Resolves the caller into a registry context; missing bearer yields an
/// anonymous caller restricted to public services.
pub async fn caller_context(
    state: &GatewayState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<CallContext> {
    let user = match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(authorization) => state
            .auth
            .valid_token(authorization, Some(query))
            .await
            .map_err(gantry_core::Error::from)?,
        None => UserInfo::anonymous(),
    };
    let workspace = state
        .registry
        .get_workspace(PUBLIC_WORKSPACE)
        .ok_or_else(|| Error::Internal("public workspace missing".into()))?;
    Ok(CallContext::new(user, workspace))
}

/// Maps an error to an HTTP response, hiding internals from anonymous
/// callers.
pub fn error_response(error: &Error, anonymous: bool) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let detail = if anonymous && matches!(error, Error::Internal(_)) {
        error!(error = %error, "Internal gateway error");
        "internal error".to_string()
    } else {
        error.to_string()
    };
    BodyFormat::Json.respond(
        status,
        &serde_json::json!({ "success": false, "detail": detail }),
    )
}

async fn list_all_services(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ctx = match caller_context(&state, &headers, &query).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e, true),
    };
    let service_query = ServiceQuery {
        workspace: Some("*".into()),
        filters: BTreeMap::new(),
    };
    match state.registry.list_services(&ctx, &service_query) {
        Ok(services) => {
            BodyFormat::Json.respond(StatusCode::OK, &serde_json::Value::Array(services))
        }
        Err(e) => error_response(&e, ctx.user().is_anonymous),
    }
}

async fn list_workspace_services(
    State(state): State<Arc<GatewayState>>,
    Path(workspace): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ctx = match caller_context(&state, &headers, &query).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e, true),
    };
    let service_query = ServiceQuery {
        workspace: Some(workspace),
        filters: BTreeMap::new(),
    };
    match state.registry.list_services(&ctx, &service_query) {
        Ok(services) => {
            BodyFormat::Json.respond(StatusCode::OK, &serde_json::Value::Array(services))
        }
        Err(e) => error_response(&e, ctx.user().is_anonymous),
    }
}

async fn service_info(
    State(state): State<Arc<GatewayState>>,
    Path((workspace, service)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ctx = match caller_context(&state, &headers, &query).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e, true),
    };
    match state.registry.get_service(&ctx, &format!("{workspace}/{service}")) {
        Ok(service) => BodyFormat::Json.respond(StatusCode::OK, &service.summary()),
        Err(e) => error_response(&e, ctx.user().is_anonymous),
    }
}

async fn call_service(
    State(state): State<Arc<GatewayState>>,
    Path((workspace, service, keys)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match caller_context(&state, &headers, &query).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e, true),
    };
    let anonymous = ctx.user().is_anonymous;

    let service = match state
        .registry
        .get_service(&ctx, &format!("{workspace}/{service}"))
    {
        Ok(service) => service,
        Err(e) => return error_response(&e, anonymous),
    };

    let Some(value) = service.body.lookup_path(&keys) else {
        return BodyFormat::Json.respond(
            StatusCode::OK,
            &serde_json::json!({ "success": false, "detail": format!("{keys} not found.") }),
        );
    };

    let Some(callable) = value.as_callable() else {
        return BodyFormat::Json.respond(StatusCode::OK, &value.to_json());
    };

    // responses mirror the request content type; GET is always JSON
    let format = match method {
        Method::GET => BodyFormat::Json,
        Method::POST => match BodyFormat::from_headers(&headers) {
            Ok(format) => format,
            Err(e) => return error_response(&e, anonymous),
        },
        _ => {
            return error_response(
                &Error::BadRequest(format!("invalid request method: {method}")),
                anonymous,
            );
        }
    };

    let mut kwargs: BTreeMap<String, RpcValue> = match method {
        Method::GET => query
            .iter()
            .map(|(key, raw)| (key.clone(), normalize(raw)))
            .collect(),
        _ => {
            let parsed = match format.parse(&body) {
                Ok(parsed) => parsed,
                Err(e) => return error_response(&e, anonymous),
            };
            match RpcValue::from_json(&parsed) {
                RpcValue::Map(map) => map,
                _ => {
                    return error_response(
                        &Error::BadRequest("request body must be an object".into()),
                        anonymous,
                    );
                }
            }
        }
    };
    if service.config.require_context {
        let user = ctx.user();
        kwargs.insert(
            "context".into(),
            RpcValue::map([
                ("user_id", RpcValue::from(user.id.clone())),
                ("workspace", RpcValue::from(service.config.workspace.clone())),
            ]),
        );
    }

    debug!(service = %service.config.id, keys = %keys, "Invoking service function");
    match callable.call(vec![RpcValue::Map(kwargs)]).await {
        Ok(result) => format.respond(StatusCode::OK, &result.to_json()),
        Err(e) => error_response(&e, anonymous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_auth::AuthConfig;
    use gantry_core::{
        Callable, EventBus, Plugin, PluginFlags, ServiceSpec, Visibility, WorkspaceInfo,
    };

    fn test_state() -> Arc<GatewayState> {
        let registry = Arc::new(Registry::new(Arc::new(EventBus::new())));
        let auth = Arc::new(Auth::new(AuthConfig {
            domain: "test.example.com".into(),
            audience: "https://test.example.com/api/".into(),
            jwt_secret: Some("gateway-test-secret".into()),
        }));
        Arc::new(GatewayState { registry, auth })
    }

    fn register_echo(state: &GatewayState, visibility: Visibility) {
        state
            .registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let workspace = state.registry.get_workspace("lab").unwrap();
        let plugin = Arc::new(Plugin::new(
            "p1",
            "worker",
            "native",
            "lab",
            "alice",
            "secret",
            "session-1",
            PluginFlags::default(),
            serde_json::json!({}),
        ));
        workspace.add_plugin(Arc::clone(&plugin));
        let ctx = CallContext::new(
            UserInfo {
                id: "alice".into(),
                email: None,
                roles: Vec::new(),
                parent: None,
                scopes: Vec::new(),
                expires_at: None,
                is_anonymous: false,
            },
            Arc::clone(&workspace),
        )
        .with_plugin(plugin);
        let echo = Callable::named("echo", |args| {
            Box::pin(async move {
                let kwargs = args.into_iter().next().unwrap_or_default();
                Ok(kwargs.get("v").cloned().unwrap_or(RpcValue::Null))
            })
        });
        state
            .registry
            .register_service(
                &ctx,
                ServiceSpec {
                    name: "echo".into(),
                    kind: "echo".into(),
                    visibility,
                    require_context: false,
                    body: RpcValue::map([
                        ("name", RpcValue::from("echo")),
                        ("type", RpcValue::from("echo")),
                        ("echo", RpcValue::Callable(echo)),
                    ]),
                },
            )
            .unwrap();
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        use tower_service_call::call_router;
        call_router(router, uri).await
    }

    // minimal in-process request driver over the axum router
    mod tower_service_call {
        use super::*;
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt as _;

        pub async fn call_router(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
            let response = router
                .oneshot(
                    Request::builder()
                        .uri(uri)
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
                .await
                .expect("body");
            let value = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn anonymous_call_to_public_service_succeeds() {
        let state = test_state();
        register_echo(&state, Visibility::Public);
        let router = gateway_router(Arc::clone(&state));
        let (status, body) = get(router.clone(), "/lab/services/echo/echo?v=hi").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!("hi"));

        let (status, listing) = get(router, "/services").await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            listing
                .as_array()
                .unwrap()
                .iter()
                .any(|c| c["id"] == "lab/echo")
        );
    }

    #[tokio::test]
    async fn anonymous_call_to_protected_service_is_forbidden() {
        let state = test_state();
        register_echo(&state, Visibility::Protected);
        let router = gateway_router(state);
        let (status, body) = get(router, "/lab/services/echo/echo?v=hi").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn nested_key_reads_a_plain_value() {
        let state = test_state();
        register_echo(&state, Visibility::Public);
        let router = gateway_router(state);
        let (status, body) = get(router, "/lab/services/echo/name").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!("echo"));
    }

    #[tokio::test]
    async fn missing_key_reports_not_found_payload() {
        let state = test_state();
        register_echo(&state, Visibility::Public);
        let router = gateway_router(state);
        let (status, body) = get(router, "/lab/services/echo/nope").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn query_arguments_are_normalized() {
        let state = test_state();
        register_echo(&state, Visibility::Public);
        let router = gateway_router(state);
        let (status, body) = get(router, "/lab/services/echo/echo?v=42").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(42));
    }

    #[tokio::test]
    async fn unknown_service_is_404() {
        let state = test_state();
        let router = gateway_router(state);
        let (status, _) = get(router, "/lab/services/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
