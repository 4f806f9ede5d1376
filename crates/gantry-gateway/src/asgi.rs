//! ASGI-style sub-application mount.
//!
//! Services registered with `type: "ASGI"` are reachable under
//! `/{workspace}/app/{name}`. Each HTTP request is translated into one
//! `{scope, receive, send}` interface bundle and forwarded as a single
//! RPC call to the service's `serve` function; the bundle's reference
//! store entries are released once `serve` resolves, so long-running apps
//! do not grow the provider's store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use gantry_core::{Callable, Error, RpcValue, Visibility};

use crate::routes::{GatewayState, caller_context, error_response};

/// Collected response state fed by the app's `send` callable.
#[derive(Debug, Default)]
struct AsgiCollector {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Handles a request to a mounted ASGI service.
pub async fn serve_app(
    State(state): State<Arc<GatewayState>>,
    Path(params): Path<HashMap<String, String>>,
    RawQuery(raw_query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let workspace_name = params.get("workspace").cloned().unwrap_or_default();
    let app = params.get("app").cloned().unwrap_or_default();
    let sub_path = params
        .get("path")
        .map(|p| format!("/{p}"))
        .unwrap_or_else(|| "/".to_string());

    let ctx = match caller_context(&state, &headers, &HashMap::new()).await {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e, true),
    };
    let anonymous = ctx.user().is_anonymous;

    let service = match state
        .registry
        .get_service(&ctx, &format!("{workspace_name}/{app}"))
    {
        Ok(service) => service,
        Err(e) => return error_response(&e, anonymous),
    };
    if service.config.kind != "ASGI" {
        return error_response(
            &Error::NotFound(format!("app {workspace_name}/{app}")),
            anonymous,
        );
    }
    // protected apps were already filtered by get_service; double-check
    // that an anonymous caller only reaches public apps
    if anonymous && service.config.visibility != Visibility::Public {
        return error_response(&Error::Forbidden(format!("app {app}")), anonymous);
    }

    let Some(serve) = service.body.get("serve").and_then(RpcValue::as_callable) else {
        return error_response(
            &Error::BadRequest(format!("service {app} defines no serve function")),
            anonymous,
        );
    };

    let scope = build_scope(&method, &sub_path, raw_query.as_deref(), &headers);
    let collector = Arc::new(Mutex::new(AsgiCollector::default()));
    let bundle = RpcValue::map([
        ("scope", scope),
        ("receive", RpcValue::Callable(receive_fn(body))),
        ("send", RpcValue::Callable(send_fn(Arc::clone(&collector)))),
        ("_rintf", RpcValue::Bool(true)),
    ]);

    debug!(app = %service.config.id, path = %sub_path, "Forwarding request to ASGI app");
    if let Err(e) = serve.call(vec![bundle]).await {
        return error_response(&e, anonymous);
    }

    let collected = {
        let mut collector = collector.lock();
        std::mem::take(&mut *collector)
    };
    let status = StatusCode::from_u16(collected.status.unwrap_or(500))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, collected.body).into_response();
    for (name, value) in collected.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

fn build_scope(
    method: &Method,
    path: &str,
    raw_query: Option<&str>,
    headers: &HeaderMap,
) -> RpcValue {
    let header_list: Vec<RpcValue> = headers
        .iter()
        .map(|(name, value)| {
            RpcValue::List(vec![
                RpcValue::from(name.as_str().to_ascii_lowercase()),
                RpcValue::from(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            ])
        })
        .collect();
    RpcValue::map([
        ("type", RpcValue::from("http")),
        ("http_version", RpcValue::from("1.1")),
        ("method", RpcValue::from(method.as_str())),
        ("path", RpcValue::from(path)),
        ("query_string", RpcValue::from(raw_query.unwrap_or(""))),
        ("headers", RpcValue::List(header_list)),
    ])
}

/// Builds the `receive` callable: yields the whole request body once,
/// then reports the client gone.
fn receive_fn(body: Bytes) -> Callable {
    let remaining = Arc::new(Mutex::new(Some(body.to_vec())));
    Callable::named("receive", move |_| {
        let remaining = Arc::clone(&remaining);
        Box::pin(async move {
            let chunk = remaining.lock().take();
            Ok(match chunk {
                Some(body) => RpcValue::map([
                    ("type", RpcValue::from("http.request")),
                    ("body", RpcValue::Bytes(body)),
                    ("more_body", RpcValue::Bool(false)),
                ]),
                None => RpcValue::map([("type", RpcValue::from("http.disconnect"))]),
            })
        })
    })
}

/// Builds the `send` callable collecting `http.response.*` events.
fn send_fn(collector: Arc<Mutex<AsgiCollector>>) -> Callable {
    Callable::named("send", move |args| {
        let collector = Arc::clone(&collector);
        Box::pin(async move {
            let Some(event) = args.into_iter().next() else {
                return Err(Error::BadRequest("send expects one event".into()));
            };
            match event.get("type").and_then(RpcValue::as_str) {
                Some("http.response.start") => {
                    let mut collector = collector.lock();
                    collector.status = event
                        .get("status")
                        .and_then(RpcValue::as_int)
                        .map(|s| s as u16);
                    if let Some(RpcValue::List(headers)) = event.get("headers") {
                        for pair in headers {
                            if let Some([name, value]) =
                                pair.as_list().and_then(|p| p.get(0..2))
                            {
                                collector.headers.push((
                                    value_to_string(name),
                                    value_to_string(value),
                                ));
                            }
                        }
                    }
                }
                Some("http.response.body") => {
                    let mut collector = collector.lock();
                    match event.get("body") {
                        Some(RpcValue::Bytes(bytes)) => collector.body.extend_from_slice(bytes),
                        Some(RpcValue::String(text)) => {
                            collector.body.extend_from_slice(text.as_bytes())
                        }
                        _ => {}
                    }
                }
                other => {
                    warn!(event = ?other, "Ignoring unknown ASGI send event");
                }
            }
            Ok(RpcValue::Null)
        })
    })
}

fn value_to_string(value: &RpcValue) -> String {
    match value {
        RpcValue::String(s) => s.clone(),
        RpcValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_yields_body_then_disconnect() {
        let receive = receive_fn(Bytes::from_static(b"payload"));
        let first = receive.call(Vec::new()).await.unwrap();
        assert_eq!(
            first.get("type").and_then(RpcValue::as_str),
            Some("http.request")
        );
        assert_eq!(first.get("body"), Some(&RpcValue::Bytes(b"payload".to_vec())));
        let second = receive.call(Vec::new()).await.unwrap();
        assert_eq!(
            second.get("type").and_then(RpcValue::as_str),
            Some("http.disconnect")
        );
    }

    #[tokio::test]
    async fn send_collects_status_headers_and_body() {
        let collector = Arc::new(Mutex::new(AsgiCollector::default()));
        let send = send_fn(Arc::clone(&collector));
        send.call(vec![RpcValue::map([
            ("type", RpcValue::from("http.response.start")),
            ("status", RpcValue::Int(201)),
            (
                "headers",
                RpcValue::List(vec![RpcValue::List(vec![
                    RpcValue::from("content-type"),
                    RpcValue::from("text/plain"),
                ])]),
            ),
        ])])
        .await
        .unwrap();
        send.call(vec![RpcValue::map([
            ("type", RpcValue::from("http.response.body")),
            ("body", RpcValue::from("hello")),
        ])])
        .await
        .unwrap();

        let collected = collector.lock();
        assert_eq!(collected.status, Some(201));
        assert_eq!(
            collected.headers,
            vec![("content-type".to_string(), "text/plain".to_string())]
        );
        assert_eq!(collected.body, b"hello");
    }

    #[test]
    fn scope_lists_lowercased_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Custom", HeaderValue::from_static("1"));
        let scope = build_scope(&Method::POST, "/predict", Some("a=1"), &headers);
        assert_eq!(scope.get("method"), Some(&RpcValue::from("POST")));
        assert_eq!(scope.get("path"), Some(&RpcValue::from("/predict")));
        assert_eq!(scope.get("query_string"), Some(&RpcValue::from("a=1")));
        let headers = scope.get("headers").and_then(RpcValue::as_list).unwrap();
        assert_eq!(
            headers[0],
            RpcValue::List(vec![RpcValue::from("x-custom"), RpcValue::from("1")])
        );
    }
}
