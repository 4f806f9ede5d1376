//! Request/response content handling.
//!
//! The gateway speaks JSON by default and msgpack on request; responses
//! are serialized in the same format as the request's `Content-Type`.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use gantry_core::{Error, Result, RpcValue};

/// Supported body formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    /// `application/json`.
    #[default]
    Json,
    /// `application/msgpack`.
    Msgpack,
}

impl BodyFormat {
    /// Resolves the format from a `Content-Type` header; unknown types
    /// are rejected.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self> {
        let Some(content_type) = headers.get(header::CONTENT_TYPE) else {
            return Ok(Self::Json);
        };
        let content_type = content_type
            .to_str()
            .map_err(|_| Error::BadRequest("unreadable content-type".into()))?;
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/json" | "" => Ok(Self::Json),
            "application/msgpack" => Ok(Self::Msgpack),
            other => Err(Error::BadRequest(format!(
                "invalid content-type {other} (supported: application/json, application/msgpack)"
            ))),
        }
    }

    /// MIME type of this format.
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Msgpack => "application/msgpack",
        }
    }

    /// Parses a request body into a JSON value.
    pub fn parse(&self, body: &[u8]) -> Result<serde_json::Value> {
        match self {
            Self::Json => serde_json::from_slice(body)
                .map_err(|e| Error::BadRequest(format!("invalid JSON body: {e}"))),
            Self::Msgpack => rmp_serde::from_slice(body)
                .map_err(|e| Error::BadRequest(format!("invalid msgpack body: {e}"))),
        }
    }

    /// Serializes a JSON value as a response in this format.
    pub fn respond(&self, status: StatusCode, value: &serde_json::Value) -> Response {
        match self {
            Self::Json => {
                let body = serde_json::to_vec(value).unwrap_or_default();
                build_response(status, self.mime(), body)
            }
            Self::Msgpack => match rmp_serde::to_vec_named(value) {
                Ok(body) => build_response(status, self.mime(), body),
                Err(e) => build_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "application/json",
                    serde_json::to_vec(&serde_json::json!({
                        "success": false,
                        "detail": format!("msgpack serialization failed: {e}"),
                    }))
                    .unwrap_or_default(),
                ),
            },
        }
    }
}

fn build_response(status: StatusCode, mime: &str, body: Vec<u8>) -> Response {
    let mut response = (status, body).into_response();
    if let Ok(value) = HeaderValue::from_str(mime) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

/// Coerces a query-string value: integers first, then floats, otherwise
/// the string itself.
pub fn normalize(raw: &str) -> RpcValue {
    if let Ok(int) = raw.parse::<i64>() {
        return RpcValue::Int(int);
    }
    if let Ok(float) = raw.parse::<f64>() {
        return RpcValue::Float(float);
    }
    RpcValue::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_strings_are_coerced() {
        assert_eq!(normalize("42"), RpcValue::Int(42));
        assert_eq!(normalize("-7"), RpcValue::Int(-7));
        assert_eq!(normalize("2.5"), RpcValue::Float(2.5));
        assert_eq!(normalize("hi"), RpcValue::String("hi".into()));
        assert_eq!(normalize("1e3"), RpcValue::Float(1000.0));
    }

    #[test]
    fn content_type_negotiation() {
        let mut headers = HeaderMap::new();
        assert_eq!(BodyFormat::from_headers(&headers).unwrap(), BodyFormat::Json);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/msgpack"),
        );
        assert_eq!(
            BodyFormat::from_headers(&headers).unwrap(),
            BodyFormat::Msgpack
        );
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/csv"),
        );
        assert!(BodyFormat::from_headers(&headers).is_err());
    }

    #[test]
    fn msgpack_round_trip() {
        let value = serde_json::json!({ "a": 1, "b": ["x", 2.5] });
        let bytes = rmp_serde::to_vec_named(&value).unwrap();
        let parsed = BodyFormat::Msgpack.parse(&bytes).unwrap();
        assert_eq!(parsed, value);
    }
}
