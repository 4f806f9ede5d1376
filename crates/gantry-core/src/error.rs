//! Unified error taxonomy for the gantry broker.
//!
//! Every error that can cross a trust boundary (an RPC reply or an HTTP
//! response) is represented here. Only the kind and the message travel over
//! the wire; stack context stays on the side that produced the error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors exposed to callers of the broker.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No or invalid bearer credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Known identity, insufficient permission for the target.
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// Workspace, service or plugin missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate workspace registration.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Target plugin has not completed the interface handshake in time.
    #[error("plugin not ready: {0}")]
    PluginNotReady(String),

    /// Plugin terminated while a call was in flight.
    #[error("plugin gone: {0}")]
    PluginGone(String),

    /// Dependency installation failed during plugin setup.
    #[error("install failed (exit code {exit_code}): {stderr}")]
    InstallFailed {
        /// Exit code of the failing install command.
        exit_code: i32,
        /// Captured stderr excerpt.
        stderr: String,
    },

    /// Worker process could not be started.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// Worker process exited unexpectedly.
    #[error("worker crashed with exit code {exit_code}")]
    WorkerCrashed {
        /// Exit code reported by the operating system.
        exit_code: i32,
    },

    /// Malformed frame or HTTP body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The per-plugin pending-call table is full.
    #[error("too many calls in flight")]
    TooManyInFlight,

    /// Unexpected failure; details are logged, never exposed to anonymous
    /// callers.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind identifier used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Unauthorized(_) => "Unauthorized",
            Error::Forbidden(_) => "Forbidden",
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::PluginNotReady(_) => "PluginNotReady",
            Error::PluginGone(_) => "PluginGone",
            Error::InstallFailed { .. } => "InstallFailed",
            Error::LaunchFailed(_) => "LaunchFailed",
            Error::WorkerCrashed { .. } => "WorkerCrashed",
            Error::BadRequest(_) => "BadRequest",
            Error::TooManyInFlight => "TooManyInFlight",
            Error::Internal(_) => "InternalError",
        }
    }

    /// Converts to the wire form transported inside RPC replies.
    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }

    /// Reconstructs an error from its wire form, preserving the kind.
    pub fn from_wire(wire: &WireError) -> Self {
        let msg = wire.message.clone();
        match wire.kind.as_str() {
            "Unauthorized" => Error::Unauthorized(msg),
            "Forbidden" => Error::Forbidden(msg),
            "NotFound" => Error::NotFound(msg),
            "AlreadyExists" => Error::AlreadyExists(msg),
            "PluginNotReady" => Error::PluginNotReady(msg),
            "PluginGone" => Error::PluginGone(msg),
            "LaunchFailed" => Error::LaunchFailed(msg),
            "BadRequest" => Error::BadRequest(msg),
            "TooManyInFlight" => Error::TooManyInFlight,
            _ => Error::Internal(msg),
        }
    }

    /// HTTP status code used by the gateway for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) | Error::BadRequest(_) => 400,
            Error::TooManyInFlight => 429,
            _ => 500,
        }
    }
}

/// Serialized `{kind, message}` pair crossing process boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// Stable error kind, see [`Error::kind`].
    pub kind: String,
    /// Human-readable message, no stack frames.
    pub message: String,
}

/// Result alias used across the broker.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_kind() {
        let err = Error::Forbidden("workspace lab".into());
        let wire = err.to_wire();
        assert_eq!(wire.kind, "Forbidden");
        let back = Error::from_wire(&wire);
        assert_eq!(back.kind(), "Forbidden");
    }

    #[test]
    fn unknown_wire_kind_becomes_internal() {
        let wire = WireError {
            kind: "SomethingNew".into(),
            message: "boom".into(),
        };
        assert_eq!(Error::from_wire(&wire).kind(), "InternalError");
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(Error::Unauthorized("x".into()).http_status(), 401);
        assert_eq!(Error::Forbidden("x".into()).http_status(), 403);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::Internal("x".into()).http_status(), 500);
    }
}
