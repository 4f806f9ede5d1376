//! Authentication error kinds.

use thiserror::Error;

/// Errors produced while validating or minting tokens.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The credential is syntactically invalid: missing header, wrong
    /// scheme, bad signature or undecodable payload.
    #[error("malformed authorization: {0}")]
    MalformedAuth(String),

    /// The token was valid once but has expired.
    #[error("the token has expired, please fetch a new one")]
    ExpiredToken,

    /// The token references a signing key the key set does not contain
    /// (after one refresh), or the key set cannot be fetched.
    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    /// The caller asked for more than its own authority allows (e.g. scope
    /// widening on a presigned token).
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl From<AuthError> for gantry_core::Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::PermissionDenied(msg) => gantry_core::Error::Forbidden(msg),
            other => gantry_core::Error::Unauthorized(other.to_string()),
        }
    }
}

/// Result alias for authentication operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;
