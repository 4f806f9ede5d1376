//! Bearer credential validation and presigned child tokens.
//!
//! Two token families are accepted:
//!
//! 1. **External** tokens issued by the configured identity provider,
//!    RS256-signed and verified against the lazily cached JWKS.
//! 2. **Internal** tokens minted by this process, HS256-signed with the
//!    engine secret and carrying the `#RTC:` prefix marker.
//!
//! The engine secret defaults to a random value when `JWT_SECRET` is
//! unset, which invalidates all previously minted internal tokens on
//! restart.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gantry_core::UserInfo;

use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksCache;

/// Prefix marking internally issued tokens.
pub const INTERNAL_TOKEN_PREFIX: &str = "#RTC:";

/// Claim namespace for email and roles on external tokens.
const EMAIL_CLAIM: &str = "https://api.gantry.io/email";
const ROLES_CLAIM: &str = "https://api.gantry.io/roles";

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Request for [`Auth::generate_presigned_token`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Workspaces the child token may enter; must be a subset of the
    /// caller's scopes.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Lifetime in seconds; `None` for no expiry.
    pub expires_in: Option<u64>,
    /// Optional email stamped on the child identity.
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InternalClaims {
    user_id: String,
    parent: Option<String>,
    email: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    scopes: Option<Vec<String>>,
    expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExternalClaims {
    sub: String,
    #[serde(default)]
    scope: Option<String>,
    #[serde(rename = "https://api.gantry.io/email")]
    email: Option<String>,
    #[serde(rename = "https://api.gantry.io/roles")]
    #[serde(default)]
    roles: Option<Vec<String>>,
}

/// Settings for the authentication layer, filled from the environment.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Identity provider domain (`AUTH0_DOMAIN`).
    pub domain: String,
    /// Expected audience of external tokens (`AUTH0_AUDIENCE`).
    pub audience: String,
    /// Symmetric secret for internal tokens (`JWT_SECRET`); a random value
    /// is generated when unset.
    pub jwt_secret: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            domain: std::env::var("AUTH0_DOMAIN")
                .unwrap_or_else(|_| "gantry.eu.auth0.com".to_string()),
            audience: std::env::var("AUTH0_AUDIENCE")
                .unwrap_or_else(|_| "https://gantry.eu.auth0.com/api/v2/".to_string()),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
        }
    }
}

/// Token validation and minting.
pub struct Auth {
    secret: String,
    domain: String,
    audience: String,
    jwks: JwksCache,
}

impl Auth {
    /// Creates the auth layer; warns when falling back to a random engine
    /// secret (previously minted internal tokens become invalid).
    pub fn new(config: AuthConfig) -> Self {
        let secret = match config.jwt_secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => {
                warn!(
                    "JWT_SECRET is not defined; internal tokens will not survive a restart"
                );
                uuid::Uuid::new_v4().to_string()
            }
        };
        Self {
            secret,
            jwks: JwksCache::new(&config.domain),
            domain: config.domain,
            audience: config.audience,
        }
    }

    /// Extracts the token from an `Authorization` header value. Exactly
    /// `Bearer <token>` is accepted.
    pub fn parse_bearer(authorization: &str) -> AuthResult<&str> {
        let mut parts = authorization.split_whitespace();
        let scheme = parts
            .next()
            .ok_or_else(|| AuthError::MalformedAuth("authorization header is expected".into()))?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthError::MalformedAuth(
                "authorization header must start with Bearer".into(),
            ));
        }
        let token = parts
            .next()
            .ok_or_else(|| AuthError::MalformedAuth("token not found".into()))?;
        if parts.next().is_some() {
            return Err(AuthError::MalformedAuth(
                "authorization header must be 'Bearer <token>'".into(),
            ));
        }
        Ok(token)
    }

    /// Validates a full `Authorization` header value and returns the
    /// admitted user. Admin callers may carry simulated-user query
    /// parameters that override the decoded subject.
    pub async fn valid_token(
        &self,
        authorization: &str,
        query_params: Option<&HashMap<String, String>>,
    ) -> AuthResult<UserInfo> {
        let token = Self::parse_bearer(authorization)?;
        let mut user = if let Some(internal) = token.strip_prefix(INTERNAL_TOKEN_PREFIX) {
            self.decode_internal(internal)?
        } else {
            self.decode_external(token).await?
        };
        if user.is_admin()
            && let Some(params) = query_params
        {
            simulate_user(&mut user, params);
        }
        Ok(user)
    }

    fn decode_internal(&self, token: &str) -> AuthResult<UserInfo> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Internal tokens carry a custom expires_at claim instead of exp.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let data = decode::<InternalClaims>(token, &key, &validation)
            .map_err(|e| AuthError::MalformedAuth(format!("invalid internal token: {e}")))?;
        let claims = data.claims;
        if let Some(expires_at) = claims.expires_at
            && expires_at <= now_secs()
        {
            return Err(AuthError::ExpiredToken);
        }
        Ok(UserInfo {
            id: claims.user_id,
            email: claims.email,
            roles: claims.roles,
            parent: claims.parent,
            scopes: claims.scopes.unwrap_or_default(),
            expires_at: claims.expires_at,
            is_anonymous: false,
        })
    }

    async fn decode_external(&self, token: &str) -> AuthResult<UserInfo> {
        let header = decode_header(token)
            .map_err(|e| AuthError::MalformedAuth(format!("invalid token header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::MalformedAuth("token header has no kid".into()))?;
        let jwk = self.jwks.get_key(&kid).await?;
        let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| AuthError::UnknownKey(format!("unusable signing key: {e}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[format!("https://{}/", self.domain)]);
        let data = decode::<ExternalClaims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
                _ => AuthError::MalformedAuth(format!("invalid token: {e}")),
            }
        })?;
        let claims = data.claims;
        debug!(user = %claims.sub, "Validated external token");
        Ok(UserInfo {
            id: claims.sub,
            email: claims.email,
            roles: claims.roles.unwrap_or_default(),
            parent: None,
            scopes: claims
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            expires_at: None,
            is_anonymous: false,
        })
    }

    /// Mints an internal token for a new child user.
    ///
    /// The child gets a fresh id, chains `parent` to the caller, and may
    /// only receive scopes contained in the caller's scopes.
    pub fn generate_presigned_token(
        &self,
        user: &UserInfo,
        config: &TokenConfig,
    ) -> AuthResult<String> {
        if !user.scopes.is_empty() {
            for scope in &config.scopes {
                if !user.scopes.iter().any(|s| s == scope) {
                    return Err(AuthError::PermissionDenied(format!(
                        "user has no permission to scope: {scope}"
                    )));
                }
            }
        }
        let expires_at = config.expires_in.map(|secs| now_secs() + secs as i64);
        let claims = InternalClaims {
            user_id: uuid::Uuid::new_v4().to_string(),
            parent: Some(user.parent.clone().unwrap_or_else(|| user.id.clone())),
            email: config.email.clone(),
            roles: Vec::new(),
            scopes: Some(config.scopes.clone()),
            expires_at,
        };
        let key = EncodingKey::from_secret(self.secret.as_bytes());
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| AuthError::MalformedAuth(format!("failed to sign token: {e}")))?;
        Ok(format!("{INTERNAL_TOKEN_PREFIX}{token}"))
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("domain", &self.domain)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

/// Overrides the decoded subject with simulated-user query parameters.
/// Only reachable for admin callers.
pub fn simulate_user(user: &mut UserInfo, params: &HashMap<String, String>) {
    if let Some(id) = params.get("user_id") {
        user.id = id.clone();
    }
    if let Some(email) = params.get("email") {
        user.email = Some(email.clone());
    }
    if let Some(roles) = params.get("roles") {
        user.roles = roles.split(',').map(|r| r.trim().to_string()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_with_secret() -> Auth {
        Auth::new(AuthConfig {
            domain: "test.example.com".into(),
            audience: "https://test.example.com/api/".into(),
            jwt_secret: Some("unit-test-secret".into()),
        })
    }

    fn parent_user(scopes: &[&str]) -> UserInfo {
        UserInfo {
            id: "parent-1".into(),
            email: None,
            roles: Vec::new(),
            parent: None,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            expires_at: None,
            is_anonymous: false,
        }
    }

    #[test]
    fn bearer_parsing_accepts_only_two_parts() {
        assert!(Auth::parse_bearer("Bearer abc").is_ok());
        assert!(Auth::parse_bearer("bearer abc").is_ok());
        assert!(Auth::parse_bearer("Basic abc").is_err());
        assert!(Auth::parse_bearer("Bearer").is_err());
        assert!(Auth::parse_bearer("Bearer a b").is_err());
    }

    #[tokio::test]
    async fn presigned_token_round_trip() {
        let auth = auth_with_secret();
        let token = auth
            .generate_presigned_token(
                &parent_user(&["lab"]),
                &TokenConfig {
                    scopes: vec!["lab".into()],
                    expires_in: Some(3600),
                    email: None,
                },
            )
            .unwrap();
        assert!(token.starts_with(INTERNAL_TOKEN_PREFIX));

        let user = auth
            .valid_token(&format!("Bearer {token}"), None)
            .await
            .unwrap();
        assert_eq!(user.parent.as_deref(), Some("parent-1"));
        assert_eq!(user.scopes, vec!["lab".to_string()]);
        assert!(!user.is_anonymous);
    }

    #[test]
    fn scope_widening_is_rejected() {
        let auth = auth_with_secret();
        let err = auth
            .generate_presigned_token(
                &parent_user(&["lab"]),
                &TokenConfig {
                    scopes: vec!["other".into()],
                    expires_in: None,
                    email: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, AuthError::PermissionDenied(_)));
    }

    #[test]
    fn grandchild_token_chains_to_original_parent() {
        let auth = auth_with_secret();
        let mut child = parent_user(&["lab"]);
        child.parent = Some("grandparent".into());
        let token = auth
            .generate_presigned_token(&child, &TokenConfig::default())
            .unwrap();
        let raw = token.strip_prefix(INTERNAL_TOKEN_PREFIX).unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        let data = decode::<InternalClaims>(
            raw,
            &DecodingKey::from_secret("unit-test-secret".as_bytes()),
            &validation,
        )
        .unwrap();
        assert_eq!(data.claims.parent.as_deref(), Some("grandparent"));
    }

    #[tokio::test]
    async fn expired_internal_token_is_rejected() {
        let auth = auth_with_secret();
        let claims = InternalClaims {
            user_id: "u1".into(),
            parent: None,
            email: None,
            roles: Vec::new(),
            scopes: None,
            expires_at: Some(now_secs() - 10),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret("unit-test-secret".as_bytes()),
        )
        .unwrap();
        let err = auth
            .valid_token(&format!("Bearer {INTERNAL_TOKEN_PREFIX}{token}"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ExpiredToken));
    }

    #[test]
    fn simulated_user_overrides_subject() {
        let mut user = parent_user(&[]);
        user.roles = vec!["admin".into()];
        let mut params = HashMap::new();
        params.insert("user_id".to_string(), "impersonated".to_string());
        params.insert("roles".to_string(), "admin,reviewer".to_string());
        simulate_user(&mut user, &params);
        assert_eq!(user.id, "impersonated");
        assert_eq!(user.roles, vec!["admin".to_string(), "reviewer".to_string()]);
    }
}
