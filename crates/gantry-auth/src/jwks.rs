//! Lazily fetched, cached JSON Web Key set for externally issued tokens.

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// One RSA key from the JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type, expected `"RSA"`.
    pub kty: String,
    /// Key id matched against the token header.
    pub kid: String,
    /// Intended use, expected `"sig"`.
    #[serde(rename = "use")]
    pub use_: Option<String>,
    /// Modulus, base64url.
    pub n: String,
    /// Exponent, base64url.
    pub e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

/// Cache around `https://<domain>/.well-known/jwks.json`.
///
/// The document is fetched on first use and kept until a lookup misses;
/// a miss triggers exactly one refresh before failing with `UnknownKey`.
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    keys: Mutex<Option<Vec<Jwk>>>,
}

impl JwksCache {
    /// Creates a cache for the given identity provider domain.
    pub fn new(domain: &str) -> Self {
        Self {
            url: format!("https://{domain}/.well-known/jwks.json"),
            client: reqwest::Client::new(),
            keys: Mutex::new(None),
        }
    }

    /// Returns the key with the given id, refreshing the cache once on a
    /// miss.
    pub async fn get_key(&self, kid: &str) -> AuthResult<Jwk> {
        let mut keys = self.keys.lock().await;
        if keys.is_none() {
            *keys = Some(self.fetch().await?);
        }
        if let Some(found) = Self::find(keys.as_deref(), kid) {
            return Ok(found);
        }
        debug!(kid = %kid, "Signing key not cached, refreshing JWKS");
        *keys = Some(self.fetch().await?);
        Self::find(keys.as_deref(), kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }

    fn find(keys: Option<&[Jwk]>, kid: &str) -> Option<Jwk> {
        keys?.iter().find(|k| k.kid == kid).cloned()
    }

    async fn fetch(&self) -> AuthResult<Vec<Jwk>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.url, error = %e, "Failed to fetch JWKS");
                AuthError::UnknownKey(format!("key set unavailable: {e}"))
            })?;
        let document: JwksDocument = response
            .json()
            .await
            .map_err(|e| AuthError::UnknownKey(format!("invalid key set document: {e}")))?;
        debug!(url = %self.url, keys = document.keys.len(), "Fetched JWKS");
        Ok(document.keys)
    }
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwksCache({})", self.url)
    }
}
