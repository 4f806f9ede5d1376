//! Object-store bridge.
//!
//! Plugins obtain per-user credentials and presigned URLs scoped to their
//! workspace prefix. Only the interface and the prefix guard live here;
//! a production deployment backs the trait with an external store admin
//! tool, the in-process implementation below serves tests and single-node
//! runs.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use gantry_core::{CallContext, Error, Result};

/// A scoped credential handed to a workspace member.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreCredential {
    /// Store endpoint URL.
    pub endpoint_url: String,
    /// Access key.
    pub access_key_id: String,
    /// Secret key.
    pub secret_access_key: String,
    /// Bucket all workspaces share.
    pub bucket: String,
    /// Key prefix the credential is confined to: `<workspace>/`.
    pub prefix: String,
}

/// Credential issuance and presigned URLs, scoped per workspace.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Issues a credential confined to the calling workspace's prefix.
    async fn generate_credential(&self, ctx: &CallContext) -> Result<StoreCredential>;

    /// Presigns a URL for one object; the object key must live under the
    /// calling workspace's prefix.
    async fn generate_presigned_url(
        &self,
        ctx: &CallContext,
        bucket: &str,
        object: &str,
        method: &str,
        expires_secs: u64,
    ) -> Result<String>;
}

/// Checks the `<workspace>/` prefix guard shared by every implementation.
pub fn check_object_prefix(workspace: &str, object: &str) -> Result<()> {
    let prefix = format!("{workspace}/");
    if object.starts_with(&prefix) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "object {object} is outside the workspace prefix {prefix}"
        )))
    }
}

/// In-process store stub: mints deterministic per-user keys and
/// unsigned-but-scoped URLs.
pub struct LocalObjectStore {
    endpoint_url: String,
    bucket: String,
    issued: Mutex<HashMap<String, StoreCredential>>,
}

impl LocalObjectStore {
    /// Creates a stub store for the given endpoint and bucket.
    pub fn new(endpoint_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            bucket: bucket.into(),
            issued: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn generate_credential(&self, ctx: &CallContext) -> Result<StoreCredential> {
        let user = ctx.user();
        let workspace = ctx.workspace.name().to_string();
        let mut issued = self.issued.lock();
        let key = format!("{workspace}:{}", user.id);
        let credential = issued.entry(key).or_insert_with(|| StoreCredential {
            endpoint_url: self.endpoint_url.clone(),
            access_key_id: user.id.clone(),
            secret_access_key: uuid::Uuid::new_v4().to_string(),
            bucket: self.bucket.clone(),
            prefix: format!("{workspace}/"),
        });
        Ok(credential.clone())
    }

    async fn generate_presigned_url(
        &self,
        ctx: &CallContext,
        bucket: &str,
        object: &str,
        method: &str,
        expires_secs: u64,
    ) -> Result<String> {
        check_object_prefix(ctx.workspace.name(), object)?;
        match method {
            "get_object" | "put_object" => {}
            other => {
                return Err(Error::BadRequest(format!(
                    "unsupported presign method: {other}"
                )));
            }
        }
        Ok(format!(
            "{}/{bucket}/{object}?method={method}&expires={expires_secs}",
            self.endpoint_url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{EventBus, Registry, UserInfo};
    use std::sync::Arc;

    fn ctx(registry: &Registry, workspace: &str) -> CallContext {
        let ws = registry.get_workspace(workspace).unwrap();
        CallContext::new(UserInfo::anonymous(), ws)
    }

    #[tokio::test]
    async fn credential_is_scoped_to_the_workspace_prefix() {
        let registry = Registry::new(Arc::new(EventBus::new()));
        let store = LocalObjectStore::new("http://127.0.0.1:9000", "gantry");
        let credential = store
            .generate_credential(&ctx(&registry, "public"))
            .await
            .unwrap();
        assert_eq!(credential.prefix, "public/");
        assert_eq!(credential.bucket, "gantry");
    }

    #[tokio::test]
    async fn presign_rejects_objects_outside_the_prefix() {
        let registry = Registry::new(Arc::new(EventBus::new()));
        let store = LocalObjectStore::new("http://127.0.0.1:9000", "gantry");
        let context = ctx(&registry, "public");
        assert!(
            store
                .generate_presigned_url(&context, "gantry", "public/logs/a.log", "get_object", 600)
                .await
                .is_ok()
        );
        let err = store
            .generate_presigned_url(&context, "gantry", "root/secrets", "get_object", 600)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
    }
}
