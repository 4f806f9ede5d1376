//! Explicit call context.
//!
//! The original design resolved "current user / workspace / plugin" through
//! ambient task-local state; here every registry operation receives a
//! [`CallContext`] value instead. Bound workspace views are built by
//! swapping the workspace field and handing the derived context to the same
//! handlers, which restores the previous scope naturally when the derived
//! value is dropped.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::{Plugin, UserInfo};
use crate::registry::Workspace;

/// Identity and scope of the caller of a registry operation.
#[derive(Clone)]
pub struct CallContext {
    user: Arc<RwLock<UserInfo>>,
    /// Workspace the call runs against.
    pub workspace: Arc<Workspace>,
    /// Calling plugin, absent for HTTP gateway callers.
    pub plugin: Option<Arc<Plugin>>,
}

impl CallContext {
    /// Creates a context for a user acting on a workspace.
    pub fn new(user: UserInfo, workspace: Arc<Workspace>) -> Self {
        Self {
            user: Arc::new(RwLock::new(user)),
            workspace,
            plugin: None,
        }
    }

    /// Creates a context sharing an existing user handle (so scope grants
    /// made through one context are visible to the session's other
    /// contexts).
    pub fn with_shared_user(user: Arc<RwLock<UserInfo>>, workspace: Arc<Workspace>) -> Self {
        Self {
            user,
            workspace,
            plugin: None,
        }
    }

    /// Attaches the calling plugin.
    pub fn with_plugin(mut self, plugin: Arc<Plugin>) -> Self {
        self.plugin = Some(plugin);
        self
    }

    /// Derives a context bound to a different workspace; user and plugin
    /// carry over.
    pub fn for_workspace(&self, workspace: Arc<Workspace>) -> Self {
        Self {
            user: Arc::clone(&self.user),
            workspace,
            plugin: self.plugin.clone(),
        }
    }

    /// Snapshot of the calling user.
    pub fn user(&self) -> UserInfo {
        self.user.read().clone()
    }

    /// Shared handle to the calling user.
    pub fn user_handle(&self) -> Arc<RwLock<UserInfo>> {
        Arc::clone(&self.user)
    }

    /// Extends the user's scopes with a workspace name (used when the user
    /// creates a workspace).
    pub fn grant_scope(&self, workspace: &str) {
        let mut user = self.user.write();
        if !user.scopes.iter().any(|s| s == workspace) {
            user.scopes.push(workspace.to_string());
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("user", &self.user.read().id)
            .field("workspace", &self.workspace.name())
            .field("plugin", &self.plugin.as_ref().map(|p| p.id.clone()))
            .finish()
    }
}
