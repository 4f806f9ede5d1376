//! Data model: users, workspaces, plugins and services.
//!
//! These types are the registry's vocabulary. Plain data lives in serde
//! structs; live state (plugin status, process id, log history) sits behind
//! `parking_lot` locks inside [`Plugin`] so records can be shared as
//! `Arc<Plugin>` between the registry, the connection layer and the
//! supervisor.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::RpcValue;

/// Upper bound on per-plugin retained log records.
const LOG_HISTORY_LIMIT: usize = 1000;

// =============================================================================
// Users
// =============================================================================

/// An identity admitted into the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Unique user id (subject of the bearer token, or a generated id for
    /// anonymous sessions).
    pub id: String,
    /// Email claim, if the token carried one.
    pub email: Option<String>,
    /// Role names, e.g. `"admin"`.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Id of the delegating user for presigned child tokens.
    pub parent: Option<String>,
    /// Workspaces this user may enter; empty means no scope restriction
    /// beyond ownership and visibility.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Unix timestamp after which the identity is invalid.
    pub expires_at: Option<i64>,
    /// True for sessions admitted without a bearer token.
    #[serde(default)]
    pub is_anonymous: bool,
}

impl UserInfo {
    /// Creates an anonymous session user.
    pub fn anonymous() -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("anonymouz-{}", &short[..12]),
            email: None,
            roles: Vec::new(),
            parent: None,
            scopes: Vec::new(),
            expires_at: None,
            is_anonymous: true,
        }
    }

    /// True if the user carries the admin role.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }

    /// Identity string used in owner lists: email when present, id
    /// otherwise.
    pub fn owner_id(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.id)
    }
}

// =============================================================================
// Workspaces
// =============================================================================

/// Workspace visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Discoverable and callable by anyone.
    Public,
    /// Members only.
    #[default]
    Protected,
}

/// Descriptive and access-control metadata of a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    /// Unique name; never mutated after creation.
    pub name: String,
    /// Whether the workspace survives its last member leaving.
    #[serde(default)]
    pub persistent: bool,
    /// User ids or emails that own the workspace.
    pub owners: Vec<String>,
    /// Visibility of the workspace itself.
    #[serde(default)]
    pub visibility: Visibility,
    /// Free-form description.
    pub description: Option<String>,
    /// Icon URL.
    pub icon: Option<String>,
    /// Cover image URLs.
    pub covers: Option<Vec<String>>,
    /// Documentation URL or inline markdown.
    pub docs: Option<String>,
    /// Explicit additional members (checked before visibility).
    pub allow_list: Option<Vec<String>>,
    /// Explicitly banned identities (checked first).
    pub deny_list: Option<Vec<String>>,
}

impl WorkspaceInfo {
    /// Creates a workspace description with the given name and owners.
    pub fn new(name: impl Into<String>, owners: Vec<String>) -> Self {
        Self {
            name: name.into(),
            persistent: false,
            owners,
            visibility: Visibility::Protected,
            description: None,
            icon: None,
            covers: None,
            docs: None,
            allow_list: None,
            deny_list: None,
        }
    }

    /// Validates naming and ownership invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::BadRequest("workspace name must not be empty".into()));
        }
        if self.name.contains('/') {
            return Err(Error::BadRequest(format!(
                "workspace name must not contain '/': {}",
                self.name
            )));
        }
        if !self.owners.iter().any(|o| !o.trim().is_empty()) {
            return Err(Error::BadRequest(format!(
                "workspace {} must have at least one owner",
                self.name
            )));
        }
        Ok(())
    }

    /// Membership check: deny list first, then ownership, then public
    /// visibility, then the allow list, then token scopes.
    pub fn check_permission(&self, user: &UserInfo) -> bool {
        let matches_user =
            |entry: &String| entry == &user.id || Some(entry.as_str()) == user.email.as_deref();

        if let Some(deny) = &self.deny_list
            && deny.iter().any(matches_user)
        {
            return false;
        }
        if self.owners.iter().any(matches_user) {
            return true;
        }
        if self.visibility == Visibility::Public {
            return true;
        }
        if let Some(allow) = &self.allow_list
            && allow.iter().any(matches_user)
        {
            return true;
        }
        user.scopes.iter().any(|s| s == &self.name)
    }
}

// =============================================================================
// Plugins
// =============================================================================

/// Behavior flags a plugin can request at initialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginFlags {
    /// Keyed by `(name, tag)`; a second init with the same key resumes the
    /// running instance.
    pub single_instance: bool,
    /// Survives its owning session; keyed by
    /// `(client_id, workspace, name, tag)`.
    pub allow_detach: bool,
    /// The peer may receive `execute` frames.
    pub allow_execution: bool,
    /// The peer exports no remote API beyond lifecycle stubs.
    pub passive: bool,
}

impl PluginFlags {
    /// Parses the wire form, a list of flag names.
    pub fn from_list(flags: &[String]) -> Self {
        let has = |name: &str| flags.iter().any(|f| f == name);
        Self {
            single_instance: has("single-instance"),
            allow_detach: has("allow-detach"),
            allow_execution: has("allow-execution"),
            passive: has("passive"),
        }
    }
}

/// Lifecycle state of a plugin, from the broker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Record exists, peer has not sent `initialized`.
    Initializing,
    /// Interface handshake complete; callable.
    Ready,
    /// Disconnect requested or kill in progress.
    Terminating,
    /// Fully torn down.
    Disconnected,
}

/// One retained log line from a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// `"info"`, `"error"` or `"progress"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Message text or progress value.
    pub value: serde_json::Value,
}

/// A live peer that has (or is about to have) declared an interface.
#[derive(Debug)]
pub struct Plugin {
    /// Unique plugin id.
    pub id: String,
    /// Display name; unique within the workspace.
    pub name: String,
    /// Plugin type, e.g. `"native-python"` or `"ASGI"`.
    pub kind: String,
    /// Owning workspace name.
    pub workspace: String,
    /// Id of the creating user; only this user may tear the plugin down.
    pub user_id: String,
    /// Opaque per-peer channel key.
    pub secret: String,
    /// Session the plugin was started in.
    pub session_id: String,
    /// Resume key for single-instance / detachable plugins.
    pub signature: Option<String>,
    /// Requested behavior flags.
    pub flags: PluginFlags,
    /// Raw config the peer supplied at init.
    pub config: serde_json::Value,
    state: Mutex<PluginState>,
    process_id: Mutex<Option<u32>>,
    log_history: Mutex<VecDeque<LogRecord>>,
}

impl Plugin {
    /// Creates a plugin record in the `Initializing` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
        workspace: impl Into<String>,
        user_id: impl Into<String>,
        secret: impl Into<String>,
        session_id: impl Into<String>,
        flags: PluginFlags,
        config: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            workspace: workspace.into(),
            user_id: user_id.into(),
            secret: secret.into(),
            session_id: session_id.into(),
            signature: None,
            flags,
            config,
            state: Mutex::new(PluginState::Initializing),
            process_id: Mutex::new(None),
            log_history: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the resume signature.
    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.signature = signature;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    /// Transitions to a new lifecycle state, returning the previous one.
    pub fn set_state(&self, state: PluginState) -> PluginState {
        std::mem::replace(&mut *self.state.lock(), state)
    }

    /// OS process id of the worker, when launched by the supervisor.
    pub fn process_id(&self) -> Option<u32> {
        *self.process_id.lock()
    }

    /// Records the worker process id.
    pub fn set_process_id(&self, pid: Option<u32>) {
        *self.process_id.lock() = pid;
    }

    /// Appends a log record, evicting the oldest past the retention limit.
    pub fn push_log(&self, record: LogRecord) {
        let mut history = self.log_history.lock();
        if history.len() >= LOG_HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(record);
    }

    /// Snapshot of the retained log records.
    pub fn log_history(&self) -> Vec<LogRecord> {
        self.log_history.lock().iter().cloned().collect()
    }
}

/// Computes the resume signature for a plugin, if its flags call for one.
pub fn plugin_signature(
    flags: PluginFlags,
    client_id: &str,
    workspace: &str,
    name: &str,
    tag: &str,
) -> Option<String> {
    if flags.single_instance {
        Some(format!("{name}/{tag}"))
    } else if flags.allow_detach {
        Some(format!("{client_id}/{workspace}/{name}/{tag}"))
    } else {
        None
    }
}

// =============================================================================
// Services
// =============================================================================

/// Public configuration of a service, returned by introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// `"<workspace>/<name>"`.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Service type, e.g. `"echo"` or `"ASGI"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Owning workspace.
    pub workspace: String,
    /// Who may see and call the service.
    #[serde(default)]
    pub visibility: Visibility,
    /// Whether handlers receive the caller context as a trailing argument.
    #[serde(default)]
    pub require_context: bool,
    /// Name of the providing plugin.
    pub provider: String,
    /// Id of the providing plugin.
    pub provider_id: String,
}

/// A named capability exposed by a plugin.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Public configuration.
    pub config: ServiceConfig,
    /// The service body: a value map whose callable slots are remote
    /// proxies into the provider plugin.
    pub body: RpcValue,
    /// The providing plugin record.
    pub provider: Arc<Plugin>,
}

impl ServiceInfo {
    /// Introspection summary for HTTP listings (no callables, placeholders
    /// only).
    pub fn summary(&self) -> serde_json::Value {
        let mut out = serde_json::to_value(&self.config)
            .unwrap_or(serde_json::Value::Null);
        if let (serde_json::Value::Object(map), RpcValue::Map(body)) = (&mut out, &self.body) {
            for (key, value) in body {
                if !map.contains_key(key) {
                    map.insert(key.clone(), value.to_json());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserInfo {
        UserInfo {
            id: id.into(),
            email: None,
            roles: Vec::new(),
            parent: None,
            scopes: Vec::new(),
            expires_at: None,
            is_anonymous: false,
        }
    }

    #[test]
    fn empty_workspace_name_is_rejected() {
        let info = WorkspaceInfo::new("", vec!["alice".into()]);
        assert!(info.validate().is_err());
        let info = WorkspaceInfo::new("a/b", vec!["alice".into()]);
        assert!(info.validate().is_err());
    }

    #[test]
    fn workspace_needs_a_non_empty_owner() {
        let info = WorkspaceInfo::new("lab", vec!["  ".into()]);
        assert!(info.validate().is_err());
    }

    #[test]
    fn owner_always_has_permission() {
        let info = WorkspaceInfo::new("lab", vec!["alice".into()]);
        assert!(info.check_permission(&user("alice")));
        assert!(!info.check_permission(&user("bob")));
    }

    #[test]
    fn public_workspace_admits_everyone() {
        let mut info = WorkspaceInfo::new("commons", vec!["root".into()]);
        info.visibility = Visibility::Public;
        assert!(info.check_permission(&user("anyone")));
    }

    #[test]
    fn deny_list_overrides_ownership() {
        let mut info = WorkspaceInfo::new("lab", vec!["alice".into()]);
        info.deny_list = Some(vec!["alice".into()]);
        assert!(!info.check_permission(&user("alice")));
    }

    #[test]
    fn scoped_user_may_enter_protected_workspace() {
        let info = WorkspaceInfo::new("lab", vec!["alice".into()]);
        let mut child = user("child-1");
        child.scopes = vec!["lab".into()];
        assert!(info.check_permission(&child));
    }

    #[test]
    fn signature_depends_on_flags() {
        let single = PluginFlags {
            single_instance: true,
            ..Default::default()
        };
        assert_eq!(
            plugin_signature(single, "c", "ws", "counter", "v1"),
            Some("counter/v1".into())
        );
        let detach = PluginFlags {
            allow_detach: true,
            ..Default::default()
        };
        assert_eq!(
            plugin_signature(detach, "c", "ws", "counter", "v1"),
            Some("c/ws/counter/v1".into())
        );
        assert_eq!(
            plugin_signature(PluginFlags::default(), "c", "ws", "counter", "v1"),
            None
        );
    }

    #[test]
    fn log_history_is_bounded() {
        let plugin = Plugin::new(
            "p1",
            "logger",
            "native",
            "lab",
            "alice",
            "s3cret",
            "session-1",
            PluginFlags::default(),
            serde_json::json!({}),
        );
        for i in 0..(LOG_HISTORY_LIMIT + 5) {
            plugin.push_log(LogRecord {
                kind: "info".into(),
                value: serde_json::json!(i),
            });
        }
        let history = plugin.log_history();
        assert_eq!(history.len(), LOG_HISTORY_LIMIT);
        assert_eq!(history[0].value, serde_json::json!(5));
    }
}
