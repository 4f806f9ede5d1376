//! Workspace, plugin and service registry.
//!
//! The registry is the in-memory authority for who exists, who owns what,
//! and who may call what. All operations are synchronous; maps are guarded
//! with `parking_lot` locks and critical sections never await.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::model::{
    Plugin, ServiceConfig, ServiceInfo, UserInfo, Visibility, WorkspaceInfo,
};
use crate::value::RpcValue;

/// Reserved workspace admitting everyone.
pub const PUBLIC_WORKSPACE: &str = "public";
/// Reserved workspace owned by the engine itself.
pub const ROOT_WORKSPACE: &str = "root";

// =============================================================================
// Workspace
// =============================================================================

/// A live workspace: metadata plus its plugin and service maps.
pub struct Workspace {
    name: String,
    info: RwLock<WorkspaceInfo>,
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    services: RwLock<HashMap<String, Arc<ServiceInfo>>>,
}

impl Workspace {
    fn new(info: WorkspaceInfo) -> Self {
        Self {
            name: info.name.clone(),
            info: RwLock::new(info),
            plugins: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Immutable workspace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the workspace metadata.
    pub fn info(&self) -> WorkspaceInfo {
        self.info.read().clone()
    }

    /// Membership check against the current metadata.
    pub fn check_permission(&self, user: &UserInfo) -> bool {
        self.info.read().check_permission(user)
    }

    /// Inserts a plugin under its name. If the name is taken, the old
    /// record is swapped out and returned so the caller can schedule its
    /// asynchronous termination; lookups see the replacement immediately.
    pub fn add_plugin(&self, plugin: Arc<Plugin>) -> Option<Arc<Plugin>> {
        let mut plugins = self.plugins.write();
        let evicted = plugins.insert(plugin.name.clone(), plugin);
        if evicted.is_some() {
            debug!(workspace = %self.name, "Replacing plugin with the same name");
        }
        evicted
    }

    /// Looks up a plugin by name.
    pub fn get_plugin(&self, name: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().get(name).cloned()
    }

    /// Looks up a plugin by id.
    pub fn get_plugin_by_id(&self, id: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().values().find(|p| p.id == id).cloned()
    }

    /// Names of all plugins in the workspace.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Removes a plugin and every service it provides. Returns the plugin
    /// and the removed services; `NotFound` when the name is unknown.
    pub fn remove_plugin(
        &self,
        name: &str,
    ) -> Result<(Arc<Plugin>, Vec<Arc<ServiceInfo>>)> {
        let plugin = self
            .plugins
            .write()
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("plugin {name} in workspace {}", self.name)))?;
        let mut services = self.services.write();
        let removed_names: Vec<String> = services
            .iter()
            .filter(|(_, svc)| svc.config.provider_id == plugin.id)
            .map(|(name, _)| name.clone())
            .collect();
        let removed = removed_names
            .iter()
            .filter_map(|name| services.remove(name))
            .collect();
        Ok((plugin, removed))
    }

    /// Registers a service under its name, replacing any previous entry.
    pub fn add_service(&self, service: Arc<ServiceInfo>) -> Option<Arc<ServiceInfo>> {
        self.services
            .write()
            .insert(service.config.name.clone(), service)
    }

    /// Looks up a service by name.
    pub fn get_service(&self, name: &str) -> Option<Arc<ServiceInfo>> {
        self.services.read().get(name).cloned()
    }

    /// Snapshot of all services in the workspace.
    pub fn services(&self) -> Vec<Arc<ServiceInfo>> {
        let mut all: Vec<Arc<ServiceInfo>> = self.services.read().values().cloned().collect();
        all.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        all
    }

    /// Applies a metadata patch. The name is immutable and unknown keys are
    /// rejected.
    pub fn update_info(&self, patch: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        let mut info = self.info.write();
        for (key, value) in patch {
            match key.as_str() {
                "name" => {
                    return Err(Error::BadRequest(
                        "changing the workspace name is not allowed".into(),
                    ));
                }
                "persistent" => {
                    info.persistent = value.as_bool().unwrap_or(info.persistent);
                }
                "visibility" => {
                    info.visibility = serde_json::from_value(value.clone())
                        .map_err(|e| Error::BadRequest(format!("invalid visibility: {e}")))?;
                }
                "owners" => {
                    info.owners = serde_json::from_value(value.clone())
                        .map_err(|e| Error::BadRequest(format!("invalid owners: {e}")))?;
                }
                "description" => info.description = value.as_str().map(String::from),
                "icon" => info.icon = value.as_str().map(String::from),
                "docs" => info.docs = value.as_str().map(String::from),
                "covers" => {
                    info.covers = serde_json::from_value(value.clone())
                        .map_err(|e| Error::BadRequest(format!("invalid covers: {e}")))?;
                }
                "allow_list" => {
                    info.allow_list = serde_json::from_value(value.clone())
                        .map_err(|e| Error::BadRequest(format!("invalid allow_list: {e}")))?;
                }
                "deny_list" => {
                    info.deny_list = serde_json::from_value(value.clone())
                        .map_err(|e| Error::BadRequest(format!("invalid deny_list: {e}")))?;
                }
                other => {
                    return Err(Error::BadRequest(format!("invalid key: {other}")));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("plugins", &self.plugins.read().len())
            .field("services", &self.services.read().len())
            .finish()
    }
}

// =============================================================================
// Service registration input
// =============================================================================

/// Parsed `register_service` request.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Service name, unique within the workspace.
    pub name: String,
    /// Service type, e.g. `"ASGI"`.
    pub kind: String,
    /// Requested visibility.
    pub visibility: Visibility,
    /// Whether handlers expect the caller context appended to their args.
    pub require_context: bool,
    /// The service body (callables and data slots).
    pub body: RpcValue,
}

impl ServiceSpec {
    /// Parses the wire form: a map with `name`, `type`, optional `config`
    /// and arbitrary data/function slots.
    pub fn from_value(value: &RpcValue) -> Result<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::BadRequest("service must be a map".into()))?;
        let name = map
            .get("name")
            .and_then(RpcValue::as_str)
            .ok_or_else(|| Error::BadRequest("service must contain `name` and `type`".into()))?
            .to_string();
        let kind = map
            .get("type")
            .and_then(RpcValue::as_str)
            .ok_or_else(|| Error::BadRequest("service must contain `name` and `type`".into()))?
            .to_string();

        let mut visibility = Visibility::Protected;
        let mut require_context = false;
        if let Some(config) = map.get("config") {
            let config_map = config
                .as_map()
                .ok_or_else(|| Error::BadRequest("service.config must be a map".into()))?;
            if let Some(config_name) = config_map.get("name").and_then(RpcValue::as_str)
                && config_name != name
            {
                return Err(Error::BadRequest(
                    "service name should match the one in service.config".into(),
                ));
            }
            if let Some(config_kind) = config_map.get("type").and_then(RpcValue::as_str)
                && config_kind != kind
            {
                return Err(Error::BadRequest(
                    "service type should match the one in service.config".into(),
                ));
            }
            if let Some(vis) = config_map.get("visibility").and_then(RpcValue::as_str) {
                visibility = match vis {
                    "public" => Visibility::Public,
                    "protected" => Visibility::Protected,
                    other => {
                        return Err(Error::BadRequest(format!("invalid visibility: {other}")));
                    }
                };
            }
            require_context = config_map
                .get("require_context")
                .and_then(RpcValue::as_bool)
                .unwrap_or(false);
        }

        let body = RpcValue::Map(
            map.iter()
                .filter(|(k, _)| k.as_str() != "config")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        Ok(Self {
            name,
            kind,
            visibility,
            require_context,
            body,
        })
    }
}

/// Query for [`Registry::list_services`].
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    /// `None` = current workspace, `Some("*")` = all workspaces the caller
    /// may see into, otherwise a specific workspace.
    pub workspace: Option<String>,
    /// Remaining keys matched by equality against the service config.
    pub filters: BTreeMap<String, serde_json::Value>,
}

impl ServiceQuery {
    fn matches(&self, config: &serde_json::Value) -> bool {
        self.filters
            .iter()
            .all(|(key, expected)| config.get(key) == Some(expected))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Process-global registry of workspaces.
pub struct Registry {
    workspaces: RwLock<HashMap<String, Arc<Workspace>>>,
    bus: Arc<EventBus>,
}

impl Registry {
    /// Creates a registry holding the reserved `public` and `root`
    /// workspaces.
    pub fn new(bus: Arc<EventBus>) -> Self {
        let registry = Self {
            workspaces: RwLock::new(HashMap::new()),
            bus,
        };
        let mut public = WorkspaceInfo::new(PUBLIC_WORKSPACE, vec![ROOT_WORKSPACE.into()]);
        public.persistent = true;
        public.visibility = Visibility::Public;
        public.allow_list = Some(Vec::new());
        public.deny_list = Some(Vec::new());
        let mut root = WorkspaceInfo::new(ROOT_WORKSPACE, vec![ROOT_WORKSPACE.into()]);
        root.persistent = true;
        // Reserved workspaces are valid by construction.
        let _ = registry.register_workspace(public);
        let _ = registry.register_workspace(root);
        registry
    }

    /// The event bus lifecycle events are emitted on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Registers a workspace, failing with `AlreadyExists` on a name
    /// collision.
    pub fn register_workspace(&self, info: WorkspaceInfo) -> Result<Arc<Workspace>> {
        info.validate()?;
        let mut workspaces = self.workspaces.write();
        if workspaces.contains_key(&info.name) {
            return Err(Error::AlreadyExists(format!("workspace {}", info.name)));
        }
        let name = info.name.clone();
        let shared_info = Arc::new(info.clone());
        let workspace = Arc::new(Workspace::new(info));
        workspaces.insert(name.clone(), Arc::clone(&workspace));
        drop(workspaces);
        info!(workspace = %name, "Registered workspace");
        self.bus.emit(&Event::WorkspaceRegistered(shared_info));
        Ok(workspace)
    }

    /// Removes a workspace (used for non-persistent workspace GC).
    pub fn unregister_workspace(&self, name: &str) -> Result<()> {
        let removed = self.workspaces.write().remove(name);
        match removed {
            Some(_) => {
                info!(workspace = %name, "Unregistered workspace");
                self.bus
                    .emit(&Event::WorkspaceUnregistered(name.to_string()));
                Ok(())
            }
            None => Err(Error::NotFound(format!("workspace {name}"))),
        }
    }

    /// Looks up a workspace by name.
    pub fn get_workspace(&self, name: &str) -> Option<Arc<Workspace>> {
        self.workspaces.read().get(name).cloned()
    }

    /// Snapshot of all workspaces.
    pub fn list_workspaces(&self) -> Vec<Arc<Workspace>> {
        let mut all: Vec<Arc<Workspace>> = self.workspaces.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// User-facing workspace creation: stamps the creating user as owner,
    /// grants the workspace scope to the user, then registers.
    pub fn create_workspace(
        &self,
        ctx: &CallContext,
        mut info: WorkspaceInfo,
    ) -> Result<Arc<Workspace>> {
        let user = ctx.user();
        let owner = user.owner_id().to_string();
        if !info.owners.iter().any(|o| o == &owner) {
            info.owners.push(owner);
        }
        info.owners = info
            .owners
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        let workspace = self.register_workspace(info)?;
        ctx.grant_scope(workspace.name());
        Ok(workspace)
    }

    /// Applies a metadata patch to a workspace the caller belongs to.
    pub fn update_workspace(
        &self,
        ctx: &CallContext,
        name: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let workspace = self
            .get_workspace(name)
            .ok_or_else(|| Error::NotFound(format!("workspace {name}")))?;
        if !workspace.check_permission(&ctx.user()) {
            return Err(Error::Forbidden(format!("workspace {name}")));
        }
        workspace.update_info(patch)
    }

    /// Registers a service provided by the calling plugin in the context
    /// workspace. Returns the service id `"<workspace>/<name>"`.
    pub fn register_service(&self, ctx: &CallContext, spec: ServiceSpec) -> Result<String> {
        let plugin = ctx
            .plugin
            .as_ref()
            .ok_or_else(|| Error::BadRequest("register_service requires a plugin caller".into()))?;
        let workspace = &ctx.workspace;
        let id = format!("{}/{}", workspace.name(), spec.name);
        let config = ServiceConfig {
            id: id.clone(),
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            workspace: workspace.name().to_string(),
            visibility: spec.visibility,
            require_context: spec.require_context,
            provider: plugin.name.clone(),
            provider_id: plugin.id.clone(),
        };
        let service = Arc::new(ServiceInfo {
            config,
            body: spec.body,
            provider: Arc::clone(plugin),
        });
        let replaced = workspace.add_service(Arc::clone(&service));
        if let Some(old) = replaced {
            debug!(service = %id, "Replaced service registration");
            self.bus.emit(&Event::ServiceUnregistered(old));
        }
        info!(service = %id, provider = %plugin.id, "Registered service");
        self.bus.emit(&Event::ServiceRegistered(service));
        Ok(id)
    }

    /// Resolves a service id, enforcing the visibility rules.
    pub fn get_service(&self, ctx: &CallContext, service_id: &str) -> Result<Arc<ServiceInfo>> {
        let (ws_name, svc_name) = service_id.split_once('/').ok_or_else(|| {
            Error::BadRequest(format!(
                "invalid service id, expected <workspace>/<name>: {service_id}"
            ))
        })?;
        let workspace = self
            .get_workspace(ws_name)
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))?;
        let service = workspace
            .get_service(svc_name)
            .ok_or_else(|| Error::NotFound(format!("service {service_id}")))?;
        let user = ctx.user();
        if service.config.visibility != Visibility::Public && !workspace.check_permission(&user) {
            return Err(Error::Forbidden(format!("service {service_id}")));
        }
        Ok(service)
    }

    /// Lists service configs matching a query; protected services are
    /// filtered by workspace membership.
    pub fn list_services(
        &self,
        ctx: &CallContext,
        query: &ServiceQuery,
    ) -> Result<Vec<serde_json::Value>> {
        let user = ctx.user();
        match query.workspace.as_deref() {
            Some("*") => {
                let mut out = Vec::new();
                for workspace in self.list_workspaces() {
                    let member = workspace.check_permission(&user);
                    for service in workspace.services() {
                        if !member && service.config.visibility != Visibility::Public {
                            continue;
                        }
                        let config = serde_json::to_value(&service.config)
                            .unwrap_or(serde_json::Value::Null);
                        if query.matches(&config) {
                            out.push(config);
                        }
                    }
                }
                Ok(out)
            }
            other => {
                let workspace = match other {
                    Some(name) => self
                        .get_workspace(name)
                        .ok_or_else(|| Error::NotFound(format!("workspace {name}")))?,
                    None => Arc::clone(&ctx.workspace),
                };
                let member = workspace.check_permission(&user);
                let mut out = Vec::new();
                for service in workspace.services() {
                    if !member && service.config.visibility != Visibility::Public {
                        continue;
                    }
                    let config =
                        serde_json::to_value(&service.config).unwrap_or(serde_json::Value::Null);
                    if query.matches(&config) {
                        out.push(config);
                    }
                }
                Ok(out)
            }
        }
    }

    /// Removes a plugin from its workspace together with its services and
    /// emits the corresponding events.
    pub fn remove_plugin(&self, workspace: &Arc<Workspace>, name: &str) -> Result<Arc<Plugin>> {
        let (plugin, services) = workspace.remove_plugin(name)?;
        for service in services {
            info!(service = %service.config.id, "Removing service of terminated plugin");
            self.bus.emit(&Event::ServiceUnregistered(service));
        }
        self.bus.emit(&Event::PluginTerminated(Arc::clone(&plugin)));
        Ok(plugin)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry({} workspaces)", self.workspaces.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PluginFlags;

    fn test_registry() -> Registry {
        Registry::new(Arc::new(EventBus::new()))
    }

    fn test_user(id: &str) -> UserInfo {
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

    fn test_plugin(id: &str, name: &str, workspace: &str) -> Arc<Plugin> {
        Arc::new(Plugin::new(
            id,
            name,
            "native",
            workspace,
            "alice",
            format!("secret-{id}"),
            "session-1",
            PluginFlags::default(),
            serde_json::json!({}),
        ))
    }

    fn plugin_ctx(registry: &Registry, ws: &str, user: &str, plugin: Arc<Plugin>) -> CallContext {
        let workspace = registry.get_workspace(ws).unwrap();
        CallContext::new(test_user(user), workspace).with_plugin(plugin)
    }

    fn echo_spec(name: &str, visibility: Visibility) -> ServiceSpec {
        ServiceSpec {
            name: name.into(),
            kind: "echo".into(),
            visibility,
            require_context: false,
            body: RpcValue::map([("echo", RpcValue::from("stub"))]),
        }
    }

    #[test]
    fn reserved_workspaces_exist() {
        let registry = test_registry();
        assert!(registry.get_workspace(PUBLIC_WORKSPACE).is_some());
        assert!(registry.get_workspace(ROOT_WORKSPACE).is_some());
    }

    #[test]
    fn duplicate_workspace_is_rejected() {
        let registry = test_registry();
        let info = WorkspaceInfo::new("lab", vec!["alice".into()]);
        registry.register_workspace(info.clone()).unwrap();
        let err = registry.register_workspace(info).unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[test]
    fn create_workspace_appends_owner_and_scope() {
        let registry = test_registry();
        let public = registry.get_workspace(PUBLIC_WORKSPACE).unwrap();
        let ctx = CallContext::new(test_user("alice"), public);
        let info = WorkspaceInfo::new("lab", vec!["bob".into()]);
        let workspace = registry.create_workspace(&ctx, info).unwrap();
        let owners = workspace.info().owners;
        assert!(owners.contains(&"alice".to_string()));
        assert!(owners.contains(&"bob".to_string()));
        assert!(ctx.user().scopes.contains(&"lab".to_string()));
    }

    #[test]
    fn service_registration_and_lookup() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let plugin = test_plugin("p1", "worker", "lab");
        registry
            .get_workspace("lab")
            .unwrap()
            .add_plugin(Arc::clone(&plugin));
        let ctx = plugin_ctx(&registry, "lab", "alice", plugin);
        let id = registry
            .register_service(&ctx, echo_spec("echo", Visibility::Protected))
            .unwrap();
        assert_eq!(id, "lab/echo");
        let service = registry.get_service(&ctx, "lab/echo").unwrap();
        assert_eq!(service.config.provider_id, "p1");
    }

    #[test]
    fn protected_service_denied_to_non_member() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let plugin = test_plugin("p1", "worker", "lab");
        registry
            .get_workspace("lab")
            .unwrap()
            .add_plugin(Arc::clone(&plugin));
        let ctx = plugin_ctx(&registry, "lab", "alice", plugin);
        registry
            .register_service(&ctx, echo_spec("echo", Visibility::Protected))
            .unwrap();

        let public = registry.get_workspace(PUBLIC_WORKSPACE).unwrap();
        let outsider = CallContext::new(test_user("mallory"), public);
        let err = registry.get_service(&outsider, "lab/echo").unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
    }

    #[test]
    fn public_service_visible_to_anonymous() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let plugin = test_plugin("p1", "worker", "lab");
        registry
            .get_workspace("lab")
            .unwrap()
            .add_plugin(Arc::clone(&plugin));
        let ctx = plugin_ctx(&registry, "lab", "alice", plugin);
        registry
            .register_service(&ctx, echo_spec("echo", Visibility::Public))
            .unwrap();

        let public = registry.get_workspace(PUBLIC_WORKSPACE).unwrap();
        let anon = CallContext::new(UserInfo::anonymous(), public);
        assert!(registry.get_service(&anon, "lab/echo").is_ok());
        let query = ServiceQuery {
            workspace: Some("*".into()),
            filters: BTreeMap::new(),
        };
        let listed = registry.list_services(&anon, &query).unwrap();
        assert!(listed.iter().any(|c| c["id"] == "lab/echo"));
    }

    #[test]
    fn remove_plugin_removes_its_services() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let workspace = registry.get_workspace("lab").unwrap();
        let plugin = test_plugin("p1", "worker", "lab");
        workspace.add_plugin(Arc::clone(&plugin));
        let ctx = plugin_ctx(&registry, "lab", "alice", Arc::clone(&plugin));
        registry
            .register_service(&ctx, echo_spec("echo", Visibility::Public))
            .unwrap();

        registry.remove_plugin(&workspace, "worker").unwrap();
        assert!(workspace.get_plugin("worker").is_none());
        let err = registry.get_service(&ctx, "lab/echo").unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn same_name_plugin_is_swapped_out() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let workspace = registry.get_workspace("lab").unwrap();
        assert!(workspace.add_plugin(test_plugin("p1", "worker", "lab")).is_none());
        let evicted = workspace
            .add_plugin(test_plugin("p2", "worker", "lab"))
            .expect("first plugin should be evicted");
        assert_eq!(evicted.id, "p1");
        assert_eq!(workspace.get_plugin("worker").unwrap().id, "p2");
    }

    #[test]
    fn service_reregistration_replaces_provider_reference() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let workspace = registry.get_workspace("lab").unwrap();
        let first = test_plugin("p1", "worker", "lab");
        workspace.add_plugin(Arc::clone(&first));
        let ctx = plugin_ctx(&registry, "lab", "alice", first);
        registry
            .register_service(&ctx, echo_spec("echo", Visibility::Public))
            .unwrap();

        let second = test_plugin("p2", "worker2", "lab");
        workspace.add_plugin(Arc::clone(&second));
        let ctx2 = plugin_ctx(&registry, "lab", "alice", second);
        registry
            .register_service(&ctx2, echo_spec("echo", Visibility::Public))
            .unwrap();

        let service = registry.get_service(&ctx2, "lab/echo").unwrap();
        assert_eq!(service.config.provider_id, "p2");
    }

    #[test]
    fn update_workspace_rejects_name_change() {
        let registry = test_registry();
        registry
            .register_workspace(WorkspaceInfo::new("lab", vec!["alice".into()]))
            .unwrap();
        let public = registry.get_workspace(PUBLIC_WORKSPACE).unwrap();
        let ctx = CallContext::new(test_user("alice"), public);
        let mut patch = serde_json::Map::new();
        patch.insert("name".into(), serde_json::json!("renamed"));
        let err = registry.update_workspace(&ctx, "lab", &patch).unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }
}
