//! The engine root object.
//!
//! [`Engine`] owns every subsystem — registry, auth, supervisor, channel
//! router, session manager, object store — and implements the websocket
//! protocol callbacks. There are no global singletons; subsystems receive
//! the engine by `Arc` at construction.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use gantry_auth::Auth;
use gantry_core::{
    CallContext, Error, Event, EventBus, LogRecord, Plugin, PluginFlags, PluginState, Registry,
    Result, RpcValue, UserInfo, WorkspaceInfo, plugin_signature,
};
use gantry_gateway::{GatewayState, gateway_router};
use gantry_rpc::{DEFAULT_READY_TIMEOUT, Frame, Packet, PeerEvents, RpcPeer};
use gantry_supervisor::{KillOutcome, LaunchEvent, LaunchSpec, Supervisor, SupervisorConfig};
use gantry_transport::{
    ChannelRouter, ClientSession, ControlEnvelope, ControlReply, ControlRequest, EngineHandler,
    RawMessage, SessionManager, channel_secret, message_from_plugin, mint_secret, to_plugin,
    websocket_router,
};

use crate::builtin;
use crate::config::GantryConfig;
use crate::objectstore::{LocalObjectStore, ObjectStore};
use crate::workdir::EngineWorkdir;

/// The broker's root object.
pub struct Engine {
    /// Effective configuration.
    pub config: GantryConfig,
    workdir: EngineWorkdir,
    /// Lifecycle event bus.
    pub bus: Arc<EventBus>,
    /// Workspace/plugin/service authority.
    pub registry: Arc<Registry>,
    /// Token validation and minting.
    pub auth: Arc<Auth>,
    /// Subprocess lifecycle owner.
    pub supervisor: Arc<Supervisor>,
    /// Per-secret channel fan-out.
    pub router: Arc<ChannelRouter>,
    /// Client session tracking.
    pub sessions: Arc<SessionManager>,
    /// Object-store bridge.
    pub objectstore: Arc<dyn ObjectStore>,
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    peers: RwLock<HashMap<String, Arc<RpcPeer>>>,
    secrets: RwLock<HashMap<String, String>>,
    owners: RwLock<HashMap<String, Arc<ClientSession>>>,
    log_writers: Mutex<HashMap<String, WorkspaceLogWriter>>,
    fatal_rx: Mutex<Option<mpsc::Receiver<i32>>>,
}

type WorkspaceLogWriter = (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
);

impl Engine {
    /// Builds the engine: bootstraps the workspace root, probes conda,
    /// and wires every subsystem together.
    pub fn new(config: GantryConfig) -> Result<Arc<Self>> {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(Arc::clone(&bus)));
        let auth = Arc::new(Auth::new((&config.auth).into()));
        let workdir =
            EngineWorkdir::bootstrap(&config.supervisor.workspace_root, config.token.clone())?;
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            workspace_root: config.supervisor.workspace_root.clone(),
            force_quit_timeout: Duration::from_secs(config.supervisor.force_quit_timeout_secs),
            freeze: config.supervisor.freeze,
            server_url: config.server.local_url(),
        }));
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let sessions = Arc::new(SessionManager::new(fatal_tx));
        let objectstore: Arc<dyn ObjectStore> =
            Arc::new(LocalObjectStore::new("http://127.0.0.1:9000", "gantry"));

        Ok(Arc::new(Self {
            config,
            workdir,
            bus,
            registry,
            auth,
            supervisor,
            router: Arc::new(ChannelRouter::new()),
            sessions,
            objectstore,
            plugins: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            secrets: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            log_writers: Mutex::new(HashMap::new()),
            fatal_rx: Mutex::new(Some(fatal_rx)),
        }))
    }

    /// Appends a line to the workspace's rolling log file.
    fn append_workspace_log(&self, workspace: &str, plugin: &str, line: &str) {
        if !self.config.logging.workspace_files {
            return;
        }
        let mut writers = self.log_writers.lock();
        if !writers.contains_key(workspace) {
            match crate::logging::workspace_log_writer(
                &self.config.supervisor.workspace_root,
                workspace,
            ) {
                Ok(writer) => {
                    writers.insert(workspace.to_string(), writer);
                }
                Err(e) => {
                    warn!(workspace = %workspace, error = %e, "Failed to open workspace log");
                    return;
                }
            }
        }
        if let Some((writer, _guard)) = writers.get_mut(workspace) {
            use std::io::Write;
            let _ = writeln!(writer, "[{plugin}] {line}");
        }
    }

    /// The engine connection token.
    pub fn engine_token(&self) -> &str {
        &self.workdir.token
    }

    /// Looks up a plugin record by id.
    pub fn plugin(&self, plugin_id: &str) -> Option<Arc<Plugin>> {
        self.plugins.read().get(plugin_id).cloned()
    }

    /// Looks up a peer by plugin id.
    pub fn peer(&self, plugin_id: &str) -> Option<Arc<RpcPeer>> {
        self.peers.read().get(plugin_id).cloned()
    }

    fn plugin_by_secret(&self, secret: &str) -> Option<Arc<Plugin>> {
        let plugin_id = self.secrets.read().get(secret).cloned()?;
        self.plugin(&plugin_id)
    }

    fn owner(&self, plugin_id: &str) -> Option<Arc<ClientSession>> {
        self.owners.read().get(plugin_id).cloned()
    }

    /// The plugin-api bundle of a ready plugin, used by `get_plugin`.
    pub async fn plugin_api(&self, plugin_id: &str) -> Result<RpcValue> {
        let peer = self
            .peer(plugin_id)
            .ok_or_else(|| Error::NotFound(format!("plugin {plugin_id}")))?;
        peer.wait_ready(DEFAULT_READY_TIMEOUT).await?;
        let remote = peer
            .remote_interface()
            .ok_or_else(|| Error::PluginNotReady(plugin_id.to_string()))?;
        let mut map = match remote {
            RpcValue::Map(map) => map,
            _ => Default::default(),
        };
        map.insert(
            "__jailed_type__".to_string(),
            RpcValue::from("plugin_api"),
        );
        map.insert("__id__".to_string(), RpcValue::from(plugin_id));
        Ok(RpcValue::Map(map))
    }

    fn get_or_create_workspace(
        &self,
        name: &str,
        user: &UserInfo,
    ) -> Result<Arc<gantry_core::Workspace>> {
        if let Some(workspace) = self.registry.get_workspace(name) {
            return Ok(workspace);
        }
        let info = WorkspaceInfo::new(name, vec![user.owner_id().to_string()]);
        self.registry.register_workspace(info)
    }

    // -------------------------------------------------------------------------
    // Plugin lifecycle
    // -------------------------------------------------------------------------

    /// Handles `init_plugin`: resume by signature when possible, otherwise
    /// create the records, the peer, and kick off the launch pipeline.
    ///
    /// Resolves once the worker process has started (or the pipeline
    /// failed), so install failures surface as the reply.
    pub async fn init_plugin(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        plugin_id: String,
        config: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let user = session.user();
        let name = config
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&plugin_id)
            .to_string();
        let kind = config
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("native-python")
            .to_string();
        let tag = config
            .get("tag")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let cmd = config
            .get("cmd")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&self.config.supervisor.default_cmd)
            .to_string();
        let requirements: Vec<String> = config
            .get("requirements")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default();
        let flags_list: Vec<String> = config
            .get("flags")
            .and_then(|f| serde_json::from_value(f.clone()).ok())
            .unwrap_or_default();
        let flags = PluginFlags::from_list(&flags_list);
        let workspace_name = config
            .get("workspace")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&session.workspace)
            .to_string();

        let workspace = self.get_or_create_workspace(&workspace_name, &user)?;
        if !workspace.check_permission(&user) {
            return Err(Error::Forbidden(format!("workspace {workspace_name}")));
        }
        let work_dir = self.supervisor.work_dir(&workspace_name)?;

        info!(
            plugin = %plugin_id, name = %name, cmd = %cmd, workspace = %workspace_name,
            "Initializing plugin"
        );

        let signature =
            plugin_signature(flags, &session.client_id, &workspace_name, &name, &tag);
        if let Some(signature) = &signature
            && let Some(existing_id) = self
                .sessions
                .resume_plugin_session(&session.session_id, signature)
        {
            if let Some(mut aborting) = self.supervisor.aborting(&existing_id) {
                info!(plugin = %existing_id, "Waiting for plugin to abort before respawn");
                let _ = aborting.wait_for(|done| *done).await;
            } else if let Some(existing) = self.plugin(&existing_id) {
                debug!(plugin = %existing_id, "Plugin already initialized, resuming");
                self.owners
                    .write()
                    .insert(existing_id.clone(), Arc::clone(session));
                return Ok(serde_json::json!({
                    "success": true,
                    "resumed": true,
                    "initialized": true,
                    "secret": existing.secret,
                    "work_dir": work_dir,
                }));
            }
        }

        let secret = mint_secret();
        let plugin = Arc::new(
            Plugin::new(
                plugin_id.clone(),
                name.clone(),
                kind,
                workspace_name.clone(),
                user.id.clone(),
                secret.clone(),
                session.session_id.clone(),
                flags,
                config.clone(),
            )
            .with_signature(signature.clone()),
        );

        // a same-named plugin is replaced immediately; its termination is
        // scheduled, never awaited here
        if let Some(evicted) = workspace.add_plugin(Arc::clone(&plugin)) {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let _ = engine.kill_plugin(&evicted.id).await;
            });
        }
        self.plugins
            .write()
            .insert(plugin_id.clone(), Arc::clone(&plugin));
        self.secrets
            .write()
            .insert(secret.clone(), plugin_id.clone());
        self.owners
            .write()
            .insert(plugin_id.clone(), Arc::clone(session));
        self.sessions.bind_plugin(&session.session_id, &plugin_id);
        if let Some(signature) = &signature {
            self.sessions.record_signature(signature, &plugin_id);
        }

        // the peer: its outbound frames flow to the worker's channel
        let (peer_tx, mut peer_rx) = mpsc::channel::<Packet>(256);
        let peer = RpcPeer::new(plugin_id.clone(), peer_tx);
        let ctx = CallContext::new(user, Arc::clone(&workspace)).with_plugin(Arc::clone(&plugin));
        peer.set_local_interface(builtin::workspace_api(self, ctx));
        peer.set_events(Arc::new(EnginePeerEvents {
            engine: Arc::downgrade(self),
            plugin_id: plugin_id.clone(),
        }));
        self.peers
            .write()
            .insert(plugin_id.clone(), Arc::clone(&peer));
        {
            let router = Arc::clone(&self.router);
            let channel = to_plugin(&secret);
            tokio::spawn(async move {
                while let Some(packet) = peer_rx.recv().await {
                    if let Err(e) = router.dispatch(&channel, packet).await {
                        debug!(channel = %channel, error = %e, "Dropping outbound frame");
                    }
                }
            });
        }

        // launch pipeline on a supervisor thread
        let spec = LaunchSpec {
            plugin_id: plugin_id.clone(),
            name,
            tag,
            env: config.get("env").cloned(),
            requirements,
            cmd,
            work_dir: work_dir.clone(),
            server_url: self.config.server.local_url(),
            secret: secret.clone(),
        };
        let mut events = self.supervisor.launch(spec);

        let (decided_tx, decided_rx) = oneshot::channel::<std::result::Result<(), String>>();
        {
            let engine = Arc::clone(self);
            let session = Arc::clone(session);
            let plugin = Arc::clone(&plugin);
            let secret = secret.clone();
            tokio::spawn(async move {
                let mut decided_tx = Some(decided_tx);
                while let Some(event) = events.recv().await {
                    match event {
                        LaunchEvent::Log { kind, message } => {
                            plugin.push_log(LogRecord {
                                kind: kind.clone(),
                                value: serde_json::Value::String(message.clone()),
                            });
                            engine.append_workspace_log(&plugin.workspace, &plugin.name, &message);
                            let frame = Frame::Logging {
                                details: serde_json::json!({ "type": kind, "value": message }),
                            };
                            let _ = session
                                .send_channel(&message_from_plugin(&secret), &Packet::frame(frame))
                                .await;
                        }
                        LaunchEvent::Progress(value) => {
                            let frame = Frame::Logging {
                                details: serde_json::json!({ "type": "progress", "value": value }),
                            };
                            let _ = session
                                .send_channel(&message_from_plugin(&secret), &Packet::frame(frame))
                                .await;
                        }
                        LaunchEvent::Started { pid } => {
                            plugin.set_process_id(Some(pid));
                            if let Some(tx) = decided_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        LaunchEvent::Exited { success, message } => {
                            if let Some(tx) = decided_tx.take() {
                                if !success {
                                    let _ = tx.send(Err(message.clone()));
                                    engine.cleanup_plugin(&plugin.id, false, &message).await;
                                    continue;
                                }
                                let _ = tx.send(Ok(()));
                            }
                            engine.cleanup_plugin(&plugin.id, success, &message).await;
                        }
                    }
                }
            });
        }

        match decided_rx.await {
            Ok(Ok(())) => Ok(serde_json::json!({
                "success": true,
                "initialized": false,
                "secret": secret,
                "work_dir": work_dir,
            })),
            Ok(Err(reason)) => Err(Error::InstallFailed {
                exit_code: 1,
                stderr: reason,
            }),
            Err(_) => Err(Error::LaunchFailed("launch pipeline vanished".into())),
        }
    }

    /// Gracefully kills a plugin: disconnect frame, grace window, forced
    /// process-group kill, registry cleanup.
    pub async fn kill_plugin(self: &Arc<Self>, plugin_id: &str) -> Result<KillOutcome> {
        let plugin = self
            .plugin(plugin_id)
            .ok_or_else(|| Error::NotFound(format!("plugin {plugin_id}")))?;
        info!(plugin = %plugin_id, "Killing plugin");
        plugin.set_state(PluginState::Terminating);
        let peer = self.peer(plugin_id);
        let outcome = self.supervisor.kill_plugin(plugin_id, peer.as_ref()).await;
        let message = match outcome {
            KillOutcome::Graceful => "plugin exited normally".to_string(),
            KillOutcome::Forced => "plugin was force-killed".to_string(),
        };
        self.cleanup_plugin(plugin_id, outcome == KillOutcome::Graceful, &message)
            .await;
        Ok(outcome)
    }

    /// Removes every trace of a plugin and notifies its session.
    async fn cleanup_plugin(self: &Arc<Self>, plugin_id: &str, success: bool, message: &str) {
        let Some(plugin) = self.plugins.write().remove(plugin_id) else {
            return;
        };
        plugin.set_state(PluginState::Disconnected);
        self.secrets.write().remove(&plugin.secret);
        if let Some(peer) = self.peers.write().remove(plugin_id) {
            peer.mark_gone();
        }
        if let Some(signature) = &plugin.signature {
            self.sessions.remove_signature(signature);
        }
        self.sessions.unbind_plugin(plugin_id);
        self.router.unregister(&to_plugin(&plugin.secret));

        if let Some(workspace) = self.registry.get_workspace(&plugin.workspace) {
            // only remove the registry entry if it still points at us (a
            // same-named replacement may already own the name)
            let still_ours = workspace
                .get_plugin(&plugin.name)
                .is_some_and(|current| current.id == plugin.id);
            if still_ours {
                let _ = self.registry.remove_plugin(&workspace, &plugin.name);
            }
            let info = workspace.info();
            if !info.persistent && workspace.plugin_names().is_empty() {
                let _ = self.registry.unregister_workspace(workspace.name());
            }
        }

        let owner = self.owners.write().remove(plugin_id);
        if let Some(owner) = owner {
            let frame = Frame::Disconnected {
                details: serde_json::json!({ "success": success, "message": message }),
            };
            let _ = owner
                .send_channel(&message_from_plugin(&plugin.secret), &Packet::frame(frame))
                .await;
        }
        info!(plugin = %plugin_id, success, "Plugin cleaned up");
    }

    // -------------------------------------------------------------------------
    // Serving
    // -------------------------------------------------------------------------

    /// Binds the listener and serves until a shutdown signal or a fatal
    /// condition (e.g. the bad-token backstop). Returns the process exit
    /// code. A port conflict at startup is fatal.
    pub async fn serve(self: &Arc<Self>) -> Result<i32> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            Error::Internal(format!(
                "failed to open port {}: {e}; terminate the process using it or pick another",
                self.config.server.port
            ))
        })?;

        let cors = if self.config.server.allow_origins.is_empty() {
            tower_http::cors::CorsLayer::permissive()
        } else {
            let origins: Vec<axum::http::HeaderValue> = self
                .config
                .server
                .allow_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            tower_http::cors::CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        };

        let handler: Arc<dyn EngineHandler> = Arc::new(EngineBridge(Arc::clone(self)));
        let gateway_state = Arc::new(GatewayState {
            registry: Arc::clone(&self.registry),
            auth: Arc::clone(&self.auth),
        });
        let app = websocket_router(handler)
            .merge(gateway_router(gateway_state))
            .layer(cors);

        info!(addr = %addr, "Gantry engine listening");
        info!("Connection token: {}", self.workdir.token);

        let mut fatal_rx = self
            .fatal_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("engine already served".into()))?;

        let exit_code = tokio::select! {
            result = axum::serve(listener, app) => {
                match result {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(error = %e, "Server error");
                        1
                    }
                }
            }
            code = fatal_rx.recv() => code.unwrap_or(1),
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                0
            }
        };

        self.shutdown().await;
        Ok(exit_code)
    }

    /// Terminates every plugin and removes the pid file.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Shutting down the engine");
        let plugin_ids: Vec<String> = self.plugins.read().keys().cloned().collect();
        for plugin_id in plugin_ids {
            let _ = self.kill_plugin(&plugin_id).await;
        }
        self.workdir.remove_pid();
    }

    async fn handle_worker_frame(
        self: &Arc<Self>,
        secret: &str,
        packet: Packet,
        outbound: &mpsc::Sender<RawMessage>,
    ) -> Result<()> {
        let plugin = self
            .plugin_by_secret(secret)
            .ok_or_else(|| Error::Unauthorized("unknown plugin secret".into()))?;
        let peer = self
            .peer(&plugin.id)
            .ok_or_else(|| Error::PluginGone(plugin.id.clone()))?;

        // bind the worker's socket to the to_plugin channel on first
        // contact so the peer's outbound frames can reach it
        let channel = to_plugin(secret);
        if !self.router.has_channel(&channel) {
            let (tx, mut rx) = mpsc::channel::<Packet>(256);
            self.router.register(channel.clone(), tx);
            let outbound = outbound.clone();
            let channel_name = channel.clone();
            tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    match gantry_transport::encode_channel_message(&channel_name, &packet) {
                        Ok((text, binaries)) => {
                            if outbound.send(RawMessage { text, binaries }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to encode outbound frame");
                        }
                    }
                }
            });
        }

        // lifecycle frames are mirrored to the owning session
        if let Some(frame) = &packet.frame
            && matches!(
                frame,
                Frame::Initialized { .. }
                    | Frame::ExecuteSuccess
                    | Frame::ExecuteFailure { .. }
                    | Frame::Disconnected { .. }
                    | Frame::Logging { .. }
            )
            && let Some(owner) = self.owner(&plugin.id)
        {
            let _ = owner
                .send_channel(&message_from_plugin(secret), &Packet::frame(frame.clone()))
                .await;
        }

        peer.handle_packet(packet).await
    }

    async fn handle_control_request(
        self: &Arc<Self>,
        session: &Arc<ClientSession>,
        envelope: ControlEnvelope,
    ) -> ControlReply {
        let request_id = envelope.request_id;
        let result = match envelope.request {
            ControlRequest::RegisterClient { .. } => {
                Err(Error::BadRequest("client is already registered".into()))
            }
            ControlRequest::InitPlugin { id, config } => {
                self.init_plugin(session, id, config).await
            }
            ControlRequest::KillPlugin { id } => {
                let allowed = self.plugin(&id).map(|plugin| {
                    let user = session.user();
                    plugin.user_id == user.id
                        || user.is_admin()
                        || plugin.session_id == session.session_id
                });
                match allowed {
                    None => Err(Error::NotFound(format!("plugin {id}"))),
                    Some(false) => Err(Error::Forbidden(format!("plugin {id}"))),
                    Some(true) => self
                        .kill_plugin(&id)
                        .await
                        .map(|_| serde_json::json!({ "success": true })),
                }
            }
            ControlRequest::KillPluginProcess { pid, all } => {
                if !session.user().is_admin() {
                    Err(Error::Forbidden("admin role required".into()))
                } else if all {
                    for (_, pid) in self.supervisor.process_ids() {
                        self.supervisor.kill_process(pid);
                    }
                    Ok(serde_json::json!({ "success": true }))
                } else {
                    self.supervisor.kill_process(pid);
                    Ok(serde_json::json!({ "success": true }))
                }
            }
            ControlRequest::EngineStatus => Ok(serde_json::json!({
                "success": true,
                "plugin_num": self.plugins.read().len(),
                "plugin_processes": self
                    .supervisor
                    .process_ids()
                    .iter()
                    .map(|(id, pid)| serde_json::json!({ "id": id, "pid": pid }))
                    .collect::<Vec<_>>(),
                "session_num": self.sessions.session_count(),
            })),
            ControlRequest::ResetEngine => {
                let mine: Vec<String> = self
                    .owners
                    .read()
                    .iter()
                    .filter(|(_, owner)| owner.sid == session.sid)
                    .map(|(plugin_id, _)| plugin_id.clone())
                    .collect();
                for plugin_id in mine {
                    let _ = self.kill_plugin(&plugin_id).await;
                }
                Ok(serde_json::json!({ "success": true }))
            }
        };
        match result {
            Ok(payload) => ControlReply::ok(request_id, payload),
            Err(error) => ControlReply::error(request_id, &error),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("plugins", &self.plugins.read().len())
            .field("sessions", &self.sessions.session_count())
            .finish()
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Peer lifecycle hooks: handshake on `initialized`, cleanup on
/// `disconnected`, log-history capture.
struct EnginePeerEvents {
    engine: Weak<Engine>,
    plugin_id: String,
}

impl PeerEvents for EnginePeerEvents {
    fn on_initialized(&self, _config: serde_json::Value) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let plugin_id = self.plugin_id.clone();
        tokio::spawn(async move {
            if let Some(peer) = engine.peer(&plugin_id) {
                // publish our interface, then ask for the peer's
                if let Err(e) = peer.send_interface().await {
                    warn!(plugin = %plugin_id, error = %e, "Failed to send interface");
                    return;
                }
                let _ = peer.request_remote().await;
            }
            let Some(plugin) = engine.plugin(&plugin_id) else {
                return;
            };
            plugin.set_state(PluginState::Ready);
            engine.bus.emit(&Event::PluginRegistered(Arc::clone(&plugin)));

            // native plugins that allow execution receive their script now
            if plugin.flags.allow_execution
                && let Some(script) = plugin
                    .config
                    .get("script")
                    .and_then(serde_json::Value::as_str)
                && let Some(peer) = engine.peer(&plugin_id)
            {
                let code = serde_json::json!({ "type": "script", "content": script });
                if let Err(e) = peer.execute(code).await {
                    error!(plugin = %plugin_id, error = %e, "Killing plugin after execution failure");
                    let _ = engine.kill_plugin(&plugin_id).await;
                }
            }
        });
    }

    fn on_disconnect_request(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let plugin_id = self.plugin_id.clone();
        tokio::spawn(async move {
            let _ = engine.kill_plugin(&plugin_id).await;
        });
    }

    fn on_disconnected(&self, details: serde_json::Value) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let plugin_id = self.plugin_id.clone();
        let success = details
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let message = details
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        tokio::spawn(async move {
            engine.cleanup_plugin(&plugin_id, success, &message).await;
        });
    }

    fn on_log(&self, details: serde_json::Value) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Some(plugin) = engine.plugin(&self.plugin_id) {
            plugin.push_log(LogRecord {
                kind: details
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("info")
                    .to_string(),
                value: details
                    .get("value")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            });
        }
    }
}

// =============================================================================
// Websocket protocol callbacks
// =============================================================================

/// Adapter giving the protocol callbacks an owned engine handle.
pub struct EngineBridge(pub Arc<Engine>);

#[async_trait]
impl EngineHandler for EngineBridge {
    async fn authenticate(
        &self,
        authorization: Option<String>,
        query: HashMap<String, String>,
    ) -> Result<UserInfo> {
        match authorization {
            Some(authorization) => self
                .0
                .auth
                .valid_token(&authorization, Some(&query))
                .await
                .map_err(Error::from),
            None => Ok(UserInfo::anonymous()),
        }
    }

    async fn register_client(
        &self,
        sid: &str,
        user: &UserInfo,
        outbound: mpsc::Sender<RawMessage>,
        request: ControlRequest,
    ) -> Result<(Arc<ClientSession>, serde_json::Value)> {
        let engine = &self.0;
        let ControlRequest::RegisterClient {
            id,
            workspace,
            session_id,
            token,
        } = request
        else {
            return Err(Error::BadRequest("expected register_client".into()));
        };
        engine
            .sessions
            .check_engine_token(&engine.workdir.token, token.as_deref())?;

        let client_id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let workspace = workspace.unwrap_or_else(|| "default".to_string());
        engine.get_or_create_workspace(&workspace, user)?;

        let session = ClientSession::new(
            sid,
            client_id.clone(),
            session_id.clone(),
            workspace.clone(),
            user.clone(),
            outbound,
        );
        let already_connected = engine.sessions.add_session(Arc::clone(&session));
        if !already_connected {
            engine
                .bus
                .emit(&Event::UserConnected(Arc::new(user.clone())));
        }
        info!(sid = %sid, client = %client_id, workspace = %workspace, "Client registered");
        Ok((
            session,
            serde_json::json!({
                "client_id": client_id,
                "session_id": session_id,
                "workspace": workspace,
            }),
        ))
    }

    async fn handle_control(
        &self,
        session: &Arc<ClientSession>,
        envelope: ControlEnvelope,
    ) -> ControlReply {
        self.0.handle_control_request(session, envelope).await
    }

    async fn handle_channel(
        &self,
        _sid: &str,
        session: Option<&Arc<ClientSession>>,
        channel: &str,
        packet: Packet,
        outbound: &mpsc::Sender<RawMessage>,
    ) -> Result<()> {
        let engine = &self.0;
        if let Some(secret) = channel_secret(channel, "from_plugin_") {
            return engine.handle_worker_frame(secret, packet, outbound).await;
        }
        if let Some(secret) = channel_secret(channel, "message_to_plugin_") {
            if session.is_none() {
                return Err(Error::Unauthorized(
                    "session messages require a registered client".into(),
                ));
            }
            // the session wraps plugin-bound frames in a message envelope
            let inner = match packet.frame {
                Some(Frame::Message { data }) => {
                    let frame: Frame = serde_json::from_value(data).map_err(|e| {
                        Error::BadRequest(format!("malformed inner frame: {e}"))
                    })?;
                    Packet::with_attachments(frame, packet.attachments)
                }
                _ => packet,
            };
            return engine.router.dispatch(&to_plugin(secret), inner).await;
        }
        Err(Error::BadRequest(format!("unroutable channel {channel}")))
    }

    async fn on_disconnect(&self, sid: &str, session: Option<&Arc<ClientSession>>) {
        let engine = &self.0;
        let Some(session) = session else {
            return;
        };
        let teardown = engine.sessions.remove_session(sid);
        for plugin_id in teardown.plugin_ids {
            let Some(plugin) = engine.plugin(&plugin_id) else {
                continue;
            };
            if plugin.flags.allow_detach {
                info!(plugin = %plugin_id, "Keeping detachable plugin after session end");
                engine.owners.write().remove(&plugin_id);
                continue;
            }
            let _ = engine.kill_plugin(&plugin_id).await;
        }
        if teardown.client_gone {
            engine
                .bus
                .emit(&Event::UserDisconnected(session.user().id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GantryConfig;

    fn test_engine(root: &std::path::Path) -> Arc<Engine> {
        let mut config = GantryConfig::default();
        config.supervisor.workspace_root = root.to_path_buf();
        config.supervisor.force_quit_timeout_secs = 0;
        config.logging.workspace_files = false;
        config.token = Some("engine-token".into());
        Engine::new(config).unwrap()
    }

    fn test_session(workspace: &str) -> (Arc<ClientSession>, mpsc::Receiver<RawMessage>) {
        let (tx, rx) = mpsc::channel(256);
        let session = ClientSession::new(
            "sid-1",
            "client-1",
            "session-1",
            workspace,
            UserInfo::anonymous(),
            tx,
        );
        (session, rx)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_instance_plugin_resumes_with_same_secret() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (session, _outbound) = test_session("lab");
        let config = serde_json::json!({
            "name": "counter",
            "type": "native-python",
            "tag": "v1",
            "cmd": "sleep 5 ;",
            "flags": ["single-instance"],
            "workspace": "lab",
        });

        let first = engine
            .init_plugin(&session, "p1".into(), config.clone())
            .await
            .unwrap();
        assert_eq!(first["success"], serde_json::json!(true));
        assert_eq!(first["initialized"], serde_json::json!(false));

        let second = engine
            .init_plugin(&session, "p1".into(), config)
            .await
            .unwrap();
        assert_eq!(second["resumed"], serde_json::json!(true));
        assert_eq!(second["initialized"], serde_json::json!(true));
        assert_eq!(second["secret"], first["secret"]);

        engine.kill_plugin("p1").await.unwrap();
        assert!(engine.plugin("p1").is_none());
        assert!(engine.supervisor.aborting("p1").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn install_failure_fails_the_init_call() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (session, _outbound) = test_session("lab");
        let config = serde_json::json!({
            "name": "broken",
            "type": "native-python",
            "cmd": "echo",
            "requirements": ["cmd:echo doesnotexist-package >&2; false"],
            "workspace": "lab",
        });

        let err = engine
            .init_plugin(&session, "p2".into(), config)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InstallFailed");
        assert!(err.to_string().contains("doesnotexist-package"));
        // the failed plugin leaves no records behind
        assert!(engine.plugin("p2").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn session_end_kills_plugins_but_keeps_detached_ones() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let (session, _outbound) = test_session("lab");
        let bridge = EngineBridge(Arc::clone(&engine));
        engine.sessions.add_session(Arc::clone(&session));

        let plain = serde_json::json!({
            "name": "plain", "cmd": "sleep 5 ;", "workspace": "lab",
        });
        let detached = serde_json::json!({
            "name": "sticky", "cmd": "sleep 5 ;", "workspace": "lab",
            "flags": ["allow-detach"],
        });
        engine
            .init_plugin(&session, "plain-1".into(), plain)
            .await
            .unwrap();
        engine
            .init_plugin(&session, "sticky-1".into(), detached)
            .await
            .unwrap();

        bridge.on_disconnect("sid-1", Some(&session)).await;
        assert!(engine.plugin("plain-1").is_none());
        assert!(engine.plugin("sticky-1").is_some());

        engine.kill_plugin("sticky-1").await.unwrap();
    }
}
