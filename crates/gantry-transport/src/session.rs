//! Client sessions.
//!
//! A session is one authenticated websocket connection. All plugins
//! started in a session are garbage-collected with it unless flagged
//! detachable; resumable plugins are tracked by signature so a later
//! session can inherit the running instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gantry_core::{Error, Result, UserInfo};
use gantry_rpc::Packet;

use crate::protocol::{ControlReply, encode_channel_message, encode_control_reply};

/// Bad-token attempts tolerated before the engine process terminates.
pub const MAX_ATTEMPTS: u32 = 1000;

/// Exit code used when the attempt backstop trips.
pub const EXIT_ATTEMPTS_EXHAUSTED: i32 = 100;

/// A websocket payload ready to be written.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// JSON text message.
    pub text: String,
    /// Binary messages following the text frame.
    pub binaries: Vec<Vec<u8>>,
}

/// One authenticated websocket connection.
pub struct ClientSession {
    /// Connection id, unique per socket.
    pub sid: String,
    /// Stable client id (survives reconnects).
    pub client_id: String,
    /// Session id plugins are garbage-collected against.
    pub session_id: String,
    /// Workspace the session operates in.
    pub workspace: String,
    user: RwLock<UserInfo>,
    outbound: mpsc::Sender<RawMessage>,
}

impl ClientSession {
    /// Creates a session around its outbound write queue.
    pub fn new(
        sid: impl Into<String>,
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        workspace: impl Into<String>,
        user: UserInfo,
        outbound: mpsc::Sender<RawMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid: sid.into(),
            client_id: client_id.into(),
            session_id: session_id.into(),
            workspace: workspace.into(),
            user: RwLock::new(user),
            outbound,
        })
    }

    /// Snapshot of the session user.
    pub fn user(&self) -> UserInfo {
        self.user.read().clone()
    }

    /// Replaces the session user (after a successful `register_client`).
    pub fn set_user(&self, user: UserInfo) {
        *self.user.write() = user;
    }

    /// Sends a packet on a channel towards this session's socket.
    pub async fn send_channel(&self, channel: &str, packet: &Packet) -> Result<()> {
        let (text, binaries) = encode_channel_message(channel, packet)?;
        self.outbound
            .send(RawMessage { text, binaries })
            .await
            .map_err(|_| Error::PluginGone(format!("session {} closed", self.sid)))
    }

    /// Sends a control reply towards this session's socket.
    pub async fn send_reply(&self, reply: &ControlReply) -> Result<()> {
        let text = encode_control_reply(reply)?;
        self.outbound
            .send(RawMessage {
                text,
                binaries: Vec::new(),
            })
            .await
            .map_err(|_| Error::PluginGone(format!("session {} closed", self.sid)))
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("sid", &self.sid)
            .field("client_id", &self.client_id)
            .field("session_id", &self.session_id)
            .field("workspace", &self.workspace)
            .finish()
    }
}

/// Mints an opaque 256-bit channel secret.
pub fn mint_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Result of a session disconnect: the plugins that lost their session.
#[derive(Debug, Default)]
pub struct SessionTeardown {
    /// Plugin ids bound to the ended session.
    pub plugin_ids: Vec<String>,
    /// True when this was the client's last session.
    pub client_gone: bool,
}

/// Tracks sessions, their plugins and resumable signatures.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    clients: RwLock<HashMap<String, Vec<String>>>,
    plugin_sessions: RwLock<HashMap<String, Vec<String>>>,
    signatures: RwLock<HashMap<String, String>>,
    attempt_count: AtomicU32,
    fatal_tx: mpsc::Sender<i32>,
}

impl SessionManager {
    /// Creates a manager; `fatal_tx` receives the exit code when the
    /// attempt backstop trips.
    pub fn new(fatal_tx: mpsc::Sender<i32>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            plugin_sessions: RwLock::new(HashMap::new()),
            signatures: RwLock::new(HashMap::new()),
            attempt_count: AtomicU32::new(0),
            fatal_tx,
        }
    }

    /// Number of failed authentication attempts so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }

    /// Verifies the engine connection token, counting failures. At
    /// [`MAX_ATTEMPTS`] the engine is asked to terminate (abuse backstop).
    pub fn check_engine_token(&self, expected: &str, provided: Option<&str>) -> Result<()> {
        if provided == Some(expected) {
            return Ok(());
        }
        let attempts = self.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(attempts, "Engine token mismatch");
        if attempts >= MAX_ATTEMPTS {
            warn!("Max token attempts exceeded, terminating engine");
            let _ = self.fatal_tx.try_send(EXIT_ATTEMPTS_EXHAUSTED);
        }
        Err(Error::Unauthorized("invalid engine token".into()))
    }

    /// Registers an authenticated session. Returns true when the client
    /// already had another live session.
    pub fn add_session(&self, session: Arc<ClientSession>) -> bool {
        let client_id = session.client_id.clone();
        let sid = session.sid.clone();
        self.sessions.write().insert(sid.clone(), session);
        let mut clients = self.clients.write();
        let entry = clients.entry(client_id).or_default();
        let connected = !entry.is_empty();
        entry.push(sid);
        connected
    }

    /// Looks up a session by connection id.
    pub fn get_session(&self, sid: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().get(sid).cloned()
    }

    /// Binds a plugin to its owning session.
    pub fn bind_plugin(&self, session_id: &str, plugin_id: &str) {
        let mut map = self.plugin_sessions.write();
        let entry = map.entry(session_id.to_string()).or_default();
        if !entry.iter().any(|p| p == plugin_id) {
            entry.push(plugin_id.to_string());
        }
    }

    /// Detaches a plugin from every session (on kill).
    pub fn unbind_plugin(&self, plugin_id: &str) {
        let mut map = self.plugin_sessions.write();
        for plugins in map.values_mut() {
            plugins.retain(|p| p != plugin_id);
        }
        map.retain(|_, plugins| !plugins.is_empty());
    }

    /// Records the resume signature of a plugin.
    pub fn record_signature(&self, signature: &str, plugin_id: &str) {
        debug!(signature = %signature, plugin = %plugin_id, "Recording plugin signature");
        self.signatures
            .write()
            .insert(signature.to_string(), plugin_id.to_string());
    }

    /// Drops a resume signature.
    pub fn remove_signature(&self, signature: &str) {
        self.signatures.write().remove(signature);
    }

    /// Resolves a signature to the running plugin, binding the new session
    /// to it.
    pub fn resume_plugin_session(
        &self,
        session_id: &str,
        signature: &str,
    ) -> Option<String> {
        let plugin_id = self.signatures.read().get(signature).cloned()?;
        info!(plugin = %plugin_id, signature = %signature, "Resuming plugin session");
        self.bind_plugin(session_id, &plugin_id);
        Some(plugin_id)
    }

    /// Removes a session, reporting the plugins that lost it.
    pub fn remove_session(&self, sid: &str) -> SessionTeardown {
        let Some(session) = self.sessions.write().remove(sid) else {
            return SessionTeardown::default();
        };
        info!(sid = %sid, "Disconnecting client session");

        let client_gone = {
            let mut clients = self.clients.write();
            if let Some(sids) = clients.get_mut(&session.client_id) {
                sids.retain(|s| s != sid);
                if sids.is_empty() {
                    clients.remove(&session.client_id);
                    true
                } else {
                    false
                }
            } else {
                true
            }
        };

        let plugin_ids = self
            .plugin_sessions
            .write()
            .remove(&session.session_id)
            .unwrap_or_default();

        SessionTeardown {
            plugin_ids,
            client_gone,
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionManager({} sessions, {} signatures)",
            self.sessions.read().len(),
            self.signatures.read().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(sid: &str, client: &str, session_id: &str) -> Arc<ClientSession> {
        let (tx, _rx) = mpsc::channel(4);
        ClientSession::new(sid, client, session_id, "lab", UserInfo::anonymous(), tx)
    }

    #[test]
    fn secrets_are_long_and_unique() {
        let a = mint_secret();
        let b = mint_secret();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn token_mismatch_counts_attempts() {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let manager = SessionManager::new(fatal_tx);
        assert!(manager.check_engine_token("good", Some("good")).is_ok());
        assert!(manager.check_engine_token("good", Some("bad")).is_err());
        assert!(manager.check_engine_token("good", None).is_err());
        assert_eq!(manager.attempt_count(), 2);
    }

    #[tokio::test]
    async fn attempt_backstop_requests_engine_exit() {
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let manager = SessionManager::new(fatal_tx);
        for _ in 0..MAX_ATTEMPTS {
            let _ = manager.check_engine_token("good", Some("bad"));
        }
        assert_eq!(fatal_rx.try_recv().unwrap(), EXIT_ATTEMPTS_EXHAUSTED);
    }

    #[tokio::test]
    async fn session_teardown_reports_bound_plugins() {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let manager = SessionManager::new(fatal_tx);
        let s = session("sid-1", "client-1", "session-1");
        assert!(!manager.add_session(Arc::clone(&s)));
        manager.bind_plugin("session-1", "p1");
        manager.bind_plugin("session-1", "p2");
        let teardown = manager.remove_session("sid-1");
        assert!(teardown.client_gone);
        assert_eq!(teardown.plugin_ids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn second_session_of_a_client_is_reported_connected() {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let manager = SessionManager::new(fatal_tx);
        assert!(!manager.add_session(session("sid-1", "client-1", "session-1")));
        assert!(manager.add_session(session("sid-2", "client-1", "session-2")));
        let teardown = manager.remove_session("sid-1");
        assert!(!teardown.client_gone);
    }

    #[tokio::test]
    async fn signature_resume_binds_the_new_session() {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let manager = SessionManager::new(fatal_tx);
        manager.record_signature("counter/v1", "p1");
        let resumed = manager.resume_plugin_session("session-2", "counter/v1");
        assert_eq!(resumed.as_deref(), Some("p1"));
        assert!(
            manager
                .resume_plugin_session("session-2", "unknown/sig")
                .is_none()
        );
        let teardown = manager.remove_session("missing");
        assert!(teardown.plugin_ids.is_empty());
    }
}
