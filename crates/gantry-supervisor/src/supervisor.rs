//! Plugin lifecycle supervisor.
//!
//! Owns one launch thread per starting plugin, the per-engine command
//! history, abort flags, and the graceful-then-forced kill sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use gantry_core::{Error, Result};
use gantry_rpc::RpcPeer;

use crate::launcher::{CondaContext, LaunchEvent, LaunchSpec, launch_plugin};
use crate::process::kill_process_tree;

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root directory workspace work dirs live under.
    pub workspace_root: PathBuf,
    /// Grace window between the disconnect frame and the forced kill.
    pub force_quit_timeout: Duration,
    /// Skip env creation and installs entirely.
    pub freeze: bool,
    /// Engine URL handed to workers.
    pub server_url: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".gantry"),
            force_quit_timeout: Duration::from_secs(5),
            freeze: false,
            server_url: "http://127.0.0.1:9527".to_string(),
        }
    }
}

/// How a kill finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The worker acknowledged the disconnect within the grace window.
    Graceful,
    /// The grace window elapsed; the process group was killed.
    Forced,
}

struct ActivePlugin {
    abort: Arc<AtomicBool>,
    process_id: Arc<Mutex<Option<u32>>>,
    aborting: Option<watch::Receiver<bool>>,
}

/// Launches, monitors and terminates plugin workers.
pub struct Supervisor {
    config: SupervisorConfig,
    conda: CondaContext,
    cmd_history: Arc<Mutex<Vec<String>>>,
    active: Mutex<HashMap<String, ActivePlugin>>,
}

impl Supervisor {
    /// Creates a supervisor, probing conda availability once.
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            conda: CondaContext::detect(),
            cmd_history: Arc::new(Mutex::new(Vec::new())),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a supervisor with an explicit conda context (tests).
    pub fn with_conda(config: SupervisorConfig, conda: CondaContext) -> Self {
        Self {
            config,
            conda,
            cmd_history: Arc::new(Mutex::new(Vec::new())),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Supervisor settings.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Snapshot of the executed-command history.
    pub fn cmd_history(&self) -> Vec<String> {
        self.cmd_history.lock().clone()
    }

    /// Work directory for a workspace, created on demand.
    pub fn work_dir(&self, workspace: &str) -> Result<PathBuf> {
        let dir = self.config.workspace_root.join(workspace);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Internal(format!("failed to create work dir: {e}")))?;
        Ok(dir)
    }

    /// Known worker process ids.
    pub fn process_ids(&self) -> Vec<(String, u32)> {
        self.active
            .lock()
            .iter()
            .filter_map(|(id, entry)| {
                let pid = *entry.process_id.lock();
                pid.map(|pid| (id.clone(), pid))
            })
            .collect()
    }

    /// True when the plugin is currently mid-termination.
    pub fn aborting(&self, plugin_id: &str) -> Option<watch::Receiver<bool>> {
        self.active
            .lock()
            .get(plugin_id)
            .and_then(|entry| entry.aborting.clone())
    }

    /// Starts a plugin worker on a dedicated thread.
    ///
    /// Events stream on the returned channel; the caller forwards them to
    /// the owning session as `logging` frames and reacts to the final
    /// `Exited` event.
    pub fn launch(&self, spec: LaunchSpec) -> mpsc::Receiver<LaunchEvent> {
        let (tx, rx) = mpsc::channel(256);
        let abort = Arc::new(AtomicBool::new(false));
        let process_id = Arc::new(Mutex::new(None));
        self.active.lock().insert(
            spec.plugin_id.clone(),
            ActivePlugin {
                abort: Arc::clone(&abort),
                process_id: Arc::clone(&process_id),
                aborting: None,
            },
        );

        let conda = self.conda.clone();
        let history = Arc::clone(&self.cmd_history);
        let freeze = self.config.freeze;
        let plugin_id = spec.plugin_id.clone();

        // forward Started events into the pid slot on the way through
        let (raw_tx, mut raw_rx) = mpsc::channel::<LaunchEvent>(256);
        let pid_slot = Arc::clone(&process_id);
        let out_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                if let LaunchEvent::Started { pid } = &event {
                    *pid_slot.lock() = Some(*pid);
                }
                if out_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        std::thread::Builder::new()
            .name(format!("launch-{plugin_id}"))
            .spawn(move || {
                launch_plugin(&spec, &conda, &history, freeze, &abort, &raw_tx);
            })
            .map_err(|e| warn!(plugin = %plugin_id, error = %e, "Failed to spawn launch thread"))
            .ok();

        rx
    }

    /// Gracefully terminates a plugin: `disconnect` frame first, forced
    /// process-group kill after the grace window. Cleans up the active
    /// entry either way.
    pub async fn kill_plugin(&self, plugin_id: &str, peer: Option<&Arc<RpcPeer>>) -> KillOutcome {
        let (abort, process_id, aborting_tx) = {
            let mut active = self.active.lock();
            let (aborting_tx, aborting_rx) = watch::channel(false);
            match active.get_mut(plugin_id) {
                Some(entry) => {
                    entry.aborting = Some(aborting_rx);
                    (
                        Some(Arc::clone(&entry.abort)),
                        *entry.process_id.lock(),
                        Some(aborting_tx),
                    )
                }
                None => (None, None, None),
            }
        };

        if let Some(abort) = &abort {
            abort.store(true, Ordering::SeqCst);
        }

        let mut outcome = KillOutcome::Forced;
        if let Some(peer) = peer {
            peer.begin_termination();
            if peer.send_disconnect().await.is_ok()
                && peer.wait_gone(self.config.force_quit_timeout).await
            {
                info!(plugin = %plugin_id, "Plugin exited gracefully");
                outcome = KillOutcome::Graceful;
            } else {
                warn!(plugin = %plugin_id, "Timeout, force quitting");
            }
            peer.mark_gone();
        }

        if let Some(pid) = process_id {
            kill_process_tree(pid);
        }
        self.active.lock().remove(plugin_id);
        if let Some(tx) = aborting_tx {
            let _ = tx.send(true);
        }
        debug!(plugin = %plugin_id, ?outcome, "Plugin terminated");
        outcome
    }

    /// Force-kills a worker process by pid without protocol niceties.
    pub fn kill_process(&self, pid: u32) {
        kill_process_tree(pid);
    }

    /// Number of plugins currently launching or running.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("active", &self.active_count())
            .field("conda", &self.conda.available)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor(root: &std::path::Path) -> Supervisor {
        Supervisor::with_conda(
            SupervisorConfig {
                workspace_root: root.to_path_buf(),
                force_quit_timeout: Duration::from_millis(200),
                freeze: false,
                server_url: "http://127.0.0.1:9527".into(),
            },
            CondaContext::unavailable(),
        )
    }

    fn spec(work_dir: PathBuf, cmd: &str, requirements: Vec<String>) -> LaunchSpec {
        LaunchSpec {
            plugin_id: "p1".into(),
            name: "worker".into(),
            tag: String::new(),
            env: None,
            requirements,
            cmd: cmd.into(),
            work_dir,
            server_url: "http://127.0.0.1:9527".into(),
            secret: "s3cret".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn launch_and_exit_events_flow() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        let work_dir = supervisor.work_dir("lab").unwrap();
        let mut events = supervisor.launch(spec(work_dir, "echo", Vec::new()));
        let mut saw_exit = false;
        while let Some(event) = events.recv().await {
            if let LaunchEvent::Exited { success, .. } = event {
                assert!(success);
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn install_failure_resolves_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        let work_dir = supervisor.work_dir("lab").unwrap();
        let mut events = supervisor.launch(spec(
            work_dir,
            "echo",
            vec!["cmd:echo no-such-package >&2; false".into()],
        ));
        let mut reason = String::new();
        while let Some(event) = events.recv().await {
            if let LaunchEvent::Exited { success, message } = event {
                assert!(!success);
                reason = message;
            }
        }
        assert!(reason.contains("no-such-package"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn kill_without_peer_is_forced_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path());
        let work_dir = supervisor.work_dir("lab").unwrap();
        // a worker that would run for a long time
        let mut events = supervisor.launch(spec(work_dir, "sleep 30 ;", Vec::new()));
        // wait for the worker to start
        let mut started = false;
        while let Some(event) = events.recv().await {
            if matches!(event, LaunchEvent::Started { .. }) {
                started = true;
                break;
            }
        }
        assert!(started);
        assert_eq!(supervisor.active_count(), 1);
        let outcome = supervisor.kill_plugin("p1", None).await;
        assert_eq!(outcome, KillOutcome::Forced);
        assert_eq!(supervisor.active_count(), 0);
    }
}
