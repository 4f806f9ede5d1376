//! The install-and-launch pipeline.
//!
//! One plugin launch is a linear sequence — clone repos, prepare the
//! environment, install requirements, start the worker — executed on a
//! dedicated thread with the abort flag consulted between every step.
//! Progress and output stream back to the owner as [`LaunchEvent`]s.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use gantry_core::{Error, Result};

use crate::env::{EnvEntry, apply_conda_activate, default_env_name, parse_env};
use crate::process::{
    CommandOutcome, kill_process_tree, new_process_group, run_commands, run_process, which,
};
use crate::requirements::{parse_repos, parse_requirements};

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Plugin id, also passed to the worker.
    pub plugin_id: String,
    /// Plugin name (used for the derived env name).
    pub name: String,
    /// Plugin tag.
    pub tag: String,
    /// Raw `env` config section.
    pub env: Option<serde_json::Value>,
    /// Requirement entries.
    pub requirements: Vec<String>,
    /// Interpreter command, e.g. `python`.
    pub cmd: String,
    /// Working directory (the workspace directory).
    pub work_dir: PathBuf,
    /// Engine URL handed to the worker.
    pub server_url: String,
    /// Channel secret handed to the worker.
    pub secret: String,
}

/// Progress and lifecycle events emitted by a launch.
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    /// Informational or error output.
    Log {
        /// `"info"` or `"error"`.
        kind: String,
        /// Message text.
        message: String,
    },
    /// Pipeline progress, 0..=100.
    Progress(u8),
    /// The worker process started.
    Started {
        /// Worker pid.
        pid: u32,
    },
    /// The pipeline finished; `success=false` carries the failure reason.
    Exited {
        /// Whether the worker exited cleanly.
        success: bool,
        /// Outcome description or collected stderr.
        message: String,
    },
}

/// Conda availability and activation template, probed once per engine.
#[derive(Debug, Clone)]
pub struct CondaContext {
    /// Whether conda was found.
    pub available: bool,
    /// Activation command template with a `{}` placeholder.
    pub activate_template: String,
}

impl CondaContext {
    /// Probes `conda info --json` and derives the platform activation
    /// template.
    pub fn detect() -> Self {
        let output = Command::new("conda")
            .args(["info", "--json", "-s"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output();
        let prefix = output.ok().and_then(|out| {
            let parsed: serde_json::Value = serde_json::from_slice(&out.stdout).ok()?;
            parsed
                .get("conda_prefix")
                .and_then(serde_json::Value::as_str)
                .map(String::from)
        });
        match prefix {
            Some(prefix) => {
                info!(prefix = %prefix, "Found conda environment");
                let activate_template = if cfg!(target_os = "macos") {
                    "source activate {}".to_string()
                } else if cfg!(target_os = "linux") {
                    format!("/bin/bash -c 'source {prefix}/bin/activate {{}}'")
                } else {
                    "conda activate {}".to_string()
                };
                Self {
                    available: true,
                    activate_template,
                }
            }
            None => {
                warn!("Conda is not available, plugin environments are limited");
                Self::unavailable()
            }
        }
    }

    /// A context without conda; commands pass through unwrapped.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            activate_template: "{}".to_string(),
        }
    }
}

struct EventSink<'a> {
    events: &'a mpsc::Sender<LaunchEvent>,
}

impl EventSink<'_> {
    fn log(&self, message: impl Into<String>) {
        let _ = self.events.blocking_send(LaunchEvent::Log {
            kind: "info".into(),
            message: message.into(),
        });
    }

    fn log_error(&self, message: impl Into<String>) {
        let _ = self.events.blocking_send(LaunchEvent::Log {
            kind: "error".into(),
            message: message.into(),
        });
    }

    fn progress(&self, value: u8) {
        let _ = self.events.blocking_send(LaunchEvent::Progress(value));
    }

    fn started(&self, pid: u32) {
        let _ = self.events.blocking_send(LaunchEvent::Started { pid });
    }

    fn exited(&self, success: bool, message: impl Into<String>) {
        let _ = self.events.blocking_send(LaunchEvent::Exited {
            success,
            message: message.into(),
        });
    }
}

/// Runs the full pipeline on the calling (supervisor) thread. Returns
/// whether the worker ran and exited cleanly.
#[allow(clippy::too_many_arguments)]
pub fn launch_plugin(
    spec: &LaunchSpec,
    conda: &CondaContext,
    cmd_history: &Arc<Mutex<Vec<String>>>,
    freeze: bool,
    abort: &Arc<AtomicBool>,
    events: &mpsc::Sender<LaunchEvent>,
) -> bool {
    let sink = EventSink { events };
    let aborted = || abort.load(Ordering::SeqCst);
    if aborted() {
        sink.exited(false, "plugin aborted before setup");
        return false;
    }

    let process_env: HashMap<String, String> = std::env::vars()
        .chain([(
            "WORK_DIR".to_string(),
            spec.work_dir.to_string_lossy().into_owned(),
        )])
        .collect();

    match setup_environment(spec, conda, cmd_history, freeze, abort, &sink, &process_env) {
        Ok(setup) => {
            if aborted() {
                sink.exited(false, "plugin aborted during setup");
                return false;
            }
            run_worker(spec, conda, &sink, abort, process_env, setup)
        }
        Err(e) => {
            error!(plugin = %spec.plugin_id, error = %e, "Plugin setup failed");
            abort.store(true, Ordering::SeqCst);
            sink.exited(false, format!("plugin process failed to start: {e}"));
            false
        }
    }
}

struct SetupOutcome {
    extra_env: HashMap<String, String>,
    venv_name: Option<String>,
}

fn setup_environment(
    spec: &LaunchSpec,
    conda: &CondaContext,
    cmd_history: &Arc<Mutex<Vec<String>>>,
    freeze: bool,
    abort: &Arc<AtomicBool>,
    sink: &EventSink<'_>,
    process_env: &HashMap<String, String>,
) -> Result<SetupOutcome> {
    let mut extra_env = HashMap::new();

    // 1. clone repositories
    let repos = parse_repos(&spec.requirements, &spec.work_dir);
    let mut progress: u8 = 5;
    sink.progress(progress);
    for repo in &repos {
        sink.log(format!("Cloning repo {} to {}", repo.url, repo.repo_dir.display()));
        let command = if repo.repo_dir.is_dir() {
            "git pull --all".to_string()
        } else {
            format!(
                "git clone --progress --depth=1 {} {}",
                repo.url,
                repo.repo_dir.display()
            )
        };
        let cwd = if repo.repo_dir.is_dir() {
            repo.repo_dir.clone()
        } else {
            spec.work_dir.clone()
        };
        match run_process(&command, process_env, &cwd, |_| {}) {
            Ok(outcome) if outcome.success() => {}
            Ok(outcome) => {
                sink.log_error(format!("Failed to obtain the git repo: {}", outcome.stderr));
            }
            Err(e) => sink.log_error(format!("Failed to obtain the git repo: {e}")),
        }
        progress = progress.saturating_add((20 / repos.len().max(1)) as u8);
        sink.progress(progress);
        if abort.load(Ordering::SeqCst) {
            return Ok(SetupOutcome {
                extra_env,
                venv_name: None,
            });
        }
    }
    progress = progress.max(25);

    // 2. environment entries
    let env_name = default_env_name(&spec.name, &spec.tag);
    let env_spec = parse_env(spec.env.as_ref(), &spec.work_dir, &env_name, conda.available)?;
    let install_cmds = parse_requirements(&spec.requirements, conda.available)?;
    let total_steps = (env_spec.entries.len() + install_cmds.len()).max(1);
    let step: u8 = (70 / total_steps).min(70) as u8;

    for entry in &env_spec.entries {
        if abort.load(Ordering::SeqCst) {
            return Ok(SetupOutcome {
                extra_env,
                venv_name: env_spec.venv_name.clone(),
            });
        }
        match entry {
            EnvEntry::Command(command) => {
                if freeze {
                    warn!(command = %command, "Env command blocked in freeze mode");
                    continue;
                }
                if cmd_history.lock().contains(command) {
                    debug!(command = %command, "Skipping env command");
                    sink.log(format!("Skip env command: {command}"));
                } else {
                    sink.log(format!("Running env command: {command}"));
                    let outcome = run_process(command, process_env, &spec.work_dir, |_| {})?;
                    if outcome.success() {
                        cmd_history.lock().push(command.clone());
                    } else {
                        sink.log_error(outcome.stderr);
                    }
                }
            }
            EnvEntry::GpuReservation(options) => {
                let devices = probe_gpus(options)?;
                sink.log(format!("GPU id assigned: {devices:?}"));
                extra_env.insert("CUDA_DEVICE_ORDER".into(), "PCI_BUS_ID".into());
                extra_env.insert(
                    "CUDA_VISIBLE_DEVICES".into(),
                    devices
                        .iter()
                        .map(u32::to_string)
                        .collect::<Vec<_>>()
                        .join(","),
                );
            }
            EnvEntry::Variables(vars) => {
                extra_env.extend(vars.clone());
            }
        }
        progress = progress.saturating_add(step);
        sink.progress(progress.min(95));
    }

    // 3. install requirements
    if freeze {
        warn!("Install commands are blocked in freeze mode: {install_cmds:?}");
        sink.progress(95);
        return Ok(SetupOutcome {
            extra_env,
            venv_name: env_spec.venv_name,
        });
    }
    let pending: Vec<String> = {
        let history = cmd_history.lock();
        install_cmds
            .iter()
            .filter(|c| !history.contains(c))
            .cloned()
            .collect()
    };
    let wrapped = match (&env_spec.venv_name, conda.available) {
        (Some(venv), true) => apply_conda_activate(&pending, &conda.activate_template, venv),
        _ => pending.clone(),
    };
    install_requirements(&wrapped, conda, process_env, spec, sink)?;
    cmd_history.lock().extend(pending);
    sink.progress(95);
    Ok(SetupOutcome {
        extra_env,
        venv_name: env_spec.venv_name,
    })
}

fn install_requirements(
    commands: &[String],
    conda: &CondaContext,
    process_env: &HashMap<String, String>,
    spec: &LaunchSpec,
    sink: &EventSink<'_>,
) -> Result<()> {
    if commands.is_empty() {
        return Ok(());
    }
    let run = |sink: &EventSink<'_>| -> Result<CommandOutcome> {
        run_commands(commands, process_env, &spec.work_dir, |pid, cmd| {
            sink.log(format!("Running requirements subprocess (pid={pid}): {cmd}"));
        })
    };

    let outcome = run(sink)?;
    if outcome.success() {
        sink.log("Requirements command executed successfully.");
        return Ok(());
    }
    sink.log_error(format!("Failed to run requirements command: {commands:?}"));

    // bootstrap git/pip through conda once, then retry
    let mut missing = Vec::new();
    if !which("git") {
        missing.push("git");
    }
    if !which("pip") {
        missing.push("pip");
    }
    if conda.available && !missing.is_empty() {
        let bootstrap = format!("conda install -y {}", missing.join(" "));
        info!(command = %bootstrap, "Install failed, bootstrapping tooling via conda");
        let boot = run_process(&bootstrap, process_env, &spec.work_dir, |_| {})?;
        if boot.success() {
            let retry = run(sink)?;
            if retry.success() {
                return Ok(());
            }
            return Err(Error::InstallFailed {
                exit_code: retry.exit_code,
                stderr: retry.stderr,
            });
        }
    }
    Err(Error::InstallFailed {
        exit_code: outcome.exit_code,
        stderr: outcome.stderr,
    })
}

fn probe_gpus(options: &serde_json::Value) -> Result<Vec<u32>> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=index", "--format=csv,noheader"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|_| Error::LaunchFailed("no GPU is available to run this plugin".into()))?;
    let mut devices: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    if let Some(limit) = options.get("limit").and_then(serde_json::Value::as_u64) {
        devices.truncate(limit as usize);
    }
    if devices.is_empty() {
        return Err(Error::LaunchFailed(
            "no GPU is available to run this plugin".into(),
        ));
    }
    Ok(devices)
}

fn run_worker(
    spec: &LaunchSpec,
    conda: &CondaContext,
    sink: &EventSink<'_>,
    abort: &Arc<AtomicBool>,
    mut process_env: HashMap<String, String>,
    setup: SetupOutcome,
) -> bool {
    process_env.extend(setup.extra_env);

    let worker_cmd = format!(
        "{} -m gantry_worker --id={} --server={} --secret={}",
        spec.cmd, spec.plugin_id, spec.server_url, spec.secret
    );
    let worker_cmd = match (&setup.venv_name, conda.available) {
        (Some(venv), true) => {
            apply_conda_activate(&[worker_cmd.clone()], &conda.activate_template, venv).remove(0)
        }
        _ => worker_cmd,
    };

    sink.progress(100);
    info!(plugin = %spec.plugin_id, command = %worker_cmd, "Starting worker");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&worker_cmd)
        .envs(&process_env)
        .current_dir(&spec.work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    new_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            sink.exited(false, format!("failed to start worker: {e}"));
            return false;
        }
    };
    let pid = child.id();
    sink.started(pid);
    sink.log(format!("Running subprocess (pid={pid}) with {worker_cmd}"));

    // stream stdout lines back as log events
    let stdout_reader = child.stdout.take().map(|stdout| {
        let events = sink.events.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                let _ = events.blocking_send(LaunchEvent::Log {
                    kind: "info".into(),
                    message: line,
                });
            }
        })
    });

    // wait for exit, watching the abort flag
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code().unwrap_or(-1),
            Ok(None) => {
                if abort.load(Ordering::SeqCst) {
                    info!(plugin = %spec.plugin_id, "Plugin aborting");
                    kill_process_tree(pid);
                    let _ = child.wait();
                    break -1;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                error!(plugin = %spec.plugin_id, error = %e, "Failed to poll worker");
                kill_process_tree(pid);
                break -1;
            }
        }
    };

    if let Some(reader) = stdout_reader {
        let _ = reader.join();
    }
    let stderr = child
        .stderr
        .take()
        .map(|mut err| {
            use std::io::Read;
            let mut buf = String::new();
            let _ = err.read_to_string(&mut buf);
            buf
        })
        .unwrap_or_default();

    if exit_code == 0 {
        sink.log(format!("Plugin process exited with code {exit_code}"));
        sink.exited(true, "");
        true
    } else {
        sink.log_error(format!("Plugin process exited with code {exit_code}"));
        sink.exited(
            false,
            format!("{stderr}\nplugin process exited with code {exit_code}"),
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &std::path::Path, cmd: &str) -> LaunchSpec {
        LaunchSpec {
            plugin_id: "p1".into(),
            name: "worker".into(),
            tag: String::new(),
            env: None,
            requirements: Vec::new(),
            cmd: cmd.into(),
            work_dir: dir.to_path_buf(),
            server_url: "http://127.0.0.1:9527".into(),
            secret: "s3cret".into(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<LaunchEvent>) -> Vec<LaunchEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_worker_exit_reports_success() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(256);
        let spec = spec(dir.path(), "echo");
        let history = Arc::new(Mutex::new(Vec::new()));
        let abort = Arc::new(AtomicBool::new(false));
        let handle = std::thread::spawn(move || {
            launch_plugin(
                &spec,
                &CondaContext::unavailable(),
                &history,
                false,
                &abort,
                &tx,
            )
        });
        let events = drain(rx).await;
        assert!(handle.join().unwrap());
        assert!(matches!(
            events.last(),
            Some(LaunchEvent::Exited { success: true, .. })
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, LaunchEvent::Started { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_install_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(256);
        let mut spec = spec(dir.path(), "echo");
        spec.requirements = vec!["cmd:echo install-broke >&2; exit 9".into()];
        let history = Arc::new(Mutex::new(Vec::new()));
        let abort = Arc::new(AtomicBool::new(false));
        let abort_probe = Arc::clone(&abort);
        let handle = std::thread::spawn(move || {
            launch_plugin(
                &spec,
                &CondaContext::unavailable(),
                &history,
                false,
                &abort,
                &tx,
            )
        });
        let events = drain(rx).await;
        assert!(!handle.join().unwrap());
        // a setup failure marks the plugin as aborted
        assert!(abort_probe.load(Ordering::SeqCst));
        match events.last() {
            Some(LaunchEvent::Exited { success, message }) => {
                assert!(!success);
                assert!(message.contains("install-broke") || message.contains("exit code 9"));
            }
            other => panic!("unexpected final event: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn history_skips_repeated_commands() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran-once");
        let command = format!("cmd:touch {}", marker.display());
        let history = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let (tx, rx) = mpsc::channel(256);
            let mut spec = spec(dir.path(), "echo");
            spec.requirements = vec![command.clone()];
            let history = Arc::clone(&history);
            let abort = Arc::new(AtomicBool::new(false));
            let handle = std::thread::spawn(move || {
                launch_plugin(
                    &spec,
                    &CondaContext::unavailable(),
                    &history,
                    false,
                    &abort,
                    &tx,
                )
            });
            drain(rx).await;
            assert!(handle.join().unwrap());
        }
        assert_eq!(history.lock().len(), 1);
    }
}
