//! Blocking subprocess helpers.
//!
//! These run on dedicated supervisor threads, never on the event loop.
//! Workers and install commands are started in their own process group so
//! a timeout can reliably take down the whole subtree.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use gantry_core::{Error, Result};

/// Outcome of one shell command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Process exit code (`-1` when terminated by signal).
    pub exit_code: i32,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutcome {
    /// True for exit code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

/// Runs a shell command to completion, capturing stderr.
///
/// `on_start` receives the child pid so the caller can record it for
/// later cleanup.
pub fn run_process(
    command: &str,
    env: &HashMap<String, String>,
    cwd: &Path,
    mut on_start: impl FnMut(u32),
) -> Result<CommandOutcome> {
    let mut cmd = shell_command(command);
    cmd.envs(env)
        .current_dir(cwd)
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    new_process_group(&mut cmd);

    debug!(command = %command, "Running command");
    let child = cmd
        .spawn()
        .map_err(|e| Error::LaunchFailed(format!("failed to spawn `{command}`: {e}")))?;
    on_start(child.id());
    let output = child
        .wait_with_output()
        .map_err(|e| Error::LaunchFailed(format!("failed to wait for `{command}`: {e}")))?;
    Ok(CommandOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs commands in sequence, stopping at the first failure.
pub fn run_commands(
    commands: &[String],
    env: &HashMap<String, String>,
    cwd: &Path,
    mut on_start: impl FnMut(u32, &str),
) -> Result<CommandOutcome> {
    let mut last = CommandOutcome {
        exit_code: 0,
        stderr: String::new(),
    };
    for command in commands {
        last = run_process(command, env, cwd, |pid| on_start(pid, command))?;
        if !last.success() {
            return Ok(last);
        }
    }
    Ok(last)
}

/// Puts the child into a fresh process group (unix only) so the whole
/// subtree can be signalled at once.
pub fn new_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

/// Kills a worker's process group: SIGTERM first, SIGKILL if it is still
/// alive shortly after.
pub fn kill_process_tree(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(pid as i32);
        info!(pid, "Killing worker process group");
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => {
                std::thread::sleep(std::time::Duration::from_millis(200));
                if killpg(pgid, Signal::SIGKILL).is_ok() {
                    debug!(pid, "Process group force-killed");
                }
            }
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid, "Process group already gone");
            }
            Err(e) => {
                warn!(pid, error = %e, "Failed to signal process group");
            }
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "Process-group kill is not supported on this platform");
    }
}

/// Probes whether an executable is reachable on PATH.
pub fn which(binary: &str) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(binary).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        // keep PATH so `sh` can find coreutils
        std::env::vars().collect()
    }

    #[test]
    fn successful_command_reports_zero() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_process("true", &no_env(), dir.path(), |_| {}).unwrap();
        assert!(outcome.success());
    }

    #[test]
    fn failing_command_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let outcome =
            run_process("echo boom >&2; exit 3", &no_env(), dir.path(), |_| {}).unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome.stderr.contains("boom"));
    }

    #[test]
    fn command_sequence_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut started = Vec::new();
        let commands = vec![
            "true".to_string(),
            "exit 7".to_string(),
            "touch should-not-exist".to_string(),
        ];
        let outcome = run_commands(&commands, &no_env(), dir.path(), |_, cmd| {
            started.push(cmd.to_string());
        })
        .unwrap();
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(started.len(), 2);
        assert!(!dir.path().join("should-not-exist").exists());
    }

    #[test]
    fn which_finds_the_shell() {
        assert!(which("sh"));
        assert!(!which("definitely-not-a-real-binary-9000"));
    }
}
