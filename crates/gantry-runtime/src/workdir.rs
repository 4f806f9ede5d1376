//! Workspace-root state on disk.
//!
//! `<workspace_root>/.token` holds the engine connection token (generated
//! once and reused across restarts); `<workspace_root>/.pid` records the
//! engine pid so a stale engine from a previous run can be taken down at
//! startup.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use gantry_core::{Error, Result};

/// On-disk engine state under the workspace root.
#[derive(Debug)]
pub struct EngineWorkdir {
    root: PathBuf,
    /// Engine connection token.
    pub token: String,
}

impl EngineWorkdir {
    /// Bootstraps the workspace root: creates the directory, loads or
    /// mints the connection token, kills any stale engine recorded in
    /// `.pid`, and records the current pid.
    pub fn bootstrap(root: &Path, token_override: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| Error::Internal(format!("failed to create workspace root: {e}")))?;

        let token_file = root.join(".token");
        let token = match token_override.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => match std::fs::read_to_string(&token_file) {
                Ok(existing) if !existing.trim().is_empty() => existing.trim().to_string(),
                _ => uuid::Uuid::new_v4().to_string(),
            },
        };
        if let Err(e) = std::fs::write(&token_file, &token) {
            warn!(error = %e, "Failed to save .token file");
        }

        let pid_file = root.join(".pid");
        if let Ok(contents) = std::fs::read_to_string(&pid_file)
            && let Ok(stale_pid) = contents.trim().parse::<u32>()
            && stale_pid != std::process::id()
        {
            kill_stale_engine(stale_pid);
        }
        if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
            warn!(error = %e, "Failed to save .pid file");
        }

        info!(root = %root.display(), "Workspace root ready");
        Ok(Self {
            root: root.to_path_buf(),
            token,
        })
    }

    /// The workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Removes the pid file (at clean shutdown).
    pub fn remove_pid(&self) {
        if let Err(e) = std::fs::remove_file(self.root.join(".pid")) {
            debug!(error = %e, "Failed to remove the pid file");
        }
    }
}

fn kill_stale_engine(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let target = Pid::from_raw(pid as i32);
        // probe first so we only log when something was actually running
        if kill(target, None).is_ok() {
            info!(pid, "Killing stale engine from a previous run");
            let _ = kill(target, Signal::SIGTERM);
            std::thread::sleep(std::time::Duration::from_millis(500));
            let _ = kill(target, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "Stale engine cleanup is not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_generated_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = EngineWorkdir::bootstrap(dir.path(), None).unwrap();
        let second = EngineWorkdir::bootstrap(dir.path(), None).unwrap();
        assert_eq!(first.token, second.token);
        assert!(dir.path().join(".token").is_file());
    }

    #[test]
    fn explicit_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let workdir =
            EngineWorkdir::bootstrap(dir.path(), Some("engine-token".into())).unwrap();
        assert_eq!(workdir.token, "engine-token");
        let reloaded = EngineWorkdir::bootstrap(dir.path(), None).unwrap();
        assert_eq!(reloaded.token, "engine-token");
    }

    #[test]
    fn pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = EngineWorkdir::bootstrap(dir.path(), None).unwrap();
        let recorded: u32 = std::fs::read_to_string(dir.path().join(".pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(recorded, std::process::id());
        workdir.remove_pid();
        assert!(!dir.path().join(".pid").exists());
    }
}
