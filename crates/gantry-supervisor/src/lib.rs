//! # Gantry Supervisor
//!
//! Lifecycle owner for native-subprocess plugins: environment
//! preparation, dependency installation, worker launch, monitoring and
//! graceful-then-forced termination.
//!
//! Install and launch steps run on one dedicated thread per starting
//! plugin (blocking subprocess I/O stays off the event loop); completion
//! and output stream back over channels as [`LaunchEvent`]s.

pub mod env;
pub mod launcher;
pub mod process;
pub mod requirements;
pub mod supervisor;

pub use env::{EnvEntry, EnvSpec, apply_conda_activate, default_env_name, parse_env};
pub use launcher::{CondaContext, LaunchEvent, LaunchSpec, launch_plugin};
pub use process::{CommandOutcome, kill_process_tree, run_commands, run_process};
pub use requirements::{RepoRequirement, parse_repos, parse_requirements};
pub use supervisor::{KillOutcome, Supervisor, SupervisorConfig};
