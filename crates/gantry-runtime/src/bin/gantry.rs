//! Engine entry point.
//!
//! Exit codes: `0` clean shutdown, `1` server failure, `100` bad-token
//! attempts exhausted, `2`/`3`/`4` install and git-bootstrap failures at
//! startup (reserved, reported by the supervisor pipeline).

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use gantry_runtime::{ConfigLoader, Engine, logging};

#[derive(Debug, Parser)]
#[command(name = "gantry", about = "Plugin broker and service gateway", version)]
struct Cli {
    /// Bind host.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Root directory for workspace state.
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Configuration file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine connection token (generated and cached when omitted).
    #[arg(long)]
    token: Option<String>,

    /// Skip env creation and dependency installs.
    #[arg(long)]
    freeze: bool,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loader = ConfigLoader::new().with_current_dir().with_user_config_dir();
    let config = match &cli.config {
        Some(path) => loader.load_from_file(path),
        None => loader.load(),
    };
    let mut config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(root) = cli.workspace_root {
        config.supervisor.workspace_root = root;
    }
    if cli.token.is_some() {
        config.token = cli.token;
    }
    if cli.freeze {
        config.supervisor.freeze = true;
    }
    if cli.debug {
        config.logging.level = "debug".to_string();
    }

    logging::init_from_level(&config.logging.level);

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to start the engine");
            std::process::exit(1);
        }
    };

    match engine.serve().await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!(error = %e, "Engine failed");
            std::process::exit(1);
        }
    }
}
