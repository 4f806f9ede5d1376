//! Configuration schema.
//!
//! ```yaml
//! server:
//!   host: 0.0.0.0
//!   port: 9527
//! auth:
//!   domain: gantry.eu.auth0.com
//! supervisor:
//!   workspace_root: ~/.gantry/workspaces
//!   force_quit_timeout_secs: 5
//! logging:
//!   level: info
//! ```
//!
//! Environment variables override file values: `AUTH0_DOMAIN`,
//! `AUTH0_AUDIENCE`, `JWT_SECRET` and `ALLOW_ORIGINS` map into the auth
//! and server sections.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GantryConfig {
    /// HTTP/websocket listener settings.
    pub server: ServerConfig,
    /// Token validation settings.
    pub auth: AuthSection,
    /// Plugin supervisor settings.
    pub supervisor: SupervisorSection,
    /// Logging settings.
    pub logging: LoggingSection,
    /// Engine connection token; generated and cached under the workspace
    /// root when unset.
    pub token: Option<String>,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// CORS origins (`ALLOW_ORIGINS`, comma separated).
    pub allow_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9527,
            allow_origins: std::env::var("ALLOW_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        }
    }
}

impl ServerConfig {
    /// The URL workers use to reach the engine.
    pub fn local_url(&self) -> String {
        let host = if self.host == "0.0.0.0" {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        format!("http://{host}:{}", self.port)
    }
}

/// Auth settings; the defaults read the conventional environment
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Identity provider domain (`AUTH0_DOMAIN`).
    pub domain: String,
    /// Expected token audience (`AUTH0_AUDIENCE`).
    pub audience: String,
    /// Symmetric secret for internal tokens (`JWT_SECRET`). When unset, a
    /// random secret is generated at startup and previously minted
    /// internal tokens become invalid.
    pub jwt_secret: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        let defaults = gantry_auth::AuthConfig::default();
        Self {
            domain: defaults.domain,
            audience: defaults.audience,
            jwt_secret: defaults.jwt_secret,
        }
    }
}

impl From<&AuthSection> for gantry_auth::AuthConfig {
    fn from(section: &AuthSection) -> Self {
        Self {
            domain: section.domain.clone(),
            audience: section.audience.clone(),
            jwt_secret: section.jwt_secret.clone(),
        }
    }
}

/// Supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Root of the per-workspace directories.
    pub workspace_root: PathBuf,
    /// Grace window between the disconnect frame and the forced kill.
    pub force_quit_timeout_secs: u64,
    /// Skip env creation and installs (operator manages environments).
    pub freeze: bool,
    /// Default interpreter command for workers.
    pub default_cmd: String,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        let workspace_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".gantry")
            .join("workspaces");
        Self {
            workspace_root,
            force_quit_timeout_secs: 5,
            freeze: false,
            default_cmd: "python".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level: trace, debug, info, warn, error.
    pub level: String,
    /// Also write per-workspace rolling log files.
    pub workspace_files: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            workspace_files: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GantryConfig::default();
        assert_eq!(config.server.port, 9527);
        assert_eq!(config.supervisor.force_quit_timeout_secs, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn local_url_rewrites_wildcard_host() {
        let server = ServerConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            allow_origins: Vec::new(),
        };
        assert_eq!(server.local_url(), "http://127.0.0.1:8000");
    }
}
