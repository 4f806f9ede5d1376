//! Configuration loader.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use tracing::{debug, info};

use gantry_core::{Error, Result};

use super::schema::GantryConfig;

const CONFIG_NAMES: &[&str] = &["gantry.yaml", "gantry.yml", ".gantry.yaml"];

/// Loads configuration from files and the environment.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Creates a loader with no search paths.
    pub fn new() -> Self {
        Self {
            search_paths: Vec::new(),
        }
    }

    /// Adds a search path for configuration files.
    pub fn add_search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Adds the current directory to the search paths.
    pub fn with_current_dir(self) -> Self {
        match std::env::current_dir() {
            Ok(cwd) => self.add_search_path(cwd),
            Err(_) => self,
        }
    }

    /// Adds the user config directory (`~/.config/gantry`).
    pub fn with_user_config_dir(self) -> Self {
        match dirs::config_dir() {
            Some(dir) => self.add_search_path(dir.join("gantry")),
            None => self,
        }
    }

    /// Loads configuration from the first file found, layered with
    /// `GANTRY_*` environment variables. Defaults apply when no file
    /// exists.
    pub fn load(&self) -> Result<GantryConfig> {
        let mut figment = Figment::from(Serialized::defaults(GantryConfig::default()));
        if let Some(path) = self.find_config_file() {
            info!(path = %path.display(), "Loading configuration");
            figment = figment.merge(Yaml::file(path));
        } else {
            debug!("No configuration file found, using defaults");
        }
        let config: GantryConfig = figment
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract()
            .map_err(|e| Error::BadRequest(format!("invalid configuration: {e}")))?;
        validate(&config)?;
        Ok(config)
    }

    /// Loads configuration from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<GantryConfig> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::NotFound(format!(
                "configuration file {}",
                path.display()
            )));
        }
        let config: GantryConfig = Figment::from(Serialized::defaults(GantryConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("GANTRY_").split("__"))
            .extract()
            .map_err(|e| Error::BadRequest(format!("invalid configuration: {e}")))?;
        validate(&config)?;
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        for search_path in &self.search_paths {
            for name in CONFIG_NAMES {
                let path = search_path.join(name);
                if path.is_file() {
                    return Some(path);
                }
            }
        }
        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(config: &GantryConfig) -> Result<()> {
    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => {
            return Err(Error::BadRequest(format!("invalid logging level: {other}")));
        }
    }
    if config.supervisor.workspace_root.as_os_str().is_empty() {
        return Err(Error::BadRequest("workspace_root must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.server.port, 9527);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gantry.yaml"),
            "server:\n  port: 8000\nlogging:\n  level: debug\n",
        )
        .unwrap();
        let config = ConfigLoader::new()
            .add_search_path(dir.path())
            .load()
            .unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn invalid_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gantry.yaml"), "logging:\n  level: loud\n").unwrap();
        let err = ConfigLoader::new()
            .add_search_path(dir.path())
            .load()
            .unwrap_err();
        assert_eq!(err.kind(), "BadRequest");
    }

    #[test]
    fn missing_explicit_file_is_not_found() {
        let err = ConfigLoader::new()
            .load_from_file("/definitely/missing.yaml")
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
