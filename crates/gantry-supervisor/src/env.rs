//! Plugin environment parsing.
//!
//! The `env` section of a plugin config is a string or a list mixing
//! shell entries (conda create/activate commands) and typed entries
//! (`{type: "gputil"}` for GPU reservation, `{type: "variable"}` for
//! plain environment variables). Conda create commands are repaired to
//! always carry `-y` and an environment name.

use std::collections::HashMap;
use std::path::Path;

use figment::Figment;
use figment::providers::{Format, Yaml};
use serde::Deserialize;
use tracing::warn;

use gantry_core::{Error, Result};

/// A typed env entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvEntry {
    /// A shell command executed during setup.
    Command(String),
    /// GPU reservation request; options forwarded to the probe.
    GpuReservation(serde_json::Value),
    /// Plain environment variables for the worker process.
    Variables(HashMap<String, String>),
}

/// Parsed environment section.
#[derive(Debug, Clone, Default)]
pub struct EnvSpec {
    /// Conda environment the worker runs in, when one is created or named.
    pub venv_name: Option<String>,
    /// Entries in declaration order.
    pub entries: Vec<EnvEntry>,
}

#[derive(Debug, Deserialize)]
struct CondaEnvFile {
    name: String,
}

/// Parses the raw `env` config value.
///
/// `default_env_name` (derived from `<name>-<tag>`) is injected into
/// `conda create` commands that name no environment; `-y` is injected
/// when missing. `conda env create -f FILE` reads the environment name
/// from the file under `work_dir`.
pub fn parse_env(
    env: Option<&serde_json::Value>,
    work_dir: &Path,
    default_env_name: &str,
    conda_available: bool,
) -> Result<EnvSpec> {
    let mut spec = EnvSpec::default();
    let Some(env) = env else {
        return Ok(spec);
    };

    let raw_entries: Vec<serde_json::Value> = match env {
        serde_json::Value::Null => return Ok(spec),
        serde_json::Value::String(s) if s.trim().is_empty() => return Ok(spec),
        serde_json::Value::String(s) => vec![serde_json::Value::String(s.clone())],
        serde_json::Value::Array(items) => items.clone(),
        other => {
            return Err(Error::BadRequest(format!(
                "invalid env section: {other}"
            )));
        }
    };

    for raw in raw_entries {
        match raw {
            serde_json::Value::String(command) => {
                if !conda_available && command.contains("conda") {
                    warn!(command = %command, "Skipping conda env command, conda unavailable");
                    continue;
                }
                spec.entries
                    .push(EnvEntry::Command(repair_conda_command(
                        &command,
                        work_dir,
                        default_env_name,
                        &mut spec.venv_name,
                    )?));
            }
            serde_json::Value::Object(map) => {
                let kind = map
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::BadRequest("typed env entry without type".into()))?;
                let options = map
                    .get("options")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                match kind {
                    "gputil" => spec.entries.push(EnvEntry::GpuReservation(options)),
                    "variable" => {
                        let variables: HashMap<String, String> =
                            serde_json::from_value(options).map_err(|e| {
                                Error::BadRequest(format!("invalid variable env entry: {e}"))
                            })?;
                        spec.entries.push(EnvEntry::Variables(variables));
                    }
                    other => {
                        warn!(kind = %other, "Skipping unsupported env entry");
                    }
                }
            }
            other => {
                warn!(entry = %other, "Skipping unsupported env entry");
            }
        }
    }

    Ok(spec)
}

fn repair_conda_command(
    command: &str,
    work_dir: &Path,
    default_env_name: &str,
    venv_name: &mut Option<String>,
) -> Result<String> {
    let mut command = command.trim().to_string();

    if command.contains("conda env create") {
        let parts: Vec<&str> = command.split_whitespace().collect();
        let file = parts
            .iter()
            .position(|p| *p == "-f")
            .and_then(|i| parts.get(i + 1))
            .ok_or_else(|| {
                Error::BadRequest(
                    "you should provide an environment file via `conda env create -f`".into(),
                )
            })?;
        let env_file: CondaEnvFile = Figment::from(Yaml::file(work_dir.join(file)))
            .extract()
            .map_err(|e| {
                Error::BadRequest(format!(
                    "failed to read env name from the specified env file: {e}"
                ))
            })?;
        *venv_name = Some(env_file.name);
        return Ok(command);
    }

    if command.contains("conda create") {
        let parts: Vec<String> = command.split_whitespace().map(String::from).collect();
        let named = parts
            .iter()
            .position(|p| p == "-n" || p == "--name")
            .and_then(|i| parts.get(i + 1));
        match named {
            Some(name) => *venv_name = Some(name.clone()),
            None => {
                *venv_name = Some(default_env_name.to_string());
                command = command.replace(
                    "conda create",
                    &format!("conda create -n {default_env_name}"),
                );
            }
        }
        if !parts.iter().any(|p| p == "-y") {
            command = command.replace("conda create", "conda create -y");
        }
    }

    Ok(command)
}

/// Derives the default environment name from the plugin name and tag.
pub fn default_env_name(name: &str, tag: &str) -> String {
    let base = if tag.is_empty() {
        name.to_string()
    } else {
        format!("{name}-{tag}")
    };
    base.replace(' ', "_")
}

/// Wraps commands in the conda activation template for the environment.
pub fn apply_conda_activate(
    commands: &[String],
    activate_template: &str,
    venv_name: &str,
) -> Vec<String> {
    commands
        .iter()
        .map(|cmd| activate_template.replace("{}", &format!("{venv_name} && {cmd}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: serde_json::Value) -> EnvSpec {
        parse_env(Some(&value), Path::new("/tmp/ws"), "plugin-v1", true).unwrap()
    }

    #[test]
    fn missing_env_yields_empty_spec() {
        let spec = parse_env(None, Path::new("/tmp"), "x", true).unwrap();
        assert!(spec.entries.is_empty());
        assert!(spec.venv_name.is_none());
    }

    #[test]
    fn conda_create_gains_name_and_yes() {
        let spec = parse(serde_json::json!("conda create python=3.10"));
        assert_eq!(spec.venv_name.as_deref(), Some("plugin-v1"));
        assert_eq!(
            spec.entries,
            vec![EnvEntry::Command(
                "conda create -y -n plugin-v1 python=3.10".into()
            )]
        );
    }

    #[test]
    fn explicit_name_is_kept() {
        let spec = parse(serde_json::json!("conda create -y -n custom python=3.10"));
        assert_eq!(spec.venv_name.as_deref(), Some("custom"));
        assert_eq!(
            spec.entries,
            vec![EnvEntry::Command(
                "conda create -y -n custom python=3.10".into()
            )]
        );
    }

    #[test]
    fn env_create_without_file_is_rejected() {
        let err = parse_env(
            Some(&serde_json::json!("conda env create")),
            Path::new("/tmp"),
            "x",
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("environment file"));
    }

    #[test]
    fn env_file_name_is_extracted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("environment.yml"),
            "name: from-file\ndependencies:\n  - python=3.10\n",
        )
        .unwrap();
        let spec = parse_env(
            Some(&serde_json::json!("conda env create -f environment.yml")),
            dir.path(),
            "x",
            true,
        )
        .unwrap();
        assert_eq!(spec.venv_name.as_deref(), Some("from-file"));
    }

    #[test]
    fn typed_entries_are_parsed() {
        let spec = parse(serde_json::json!([
            { "type": "variable", "options": { "MODEL_DIR": "/data" } },
            { "type": "gputil", "options": { "limit": 1 } },
        ]));
        assert_eq!(spec.entries.len(), 2);
        match &spec.entries[0] {
            EnvEntry::Variables(vars) => assert_eq!(vars["MODEL_DIR"], "/data"),
            other => panic!("unexpected entry: {other:?}"),
        }
        assert!(matches!(spec.entries[1], EnvEntry::GpuReservation(_)));
    }

    #[test]
    fn conda_commands_skipped_without_conda() {
        let spec = parse_env(
            Some(&serde_json::json!("conda create -n x python=3.10")),
            Path::new("/tmp"),
            "x",
            false,
        )
        .unwrap();
        assert!(spec.entries.is_empty());
    }

    #[test]
    fn default_name_joins_name_and_tag() {
        assert_eq!(default_env_name("seg model", "gpu"), "seg_model-gpu");
        assert_eq!(default_env_name("plain", ""), "plain");
    }

    #[test]
    fn activation_wraps_commands() {
        let wrapped = apply_conda_activate(
            &["pip install x".to_string()],
            "/bin/bash -c 'source /opt/conda/bin/activate {}'",
            "venv1",
        );
        assert_eq!(
            wrapped,
            vec!["/bin/bash -c 'source /opt/conda/bin/activate venv1 && pip install x'"]
        );
    }
}
