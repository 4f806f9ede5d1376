//! Requirement parsing.
//!
//! A plugin declares requirements as strings of the form
//! `conda:pkg`, `pip:pkg`, `repo:<url> [dir]`, `cmd:<shell>`, a VCS/URL
//! spec, or a bare package name. Each entry translates into one shell
//! command; `repo:` entries become clone targets handled before the
//! install step.

use std::path::{Path, PathBuf};

use gantry_core::{Error, Result};

/// A git repository requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRequirement {
    /// Clone URL.
    pub url: String,
    /// Directory the repo is cloned into, under the work dir.
    pub repo_dir: PathBuf,
}

/// Translates requirement entries into install commands.
///
/// `conda` commands are only produced when conda is available; `repo:`
/// entries produce no command here (see [`parse_repos`]).
pub fn parse_requirements(requirements: &[String], conda_available: bool) -> Result<Vec<String>> {
    let mut commands = Vec::new();
    for req in requirements {
        let req = req.trim();
        if req.is_empty() {
            continue;
        }
        match req.split_once(':') {
            Some((kind, rest)) => {
                let kind = kind.trim();
                let libs: Vec<&str> = rest.split_whitespace().collect();
                match kind {
                    "conda" if !libs.is_empty() => {
                        if conda_available {
                            commands.push(format!("conda install -y {}", libs.join(" ")));
                        }
                    }
                    "pip" if !libs.is_empty() => {
                        commands.push(format!("pip install {}", libs.join(" ")));
                    }
                    "repo" => {}
                    "cmd" if !libs.is_empty() => {
                        commands.push(libs.join(" "));
                    }
                    _ if kind.contains('+') || kind.contains("http") => {
                        commands.push(format!("pip install {req}"));
                    }
                    other => {
                        return Err(Error::BadRequest(format!(
                            "unsupported requirement type: {other}"
                        )));
                    }
                }
            }
            None => commands.push(format!("pip install {req}")),
        }
    }
    Ok(commands)
}

/// Extracts `repo:` requirements into clone targets under `work_dir`.
pub fn parse_repos(requirements: &[String], work_dir: &Path) -> Vec<RepoRequirement> {
    let mut repos = Vec::new();
    for req in requirements {
        let Some(rest) = req.trim().strip_prefix("repo:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let Some(url) = parts.next() else { continue };
        let dir_name = match parts.next() {
            Some(dir) => dir.to_string(),
            None => url
                .rsplit('/')
                .next()
                .unwrap_or(url)
                .trim_end_matches(".git")
                .to_string(),
        };
        repos.push(RepoRequirement {
            url: url.to_string(),
            repo_dir: work_dir.join(dir_name),
        });
    }
    repos
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reqs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn requirement_translation_table() {
        let commands = parse_requirements(
            &reqs(&[
                "conda:numpy scipy",
                "pip:imageio",
                "repo:https://github.com/lab/models",
                "cmd:make install",
                "git+https://github.com/lab/tool.git",
                "plain-package",
            ]),
            true,
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                "conda install -y numpy scipy",
                "pip install imageio",
                "make install",
                "pip install git+https://github.com/lab/tool.git",
                "pip install plain-package",
            ]
        );
    }

    #[test]
    fn conda_requirements_are_skipped_without_conda() {
        let commands =
            parse_requirements(&reqs(&["conda:numpy", "pip:imageio"]), false).unwrap();
        assert_eq!(commands, vec!["pip install imageio"]);
    }

    #[test]
    fn unknown_requirement_type_is_rejected() {
        let err = parse_requirements(&reqs(&["carton:thing"]), true).unwrap_err();
        assert!(err.to_string().contains("unsupported requirement type"));
    }

    #[test]
    fn repo_entries_become_clone_targets() {
        let work_dir = Path::new("/tmp/ws");
        let repos = parse_repos(
            &reqs(&[
                "repo:https://github.com/lab/models.git",
                "repo:https://github.com/lab/tools custom-dir",
                "pip:numpy",
            ]),
            work_dir,
        );
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].repo_dir, work_dir.join("models"));
        assert_eq!(repos[1].repo_dir, work_dir.join("custom-dir"));
    }
}
