use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ExperimentError, Result};

pub const PROJECT_CONFIG_FILE: &str = "exptrack.yaml";

/// Optional per-project settings read from `exptrack.yaml`.
///
/// ```yaml
/// experiments_directory: runs
/// ignore_args: [seed, device]
/// display_args: [lr]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub experiments_directory: PathBuf,
    pub ignore_args: Vec<String>,
    pub display_args: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            experiments_directory: PathBuf::from("experiments"),
            ignore_args: Vec::new(),
            display_args: Vec::new(),
        }
    }
}

impl ProjectConfig {
    pub fn load(project_directory: &Path) -> Result<Self> {
        let path = project_directory.join(PROJECT_CONFIG_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ExperimentError::io(&path, e)),
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ExperimentError::Yaml { path, source })
    }

    pub fn experiments_root(&self, project_directory: &Path) -> PathBuf {
        project_directory.join(&self.experiments_directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_project(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "exp_core_cfg_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("project dir");
        dir
    }

    #[test]
    fn missing_file_yields_defaults() {
        let project = temp_project("missing");
        let cfg = ProjectConfig::load(&project).expect("load");
        assert_eq!(cfg, ProjectConfig::default());
        assert_eq!(cfg.experiments_root(&project), project.join("experiments"));
        let _ = fs::remove_dir_all(project);
    }

    #[test]
    fn partial_file_fills_remaining_fields() {
        let project = temp_project("partial");
        fs::write(
            project.join(PROJECT_CONFIG_FILE),
            "experiments_directory: runs\nignore_args: [seed]\n",
        )
        .expect("write cfg");
        let cfg = ProjectConfig::load(&project).expect("load");
        assert_eq!(cfg.experiments_directory, PathBuf::from("runs"));
        assert_eq!(cfg.ignore_args, vec!["seed".to_string()]);
        assert!(cfg.display_args.is_empty());
        let _ = fs::remove_dir_all(project);
    }

    #[test]
    fn absolute_experiments_directory_ignores_project() {
        let cfg = ProjectConfig {
            experiments_directory: PathBuf::from("/data/exps"),
            ..ProjectConfig::default()
        };
        assert_eq!(
            cfg.experiments_root(Path::new("/home/me/proj")),
            PathBuf::from("/data/exps")
        );
    }

    #[test]
    fn malformed_yaml_is_reported_with_path() {
        let project = temp_project("broken");
        fs::write(project.join(PROJECT_CONFIG_FILE), "ignore_args: [unterminated\n")
            .expect("write cfg");
        let err = ProjectConfig::load(&project).expect_err("broken yaml");
        assert!(err.to_string().contains(PROJECT_CONFIG_FILE), "{}", err);
        let _ = fs::remove_dir_all(project);
    }
}
