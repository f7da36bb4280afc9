use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

use crate::error::{ExperimentError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeVersion {
    pub sha: String,
    pub message: String,
}

pub trait Vcs {
    fn workdir(&self) -> &Path;
    fn head(&self) -> Result<CodeVersion>;
    fn is_dirty(&self) -> Result<bool>;
    fn commit_file(&self, path: &Path, message: &str) -> Result<()>;
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;
    fn diff(&self, from: &str, to: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
}

impl GitCli {
    pub fn discover(start: &Path) -> Result<Self> {
        let top = run_git(start, &["rev-parse", "--show-toplevel"])?;
        Ok(Self {
            workdir: PathBuf::from(top.trim()),
        })
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        run_git(&self.workdir, args)
    }
}

fn git_command_line(args: &[&str]) -> String {
    format!("git {}", args.join(" "))
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    debug!(dir = %dir.display(), command = %git_command_line(args), "running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| ExperimentError::Vcs {
            command: git_command_line(args),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(ExperimentError::Vcs {
            command: git_command_line(args),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl Vcs for GitCli {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn head(&self) -> Result<CodeVersion> {
        let sha = self.git(&["rev-parse", "HEAD"])?.trim().to_string();
        let message = self.git(&["log", "-1", "--format=%B", "HEAD"])?;
        Ok(CodeVersion {
            sha,
            message: message.trim_end().to_string(),
        })
    }

    fn is_dirty(&self) -> Result<bool> {
        let status = self.git(&["status", "--porcelain", "--untracked-files=no"])?;
        Ok(!status.trim().is_empty())
    }

    fn commit_file(&self, path: &Path, message: &str) -> Result<()> {
        let path = path.to_string_lossy();
        self.git(&["add", "--", &path])?;
        self.git(&["commit", "-m", message, "--", &path])?;
        Ok(())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let args = ["merge-base", "--is-ancestor", ancestor, descendant];
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| ExperimentError::Vcs {
                command: git_command_line(&args),
                message: e.to_string(),
            })?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(ExperimentError::Vcs {
                command: git_command_line(&args),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    fn diff(&self, from: &str, to: &str) -> Result<String> {
        self.git(&["diff", from, to])
    }
}

/// A fixed code version. Hosts that obtain their fingerprint elsewhere (a
/// build-time constant, a packaged release) use this in place of a live
/// repository; it never reports dirty state and records commit requests
/// instead of performing them.
#[derive(Debug)]
pub struct StaticVcs {
    workdir: PathBuf,
    version: CodeVersion,
    dirty: bool,
    ancestry: Vec<(String, String)>,
    commits: Mutex<Vec<String>>,
}

impl StaticVcs {
    pub fn new(workdir: impl Into<PathBuf>, sha: &str, message: &str) -> Self {
        Self {
            workdir: workdir.into(),
            version: CodeVersion {
                sha: sha.to_string(),
                message: message.to_string(),
            },
            dirty: false,
            ancestry: Vec::new(),
            commits: Mutex::new(Vec::new()),
        }
    }

    pub fn dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    pub fn with_ancestry(mut self, ancestor: &str, descendant: &str) -> Self {
        self.ancestry
            .push((ancestor.to_string(), descendant.to_string()));
        self
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

impl Vcs for StaticVcs {
    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn head(&self) -> Result<CodeVersion> {
        Ok(self.version.clone())
    }

    fn is_dirty(&self) -> Result<bool> {
        Ok(self.dirty)
    }

    fn commit_file(&self, _path: &Path, message: &str) -> Result<()> {
        if let Ok(mut commits) = self.commits.lock() {
            commits.push(message.to_string());
        }
        Ok(())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        Ok(ancestor == descendant
            || self
                .ancestry
                .iter()
                .any(|(a, d)| a == ancestor && d == descendant))
    }

    fn diff(&self, from: &str, to: &str) -> Result<String> {
        Ok(format!("diff {}..{}\n", from, to))
    }
}
