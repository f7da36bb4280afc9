use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = ExperimentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error(
        "repository at {} has tracked but uncommitted changes; commit them or remove them from tracking",
        workdir.display()
    )]
    DirtyRepository { workdir: PathBuf },

    #[error(
        "args do not match the stored args of {} (differing: {}); specify the correct experiment id or create a new experiment",
        dir.display(),
        keys.join(", ")
    )]
    MismatchedArgs { dir: PathBuf, keys: Vec<String> },

    #[error(
        "current githead sha ({current}) does not match the githead-sha of {} ({stored}); specify the correct experiment id or create a new experiment",
        dir.display()
    )]
    MismatchedCommit {
        dir: PathBuf,
        stored: String,
        current: String,
    },

    #[error("cannot prepare directory {}: {source}", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid yaml in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("vcs command `{command}` failed: {message}")]
    Vcs { command: String, message: String },

    #[error("invalid args: {0}")]
    InvalidArgs(String),

    #[error("experiment session is not active")]
    NotActive,
}

impl ExperimentError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    pub fn directory(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Directory {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Io { source, .. } | Self::Directory { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}
