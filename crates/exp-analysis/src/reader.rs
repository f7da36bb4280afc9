use chrono::{DateTime, Utc};
use exp_core::record::{
    ARGS_FILE, DEFAULT_ARGS_FILE, LOG_FILE, METADATA_FILE, STATUS_FILE, SUMMARY_FILE,
};
use exp_core::{
    load_optional_json, non_default_args, Args, ExperimentError, ExperimentId, Metadata, Result,
    Status, StatusMarker,
};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub path: PathBuf,
    pub metadata: Metadata,
    pub all_args: Args,
    pub args: Args,
    pub default_args: Args,
    pub status: Status,
    pub status_message: String,
    pub summary: Args,
    /// Start time, or the modification time of `metadata.json` when the
    /// start time was not recorded.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, &[])
    }

    /// Missing files read as empty (`STATUS` as `UNKNOWN`); malformed ones are
    /// errors.
    pub fn load_with(path: &Path, ignore_args: &[String]) -> Result<Self> {
        if !path.is_dir() {
            return Err(ExperimentError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not an experiment directory"),
            ));
        }
        let id = ExperimentId::from_dir(path)?;
        let metadata_path = path.join(METADATA_FILE);
        let metadata = load_optional_json::<Metadata>(&metadata_path)?.unwrap_or_default();

        let mut all_args = load_optional_json::<Args>(&path.join(ARGS_FILE))?.unwrap_or_default();
        for name in ignore_args {
            all_args.remove(name);
        }
        let defaults = load_optional_json::<Args>(&path.join(DEFAULT_ARGS_FILE))?;
        let args = non_default_args(&all_args, defaults.as_ref());
        let default_args = defaults.unwrap_or_default();

        let summary = load_optional_json::<Args>(&path.join(SUMMARY_FILE))?.unwrap_or_default();
        let marker = read_status(path)?;

        let timestamp = match metadata.start_time {
            Some(ts) => Some(ts),
            None => modified_time(&metadata_path),
        };

        Ok(Self {
            id,
            path: path.to_path_buf(),
            metadata,
            all_args,
            args,
            default_args,
            status: marker.status,
            status_message: marker.message,
            summary,
            timestamp,
        })
    }

    pub fn sha(&self) -> &str {
        &self.metadata.githead_sha
    }

    pub fn log(&self) -> Result<Vec<Value>> {
        read_log(&self.path.join(LOG_FILE))
    }

    pub fn reload_summary(&self) -> Result<Args> {
        Ok(load_optional_json::<Args>(&self.path.join(SUMMARY_FILE))?.unwrap_or_default())
    }
}

fn read_status(dir: &Path) -> Result<StatusMarker> {
    let path = dir.join(STATUS_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => Ok(StatusMarker::parse(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusMarker::new(Status::Unknown, "")),
        Err(e) => Err(ExperimentError::io(&path, e)),
    }
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// `log.json` holds JSON values written back to back with no separators.
pub fn read_log(path: &Path) -> Result<Vec<Value>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ExperimentError::io(path, e)),
    };
    serde_json::Deserializer::from_str(&text)
        .into_iter::<Value>()
        .map(|entry| entry.map_err(|e| ExperimentError::json(path, e)))
        .collect()
}
