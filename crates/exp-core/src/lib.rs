pub mod args;
pub mod config;
pub mod error;
pub mod record;
pub mod vcs;

pub use args::{args_equal, args_from, differing_keys, non_default_args, Args};
pub use config::ProjectConfig;
pub use error::{ExperimentError, Result};
pub use record::{parse_time, ExperimentId, Metadata, Status, StatusMarker};
pub use vcs::{CodeVersion, GitCli, StaticVcs, Vcs};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| ExperimentError::directory(path, e))
}

/// Writes through a sibling temp file and a rename so readers never observe a
/// half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp).map_err(|e| ExperimentError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| ExperimentError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| ExperimentError::io(path, e))?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| ExperimentError::json(path, e))?;
    atomic_write_bytes(path, &bytes)
}

pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|e| ExperimentError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ExperimentError::json(path, e))
}

pub fn load_optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ExperimentError::io(path, e)),
    };
    serde_json::from_slice::<Option<T>>(&bytes).map_err(|e| ExperimentError::json(path, e))
}
