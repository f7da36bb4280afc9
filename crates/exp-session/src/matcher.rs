use exp_core::record::{ARGS_FILE, METADATA_FILE};
use exp_core::{
    differing_keys, load_optional_json, Args, CodeVersion, ExperimentError,
    ExperimentId, Metadata, Result,
};
use std::path::Path;
use tracing::{debug, info};

use crate::allocator::{allocate, child_dirs, Allocation};

struct StoredRun {
    args: Args,
    sha: String,
}

fn load_stored_run(dir: &Path) -> Result<Option<StoredRun>> {
    let Some(metadata) = load_optional_json::<Metadata>(&dir.join(METADATA_FILE))? else {
        return Ok(None);
    };
    let args = load_optional_json::<Args>(&dir.join(ARGS_FILE))?.unwrap_or_default();
    Ok(Some(StoredRun {
        args,
        sha: metadata.githead_sha,
    }))
}

/// `Ok(false)` when the directory holds no recorded run yet. Mismatches are
/// errors.
pub fn verify_resumable(
    dir: &Path,
    args: &Args,
    version: &CodeVersion,
    ignore_args: &[String],
) -> Result<bool> {
    let Some(stored) = load_stored_run(dir)? else {
        return Ok(false);
    };
    let keys = differing_keys(&stored.args, args, ignore_args);
    if !keys.is_empty() {
        return Err(ExperimentError::MismatchedArgs {
            dir: dir.to_path_buf(),
            keys,
        });
    }
    if stored.sha != version.sha {
        return Err(ExperimentError::MismatchedCommit {
            dir: dir.to_path_buf(),
            stored: stored.sha,
            current: version.sha.clone(),
        });
    }
    Ok(true)
}

pub fn resolve_explicit(
    root: &Path,
    requested_id: &str,
    args: &Args,
    version: &CodeVersion,
    ignore_args: &[String],
) -> Result<Allocation> {
    let mut allocation = allocate(root, Some(requested_id))?;
    if allocation.existed {
        info!(dir = %allocation.path.display(), "found existing experiment, attempting to resume");
        let resumed = verify_resumable(&allocation.path, args, version, ignore_args)?;
        if resumed {
            info!("args and githead-sha match, resuming experiment");
        } else {
            debug!(dir = %allocation.path.display(), "directory holds no recorded run, using it as new");
        }
        allocation.existed = resumed;
    }
    Ok(allocation)
}

pub fn find_matching(
    root: &Path,
    args: &Args,
    version: &CodeVersion,
    ignore_args: &[String],
) -> Result<Option<Allocation>> {
    if !root.is_dir() {
        return Ok(None);
    }
    let mut best: Option<Allocation> = None;
    for dir in child_dirs(root)? {
        let stored = match load_stored_run(&dir) {
            Ok(Some(stored)) => stored,
            Ok(None) => continue,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "skipping unreadable experiment during resume scan");
                continue;
            }
        };
        if stored.sha != version.sha || !differing_keys(&stored.args, args, ignore_args).is_empty() {
            continue;
        }
        let id = ExperimentId::from_dir(&dir)?;
        if best.as_ref().map_or(true, |b| id > b.id) {
            best = Some(Allocation {
                id,
                path: dir,
                existed: true,
            });
        }
    }
    if let Some(found) = &best {
        info!(dir = %found.path.display(), "resuming matching experiment");
    }
    Ok(best)
}

/// `None` means a new numbered directory is needed.
pub fn try_resume(
    root: &Path,
    requested_id: Option<&str>,
    scan: bool,
    args: &Args,
    version: &CodeVersion,
    ignore_args: &[String],
) -> Result<Option<Allocation>> {
    match requested_id {
        Some(id) => {
            let allocation = resolve_explicit(root, id, args, version, ignore_args)?;
            Ok(Some(allocation))
        }
        None if scan => find_matching(root, args, version, ignore_args),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use exp_core::{atomic_write_json_pretty, ensure_dir};
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "exp_match_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn args(value: serde_json::Value) -> Args {
        exp_core::args_from(&value).expect("args")
    }

    fn version(sha: &str) -> CodeVersion {
        CodeVersion {
            sha: sha.to_string(),
            message: "msg".to_string(),
        }
    }

    fn record(root: &Path, name: &str, a: &Args, sha: &str) -> PathBuf {
        let dir = root.join(name);
        ensure_dir(&dir).expect("dir");
        atomic_write_json_pretty(&dir.join(ARGS_FILE), a).expect("args");
        atomic_write_json_pretty(&dir.join(METADATA_FILE), &json!({"githead-sha": sha}))
            .expect("metadata");
        dir
    }

    #[test]
    fn explicit_id_resumes_on_exact_match() {
        let root = temp_root("exact");
        let a = args(json!({"lr": 0.1}));
        record(&root, "run", &a, "aaa");
        let found = try_resume(&root, Some("run"), false, &a, &version("aaa"), &[])
            .expect("resume")
            .expect("allocation");
        assert!(found.existed);
        assert_eq!(found.path, root.join("run"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn explicit_id_rejects_changed_args_and_commit() {
        let root = temp_root("mismatch");
        let a = args(json!({"lr": 0.1, "epochs": 5}));
        record(&root, "run", &a, "aaa");

        let changed = args(json!({"lr": 0.2, "epochs": 5}));
        let err = try_resume(&root, Some("run"), false, &changed, &version("aaa"), &[])
            .expect_err("args differ");
        match err {
            ExperimentError::MismatchedArgs { keys, .. } => assert_eq!(keys, vec!["lr".to_string()]),
            other => panic!("unexpected error: {}", other),
        }

        let err = try_resume(&root, Some("run"), false, &a, &version("bbb"), &[])
            .expect_err("commit differs");
        let msg = err.to_string();
        assert!(matches!(err, ExperimentError::MismatchedCommit { .. }));
        assert!(msg.contains("aaa") && msg.contains("bbb"), "{}", msg);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn ignored_args_do_not_block_resume() {
        let root = temp_root("ignore");
        record(&root, "run", &args(json!({"lr": 0.1, "seed": 1})), "aaa");
        let current = args(json!({"lr": 0.1, "seed": 2}));
        let ignore = vec!["seed".to_string()];
        let found = try_resume(&root, Some("run"), false, &current, &version("aaa"), &ignore)
            .expect("resume");
        assert!(found.expect("allocation").existed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn explicit_id_without_recorded_run_is_fresh() {
        let root = temp_root("empty_named");
        ensure_dir(&root.join("half")).expect("half-started dir");
        let found = try_resume(&root, Some("half"), false, &Args::new(), &version("aaa"), &[])
            .expect("resolve")
            .expect("allocation");
        assert!(!found.existed);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scan_picks_greatest_matching_id() {
        let root = temp_root("scan");
        let a = args(json!({"lr": 0.1}));
        record(&root, "2", &a, "aaa");
        record(&root, "10", &a, "aaa");
        record(&root, "11", &a, "bbb");
        record(&root, "12", &args(json!({"lr": 0.5})), "aaa");
        fs::create_dir_all(root.join("13")).expect("empty dir");
        let found = try_resume(&root, None, true, &a, &version("aaa"), &[])
            .expect("scan")
            .expect("match");
        assert_eq!(found.id, ExperimentId::Numbered(10));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn scan_without_match_or_without_request_returns_none() {
        let root = temp_root("nomatch");
        let a = args(json!({"lr": 0.1}));
        record(&root, "1", &a, "aaa");
        assert!(try_resume(&root, None, true, &a, &version("zzz"), &[])
            .expect("scan")
            .is_none());
        assert!(try_resume(&root, None, false, &a, &version("aaa"), &[])
            .expect("no scan")
            .is_none());
        let _ = fs::remove_dir_all(root);
    }
}
