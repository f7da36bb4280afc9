use exp_core::{ensure_dir, ExperimentError, ExperimentId, Result, Vcs};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

const GITIGNORE: &str = ".gitignore";
const IGNORE_COMMIT_MESSAGE: &str = "Added experiments directory to .gitignore";
const MAX_CREATE_ATTEMPTS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: ExperimentId,
    pub path: PathBuf,
    pub existed: bool,
}

/// Creates `root` and, when it lies inside the working tree, commits a
/// `.gitignore` entry for it once.
pub fn prepare_root(root: &Path, vcs: &dyn Vcs) -> Result<()> {
    ensure_dir(root)?;
    let workdir = fs::canonicalize(vcs.workdir()).unwrap_or_else(|_| vcs.workdir().to_path_buf());
    let root_abs = fs::canonicalize(root).map_err(|e| ExperimentError::directory(root, e))?;
    let Ok(rel) = root_abs.strip_prefix(&workdir) else {
        debug!(root = %root_abs.display(), "experiments root is outside the working tree");
        return Ok(());
    };
    if rel.as_os_str().is_empty() {
        return Ok(());
    }
    let entry = rel.to_string_lossy().replace('\\', "/");
    let gitignore = workdir.join(GITIGNORE);
    let existing = match fs::read_to_string(&gitignore) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %gitignore.display(), "creating .gitignore");
            String::new()
        }
        Err(e) => return Err(ExperimentError::io(&gitignore, e)),
    };
    if existing
        .lines()
        .any(|line| normalize_ignore_line(line) == entry)
    {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    fs::write(&gitignore, updated).map_err(|e| ExperimentError::io(&gitignore, e))?;
    info!(entry = %entry, "added experiments directory to .gitignore");
    vcs.commit_file(&gitignore, IGNORE_COMMIT_MESSAGE)
}

fn normalize_ignore_line(line: &str) -> String {
    let trimmed = line.trim().trim_start_matches("./").trim_end_matches('/');
    trimmed.trim_start_matches('/').to_string()
}

/// Without `requested_id`, creates the next integer after the largest numeric
/// child, skipping numbers claimed concurrently.
pub fn allocate(root: &Path, requested_id: Option<&str>) -> Result<Allocation> {
    ensure_dir(root)?;
    match requested_id {
        Some(name) => allocate_named(root, name),
        None => allocate_next(root),
    }
}

fn allocate_named(root: &Path, name: &str) -> Result<Allocation> {
    validate_id(root, name)?;
    let path = root.join(name);
    let id = ExperimentId::from_name(name);
    if path.is_dir() {
        info!(dir = %path.display(), "using existing experiment directory");
        return Ok(Allocation {
            id,
            path,
            existed: true,
        });
    }
    fs::create_dir(&path).map_err(|e| ExperimentError::directory(&path, e))?;
    info!(dir = %path.display(), "created experiment directory for requested id");
    Ok(Allocation {
        id,
        path,
        existed: false,
    })
}

/// Rejects ids that are empty, `.`/`..`, or contain a path separator.
pub fn validate_id(root: &Path, name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    let valid = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if valid {
        Ok(())
    } else {
        Err(ExperimentError::directory(
            root.join(name),
            std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("experiment id {:?} must be a single path component", name),
            ),
        ))
    }
}

fn allocate_next(root: &Path) -> Result<Allocation> {
    let mut candidate = max_numbered_child(root)? + 1;
    for _ in 0..MAX_CREATE_ATTEMPTS {
        let path = root.join(candidate.to_string());
        match fs::create_dir(&path) {
            Ok(()) => {
                info!(dir = %path.display(), "new experiment");
                return Ok(Allocation {
                    id: ExperimentId::Numbered(candidate),
                    path,
                    existed: false,
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(candidate, "experiment id already taken, trying the next one");
                candidate += 1;
            }
            Err(e) => return Err(ExperimentError::directory(&path, e)),
        }
    }
    Err(ExperimentError::directory(
        root,
        std::io::Error::new(
            ErrorKind::AlreadyExists,
            "could not claim a fresh experiment number",
        ),
    ))
}

pub fn max_numbered_child(root: &Path) -> Result<u64> {
    let mut max = 0;
    for entry in child_dirs(root)? {
        let parsed = entry
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(n) = parsed {
            max = max.max(n);
        }
    }
    Ok(max)
}

pub fn child_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(ErrorKind::Other, "directory walk failed"));
            ExperimentError::directory(path, source)
        })?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}
