use exp_core::args::display_value;
use exp_core::{args_equal, Args, ExperimentError, ExperimentId, Result, Vcs};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::reader::ExperimentRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub ignore_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedExperiment {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ExperimentSet {
    root: PathBuf,
    options: LoadOptions,
    records: Vec<ExperimentRecord>,
    index: BTreeMap<ExperimentId, usize>,
    skipped: Vec<SkippedExperiment>,
}

impl ExperimentSet {
    pub fn load(root: &Path, options: LoadOptions) -> Result<Self> {
        let mut set = Self {
            root: root.to_path_buf(),
            options,
            records: Vec::new(),
            index: BTreeMap::new(),
            skipped: Vec::new(),
        };
        set.refresh()?;
        Ok(set)
    }

    /// Rescans the root. A directory that fails to load is skipped with a
    /// warning; only a missing or unreadable root is an error.
    pub fn refresh(&mut self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(ExperimentError::directory(
                &self.root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "experiments root not found"),
            ));
        }
        let mut records = Vec::new();
        let mut skipped = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    warn!(path = %path.display(), error = %err, "skipping unreadable entry");
                    skipped.push(SkippedExperiment {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match ExperimentRecord::load_with(entry.path(), &self.options.ignore_args) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "skipping unreadable experiment"
                    );
                    skipped.push(SkippedExperiment {
                        path: entry.path().to_path_buf(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        self.index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
        debug!(
            root = %self.root.display(),
            loaded = records.len(),
            skipped = skipped.len(),
            "scanned experiments"
        );
        self.records = records;
        self.skipped = skipped;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &ExperimentId) -> Option<&ExperimentRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ExperimentRecord> + '_ {
        self.records.iter()
    }

    pub fn records(&self) -> &[ExperimentRecord] {
        &self.records
    }

    pub fn last(&self, n: usize) -> &[ExperimentRecord] {
        &self.records[self.records.len().saturating_sub(n)..]
    }

    pub fn skipped(&self) -> &[SkippedExperiment] {
        &self.skipped
    }

    /// Partitions the records (or only the last `last` of them) by commit.
    /// Members are newest first and groups are ordered by their newest
    /// member, newest first.
    pub fn group_by_commit(&self, last: Option<usize>) -> Vec<CommitGroup<'_>> {
        let records = match last {
            Some(n) => self.last(n),
            None => &self.records[..],
        };
        let mut groups: Vec<CommitGroup<'_>> = Vec::new();
        for record in records.iter().rev() {
            match groups.iter_mut().find(|g| g.sha == record.sha()) {
                Some(group) => group.experiments.push(record),
                None => groups.push(CommitGroup {
                    sha: record.sha().to_string(),
                    message: record.metadata.githead_message.clone(),
                    experiments: vec![record],
                }),
            }
        }
        groups
    }

    /// Classifies every ordered pair of experiments: same commit with other
    /// args, same commit repeated, or an ancestor commit re-run with the same
    /// args.
    pub fn gather_changes(&self, vcs: &dyn Vcs) -> Result<Changes> {
        let mut changes = Changes::default();
        let mut ancestry: HashMap<(&str, &str), bool> = HashMap::new();
        for first in &self.records {
            for second in &self.records {
                if first.id == second.id {
                    continue;
                }
                let same_args = args_equal(&first.all_args, &second.all_args, &[]);
                if first.sha() == second.sha() {
                    let bucket = if same_args {
                        &mut changes.repeats
                    } else {
                        &mut changes.arg_changes
                    };
                    let ids = bucket.entry(first.sha().to_string()).or_default();
                    ids.insert(first.id.clone());
                    ids.insert(second.id.clone());
                    continue;
                }
                if !same_args || first.sha().is_empty() || second.sha().is_empty() {
                    continue;
                }
                let key = (first.sha(), second.sha());
                let is_ancestor = match ancestry.get(&key) {
                    Some(known) => *known,
                    None => {
                        let known = vcs.is_ancestor(first.sha(), second.sha())?;
                        ancestry.insert(key, known);
                        known
                    }
                };
                if is_ancestor {
                    changes.code_changes.push(CodeChange::between(first, second));
                }
            }
        }
        Ok(changes)
    }

    pub fn code_change(&self, from: &ExperimentId, to: &ExperimentId) -> Option<CodeChange> {
        Some(CodeChange::between(self.get(from)?, self.get(to)?))
    }
}

#[derive(Debug, Clone)]
pub struct CommitGroup<'a> {
    pub sha: String,
    pub message: String,
    pub experiments: Vec<&'a ExperimentRecord>,
}

impl<'a> CommitGroup<'a> {
    pub fn short_sha(&self) -> &str {
        self.sha.get(..7).unwrap_or(&self.sha)
    }

    pub fn headline(&self) -> &str {
        self.message.lines().next().unwrap_or("").trim()
    }

    fn arg_names(&self) -> Vec<&'a str> {
        let mut names: Vec<&'a str> = Vec::new();
        for record in &self.experiments {
            for name in record.args.keys() {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn values_agree(&self, name: &str) -> bool {
        let mut values = self
            .experiments
            .iter()
            .map(|r| r.all_args.get(name).map(display_value));
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }

    pub fn common_args(&self) -> Args {
        self.arg_names()
            .into_iter()
            .filter(|name| self.values_agree(name))
            .filter_map(|name| {
                let value = self.experiments.first()?.all_args.get(name)?.clone();
                Some((name.to_string(), value))
            })
            .collect()
    }

    pub fn differing_args(&self) -> Vec<String> {
        self.arg_names()
            .into_iter()
            .filter(|name| !self.values_agree(name))
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub arg_changes: BTreeMap<String, BTreeSet<ExperimentId>>,
    pub repeats: BTreeMap<String, BTreeSet<ExperimentId>>,
    pub code_changes: Vec<CodeChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChange {
    pub from: ExperimentId,
    pub to: ExperimentId,
    pub from_sha: String,
    pub to_sha: String,
    pub from_message: String,
    pub to_message: String,
}

impl CodeChange {
    fn between(from: &ExperimentRecord, to: &ExperimentRecord) -> Self {
        Self {
            from: from.id.clone(),
            to: to.id.clone(),
            from_sha: from.sha().to_string(),
            to_sha: to.sha().to_string(),
            from_message: from.metadata.headline().to_string(),
            to_message: to.metadata.headline().to_string(),
        }
    }

    pub fn diff(&self, vcs: &dyn Vcs) -> Result<String> {
        vcs.diff(&self.from_sha, &self.to_sha)
    }
}

impl fmt::Display for CodeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}->{}|{}",
            self.from, self.from_message, self.to, self.to_message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exp_core::record::{ARGS_FILE, METADATA_FILE, STATUS_FILE};
    use exp_core::{atomic_write_json_pretty, ensure_dir, StaticVcs};
    use serde_json::{json, Value};
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "exp_set_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp root");
        dir
    }

    fn write_experiment(root: &Path, id: &str, sha: &str, minute: u32, args: Value) {
        let dir = root.join(id);
        ensure_dir(&dir).expect("experiment dir");
        atomic_write_json_pretty(
            &dir.join(METADATA_FILE),
            &json!({
                "githead-sha": sha,
                "githead-message": format!("commit {}\n\nbody", sha),
                "start-time": format!("2024-03-01T10:{:02}:00Z", minute),
            }),
        )
        .expect("metadata");
        atomic_write_json_pretty(&dir.join(ARGS_FILE), &args).expect("args");
        fs::write(dir.join(STATUS_FILE), "SUCCESS").expect("status");
    }

    fn ids<'a>(records: impl Iterator<Item = &'a ExperimentRecord>) -> Vec<String> {
        records.map(|r| r.id.to_string()).collect()
    }

    #[test]
    fn faulty_directory_is_skipped_and_reported() {
        let root = temp_root("faulty");
        for (i, minute) in [(1, 5), (2, 1), (3, 3), (4, 2)] {
            write_experiment(&root, &i.to_string(), "aaa", minute, json!({"lr": i}));
        }
        ensure_dir(&root.join("5")).expect("broken dir");
        fs::write(root.join("5").join(METADATA_FILE), "{\"githead-sha\": ").expect("corrupt");
        fs::write(root.join("notes.txt"), "not an experiment").expect("file");

        let set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");
        assert_eq!(set.len(), 4);
        assert_eq!(ids(set.iter()), vec!["2", "4", "3", "1"]);
        assert_eq!(set.skipped().len(), 1);
        assert!(set.skipped()[0].path.ends_with("5"));
        assert!(set.get(&ExperimentId::Numbered(3)).is_some());
        assert!(set.get(&ExperimentId::Numbered(5)).is_none());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn refresh_picks_up_new_experiments() {
        let root = temp_root("refresh");
        write_experiment(&root, "1", "aaa", 1, json!({}));
        let mut set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");
        assert_eq!(set.len(), 1);
        write_experiment(&root, "2", "aaa", 2, json!({}));
        set.refresh().expect("refresh");
        assert_eq!(ids(set.iter()), vec!["1", "2"]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = temp_root("missing").join("absent");
        let err = ExperimentSet::load(&root, LoadOptions::default()).expect_err("missing root");
        assert!(matches!(err, ExperimentError::Directory { .. }), "{}", err);
    }

    #[test]
    fn groups_follow_newest_member() {
        let root = temp_root("groups");
        write_experiment(&root, "1", "aaa", 1, json!({"lr": 0.1, "epochs": 5}));
        write_experiment(&root, "2", "bbb", 2, json!({"lr": 0.1}));
        write_experiment(&root, "3", "aaa", 3, json!({"lr": 0.2, "epochs": 5}));
        let set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");

        let groups = set.group_by_commit(None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].sha, "aaa");
        assert_eq!(groups[0].headline(), "commit aaa");
        assert_eq!(ids(groups[0].experiments.iter().copied()), vec!["3", "1"]);
        assert_eq!(groups[1].sha, "bbb");
        assert_eq!(groups[0].differing_args(), vec!["lr".to_string()]);
        assert_eq!(
            groups[0].common_args(),
            exp_core::args_from(&json!({"epochs": 5})).expect("args")
        );

        let recent = set.group_by_commit(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(ids(recent[0].experiments.iter().copied()), vec!["3"]);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn changes_classify_pairs() {
        let root = temp_root("changes");
        write_experiment(&root, "1", "aaa", 1, json!({"lr": 0.1}));
        write_experiment(&root, "2", "aaa", 2, json!({"lr": 0.1}));
        write_experiment(&root, "3", "aaa", 3, json!({"lr": 0.2}));
        write_experiment(&root, "4", "bbb", 4, json!({"lr": 0.2}));
        write_experiment(&root, "5", "ccc", 5, json!({"lr": 0.2}));
        let set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");
        let vcs = StaticVcs::new(&root, "bbb", "head").with_ancestry("aaa", "bbb");

        let changes = set.gather_changes(&vcs).expect("changes");
        let set_of = |ids: &[u64]| -> BTreeSet<ExperimentId> {
            ids.iter().map(|&n| ExperimentId::Numbered(n)).collect()
        };
        assert_eq!(changes.repeats.get("aaa"), Some(&set_of(&[1, 2])));
        assert_eq!(changes.arg_changes.get("aaa"), Some(&set_of(&[1, 2, 3])));
        assert_eq!(changes.code_changes.len(), 1);
        let change = &changes.code_changes[0];
        assert_eq!(change.from, ExperimentId::Numbered(3));
        assert_eq!(change.to, ExperimentId::Numbered(4));
        assert_eq!(change.to_string(), "3|commit aaa->4|commit bbb");
        assert_eq!(change.diff(&vcs).expect("diff"), "diff aaa..bbb\n");
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn ignored_args_do_not_split_repeats() {
        let root = temp_root("ignored");
        write_experiment(&root, "1", "aaa", 1, json!({"lr": 0.1, "seed": 1}));
        write_experiment(&root, "2", "aaa", 2, json!({"lr": 0.1, "seed": 2}));
        let options = LoadOptions {
            ignore_args: vec!["seed".to_string()],
        };
        let set = ExperimentSet::load(&root, options).expect("load");
        let vcs = StaticVcs::new(&root, "aaa", "head");
        let changes = set.gather_changes(&vcs).expect("changes");
        assert!(changes.arg_changes.is_empty());
        assert_eq!(changes.repeats.get("aaa").map(BTreeSet::len), Some(2));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn code_change_between_any_two_ids() {
        let root = temp_root("codechange");
        write_experiment(&root, "1", "aaa", 1, json!({}));
        write_experiment(&root, "named", "bbb", 2, json!({}));
        let set = ExperimentSet::load(&root, LoadOptions::default()).expect("load");
        let change = set
            .code_change(&ExperimentId::Numbered(1), &"named".into())
            .expect("both exist");
        assert_eq!(change.from_sha, "aaa");
        assert_eq!(change.to_sha, "bbb");
        assert!(set.code_change(&ExperimentId::Numbered(9), &"named".into()).is_none());
        let _ = fs::remove_dir_all(&root);
    }
}
