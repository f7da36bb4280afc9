use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use exp_analysis::{
    commit_group_table, experiments_table, experiments_table_with_columns, format_timestamp,
    CommitGroup, ExperimentRecord, ExperimentSet, LoadOptions,
};
use exp_core::args::display_value;
use exp_core::{Args, ExperimentId, GitCli, ProjectConfig, StaticVcs, Vcs};
use exp_session::{validate_id, Session, SessionOptions};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "exp", version, about = "Inspect and record experiment runs")]
struct Cli {
    /// Project directory, part of a git repository
    #[arg(long, global = true, default_value = ".")]
    project_directory: PathBuf,
    /// Experiments root; defaults to the project config, then `experiments`
    #[arg(long, global = true)]
    experiments_directory: Option<PathBuf>,
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Table of experiments, oldest first
    List {
        /// Add a column per non-default argument
        #[arg(long)]
        args: bool,
        #[arg(long)]
        last: Option<usize>,
    },
    /// Metadata, status, args and summary of one experiment
    Show { id: String },
    /// Entries of an experiment's log
    Log {
        id: String,
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Experiments grouped by commit, newest first
    Groups {
        #[arg(long)]
        last: Option<usize>,
    },
    /// Argument changes, repeats and code changes between experiments
    Changes,
    /// Patch between the commits two experiments ran against
    Diff { from: String, to: String },
    /// Run a command as a tracked experiment
    Run {
        #[arg(long)]
        experiment_id: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        norecord: bool,
        /// Recorded argument, `key=value`; values parse as JSON when possible
        #[arg(long = "set")]
        set: Vec<String>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

struct Workspace {
    project_directory: PathBuf,
    experiments_directory: PathBuf,
    config: ProjectConfig,
}

impl Workspace {
    fn load(cli: &Cli) -> Result<Self> {
        let config = ProjectConfig::load(&cli.project_directory)?;
        let experiments_directory = cli
            .experiments_directory
            .clone()
            .unwrap_or_else(|| config.experiments_directory.clone());
        Ok(Self {
            project_directory: cli.project_directory.clone(),
            experiments_directory,
            config,
        })
    }

    fn root(&self) -> PathBuf {
        self.project_directory.join(&self.experiments_directory)
    }

    fn experiments(&self) -> Result<ExperimentSet> {
        let options = LoadOptions {
            ignore_args: self.config.ignore_args.clone(),
        };
        let set = ExperimentSet::load(&self.root(), options)?;
        for skipped in set.skipped() {
            debug!(path = %skipped.path.display(), reason = %skipped.reason, "skipped");
        }
        Ok(set)
    }

    fn vcs(&self) -> Result<GitCli> {
        Ok(GitCli::discover(&self.project_directory)?)
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = cli.json;
    let result = Workspace::load(&cli).and_then(|ws| run_command(&ws, cli.command, json_mode));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_command(ws: &Workspace, command: Commands, json_mode: bool) -> Result<Option<Value>> {
    match command {
        Commands::List { args, last } => {
            let set = ws.experiments()?;
            let records = match last {
                Some(n) => set.last(n),
                None => set.records(),
            };
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "root": ws.root().display().to_string(),
                    "experiments": records.iter().map(record_to_json).collect::<Vec<_>>(),
                    "skipped": set.skipped().iter().map(|s| json!({
                        "path": s.path.display().to_string(),
                        "reason": s.reason,
                    })).collect::<Vec<_>>(),
                })));
            }
            let table = if !args && !ws.config.display_args.is_empty() {
                experiments_table_with_columns(records, &ws.config.display_args)
            } else {
                experiments_table(records, args)
            };
            println!("{table}");
            if !set.skipped().is_empty() {
                println!("skipped: {}", set.skipped().len());
            }
        }
        Commands::Show { id } => {
            let record = find_record(ws, &id)?;
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "experiment": record_to_json(&record),
                })));
            }
            print_record(&record);
        }
        Commands::Log { id, tail } => {
            let record = find_record(ws, &id)?;
            let mut entries = record.log()?;
            if let Some(n) = tail {
                entries = entries.split_off(entries.len().saturating_sub(n));
            }
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "log",
                    "id": record.id.to_string(),
                    "entries": entries,
                })));
            }
            for entry in entries {
                println!("{}", entry);
            }
        }
        Commands::Groups { last } => {
            let set = ws.experiments()?;
            let groups = set.group_by_commit(last);
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "groups",
                    "groups": groups.iter().map(group_to_json).collect::<Vec<_>>(),
                })));
            }
            for group in &groups {
                println!("{} {}", group.short_sha(), group.headline());
                let common = group.common_args();
                if !common.is_empty() {
                    println!("common: {}", Value::Object(common.into_iter().collect()));
                }
                println!("{}", commit_group_table(group));
            }
        }
        Commands::Changes => {
            let set = ws.experiments()?;
            let vcs = ws.vcs()?;
            let changes = set.gather_changes(&vcs)?;
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "changes",
                    "arg_changes": changes.arg_changes.iter().map(|(sha, ids)| {
                        (sha.clone(), json!(ids.iter().map(ToString::to_string).collect::<Vec<_>>()))
                    }).collect::<serde_json::Map<_, _>>(),
                    "repeats": changes.repeats.iter().map(|(sha, ids)| {
                        (sha.clone(), json!(ids.iter().map(ToString::to_string).collect::<Vec<_>>()))
                    }).collect::<serde_json::Map<_, _>>(),
                    "code_changes": changes.code_changes.iter().map(|c| json!({
                        "from": c.from.to_string(),
                        "to": c.to.to_string(),
                        "from_sha": c.from_sha,
                        "to_sha": c.to_sha,
                    })).collect::<Vec<_>>(),
                })));
            }
            print_id_sets("arg changes", &changes.arg_changes);
            print_id_sets("repeats", &changes.repeats);
            println!("code changes:");
            for change in &changes.code_changes {
                println!("  {}", change);
            }
        }
        Commands::Diff { from, to } => {
            let set = ws.experiments()?;
            let change = set
                .code_change(&ExperimentId::from_name(&from), &ExperimentId::from_name(&to))
                .ok_or_else(|| anyhow!("unknown experiment id: {} or {}", from, to))?;
            let vcs = ws.vcs()?;
            let patch = change.diff(&vcs)?;
            if json_mode {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "diff",
                    "from": change.from.to_string(),
                    "to": change.to.to_string(),
                    "patch": patch,
                })));
            }
            print!("{}", patch);
        }
        Commands::Run {
            experiment_id,
            description,
            resume,
            norecord,
            set,
            command,
        } => {
            let args = parse_set_bindings(&set)?;
            let options = SessionOptions {
                project_directory: ws.project_directory.clone(),
                experiments_directory: ws.experiments_directory.clone(),
                experiment_id,
                description,
                resume,
                norecord,
                ignore_args: ws.config.ignore_args.clone(),
                handle_interrupts: true,
            };
            let vcs: Box<dyn Vcs> = if norecord {
                Box::new(StaticVcs::new(&ws.project_directory, "", ""))
            } else {
                Box::new(ws.vcs()?)
            };
            let session = Session::start(args, None, &options, vcs.as_ref())?;
            let status = match run_mirrored(&session, &command) {
                Ok(status) => status,
                Err(err) => {
                    session.fail(format!("{:#}", err))?;
                    return Err(err);
                }
            };
            let code = exit_code(status);
            if json_mode {
                emit_json(&json!({
                    "ok": true,
                    "command": "run",
                    "id": session.id().map(ToString::to_string),
                    "dir": session.dir().display().to_string(),
                    "exit_code": code,
                }));
            }
            session.exit(code);
        }
    }
    Ok(None)
}

fn run_mirrored(session: &Session, command: &[String]) -> Result<ExitStatus> {
    let (program, rest) = command
        .split_first()
        .ok_or_else(|| anyhow!("missing command"))?;
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start {}", program))?;

    let mut copiers = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let mut mirror = session.stdout();
        copiers.push(thread::spawn(move || io::copy(&mut out, &mut mirror)));
    }
    if let Some(mut err) = child.stderr.take() {
        let mut mirror = session.stderr();
        copiers.push(thread::spawn(move || io::copy(&mut err, &mut mirror)));
    }
    let status = child.wait().context("failed to wait for child")?;
    for copier in copiers {
        match copier.join() {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "output copy failed"),
            Err(_) => warn!("output copier panicked"),
        }
    }
    Ok(status)
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn find_record(ws: &Workspace, id: &str) -> Result<ExperimentRecord> {
    let root = ws.root();
    validate_id(&root, id)?;
    let path = root.join(id);
    if !path.is_dir() {
        return Err(anyhow!("no experiment {} under {}", id, ws.root().display()));
    }
    Ok(ExperimentRecord::load_with(&path, &ws.config.ignore_args)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn parse_set_bindings(values: &[String]) -> Result<Args> {
    let mut out = Args::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid --set '{}': expected k=v", raw))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("invalid --set '{}': key cannot be empty", raw));
        }
        let parsed =
            serde_json::from_str::<Value>(val_raw).unwrap_or_else(|_| Value::String(val_raw.to_string()));
        out.insert(key.to_string(), parsed);
    }
    Ok(out)
}

fn record_to_json(record: &ExperimentRecord) -> Value {
    json!({
        "id": record.id.to_string(),
        "path": record.path.display().to_string(),
        "status": record.status.as_str(),
        "status_message": record.status_message,
        "timestamp": record.timestamp.map(|ts| ts.to_rfc3339()),
        "metadata": record.metadata,
        "args": record.args,
        "all_args": record.all_args,
        "default_args": record.default_args,
        "summary": record.summary,
    })
}

fn group_to_json(group: &CommitGroup<'_>) -> Value {
    json!({
        "sha": group.sha,
        "message": group.headline(),
        "common_args": group.common_args(),
        "differing_args": group.differing_args(),
        "experiments": group.experiments.iter().map(|r| r.id.to_string()).collect::<Vec<_>>(),
    })
}

fn print_record(record: &ExperimentRecord) {
    println!("id: {}", record.id);
    println!("path: {}", record.path.display());
    println!("status: {}", record.status);
    if !record.status_message.is_empty() {
        println!("status_message: {}", record.status_message);
    }
    println!("start_time: {}", format_timestamp(record.timestamp));
    if let Some(end) = record.metadata.end_time {
        println!("end_time: {}", format_timestamp(Some(end)));
    }
    println!("commit: {} {}", record.metadata.short_sha(), record.metadata.headline());
    if !record.metadata.description.is_empty() {
        println!("description: {}", record.metadata.description);
    }
    if !record.metadata.command.is_empty() {
        println!("command: {}", record.metadata.command.join(" "));
    }
    print_mapping("args", &record.args);
    print_mapping("summary", &record.summary);
}

fn print_mapping(label: &str, values: &Args) {
    println!("{}:", label);
    for (key, value) in values {
        println!("  {}: {}", key, display_value(value));
    }
}

fn print_id_sets(label: &str, sets: &BTreeMap<String, BTreeSet<ExperimentId>>) {
    println!("{}:", label);
    for (sha, ids) in sets {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        println!("  {} {}", short(sha), ids.join(", "));
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}
