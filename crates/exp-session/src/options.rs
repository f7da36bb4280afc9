use clap::Args as ClapArgs;
use exp_core::{Args, ProjectConfig};
use serde_json::Value;
use std::path::PathBuf;

pub const TRACKING_ARG_IDS: &[&str] = &[
    "project_directory",
    "experiments_directory",
    "experiment_id",
    "description",
    "resume",
    "norecord",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub project_directory: PathBuf,
    pub experiments_directory: PathBuf,
    /// Explicit id. An existing directory with this id is resumed only when
    /// its args and commit match.
    pub experiment_id: Option<String>,
    pub description: String,
    pub resume: bool,
    /// Skip tracking entirely; every session operation becomes a no-op.
    pub norecord: bool,
    pub ignore_args: Vec<String>,
    /// Record Ctrl-C as an interrupted run and exit with code 130.
    pub handle_interrupts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            project_directory: PathBuf::from("."),
            experiments_directory: PathBuf::from("experiments"),
            experiment_id: None,
            description: String::new(),
            resume: false,
            norecord: false,
            ignore_args: Vec::new(),
            handle_interrupts: false,
        }
    }
}

impl SessionOptions {
    pub fn experiments_root(&self) -> PathBuf {
        self.project_directory.join(&self.experiments_directory)
    }

    /// Values already set away from their defaults win over the project config.
    pub fn with_project_config(mut self, config: &ProjectConfig) -> Self {
        if self.experiments_directory == SessionOptions::default().experiments_directory {
            self.experiments_directory = config.experiments_directory.clone();
        }
        for name in &config.ignore_args {
            if !self.ignore_args.contains(name) {
                self.ignore_args.push(name.clone());
            }
        }
        self
    }
}

/// Tracking flags for a host program's clap parser:
///
/// ```ignore
/// #[derive(clap::Parser, serde::Serialize)]
/// struct Train {
///     #[arg(long, default_value_t = 0.01)]
///     lr: f64,
///     #[command(flatten)]
///     #[serde(skip)]
///     tracking: exp_session::ExperimentArgs,
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, ClapArgs)]
#[command(next_help_heading = "Experiment tracking")]
pub struct ExperimentArgs {
    /// Project directory, part of a git repository
    #[arg(long, default_value = ".")]
    pub project_directory: PathBuf,
    /// Directory that stores experiments, relative to the project directory
    #[arg(long, default_value = "experiments")]
    pub experiments_directory: PathBuf,
    /// Name the experiment directory explicitly; an existing one is resumed
    /// when args and commit match
    #[arg(long)]
    pub experiment_id: Option<String>,
    /// Free-text description stored in the metadata
    #[arg(long, default_value = "")]
    pub description: String,
    /// Resume the latest experiment with identical args and commit
    #[arg(long)]
    pub resume: bool,
    /// Disable tracking; the repository may be dirty and nothing is written
    #[arg(long)]
    pub norecord: bool,
}

impl ExperimentArgs {
    pub fn into_options(self) -> SessionOptions {
        SessionOptions {
            project_directory: self.project_directory,
            experiments_directory: self.experiments_directory,
            experiment_id: self.experiment_id,
            description: self.description,
            resume: self.resume,
            norecord: self.norecord,
            ..SessionOptions::default()
        }
    }
}

/// Defaults declared by a clap command, minus tracking flags and positionals.
/// Each default parses as JSON when possible and stays a string otherwise.
pub fn defaults_from_command(command: &clap::Command) -> Args {
    let mut command = command.clone();
    command.build();
    let mut defaults = Args::new();
    for arg in command.get_arguments() {
        let id = arg.get_id().as_str();
        if arg.is_positional() || TRACKING_ARG_IDS.contains(&id) {
            continue;
        }
        let mut values: Vec<Value> = arg
            .get_default_values()
            .iter()
            .map(|v| parse_default(&v.to_string_lossy()))
            .collect();
        let value = match values.len() {
            0 => continue,
            1 => values.remove(0),
            _ => Value::Array(values),
        };
        defaults.insert(id.to_string(), value);
    }
    defaults
}

fn parse_default(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
