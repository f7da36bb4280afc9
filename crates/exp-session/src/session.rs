use chrono::Utc;
use exp_core::record::{
    ARGS_FILE, DEFAULT_ARGS_FILE, LOG_FILE, METADATA_FILE, STATUS_FILE, STDERR_FILE, STDOUT_FILE,
    SUMMARY_FILE,
};
use exp_core::{
    args_from, atomic_write_bytes, atomic_write_json_pretty, load_optional_json, Args,
    ExperimentError, ExperimentId, Metadata, Result, Status, StatusMarker, Vcs,
};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};

use crate::allocator::{allocate, prepare_root};
use crate::hooks;
use crate::matcher::try_resume;
use crate::mirror::{MirroredStream, StreamKind};
use crate::options::SessionOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unstarted,
    Active,
    Succeeded,
    Failed,
    Disabled,
}

/// How the process (or the caller) ended the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Normal,
    Exit(i32),
    Fault(String),
    Interrupted,
}

impl Termination {
    pub fn marker(&self) -> StatusMarker {
        match self {
            Termination::Normal | Termination::Exit(0) => StatusMarker::new(Status::Success, ""),
            Termination::Exit(code) => StatusMarker::new(Status::Error, format!("exit({})", code)),
            Termination::Fault(description) => StatusMarker::new(Status::Error, description.clone()),
            Termination::Interrupted => StatusMarker::new(Status::Error, "interrupted"),
        }
    }
}

pub(crate) struct SessionCore {
    dir: PathBuf,
    metadata: Metadata,
    state: SessionState,
    stdout: MirroredStream,
    stderr: MirroredStream,
    hook_key: Option<u64>,
}

impl SessionCore {
    pub(crate) fn finalize(&mut self, termination: Termination) -> Result<bool> {
        if self.state != SessionState::Active {
            return Ok(false);
        }
        let marker = termination.marker();
        self.state = if marker.status == Status::Success {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };
        self.metadata.end_time = Some(Utc::now());
        let metadata_written =
            atomic_write_json_pretty(&self.dir.join(METADATA_FILE), &self.metadata);
        let status_written =
            atomic_write_bytes(&self.dir.join(STATUS_FILE), marker.render().as_bytes());
        self.stdout.release();
        self.stderr.release();
        if let Some(key) = self.hook_key.take() {
            hooks::unregister(key);
        }
        info!(dir = %self.dir.display(), status = %marker.status, "experiment finished");
        metadata_written?;
        status_written?;
        Ok(true)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == SessionState::Active {
            Ok(())
        } else {
            Err(ExperimentError::NotActive)
        }
    }
}

/// A tracked run, held by the host program for its whole lifetime.
///
/// Dropping the session records `SUCCESS`, or `ERROR` when the thread is
/// unwinding from a panic. [`Session::exit`] records the exit code; any other
/// process exit records `ERROR`. The first finalization wins.
pub struct Session {
    core: Option<Arc<Mutex<SessionCore>>>,
    id: Option<ExperimentId>,
    dir: PathBuf,
    resumed: bool,
    stdout: MirroredStream,
    stderr: MirroredStream,
}

impl Session {
    /// Starts (or resumes) an experiment in a clean repository. `STATUS` is
    /// written last, so a failed start never leaves `RUNNING` behind.
    pub fn start(
        args: Args,
        default_args: Option<Args>,
        options: &SessionOptions,
        vcs: &dyn Vcs,
    ) -> Result<Self> {
        if options.norecord {
            return Ok(Self::disabled());
        }
        if vcs.is_dirty()? {
            return Err(ExperimentError::DirtyRepository {
                workdir: vcs.workdir().to_path_buf(),
            });
        }
        let root = options.experiments_root();
        prepare_root(&root, vcs)?;
        let version = vcs.head()?;

        let resumed_allocation = try_resume(
            &root,
            options.experiment_id.as_deref(),
            options.resume,
            &args,
            &version,
            &options.ignore_args,
        )?;
        let allocation = match resumed_allocation {
            Some(allocation) => allocation,
            None => allocate(&root, None)?,
        };
        let dir = allocation.path;

        // Keys written by other tools survive a resume.
        let extra = if allocation.existed {
            load_optional_json::<Metadata>(&dir.join(METADATA_FILE))?
                .map(|stored| stored.extra)
                .unwrap_or_default()
        } else {
            Default::default()
        };
        let metadata = Metadata {
            githead_sha: version.sha,
            githead_message: version.message,
            description: options.description.clone(),
            start_time: Some(Utc::now()),
            end_time: None,
            command: std::env::args().collect(),
            extra,
        };
        atomic_write_json_pretty(&dir.join(ARGS_FILE), &args)?;
        if let Some(defaults) = &default_args {
            atomic_write_json_pretty(&dir.join(DEFAULT_ARGS_FILE), defaults)?;
        }
        atomic_write_json_pretty(&dir.join(METADATA_FILE), &metadata)?;

        let stdout = MirroredStream::open(StreamKind::Stdout, &dir.join(STDOUT_FILE))?;
        let stderr = MirroredStream::open(StreamKind::Stderr, &dir.join(STDERR_FILE))?;
        let status_written = atomic_write_bytes(
            &dir.join(STATUS_FILE),
            StatusMarker::running().render().as_bytes(),
        );
        if let Err(err) = status_written {
            stdout.release();
            stderr.release();
            return Err(err);
        }

        let core = Arc::new(Mutex::new(SessionCore {
            dir: dir.clone(),
            metadata,
            state: SessionState::Unstarted,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            hook_key: None,
        }));
        let key = hooks::register(&core, options.handle_interrupts);
        {
            let mut guard = lock(&core);
            guard.hook_key = Some(key);
            guard.state = SessionState::Active;
        }
        info!(dir = %dir.display(), resumed = allocation.existed, "experiment started");

        Ok(Self {
            core: Some(core),
            id: Some(allocation.id),
            dir,
            resumed: allocation.existed,
            stdout,
            stderr,
        })
    }

    pub fn disabled() -> Self {
        Self {
            core: None,
            id: None,
            dir: PathBuf::from("."),
            resumed: false,
            stdout: MirroredStream::passthrough(StreamKind::Stdout),
            stderr: MirroredStream::passthrough(StreamKind::Stderr),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.core.is_some()
    }

    pub fn id(&self) -> Option<&ExperimentId> {
        self.id.as_ref()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn state(&self) -> SessionState {
        match &self.core {
            Some(core) => lock(core).state,
            None => SessionState::Disabled,
        }
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.core.as_ref().map(|core| lock(core).metadata.clone())
    }

    pub fn stdout(&self) -> MirroredStream {
        self.stdout.clone()
    }

    pub fn stderr(&self) -> MirroredStream {
        self.stderr.clone()
    }

    /// Resolves `name` inside the experiment directory; absolute paths are
    /// returned unchanged.
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        let name = name.as_ref();
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            self.dir.join(name)
        }
    }

    pub fn open(&self, name: impl AsRef<Path>, options: &OpenOptions) -> Result<File> {
        let path = self.path(name);
        options.open(&path).map_err(|e| ExperimentError::io(&path, e))
    }

    pub fn log<T: Serialize + ?Sized>(&self, entry: &T) -> Result<()> {
        let Some(core) = &self.core else {
            return Ok(());
        };
        let core = lock(core);
        core.ensure_active()?;
        let path = core.dir.join(LOG_FILE);
        let bytes = serde_json::to_vec_pretty(entry).map_err(|e| ExperimentError::json(&path, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ExperimentError::io(&path, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.flush())
            .map_err(|e| ExperimentError::io(&path, e))
    }

    pub fn summary<T: Serialize + ?Sized>(&self, partial: &T) -> Result<()> {
        let Some(core) = &self.core else {
            return Ok(());
        };
        let partial = args_from(partial)?;
        let core = lock(core);
        core.ensure_active()?;
        let path = core.dir.join(SUMMARY_FILE);
        let mut summary = load_optional_json::<Args>(&path)?.unwrap_or_default();
        summary.extend(partial);
        atomic_write_json_pretty(&path, &summary)
    }

    pub fn finalize(&self, termination: Termination) -> Result<bool> {
        match &self.core {
            Some(core) => lock(core).finalize(termination),
            None => Ok(false),
        }
    }

    pub fn finish(&self) -> Result<bool> {
        self.finalize(Termination::Normal)
    }

    pub fn fail(&self, message: impl Into<String>) -> Result<bool> {
        self.finalize(Termination::Fault(message.into()))
    }

    pub fn exit(self, code: i32) -> ! {
        if let Err(err) = self.finalize(Termination::Exit(code)) {
            error!(error = %err, "failed to record exit status");
        }
        std::process::exit(code)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(core) = &self.core else {
            return;
        };
        let termination = if std::thread::panicking() {
            Termination::Fault(
                hooks::current_panic_description().unwrap_or_else(|| "panicked".to_string()),
            )
        } else {
            Termination::Normal
        };
        if let Err(err) = lock(core).finalize(termination) {
            error!(error = %err, "failed to record final status");
        }
    }
}

fn lock(core: &Arc<Mutex<SessionCore>>) -> MutexGuard<'_, SessionCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}
