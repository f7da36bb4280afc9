use exp_core::{ExperimentError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Writes to the process stream and appends the same bytes to the
/// experiment's file.
#[derive(Debug, Clone)]
pub struct MirroredStream {
    kind: StreamKind,
    file: Arc<Mutex<Option<File>>>,
}

impl MirroredStream {
    pub(crate) fn open(kind: StreamKind, path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ExperimentError::io(path, e))?;
        Ok(Self {
            kind,
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    pub fn passthrough(kind: StreamKind) -> Self {
        Self {
            kind,
            file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn is_mirroring(&self) -> bool {
        self.lock_file().is_some()
    }

    /// Flushes and closes the mirror file; later writes reach the process
    /// stream only. Every clone shares the same file slot.
    pub(crate) fn release(&self) {
        if let Some(mut file) = self.lock_file().take() {
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }

    fn lock_file(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for MirroredStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // The file lock spans both writes so clones never interleave.
        let mut file = self.lock_file();
        match self.kind {
            StreamKind::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(buf)?;
                out.flush()?;
            }
            StreamKind::Stderr => io::stderr().lock().write_all(buf)?,
        }
        if let Some(file) = file.as_mut() {
            file.write_all(buf)?;
            file.flush()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self.lock_file();
        match self.kind {
            StreamKind::Stdout => io::stdout().flush()?,
            StreamKind::Stderr => io::stderr().flush()?,
        }
        if let Some(file) = file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for MirroredStream {
    type Writer = MirroredStream;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
