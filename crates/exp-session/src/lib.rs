//! Recording a run from a host program:
//!
//! ```no_run
//! use exp_core::{args_from, GitCli};
//! use exp_session::{Session, SessionOptions};
//! use serde_json::json;
//!
//! # fn main() -> exp_core::Result<()> {
//! let vcs = GitCli::discover(std::path::Path::new("."))?;
//! let args = args_from(&json!({"lr": 0.1, "epochs": 5}))?;
//! let session = Session::start(args, None, &SessionOptions::default(), &vcs)?;
//! session.log(&json!({"epoch": 1, "loss": 0.7}))?;
//! session.summary(&json!({"best_loss": 0.7}))?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
mod hooks;
pub mod matcher;
pub mod mirror;
pub mod options;
pub mod session;

pub use allocator::{allocate, prepare_root, validate_id, Allocation};
pub use hooks::INTERRUPT_EXIT_CODE;
pub use matcher::try_resume;
pub use mirror::{MirroredStream, StreamKind};
pub use options::{defaults_from_command, ExperimentArgs, SessionOptions};
pub use session::{Session, SessionState, Termination};
