//! Error taxonomy for the installation run.
//!
//! Every failure is fatal to the run; nothing is retried. The variants
//! mirror the stages of the run so callers and tests can tell a rejected
//! command line from a failed external tool.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, InstallerError>;

/// Errors produced by one installation run.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// Bad or missing command-line input. Detected before any external
    /// effect; recoverable by correcting the invocation.
    #[error("{0}")]
    Config(String),

    /// The process lacks the privilege required to partition disks and
    /// mount filesystems.
    #[error("{0}")]
    Privilege(String),

    /// The build evaluator failed or returned a malformed artifact set.
    #[error("{0}")]
    Build(String),

    /// The partition script exited with a non-zero status.
    #[error("partition script '{}' failed with {}", .script.display(), .status)]
    Partition { script: PathBuf, status: ExitStatus },

    /// Copying an extra file into the target root failed.
    #[error("copying '{}' to '{}': {}", .from.display(), .to.display(), .reason)]
    Copy {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    /// The system installer exited with a non-zero status.
    #[error("nixos-install failed with {status}")]
    Install { status: ExitStatus },

    /// Filesystem or process-spawn failure outside the stages above.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl InstallerError {
    /// Wrap an [`io::Error`] with a short description of the attempted
    /// action, for use with `map_err`.
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| InstallerError::Io { context, source }
    }
}
