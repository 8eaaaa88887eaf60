//! Error handling for the lifecycle engine.

use std::path::PathBuf;

use thiserror::Error;

use grani_batch::BatchError;

/// Result type for lifecycle operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the lifecycle engine.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Wipe was attempted on a job that is not in a terminal state. The
    /// working directory is left untouched.
    #[error("job '{0}' is not in a terminal state")]
    NotTerminal(String),

    /// The per-job info file does not exist. Single-job commands fail with
    /// this immediately; batch listings simply omit the job.
    #[error("job info file '{0}' does not exist")]
    MissingInfoFile(PathBuf),

    /// The per-job info file is not readable for this user. The job is
    /// skipped in aggregate listings.
    #[error("no permission to read job info file '{0}'")]
    Permission(PathBuf),

    /// The job's state does not allow the requested operation.
    #[error("job is not suitable for this operation: {0}")]
    NotSuitable(String),

    /// The job has no execution host or working directory yet.
    #[error("host ('main_node') or working directory ('work_dir') are not defined")]
    NoDestination,

    /// The per-job info file could not be parsed.
    #[error("could not parse job info file '{path}': {source}")]
    InfoParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// An error from the batch scheduler boundary.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
