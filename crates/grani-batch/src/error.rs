//! Error handling for the batch adapters.

use thiserror::Error;

/// Result type for batch adapter operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// Errors that can occur at the scheduler boundary.
#[derive(Error, Debug)]
pub enum BatchError {
    /// The scheduler refused the submission, typically for an invalid or
    /// unsupported resource combination. Fatal for that submit call.
    #[error("scheduler rejected submission: {0}")]
    SchedulerRejected(String),

    /// Scheduler output did not match the expected shape. Degrades a single
    /// status entry to unknown; never aborts a batch query.
    #[error("could not parse scheduler output: {0}")]
    Parse(String),

    /// Cancellation was attempted on a job that already left active state.
    #[error("job '{0}' is no longer active")]
    AlreadyTerminal(String),

    /// A scheduler command exceeded its per-call timeout.
    #[error("{command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// Authentication to a remote host failed. Transient; the caller may
    /// retry with an alternate authentication mode.
    #[error("authentication to remote host '{host}' failed: {message}")]
    RemoteAuth { host: String, message: String },

    /// A scheduler or transport command failed.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BatchError::SchedulerRejected("ncpus must be divisible by nodes".to_string());
        assert_eq!(
            err.to_string(),
            "scheduler rejected submission: ncpus must be divisible by nodes"
        );

        let err = BatchError::Timeout {
            command: "qstat".to_string(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "qstat timed out after 30s");

        let err = BatchError::AlreadyTerminal("12345".to_string());
        assert_eq!(err.to_string(), "job '12345' is no longer active");
    }
}
