//! Job state vocabulary and reconciliation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Canonical job state, persisted in the job record and shown to users.
///
/// Transitions are monotonic (`Held`/`Queued` -> `Running` -> terminal)
/// except for scheduler-reported oscillation between `Queued` and `Held`,
/// which is allowed. `Finishing` is a transient sub-state entered while a
/// terminal signal is being processed and runtime files are copied back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Job is held by the scheduler and will not run until released.
    Held,
    /// Job is waiting in a queue.
    Queued,
    /// Job is executing in its working directory.
    Running,
    /// Terminal signal received; runtime files and working directory are
    /// being copied back to the input directory.
    Finishing,
    /// Job completed successfully and was synchronized.
    Finished,
    /// Job exited with a non-zero code.
    Failed,
    /// Job was cancelled.
    Killed,
    /// State could not be determined.
    Unknown,
}

impl JobState {
    /// Check whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Killed)
    }

    /// Check whether the job is still waiting to start.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Held)
    }

    /// Combine the persisted record state with a live scheduler report into
    /// the state actually shown to the user.
    ///
    /// The record is authoritative for terminal outcomes; the scheduler is
    /// authoritative for queue-side oscillation (`Queued`/`Held`). A record
    /// already marked terminal whose batch job is still running is
    /// `Finishing` (the runner is copying files back). A batch job the
    /// scheduler no longer knows keeps the record state when that state is
    /// terminal, and degrades to `Unknown` otherwise. Contradictions (e.g.
    /// a finished record with a queued batch job) are `Unknown`.
    pub fn reconcile(record: JobState, batch: BatchState) -> JobState {
        match (record, batch) {
            (JobState::Unknown, _) => JobState::Unknown,
            (JobState::Finishing, _) => JobState::Finishing,

            (JobState::Queued | JobState::Held, BatchState::Queued | BatchState::Moving) => {
                JobState::Queued
            }
            (JobState::Queued | JobState::Held, BatchState::Held) => JobState::Held,
            (JobState::Queued | JobState::Held, BatchState::Waiting) => JobState::Queued,
            (JobState::Queued | JobState::Held, BatchState::Suspended) => JobState::Held,
            // the scheduler started the job but the runner has not reported
            // in yet; it is effectively booting
            (JobState::Queued | JobState::Held, BatchState::Running) => JobState::Running,
            (JobState::Queued | JobState::Held, _) => JobState::Unknown,

            (JobState::Running, BatchState::Running | BatchState::Suspended) => JobState::Running,
            (JobState::Running, BatchState::Exiting) => JobState::Finishing,
            (JobState::Running, _) => JobState::Unknown,

            (JobState::Killed, BatchState::Running) => JobState::Finishing,
            (JobState::Killed, _) => JobState::Killed,

            (JobState::Finished, BatchState::Running) => JobState::Finishing,
            (
                JobState::Finished,
                BatchState::Queued | BatchState::Waiting | BatchState::Held | BatchState::Failed,
            ) => JobState::Unknown,
            (JobState::Finished, _) => JobState::Finished,

            (JobState::Failed, BatchState::Running) => JobState::Finishing,
            (
                JobState::Failed,
                BatchState::Queued | BatchState::Waiting | BatchState::Held | BatchState::Finished,
            ) => JobState::Unknown,
            (JobState::Failed, _) => JobState::Failed,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Held => "held",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Finishing => "finishing",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Killed => "killed",
            JobState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Job state as reported by the underlying batch system.
///
/// Both PBS and Slurm reduce to single-letter state codes:
/// - Q: Queued (waiting in queue)
/// - R: Running
/// - H: Held
/// - W: Waiting (delayed start)
/// - S: Suspended
/// - T: Being moved to a new location
/// - E: Exiting (job completing)
/// - F: Finished
/// - X: Failed/expired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    /// Job is queued and waiting for resources.
    Queued,
    /// Job is currently running.
    Running,
    /// Job is held and will not run until released.
    Held,
    /// Job is waiting for a scheduled start time.
    Waiting,
    /// Job has been suspended.
    Suspended,
    /// Job is being moved to another location.
    Moving,
    /// Job is exiting (finishing up).
    Exiting,
    /// Job has finished.
    Finished,
    /// Job has failed or expired.
    Failed,
    /// Unknown state.
    Unknown,
}

impl BatchState {
    /// Convert a one-letter batch system code to a state.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "Q" => BatchState::Queued,
            "R" => BatchState::Running,
            "H" => BatchState::Held,
            "W" => BatchState::Waiting,
            "S" => BatchState::Suspended,
            "T" => BatchState::Moving,
            "E" => BatchState::Exiting,
            "F" => BatchState::Finished,
            "X" => BatchState::Failed,
            _ => BatchState::Unknown,
        }
    }

    /// The one-letter code for this state, `?` if unknown.
    pub fn to_code(&self) -> &'static str {
        match self {
            BatchState::Queued => "Q",
            BatchState::Running => "R",
            BatchState::Held => "H",
            BatchState::Waiting => "W",
            BatchState::Suspended => "S",
            BatchState::Moving => "T",
            BatchState::Exiting => "E",
            BatchState::Finished => "F",
            BatchState::Failed => "X",
            BatchState::Unknown => "?",
        }
    }

    /// Check whether the batch system considers the job active (eligible
    /// for cancellation).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BatchState::Queued
                | BatchState::Running
                | BatchState::Held
                | BatchState::Waiting
                | BatchState::Suspended
                | BatchState::Moving
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchState::Queued => "queued",
            BatchState::Running => "running",
            BatchState::Held => "held",
            BatchState::Waiting => "waiting",
            BatchState::Suspended => "suspended",
            BatchState::Moving => "moving",
            BatchState::Exiting => "exiting",
            BatchState::Finished => "finished",
            BatchState::Failed => "failed",
            BatchState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Finished.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Killed.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Finishing.is_terminal());
        assert!(!JobState::Queued.is_terminal());
    }

    #[test]
    fn test_code_roundtrip() {
        for code in ["Q", "R", "H", "W", "S", "T", "E", "F", "X"] {
            let state = BatchState::from_code(code);
            assert_ne!(state, BatchState::Unknown);
            assert_eq!(state.to_code(), code);
        }
        assert_eq!(BatchState::from_code("z"), BatchState::Unknown);
        assert_eq!(BatchState::from_code("q"), BatchState::Queued);
        assert_eq!(BatchState::Unknown.to_code(), "?");
    }

    #[test]
    fn test_reconcile_queue_oscillation() {
        // Queued/Held oscillation follows the scheduler report
        assert_eq!(
            JobState::reconcile(JobState::Queued, BatchState::Held),
            JobState::Held
        );
        assert_eq!(
            JobState::reconcile(JobState::Held, BatchState::Queued),
            JobState::Queued
        );
    }

    #[test]
    fn test_reconcile_terminal_record_wins_after_purge() {
        // a purged batch job keeps the terminal record state
        assert_eq!(
            JobState::reconcile(JobState::Finished, BatchState::Unknown),
            JobState::Finished
        );
        assert_eq!(
            JobState::reconcile(JobState::Killed, BatchState::Unknown),
            JobState::Killed
        );
        // but a non-terminal record degrades to unknown
        assert_eq!(
            JobState::reconcile(JobState::Running, BatchState::Unknown),
            JobState::Unknown
        );
    }

    #[test]
    fn test_reconcile_finishing() {
        // terminal record + still-running batch job = runner copying back
        assert_eq!(
            JobState::reconcile(JobState::Finished, BatchState::Running),
            JobState::Finishing
        );
        assert_eq!(
            JobState::reconcile(JobState::Failed, BatchState::Running),
            JobState::Finishing
        );
        assert_eq!(
            JobState::reconcile(JobState::Killed, BatchState::Running),
            JobState::Finishing
        );
    }

    #[test]
    fn test_reconcile_contradictions() {
        assert_eq!(
            JobState::reconcile(JobState::Finished, BatchState::Queued),
            JobState::Unknown
        );
        assert_eq!(
            JobState::reconcile(JobState::Failed, BatchState::Finished),
            JobState::Unknown
        );
        assert_eq!(
            JobState::reconcile(JobState::Running, BatchState::Queued),
            JobState::Unknown
        );
    }

    #[test]
    fn test_reconcile_running() {
        assert_eq!(
            JobState::reconcile(JobState::Running, BatchState::Running),
            JobState::Running
        );
        assert_eq!(
            JobState::reconcile(JobState::Queued, BatchState::Running),
            JobState::Running
        );
        assert_eq!(
            JobState::reconcile(JobState::Running, BatchState::Exiting),
            JobState::Finishing
        );
    }
}
