//! The persisted canonical description of a submitted job.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kind::BatchKind;
use crate::loop_spec::LoopSpec;
use crate::resources::ResolvedSpec;
use crate::state::JobState;

/// Suffix of the per-job info file colocated with the input directory.
pub const INFO_SUFFIX: &str = ".info.json";

/// Suffix of the captured standard output of the job script.
pub const STDOUT_SUFFIX: &str = ".out";

/// Suffix of the captured standard error of the job script.
pub const STDERR_SUFFIX: &str = ".err";

/// Suffix of the batch system's own output for the job.
pub const BATCH_OUT_SUFFIX: &str = ".batch.out";

/// Canonical, persisted record of one job: the source of truth for every
/// command operating on it.
///
/// Written once at submission and updated at each lifecycle transition.
/// The record must stay forward compatible: unknown fields are ignored on
/// read and missing optional fields resolve to defaults.
///
/// Invariants: `job_id` is immutable once assigned; `work_dir` is set
/// exactly once (at job start) and never renamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Scheduler-assigned identifier; format is scheduler-specific.
    pub job_id: String,

    /// Job name as submitted (script name, plus cycle tag for loop jobs).
    pub job_name: String,

    /// Name of the script executed.
    pub script_name: String,

    /// Queue the job was submitted to.
    pub queue: String,

    /// Which scheduler variant owns this job.
    pub scheduler: BatchKind,

    /// Current lifecycle state.
    pub state: JobState,

    /// Host from which the job was submitted.
    pub input_host: String,

    /// Directory from which the job was submitted.
    pub input_dir: PathBuf,

    /// Resolved allocation the job was submitted with.
    pub resources: ResolvedSpec,

    /// Submission timestamp.
    pub submitted_at: DateTime<Utc>,

    /// Working directory; unset until the job starts.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Main execution node; unset until the job starts.
    #[serde(default)]
    pub main_node: Option<String>,

    /// All nodes assigned to the job.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Start timestamp.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Completion timestamp.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Exit code of the job script.
    #[serde(default)]
    pub exit_code: Option<i32>,

    /// Extra paths copied into the working directory at job start.
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,

    /// Paths never copied into the working directory.
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,

    /// Loop-job bookkeeping; absent for standard jobs.
    #[serde(default)]
    pub loop_spec: Option<LoopSpec>,

    /// Command line the job was submitted with, for resubmission.
    #[serde(default)]
    pub command_line: Vec<String>,
}

impl JobRecord {
    /// Path of the info file for a job of the given name in `input_dir`.
    pub fn info_path_for(input_dir: &Path, job_name: &str) -> PathBuf {
        input_dir.join(format!("{job_name}{INFO_SUFFIX}"))
    }

    /// Path of this record's info file.
    pub fn info_path(&self) -> PathBuf {
        Self::info_path_for(&self.input_dir, &self.job_name)
    }

    /// Name of the file capturing the script's standard output.
    pub fn stdout_name(&self) -> String {
        format!("{}{STDOUT_SUFFIX}", self.job_name)
    }

    /// Name of the file capturing the script's standard error.
    pub fn stderr_name(&self) -> String {
        format!("{}{STDERR_SUFFIX}", self.job_name)
    }

    /// The runtime files copied back to the input directory before the rest
    /// of the working directory.
    pub fn runtime_files(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from(self.stdout_name()),
            PathBuf::from(self.stderr_name()),
        ]
    }

    /// Whether the record is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the working directory is the input directory (either by
    /// policy or because the job ran directly in shared storage).
    pub fn work_dir_is_input_dir(&self) -> bool {
        !self.resources.work_dir.uses_scratch()
            || self.work_dir.as_deref() == Some(self.input_dir.as_path())
    }

    /// The host and working directory of a started job.
    pub fn destination(&self) -> Option<(&str, &Path)> {
        match (self.main_node.as_deref(), self.work_dir.as_deref()) {
            (Some(host), Some(dir)) => Some((host, dir)),
            _ => None,
        }
    }

    /// Mark the job as running. The working directory is set here, exactly
    /// once.
    pub fn set_running(
        &mut self,
        started_at: DateTime<Utc>,
        main_node: impl Into<String>,
        nodes: Vec<String>,
        work_dir: impl Into<PathBuf>,
    ) {
        self.state = JobState::Running;
        self.started_at = Some(started_at);
        self.main_node = Some(main_node.into());
        self.nodes = nodes;
        if self.work_dir.is_none() {
            self.work_dir = Some(work_dir.into());
        }
    }

    /// Mark the job as finishing (terminal processing in progress).
    pub fn set_finishing(&mut self) {
        self.state = JobState::Finishing;
    }

    /// Mark the job as finished.
    pub fn set_finished(&mut self, completed_at: DateTime<Utc>) {
        self.state = JobState::Finished;
        self.completed_at = Some(completed_at);
        self.exit_code = Some(0);
    }

    /// Mark the job as failed with the script's exit code.
    pub fn set_failed(&mut self, completed_at: DateTime<Utc>, exit_code: i32) {
        self.state = JobState::Failed;
        self.completed_at = Some(completed_at);
        self.exit_code = Some(exit_code);
    }

    /// Mark the job as killed.
    pub fn set_killed(&mut self, completed_at: DateTime<Utc>) {
        self.state = JobState::Killed;
        self.completed_at = Some(completed_at);
    }
}
