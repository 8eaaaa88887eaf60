//! The polymorphic batch system interface.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tracing::debug;

use grani_types::{BatchKind, BatchState, ResolvedSpec, ResourceSpec, Size};

use crate::error::{BatchError, BatchResult};
use crate::pbs::PbsSystem;
use crate::slurm::SlurmSystem;

/// Configuration shared by the batch adapters and the remote-host plumbing.
///
/// Passed explicitly into each component instead of living in module-level
/// globals, so concurrent workers always see one consistent configuration.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Timeout for job submission commands.
    pub submit_timeout: Duration,

    /// Timeout for status query and cancellation commands.
    pub query_timeout: Duration,

    /// Connection timeout for ssh round trips.
    pub ssh_timeout: Duration,

    /// Timeout for directory synchronization.
    pub rsync_timeout: Duration,

    /// Whether the input directory lives on shared storage, allowing remote
    /// file operations to short-circuit to local ones.
    pub shared_storage: bool,

    /// Name of the host this process runs on; targets equal to it are
    /// accessed locally.
    pub local_host: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(30),
            ssh_timeout: Duration::from_secs(60),
            rsync_timeout: Duration::from_secs(600),
            shared_storage: false,
            local_host: String::new(),
        }
    }
}

impl BatchConfig {
    /// Set the local host name.
    pub fn with_local_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Mark the input directory as living on shared storage.
    pub fn with_shared_storage(mut self, shared: bool) -> Self {
        self.shared_storage = shared;
        self
    }
}

/// A job submission request, already resolved to a concrete allocation.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Path to the job script.
    pub script: PathBuf,

    /// Name under which the job is submitted.
    pub job_name: String,

    /// Target queue (Slurm: partition).
    pub queue: String,

    /// Optional accounting string.
    pub account: Option<String>,

    /// The resolved allocation.
    pub spec: ResolvedSpec,

    /// File receiving the batch system's own output for the job.
    pub batch_output: PathBuf,

    /// Environment variables exported into the job.
    pub env: FxHashMap<String, String>,

    /// Job ids that must finish successfully before this job starts.
    pub depend_ok: Vec<String>,
}

/// Canonical job status as reported by a batch system.
#[derive(Debug, Clone)]
pub struct BatchJobStatus {
    /// Scheduler-assigned job id.
    pub job_id: String,

    /// Job name.
    pub name: String,

    /// Reported state.
    pub state: BatchState,

    /// Queue the job is in.
    pub queue: Option<String>,

    /// Exit code, for completed jobs.
    pub exit_code: Option<i32>,

    /// Main execution node.
    pub main_node: Option<String>,

    /// All nodes assigned to the job.
    pub nodes: Vec<String>,

    /// Allocated CPU cores.
    pub cpus: u32,

    /// Allocated GPUs.
    pub gpus: u32,

    /// Allocated memory; zero when not reported.
    pub mem: Size,

    /// Walltime limit.
    pub walltime: Option<String>,

    /// Walltime used so far.
    pub walltime_used: Option<String>,

    /// Scheduler comment (e.g. why the job is still queued).
    pub comment: Option<String>,
}

impl Default for BatchJobStatus {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            name: String::new(),
            state: BatchState::Unknown,
            queue: None,
            exit_code: None,
            main_node: None,
            nodes: Vec::new(),
            cpus: 0,
            gpus: 0,
            mem: Size::zero(),
            walltime: None,
            walltime_used: None,
            comment: None,
        }
    }
}

/// Canonical queue (Slurm: partition) information.
#[derive(Debug, Clone, Default)]
pub struct QueueInfo {
    /// Queue name.
    pub name: String,

    /// Whether the queue accepts new jobs.
    pub enabled: bool,

    /// Whether queued jobs are being started.
    pub started: bool,

    /// Queue priority.
    pub priority: Option<i64>,

    /// Total number of jobs in the queue.
    pub total_jobs: u32,

    /// Running jobs.
    pub running_jobs: u32,

    /// Queued jobs.
    pub queued_jobs: u32,

    /// Jobs in other states (held, waiting, exiting, ...).
    pub other_jobs: u32,

    /// Maximum walltime permitted by the queue.
    pub max_walltime: Option<String>,

    /// Maximum memory permitted by the queue; zero when the queue
    /// advertises no limit.
    pub max_mem: Size,

    /// Default resources the queue applies to jobs that do not request
    /// their own; merged below the user's spec at submission.
    pub defaults: ResourceSpec,

    /// Administrative comment.
    pub comment: Option<String>,
}

/// Canonical compute node information.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// Node name.
    pub name: String,

    /// Raw node state as reported by the scheduler.
    pub state: String,

    /// Total CPU cores on the node.
    pub cpus_total: u32,

    /// CPU cores currently assigned to jobs.
    pub cpus_assigned: u32,

    /// Total GPUs on the node.
    pub gpus_total: u32,

    /// Total memory; zero when not reported.
    pub mem_total: Size,

    /// Memory currently assigned to jobs; zero when not reported.
    pub mem_assigned: Size,

    /// Local scratch capacity; zero when not reported.
    pub scratch_local: Size,

    /// Node properties / features.
    pub properties: Vec<String>,
}

/// Capability set exposed uniformly over the supported batch schedulers.
///
/// All operations translate into scheduler-native commands executed under a
/// per-call timeout. Query operations return `Ok(None)` for entities the
/// scheduler does not know (e.g. jobs already purged from history) and
/// never fail for that reason alone.
#[async_trait]
pub trait BatchSystem: Send + Sync {
    /// The scheduler variant this system drives.
    fn kind(&self) -> BatchKind;

    /// Submit a job; returns the scheduler-assigned job id.
    ///
    /// Fails with [`BatchError::SchedulerRejected`] on invalid resource
    /// combinations. On success exactly one job enters the queued (or held)
    /// state in the external scheduler.
    async fn submit(&self, request: &SubmitRequest) -> BatchResult<String>;

    /// Query the status of one job; `Ok(None)` if the scheduler no longer
    /// knows it.
    async fn query_job(&self, job_id: &str) -> BatchResult<Option<BatchJobStatus>>;

    /// Query one queue; `Ok(None)` if it does not exist.
    async fn query_queue(&self, name: &str) -> BatchResult<Option<QueueInfo>>;

    /// Query one node; `Ok(None)` if it does not exist.
    async fn query_node(&self, name: &str) -> BatchResult<Option<NodeInfo>>;

    /// Cancel a job gracefully, leaving it time for cleanup.
    ///
    /// Fails with [`BatchError::AlreadyTerminal`] if the job has already
    /// left active state.
    async fn cancel(&self, job_id: &str) -> BatchResult<()>;

    /// Cancel a job immediately, without cleanup time.
    async fn cancel_force(&self, job_id: &str) -> BatchResult<()>;

    /// All jobs of one user known to the scheduler, including finished
    /// ones still in history.
    async fn list_user_jobs(&self, user: &str) -> BatchResult<Vec<BatchJobStatus>>;
}

/// Construct the batch system for the given scheduler variant.
pub fn system_for(kind: BatchKind, config: BatchConfig) -> Arc<dyn BatchSystem> {
    match kind {
        BatchKind::Pbs => Arc::new(PbsSystem::new(config)),
        BatchKind::Slurm => Arc::new(SlurmSystem::new(config)),
    }
}

/// Detect the batch system available on this host by probing for its
/// submission command on PATH.
pub fn detect_kind() -> Option<BatchKind> {
    if command_on_path("qsub") {
        Some(BatchKind::Pbs)
    } else if command_on_path("sbatch") {
        Some(BatchKind::Slurm)
    } else {
        None
    }
}

fn command_on_path(command: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(command).is_file())
}

/// Run a scheduler command with the given timeout, capturing its output.
pub(crate) async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> BatchResult<Output> {
    debug!(program, ?args, "running scheduler command");

    let result = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await;

    match result {
        Err(_) => Err(BatchError::Timeout {
            command: program.to_string(),
            seconds: timeout.as_secs(),
        }),
        Ok(Err(e)) => Err(BatchError::CommandFailed {
            command: program.to_string(),
            message: e.to_string(),
        }),
        Ok(Ok(output)) => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BatchConfig::default();
        assert_eq!(config.submit_timeout, Duration::from_secs(60));
        assert_eq!(config.query_timeout, Duration::from_secs(30));
        assert!(!config.shared_storage);
    }

    #[test]
    fn test_default_status_is_unknown() {
        let status = BatchJobStatus::default();
        assert_eq!(status.state, BatchState::Unknown);
        assert!(status.mem.is_zero());
    }

    #[test]
    fn test_default_node_sizes_are_zero() {
        let node = NodeInfo::default();
        assert!(node.mem_total.is_zero());
        assert!(node.scratch_local.is_zero());
    }

    #[tokio::test]
    async fn test_run_command_timeout() {
        let err = run_command(
            "sleep",
            &["5".to_string()],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_run_command_missing_program() {
        let err = run_command("definitely-not-a-scheduler", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::CommandFailed { .. }));
    }
}
