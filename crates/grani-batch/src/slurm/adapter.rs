//! Slurm adapter for job submission and tracking.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use grani_types::{BatchKind, BatchState, ResolvedSpec};

use crate::error::{BatchError, BatchResult};
use crate::slurm::parser;
use crate::system::{
    BatchConfig, BatchJobStatus, BatchSystem, NodeInfo, QueueInfo, SubmitRequest, run_command,
};

/// Adapter for the Slurm scheduler.
///
/// Status queries go through squeue for active jobs and fall back to sacct
/// for jobs that already left the queue; sacct does not know pending jobs
/// and squeue does not know finished ones.
pub struct SlurmSystem {
    config: BatchConfig,
    /// Whether to use mock mode (for testing).
    mock_mode: bool,
    /// Mock job counter for generating fake job ids.
    mock_counter: AtomicU64,
}

impl SlurmSystem {
    /// Create a new Slurm adapter with the given configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            mock_mode: false,
            mock_counter: AtomicU64::new(1000),
        }
    }

    /// Create a new Slurm adapter in mock mode (for testing).
    pub fn mock(config: BatchConfig) -> Self {
        Self {
            config,
            mock_mode: true,
            mock_counter: AtomicU64::new(1000),
        }
    }

    /// Translate a submission request into sbatch arguments.
    fn submit_args(request: &SubmitRequest) -> BatchResult<Vec<String>> {
        let spec = &request.spec;
        let nodes = spec.nodes.max(1);

        if spec.cpus > 0 && spec.cpus % nodes != 0 {
            return Err(BatchError::SchedulerRejected(format!(
                "cpu count ({}) must be divisible by the node count ({nodes})",
                spec.cpus
            )));
        }
        if spec.gpus > 0 && spec.gpus % nodes != 0 {
            return Err(BatchError::SchedulerRejected(format!(
                "gpu count ({}) must be divisible by the node count ({nodes})",
                spec.gpus
            )));
        }

        let mut args = vec![
            "-J".to_string(),
            request.job_name.clone(),
            "-p".to_string(),
            request.queue.clone(),
            "-o".to_string(),
            request.batch_output.display().to_string(),
            "-e".to_string(),
            request.batch_output.display().to_string(),
        ];

        if let Some(account) = &request.account {
            args.push("--account".to_string());
            args.push(account.clone());
        }

        if !request.env.is_empty() {
            args.push(format!("--export=ALL,{}", Self::translate_env(&request.env)));
        }

        args.push("--nodes".to_string());
        args.push(nodes.to_string());

        if spec.cpus > 0 {
            // one task per node; scripts fan out themselves, this keeps
            // Slurm accounting aligned with the allocation
            args.push("--ntasks-per-node=1".to_string());
            args.push(format!("--cpus-per-task={}", spec.cpus / nodes));
        }

        if !spec.mem.is_zero() {
            args.push(format!(
                "--mem={}",
                spec.mem.per_node(u64::from(nodes)).to_slurm_exact()
            ));
        }

        if spec.gpus > 0 {
            args.push(format!("--gpus-per-node={}", spec.gpus / nodes));
        }

        if !spec.props.is_empty() {
            let mut constraints = Vec::new();
            let mut entries: Vec<_> = spec.props.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            for (key, value) in entries {
                if value != "true" {
                    return Err(BatchError::SchedulerRejected(format!(
                        "Slurm only supports properties with a value of 'true', not '{key}={value}'"
                    )));
                }
                constraints.push(key.clone());
            }
            args.push(format!("--constraint={}", constraints.join("&")));
        }

        if let Some(walltime) = &spec.walltime {
            args.push(format!("--time={walltime}"));
        }

        if !request.depend_ok.is_empty() {
            args.push(format!(
                "--dependency=afterok:{}",
                request.depend_ok.join(":")
            ));
        }

        args.push(request.script.display().to_string());
        Ok(args)
    }

    /// Environment variables for `--export`, keys sorted for a stable
    /// command line.
    fn translate_env(env: &FxHashMap<String, String>) -> String {
        let mut entries: Vec<_> = env.iter().collect();
        entries.sort_by_key(|(key, _)| key.as_str());
        entries
            .into_iter()
            .map(|(key, value)| format!("{key}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Query active jobs through squeue; `Ok(None)` when squeue does not
    /// know the id.
    async fn query_squeue(&self, job_id: &str) -> BatchResult<Option<BatchJobStatus>> {
        let args = vec![
            "-h".to_string(),
            "-j".to_string(),
            job_id.to_string(),
            "-o".to_string(),
            parser::SQUEUE_FORMAT.to_string(),
        ];
        let output = run_command("squeue", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Invalid job id") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "squeue".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => Ok(Some(parser::job_from_squeue_line(line)?)),
            None => Ok(None),
        }
    }

    /// Query finished jobs through sacct; `Ok(None)` when the job left
    /// accounting history.
    async fn query_sacct(&self, job_id: &str) -> BatchResult<Option<BatchJobStatus>> {
        let args = vec![
            "-j".to_string(),
            job_id.to_string(),
            "--allocations".to_string(),
            "--noheader".to_string(),
            "--parsable2".to_string(),
            format!("--format={}", parser::SACCT_FORMAT),
        ];
        let output = run_command("sacct", &args, self.config.query_timeout).await?;
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "sacct".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().find(|l| !l.trim().is_empty()) {
            Some(line) => Ok(Some(parser::job_from_sacct_line(line)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl BatchSystem for SlurmSystem {
    fn kind(&self) -> BatchKind {
        BatchKind::Slurm
    }

    async fn submit(&self, request: &SubmitRequest) -> BatchResult<String> {
        let args = Self::submit_args(request)?;

        if self.mock_mode {
            return Ok(self.mock_counter.fetch_add(1, Ordering::SeqCst).to_string());
        }

        let output = run_command("sbatch", &args, self.config.submit_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BatchError::SchedulerRejected(stderr.trim().to_string()));
        }

        parser::parse_submit_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn query_job(&self, job_id: &str) -> BatchResult<Option<BatchJobStatus>> {
        if self.mock_mode {
            return Ok(Some(BatchJobStatus {
                job_id: job_id.to_string(),
                name: "mock_job".to_string(),
                state: BatchState::Finished,
                exit_code: Some(0),
                ..Default::default()
            }));
        }

        if let Some(status) = self.query_squeue(job_id).await? {
            return Ok(Some(status));
        }
        debug!(job_id, "not in squeue, falling back to sacct");
        self.query_sacct(job_id).await
    }

    async fn query_queue(&self, name: &str) -> BatchResult<Option<QueueInfo>> {
        if self.mock_mode {
            return Ok(Some(QueueInfo {
                name: name.to_string(),
                enabled: true,
                started: true,
                ..Default::default()
            }));
        }

        let args = vec![
            "show".to_string(),
            "partition".to_string(),
            "-o".to_string(),
            name.to_string(),
        ];
        let output = run_command("scontrol", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("Invalid partition") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "scontrol".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|line| parser::partition_from_map(&parser::parse_scontrol_line(line))))
    }

    async fn query_node(&self, name: &str) -> BatchResult<Option<NodeInfo>> {
        if self.mock_mode {
            return Ok(Some(NodeInfo {
                name: name.to_string(),
                state: "IDLE".to_string(),
                ..Default::default()
            }));
        }

        let args = vec![
            "show".to_string(),
            "node".to_string(),
            "-o".to_string(),
            name.to_string(),
        ];
        let output = run_command("scontrol", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("Invalid node name") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "scontrol".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|line| parser::node_from_map(&parser::parse_scontrol_line(line))))
    }

    async fn cancel(&self, job_id: &str) -> BatchResult<()> {
        if self.mock_mode {
            return Ok(());
        }

        // plain scancel sends SIGTERM, leaving the job time for cleanup
        let args = vec![job_id.to_string()];
        let output = run_command("scancel", &args, self.config.query_timeout).await?;
        parser::parse_cancel_output(job_id, &String::from_utf8_lossy(&output.stderr))
    }

    async fn cancel_force(&self, job_id: &str) -> BatchResult<()> {
        if self.mock_mode {
            return Ok(());
        }

        let args = vec!["--signal=KILL".to_string(), job_id.to_string()];
        let output = run_command("scancel", &args, self.config.query_timeout).await?;
        parser::parse_cancel_output(job_id, &String::from_utf8_lossy(&output.stderr))
    }

    async fn list_user_jobs(&self, user: &str) -> BatchResult<Vec<BatchJobStatus>> {
        if self.mock_mode {
            return Ok(Vec::new());
        }

        // sacct covers running and finished jobs but not pending ones
        let args = vec![
            "-u".to_string(),
            user.to_string(),
            "--allocations".to_string(),
            "--noheader".to_string(),
            "--parsable2".to_string(),
            format!("--format={}", parser::SACCT_FORMAT),
        ];
        let output = run_command("sacct", &args, self.config.query_timeout).await?;
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "sacct".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut jobs: Vec<BatchJobStatus> = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            jobs.push(parser::job_from_sacct_line(line)?);
        }

        // pending jobs only exist in squeue
        let args = vec![
            "-h".to_string(),
            "-u".to_string(),
            user.to_string(),
            "-t".to_string(),
            "PENDING".to_string(),
            "-o".to_string(),
            parser::SQUEUE_FORMAT.to_string(),
        ];
        let output = run_command("squeue", &args, self.config.query_timeout).await?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
                let job = parser::job_from_squeue_line(line)?;
                if !jobs.iter().any(|j| j.job_id == job.job_id) {
                    jobs.push(job);
                }
            }
        }

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grani_types::{ResourceSpec, Size, WorkDirPolicy};
    use std::path::PathBuf;

    fn request(spec: ResolvedSpec) -> SubmitRequest {
        SubmitRequest {
            script: PathBuf::from("/home/alice/project/md.sh"),
            job_name: "md.sh".to_string(),
            queue: "compute".to_string(),
            account: Some("proj-123".to_string()),
            spec,
            batch_output: PathBuf::from("/home/alice/project/md.sh.batch.out"),
            env: FxHashMap::default(),
            depend_ok: Vec::new(),
        }
    }

    #[test]
    fn test_submit_args() {
        let spec = ResourceSpec {
            nodes: Some(2),
            cpus_per_node: Some(4),
            mem: Some(Size::from_gb(16)),
            walltime: Some("12:00:00".to_string()),
            ..Default::default()
        }
        .resolve();

        let args = SlurmSystem::submit_args(&request(spec)).unwrap();
        let joined = args.join(" ");
        assert!(joined.contains("-J md.sh"));
        assert!(joined.contains("-p compute"));
        assert!(joined.contains("--account proj-123"));
        assert!(joined.contains("--nodes 2"));
        assert!(joined.contains("--ntasks-per-node=1"));
        assert!(joined.contains("--cpus-per-task=4"));
        assert!(joined.contains("--mem=8G"));
        assert!(joined.contains("--time=12:00:00"));
        assert!(joined.ends_with("/home/alice/project/md.sh"));
    }

    #[test]
    fn test_submit_args_constraints() {
        let mut props = FxHashMap::default();
        props.insert("amd".to_string(), "true".to_string());
        props.insert("ssd".to_string(), "true".to_string());
        let spec = ResourceSpec {
            props: Some(props),
            ..Default::default()
        }
        .resolve();

        let args = SlurmSystem::submit_args(&request(spec)).unwrap();
        assert!(args.contains(&"--constraint=amd&ssd".to_string()));
    }

    #[test]
    fn test_submit_args_rejects_excluded_property() {
        let mut props = FxHashMap::default();
        props.insert("slow".to_string(), "false".to_string());
        let spec = ResourceSpec {
            props: Some(props),
            ..Default::default()
        }
        .resolve();

        let err = SlurmSystem::submit_args(&request(spec)).unwrap_err();
        assert!(matches!(err, BatchError::SchedulerRejected(_)));
    }

    #[test]
    fn test_submit_args_rejects_indivisible_gpus() {
        let spec = ResourceSpec {
            nodes: Some(2),
            cpus: Some(8),
            gpus: Some(3),
            ..Default::default()
        }
        .resolve();

        let err = SlurmSystem::submit_args(&request(spec)).unwrap_err();
        assert!(matches!(err, BatchError::SchedulerRejected(_)));
    }

    #[test]
    fn test_submit_args_no_storage_request_for_input_dir() {
        let spec = ResourceSpec {
            cpus: Some(4),
            work_size: Some(Size::from_gb(10)),
            work_dir: Some(WorkDirPolicy::InputDir),
            ..Default::default()
        }
        .resolve();

        let args = SlurmSystem::submit_args(&request(spec)).unwrap();
        assert!(!args.join(" ").contains("10"));
    }

    #[test]
    fn test_translate_env_sorted() {
        let mut env = FxHashMap::default();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(SlurmSystem::translate_env(&env), "A=\"1\",B=\"2\"");
    }

    #[tokio::test]
    async fn test_mock_submit_query_cancel() {
        let system = SlurmSystem::mock(BatchConfig::default());

        let job_id = system
            .submit(&request(ResourceSpec::default().resolve()))
            .await
            .unwrap();
        assert!(job_id.parse::<u64>().is_ok());

        let status = system.query_job(&job_id).await.unwrap().unwrap();
        assert_eq!(status.state, BatchState::Finished);

        system.cancel(&job_id).await.unwrap();
    }
}
