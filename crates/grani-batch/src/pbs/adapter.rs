//! PBS adapter for job submission and tracking.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

use grani_types::{BatchKind, BatchState, ResolvedSpec, WorkDirPolicy};

use crate::error::{BatchError, BatchResult};
use crate::pbs::parser;
use crate::system::{
    BatchConfig, BatchJobStatus, BatchSystem, NodeInfo, QueueInfo, SubmitRequest, run_command,
};

/// Adapter for the PBS scheduler family (PBS Pro, OpenPBS, Torque).
pub struct PbsSystem {
    config: BatchConfig,
    /// Whether to use mock mode (for testing).
    mock_mode: bool,
    /// Mock job counter for generating fake job ids.
    mock_counter: AtomicU64,
}

impl PbsSystem {
    /// Create a new PBS adapter with the given configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            mock_mode: false,
            mock_counter: AtomicU64::new(1000),
        }
    }

    /// Create a new PBS adapter in mock mode (for testing).
    pub fn mock(config: BatchConfig) -> Self {
        Self {
            config,
            mock_mode: true,
            mock_counter: AtomicU64::new(1000),
        }
    }

    /// Translate a submission request into qsub arguments.
    fn submit_args(request: &SubmitRequest) -> BatchResult<Vec<String>> {
        let spec = &request.spec;
        let mut args = vec![
            "-N".to_string(),
            request.job_name.clone(),
            "-q".to_string(),
            request.queue.clone(),
            // merge the scheduler's stdout/stderr into one file
            "-j".to_string(),
            "eo".to_string(),
            "-e".to_string(),
            request.batch_output.display().to_string(),
        ];

        if let Some(account) = &request.account {
            args.push("-A".to_string());
            args.push(account.clone());
        }

        if !request.env.is_empty() {
            args.push("-v".to_string());
            args.push(Self::translate_env(&request.env));
        }

        let mut chunk = Self::chunk_resources(spec)?;
        for (key, value) in sorted(&spec.props) {
            chunk.push(format!("{key}={value}"));
        }

        if spec.nodes > 1 {
            args.push("-l".to_string());
            if chunk.is_empty() {
                args.push(format!("select={}", spec.nodes));
            } else {
                args.push(format!("select={}:{}", spec.nodes, chunk.join(":")));
            }
            // each chunk lands on a different node
            args.push("-l".to_string());
            args.push("place=vscatter".to_string());
        } else if !chunk.is_empty() {
            args.push("-l".to_string());
            args.push(chunk.join(","));
        }

        if let Some(walltime) = &spec.walltime {
            args.push("-l".to_string());
            args.push(format!("walltime={walltime}"));
        }

        if !request.depend_ok.is_empty() {
            args.push("-W".to_string());
            args.push(format!("depend=afterok:{}", request.depend_ok.join(":")));
        }

        args.push(request.script.display().to_string());
        Ok(args)
    }

    /// Per-node resource chunk: each divisible dimension is split by the
    /// node count.
    fn chunk_resources(spec: &ResolvedSpec) -> BatchResult<Vec<String>> {
        let nodes = spec.nodes;
        if nodes == 0 {
            return Err(BatchError::SchedulerRejected(
                "node count cannot be 0".to_string(),
            ));
        }
        if spec.cpus > 0 && spec.cpus % nodes != 0 {
            return Err(BatchError::SchedulerRejected(format!(
                "'ncpus' ({}) must be divisible by the node count ({nodes})",
                spec.cpus
            )));
        }
        if spec.gpus > 0 && spec.gpus % nodes != 0 {
            return Err(BatchError::SchedulerRejected(format!(
                "'ngpus' ({}) must be divisible by the node count ({nodes})",
                spec.gpus
            )));
        }

        let mut chunk = Vec::new();
        if spec.cpus > 0 {
            chunk.push(format!("ncpus={}", spec.cpus / nodes));
        }
        if !spec.mem.is_zero() {
            chunk.push(format!(
                "mem={}",
                spec.mem.per_node(u64::from(nodes)).to_pbs_exact()
            ));
        }
        if spec.gpus > 0 {
            chunk.push(format!("ngpus={}", spec.gpus / nodes));
        }
        if let Some(work_dir) = Self::work_dir_chunk(spec) {
            chunk.push(work_dir);
        }
        Ok(chunk)
    }

    /// The working-directory part of the resource chunk, if any.
    fn work_dir_chunk(spec: &ResolvedSpec) -> Option<String> {
        match spec.work_dir {
            WorkDirPolicy::InputDir => None,
            WorkDirPolicy::ScratchShm => Some("scratch_shm=true".to_string()),
            policy => {
                if spec.work_size.is_zero() {
                    None
                } else {
                    Some(format!(
                        "{policy}={}",
                        spec.work_size.per_node(u64::from(spec.nodes)).to_pbs_exact()
                    ))
                }
            }
        }
    }

    /// Environment variables as a single `-v` argument, keys sorted for a
    /// stable command line.
    fn translate_env(env: &FxHashMap<String, String>) -> String {
        sorted(env)
            .into_iter()
            .map(|(key, value)| format!("{key}='{value}'"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn sorted(map: &FxHashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(key, _)| key.as_str());
    entries
}

#[async_trait]
impl BatchSystem for PbsSystem {
    fn kind(&self) -> BatchKind {
        BatchKind::Pbs
    }

    async fn submit(&self, request: &SubmitRequest) -> BatchResult<String> {
        let args = Self::submit_args(request)?;

        if self.mock_mode {
            let id = self.mock_counter.fetch_add(1, Ordering::SeqCst);
            return Ok(format!("{id}.pbs-server"));
        }

        let output = run_command("qsub", &args, self.config.submit_timeout).await?;
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

        // -x includes finished jobs still in history
        let args = vec!["-fxw".to_string(), job_id.to_string()];
        let output = run_command("qstat", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Unknown Job Id") || stderr.contains("does not exist") {
            debug!(job_id, "job unknown to PBS");
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "qstat".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parser::parse_records(&stdout, Some("Job Id"))?;
        Ok(records
            .first()
            .map(|(id, map)| parser::job_from_dump(id, map)))
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

        let args = vec!["-Qfw".to_string(), name.to_string()];
        let output = run_command("qstat", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Unknown queue") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "qstat".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parser::parse_records(&stdout, Some("Queue"))?;
        Ok(records
            .first()
            .map(|(name, map)| parser::queue_from_dump(name, map)))
    }

    async fn query_node(&self, name: &str) -> BatchResult<Option<NodeInfo>> {
        if self.mock_mode {
            return Ok(Some(NodeInfo {
                name: name.to_string(),
                state: "free".to_string(),
                ..Default::default()
            }));
        }

        let args = vec![name.to_string()];
        let output = run_command("pbsnodes", &args, self.config.query_timeout).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Unknown node") {
            return Ok(None);
        }
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "pbsnodes".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parser::parse_records(&stdout, None)?;
        Ok(records
            .first()
            .map(|(name, map)| parser::node_from_dump(name, map)))
    }

    async fn cancel(&self, job_id: &str) -> BatchResult<()> {
        if self.mock_mode {
            return Ok(());
        }

        let args = vec![job_id.to_string()];
        let output = run_command("qdel", &args, self.config.query_timeout).await?;
        parser::parse_cancel_output(job_id, &String::from_utf8_lossy(&output.stderr))
    }

    async fn cancel_force(&self, job_id: &str) -> BatchResult<()> {
        if self.mock_mode {
            return Ok(());
        }

        let args = vec!["-W".to_string(), "force".to_string(), job_id.to_string()];
        let output = run_command("qdel", &args, self.config.query_timeout).await?;
        parser::parse_cancel_output(job_id, &String::from_utf8_lossy(&output.stderr))
    }

    async fn list_user_jobs(&self, user: &str) -> BatchResult<Vec<BatchJobStatus>> {
        if self.mock_mode {
            return Ok(Vec::new());
        }

        let args = vec!["-fxwu".to_string(), user.to_string()];
        let output = run_command("qstat", &args, self.config.query_timeout).await?;
        if !output.status.success() {
            return Err(BatchError::CommandFailed {
                command: "qstat".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let records = parser::parse_records(&stdout, Some("Job Id"))?;
        Ok(records
            .iter()
            .map(|(id, map)| parser::job_from_dump(id, map))
            .collect())
    }
}
