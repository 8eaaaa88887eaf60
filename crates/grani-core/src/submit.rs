//! Job submission.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use grani_batch::{BatchConfig, BatchSystem, SubmitRequest};
use grani_types::{
    BATCH_OUT_SUFFIX, BatchState, JobRecord, JobState, LoopSpec, ResourceSpec, Size, cycle_tag,
};

use crate::env;
use crate::error::{CoreError, CoreResult};
use crate::store::InfoStore;

/// Hard-coded fallback resources applied below the user's spec and the
/// queue's defaults.
pub fn server_defaults() -> ResourceSpec {
    ResourceSpec {
        nodes: Some(1),
        cpus: Some(1),
        mem_per_cpu: Some(Size::from_gb(1)),
        work_size_per_cpu: Some(Size::from_gb(1)),
        work_dir: Some(grani_types::WorkDirPolicy::ScratchLocal),
        walltime: Some("24:00:00".to_string()),
        ..Default::default()
    }
}

/// Everything needed to submit one job.
#[derive(Debug, Clone)]
pub struct JobSubmission {
    /// Path to the job script; its parent directory becomes the input
    /// directory.
    pub script: PathBuf,

    /// Target queue.
    pub queue: String,

    /// Optional accounting string.
    pub account: Option<String>,

    /// Requested resources, before resolution.
    pub resources: ResourceSpec,

    /// Extra paths copied into the working directory at job start.
    pub include_paths: Vec<PathBuf>,

    /// Paths never copied into the working directory.
    pub exclude_paths: Vec<PathBuf>,

    /// Loop bookkeeping for cyclic jobs.
    pub loop_spec: Option<LoopSpec>,

    /// Job ids that must finish successfully first.
    pub depend_ok: Vec<String>,

    /// The command line used for this submission, kept for resubmission.
    pub command_line: Vec<String>,
}

impl JobSubmission {
    /// A submission with defaults for everything but script and queue.
    pub fn new(script: impl Into<PathBuf>, queue: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            queue: queue.into(),
            account: None,
            resources: ResourceSpec::default(),
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            loop_spec: None,
            depend_ok: Vec::new(),
            command_line: Vec::new(),
        }
    }
}

/// Submits jobs to the configured batch system and creates their info
/// records.
pub struct Submitter {
    batch: Arc<dyn BatchSystem>,
    store: Arc<InfoStore>,
    config: BatchConfig,
    defaults: ResourceSpec,
}

impl Submitter {
    /// Create a submitter for the given batch system.
    pub fn new(batch: Arc<dyn BatchSystem>, store: Arc<InfoStore>, config: BatchConfig) -> Self {
        Self {
            batch,
            store,
            config,
            defaults: server_defaults(),
        }
    }

    /// Override the fallback resource defaults.
    pub fn with_defaults(mut self, defaults: ResourceSpec) -> Self {
        self.defaults = defaults;
        self
    }

    /// Submit a job.
    ///
    /// Resolves resources against the queue's and the server's defaults,
    /// submits through the batch system, and writes the info record with
    /// state `Queued` (or `Held` when the scheduler reports an immediate
    /// hold). On rejection no record is created and the error is surfaced
    /// unchanged.
    pub async fn submit(&self, submission: JobSubmission) -> CoreResult<JobRecord> {
        let script = submission.script.clone();
        if !script.is_file() {
            return Err(CoreError::NotSuitable(format!(
                "script '{}' does not exist or is not a file",
                script.display()
            )));
        }

        let input_dir = script
            .parent()
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        let script_name = script
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_default();
        let job_name = job_name(&script_name, submission.loop_spec.as_ref());

        // layered resolution: user intent, queue defaults, server defaults
        let queue_defaults = self.queue_defaults(&submission.queue).await;
        let merged = ResourceSpec::merge(&[
            submission.resources.clone(),
            queue_defaults,
            self.defaults.clone(),
        ]);
        let spec = merged.resolve();
        debug!(?spec, "resolved submission resources");

        let info_file = JobRecord::info_path_for(&input_dir, &job_name);
        let environment = env::job_environment(
            &info_file,
            &self.config.local_host,
            &input_dir,
            self.batch.kind(),
            &spec,
            submission.loop_spec.as_ref(),
            self.config.shared_storage,
        );

        let request = SubmitRequest {
            script: script.clone(),
            job_name: job_name.clone(),
            queue: submission.queue.clone(),
            account: submission.account.clone(),
            spec: spec.clone(),
            batch_output: input_dir.join(format!("{job_name}{BATCH_OUT_SUFFIX}")),
            env: environment,
            depend_ok: submission.depend_ok.clone(),
        };

        // a rejection leaves no trace: no record is written
        let job_id = self.batch.submit(&request).await?;
        info!(%job_id, queue = %submission.queue, "job submitted");

        let state = self.initial_state(&job_id).await;
        let record = JobRecord {
            job_id,
            job_name,
            script_name,
            queue: submission.queue,
            scheduler: self.batch.kind(),
            state,
            input_host: self.config.local_host.clone(),
            input_dir,
            resources: spec,
            submitted_at: Utc::now(),
            work_dir: None,
            main_node: None,
            nodes: Vec::new(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            include_paths: submission.include_paths,
            exclude_paths: submission.exclude_paths,
            loop_spec: submission.loop_spec,
            command_line: submission.command_line,
        };
        self.store.save(&record).await?;

        Ok(record)
    }

    /// Whether this submission continues an existing loop job: the input
    /// directory holds a finished loop record whose cycle is exactly one
    /// below the incoming one.
    pub async fn continues_loop(&self, submission: &JobSubmission) -> bool {
        let Some(incoming) = &submission.loop_spec else {
            return false;
        };
        let Some(input_dir) = submission.script.parent() else {
            return false;
        };

        let info_file = match InfoStore::find_info_file(input_dir).await {
            Ok(Some(path)) => path,
            Ok(None) => return false,
            Err(e) => {
                debug!("could not look for a previous info file: {e}");
                return false;
            }
        };

        match self.store.reload(&info_file).await {
            Ok(previous) => {
                previous.state == JobState::Finished
                    && previous
                        .loop_spec
                        .as_ref()
                        .is_some_and(|prev| prev.current + 1 == incoming.current)
            }
            Err(e) => {
                debug!("could not read a previous info file: {e}");
                false
            }
        }
    }

    /// Queue-side default resources; empty when the queue cannot be
    /// queried.
    async fn queue_defaults(&self, queue: &str) -> ResourceSpec {
        match self.batch.query_queue(queue).await {
            Ok(Some(info)) => info.defaults,
            Ok(None) => ResourceSpec::default(),
            Err(e) => {
                debug!("could not query queue '{queue}' for defaults: {e}");
                ResourceSpec::default()
            }
        }
    }

    /// The state to record right after submission. Schedulers may hold a
    /// job immediately (e.g. for an unmet dependency); one follow-up query
    /// catches that, and any probe failure falls back to `Queued` since the
    /// submission itself already succeeded.
    async fn initial_state(&self, job_id: &str) -> JobState {
        match self.batch.query_job(job_id).await {
            Ok(Some(status)) if status.state == BatchState::Held => JobState::Held,
            Ok(_) => JobState::Queued,
            Err(e) => {
                warn!("could not probe the state of freshly submitted job '{job_id}': {e}");
                JobState::Queued
            }
        }
    }
}

/// The name a job is submitted under: the script name, with the cycle tag
/// appended for loop jobs.
fn job_name(script_name: &str, loop_spec: Option<&LoopSpec>) -> String {
    match loop_spec {
        Some(spec) => format!("{script_name}{}", cycle_tag(spec.current)),
        None => script_name.to_string(),
    }
}
