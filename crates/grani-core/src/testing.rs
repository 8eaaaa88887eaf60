//! Test support: a programmable mock batch system and filesystem-only
//! directory synchronizers.
//!
//! Lives in the library (not behind `cfg(test)`) so integration tests and
//! downstream crates can drive the lifecycle engine without a scheduler.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};

use grani_batch::{
    BatchError, BatchJobStatus, BatchResult, BatchSystem, NodeInfo, QueueInfo, SubmitRequest,
};
use grani_types::{BatchKind, BatchState, JobRecord, JobState, ResourceSpec};

use crate::sync::DirSync;

/// A minimal queued record for store and lifecycle tests.
pub fn sample_record(input_dir: &Path, job_name: &str, job_id: &str) -> JobRecord {
    JobRecord {
        job_id: job_id.to_string(),
        job_name: job_name.to_string(),
        script_name: job_name.to_string(),
        queue: "batch".to_string(),
        scheduler: BatchKind::Pbs,
        state: JobState::Queued,
        input_host: "login1".to_string(),
        input_dir: input_dir.to_path_buf(),
        resources: ResourceSpec::default().resolve(),
        submitted_at: Utc::now(),
        work_dir: None,
        main_node: None,
        nodes: Vec::new(),
        started_at: None,
        completed_at: None,
        exit_code: None,
        include_paths: Vec::new(),
        exclude_paths: Vec::new(),
        loop_spec: None,
        command_line: Vec::new(),
    }
}

/// A programmable in-memory batch system.
///
/// Supports per-id query latencies and failures, submission rejection, and
/// tracks the high-water mark of concurrent queries, which the collector
/// tests use to verify the worker bound.
pub struct MockBatch {
    counter: AtomicU64,
    reject_submit: AtomicBool,
    hold_on_submit: AtomicBool,
    statuses: Mutex<FxHashMap<String, BatchJobStatus>>,
    latencies: Mutex<FxHashMap<String, Duration>>,
    failing: Mutex<FxHashSet<String>>,
    cancelled: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBatch {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1000),
            reject_submit: AtomicBool::new(false),
            hold_on_submit: AtomicBool::new(false),
            statuses: Mutex::new(FxHashMap::default()),
            latencies: Mutex::new(FxHashMap::default()),
            failing: Mutex::new(FxHashSet::default()),
            cancelled: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Reject all further submissions.
    pub fn reject_submissions(&self) {
        self.reject_submit.store(true, Ordering::SeqCst);
    }

    /// Report newly submitted jobs as held.
    pub fn hold_submissions(&self) {
        self.hold_on_submit.store(true, Ordering::SeqCst);
    }

    /// Set the reported state of one job.
    pub fn set_state(&self, job_id: &str, state: BatchState) {
        let mut statuses = self.statuses.lock().expect("mock lock");
        let entry = statuses
            .entry(job_id.to_string())
            .or_insert_with(|| BatchJobStatus {
                job_id: job_id.to_string(),
                ..Default::default()
            });
        entry.state = state;
    }

    /// Remove a job from the mock scheduler's history.
    pub fn purge(&self, job_id: &str) {
        self.statuses.lock().expect("mock lock").remove(job_id);
    }

    /// Delay queries for one id.
    pub fn set_latency(&self, id: &str, latency: Duration) {
        self.latencies
            .lock()
            .expect("mock lock")
            .insert(id.to_string(), latency);
    }

    /// Make queries for one id fail with a timeout.
    pub fn fail_queries_for(&self, id: &str) {
        self.failing.lock().expect("mock lock").insert(id.to_string());
    }

    /// Ids cancelled so far.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().expect("mock lock").clone()
    }

    /// Highest number of queries observed in flight at once.
    pub fn max_concurrent_queries(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter_query(&self, id: &str) -> BatchResult<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.latencies.lock().expect("mock lock").get(id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().expect("mock lock").contains(id) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(BatchError::Timeout {
                command: "mock-query".to_string(),
                seconds: 0,
            });
        }
        Ok(())
    }

    fn leave_query(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchSystem for MockBatch {
    fn kind(&self) -> BatchKind {
        BatchKind::Pbs
    }

    async fn submit(&self, request: &SubmitRequest) -> BatchResult<String> {
        if self.reject_submit.load(Ordering::SeqCst) {
            return Err(BatchError::SchedulerRejected(
                "mock rejection".to_string(),
            ));
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("{id}.mock");
        let state = if self.hold_on_submit.load(Ordering::SeqCst) {
            BatchState::Held
        } else {
            BatchState::Queued
        };

        let mut statuses = self.statuses.lock().expect("mock lock");
        statuses.insert(
            job_id.clone(),
            BatchJobStatus {
                job_id: job_id.clone(),
                name: request.job_name.clone(),
                state,
                queue: Some(request.queue.clone()),
                ..Default::default()
            },
        );
        Ok(job_id)
    }

    async fn query_job(&self, job_id: &str) -> BatchResult<Option<BatchJobStatus>> {
        self.enter_query(job_id).await?;
        let result = self
            .statuses
            .lock()
            .expect("mock lock")
            .get(job_id)
            .cloned();
        self.leave_query();
        Ok(result)
    }

    async fn query_queue(&self, name: &str) -> BatchResult<Option<QueueInfo>> {
        self.enter_query(name).await?;
        self.leave_query();
        Ok(Some(QueueInfo {
            name: name.to_string(),
            enabled: true,
            started: true,
            ..Default::default()
        }))
    }

    async fn query_node(&self, name: &str) -> BatchResult<Option<NodeInfo>> {
        self.enter_query(name).await?;
        self.leave_query();
        Ok(Some(NodeInfo {
            name: name.to_string(),
            state: "free".to_string(),
            ..Default::default()
        }))
    }

    async fn cancel(&self, job_id: &str) -> BatchResult<()> {
        let mut statuses = self.statuses.lock().expect("mock lock");
        match statuses.get_mut(job_id) {
            Some(status) if status.state.is_active() => {
                status.state = BatchState::Failed;
                self.cancelled
                    .lock()
                    .expect("mock lock")
                    .push(job_id.to_string());
                Ok(())
            }
            _ => Err(BatchError::AlreadyTerminal(job_id.to_string())),
        }
    }

    async fn cancel_force(&self, job_id: &str) -> BatchResult<()> {
        self.cancel(job_id).await
    }

    async fn list_user_jobs(&self, _user: &str) -> BatchResult<Vec<BatchJobStatus>> {
        Ok(self
            .statuses
            .lock()
            .expect("mock lock")
            .values()
            .cloned()
            .collect())
    }
}

/// A [`DirSync`] that copies through the local filesystem, for tests on
/// shared-storage-like tempdirs.
pub struct LocalSync;

fn copy_tree(src: &Path, dest: &Path, exclude: &[PathBuf]) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let relative = PathBuf::from(entry.file_name());
        if exclude.contains(&relative) {
            continue;
        }
        let target = dest.join(&relative);
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target, &[])?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl DirSync for LocalSync {
    async fn copy_all(
        &self,
        src: &Path,
        dest: &Path,
        _src_host: Option<&str>,
        exclude: &[PathBuf],
    ) -> BatchResult<()> {
        copy_tree(src, dest, exclude).map_err(BatchError::Io)
    }

    async fn copy_selected(
        &self,
        src: &Path,
        dest: &Path,
        _src_host: Option<&str>,
        include: &[PathBuf],
    ) -> BatchResult<()> {
        std::fs::create_dir_all(dest).map_err(BatchError::Io)?;
        for relative in include {
            let from = src.join(relative);
            if from.exists() {
                std::fs::copy(&from, dest.join(relative)).map_err(BatchError::Io)?;
            }
        }
        Ok(())
    }

    async fn remove_dir(&self, _host: Option<&str>, dir: &Path) -> BatchResult<()> {
        match std::fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BatchError::Io(e)),
        }
    }
}

/// A [`DirSync`] whose full sync always fails after the selected copy
/// succeeded, simulating an interrupted working-directory sync.
pub struct InterruptedSync {
    inner: LocalSync,
}

impl InterruptedSync {
    pub fn new() -> Self {
        Self { inner: LocalSync }
    }
}

impl Default for InterruptedSync {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirSync for InterruptedSync {
    async fn copy_all(
        &self,
        _src: &Path,
        _dest: &Path,
        _src_host: Option<&str>,
        _exclude: &[PathBuf],
    ) -> BatchResult<()> {
        Err(BatchError::CommandFailed {
            command: "rsync".to_string(),
            message: "connection reset".to_string(),
        })
    }

    async fn copy_selected(
        &self,
        src: &Path,
        dest: &Path,
        src_host: Option<&str>,
        include: &[PathBuf],
    ) -> BatchResult<()> {
        self.inner.copy_selected(src, dest, src_host, include).await
    }

    async fn remove_dir(&self, host: Option<&str>, dir: &Path) -> BatchResult<()> {
        self.inner.remove_dir(host, dir).await
    }
}
