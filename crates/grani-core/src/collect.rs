//! Concurrent status collection across jobs, queues, and nodes.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use grani_batch::{BatchJobStatus, BatchSystem, NodeInfo, QueueInfo};
use grani_types::{BatchState, JobRecord, JobState};

use crate::error::CoreError;
use crate::store::InfoStore;

/// Default bound on concurrent scheduler queries. Scheduler query
/// interfaces are serially expensive (notably under Slurm), so the fan-out
/// stays modest.
const DEFAULT_WORKERS: usize = 8;

/// Collected status of one job.
#[derive(Debug, Clone)]
pub struct JobEntry {
    /// The queried job id.
    pub job_id: String,

    /// The scheduler's report; `None` when the job is unknown or the
    /// query failed.
    pub status: Option<BatchJobStatus>,

    /// Canonical state derived from the report; `Unknown` when degraded.
    pub state: JobState,
}

/// Collected status of one queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The queried queue name.
    pub name: String,

    /// The queue's information; `None` when unknown or the query failed.
    pub info: Option<QueueInfo>,
}

/// Collected status of one node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// The queried node name.
    pub name: String,

    /// The node's information; `None` when unknown or the query failed.
    pub info: Option<NodeInfo>,
}

/// Fans status queries out across many ids concurrently, bounded by a
/// worker limit, and assembles a result set in input order.
///
/// Workers write into disjoint output slots (one per input position), so
/// the output order is deterministic regardless of per-query latency. A
/// failure for one id degrades that entry to `Unknown` and never aborts
/// the rest.
pub struct Collector {
    batch: Arc<dyn BatchSystem>,
    workers: usize,
}

impl Collector {
    /// Create a collector with the default worker bound.
    pub fn new(batch: Arc<dyn BatchSystem>) -> Self {
        Self {
            batch,
            workers: DEFAULT_WORKERS,
        }
    }

    /// Override the worker bound.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Collect the status of the given jobs, in input order.
    pub async fn collect_jobs(&self, job_ids: &[String]) -> Vec<JobEntry> {
        self.collect(job_ids, |batch, job_id| async move {
            let status = batch.query_job(&job_id).await?;
            let state = status
                .as_ref()
                .map(|s| job_state_of(s.state))
                .unwrap_or(JobState::Unknown);
            Ok(JobEntry {
                job_id,
                status,
                state,
            })
        })
        .await
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            entry.unwrap_or_else(|| JobEntry {
                job_id: job_ids[index].clone(),
                status: None,
                state: JobState::Unknown,
            })
        })
        .collect()
    }

    /// Collect the status of the given queues, in input order.
    pub async fn collect_queues(&self, names: &[String]) -> Vec<QueueEntry> {
        self.collect(names, |batch, name| async move {
            let info = batch.query_queue(&name).await?;
            Ok(QueueEntry { name, info })
        })
        .await
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            entry.unwrap_or_else(|| QueueEntry {
                name: names[index].clone(),
                info: None,
            })
        })
        .collect()
    }

    /// Collect the status of the given nodes, in input order.
    pub async fn collect_nodes(&self, names: &[String]) -> Vec<NodeEntry> {
        self.collect(names, |batch, name| async move {
            let info = batch.query_node(&name).await?;
            Ok(NodeEntry { name, info })
        })
        .await
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            entry.unwrap_or_else(|| NodeEntry {
                name: names[index].clone(),
                info: None,
            })
        })
        .collect()
    }

    /// Load the records behind the given info files, omitting jobs whose
    /// file is missing or unreadable for permissions.
    pub async fn collect_records(
        &self,
        store: &InfoStore,
        info_files: &[PathBuf],
    ) -> Vec<JobRecord> {
        let mut records = Vec::with_capacity(info_files.len());
        for path in info_files {
            match store.reload(path).await {
                Ok(record) => records.push(record),
                Err(CoreError::MissingInfoFile(_) | CoreError::Permission(_)) => {
                    debug!("skipping unreadable job record '{}'", path.display());
                }
                Err(e) => {
                    warn!("skipping job record '{}': {e}", path.display());
                }
            }
        }
        records
    }

    /// Run one query per id under the worker bound; each result lands in
    /// the slot of its input position. `None` marks a degraded entry.
    async fn collect<T, F, Fut>(&self, ids: &[String], query: F) -> Vec<Option<T>>
    where
        F: Fn(Arc<dyn BatchSystem>, String) -> Fut,
        Fut: Future<Output = Result<T, grani_batch::BatchError>>,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));

        let queries = ids.iter().cloned().enumerate().map(|(index, id)| {
            let batch = Arc::clone(&self.batch);
            let semaphore = Arc::clone(&semaphore);
            let query = &query;
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                match query(batch, id.clone()).await {
                    Ok(entry) => (index, Some(entry)),
                    Err(e) => {
                        warn!("status query for '{id}' degraded to unknown: {e}");
                        (index, None)
                    }
                }
            }
        });

        let mut slots: Vec<Option<T>> = Vec::with_capacity(ids.len());
        slots.resize_with(ids.len(), || None);
        for (index, entry) in futures::future::join_all(queries).await {
            slots[index] = entry;
        }
        slots
    }
}

/// The canonical state corresponding to a bare scheduler report, without a
/// job record to reconcile against.
fn job_state_of(batch: BatchState) -> JobState {
    match batch {
        BatchState::Queued | BatchState::Waiting | BatchState::Moving => JobState::Queued,
        BatchState::Held | BatchState::Suspended => JobState::Held,
        BatchState::Running => JobState::Running,
        BatchState::Exiting => JobState::Finishing,
        BatchState::Finished => JobState::Finished,
        BatchState::Failed => JobState::Failed,
        BatchState::Unknown => JobState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBatch, sample_record};
    use std::time::Duration;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i}.mock")).collect()
    }

    #[tokio::test]
    async fn test_output_order_matches_input_order() {
        let batch = Arc::new(MockBatch::new());
        let job_ids = ids(20);
        for (i, id) in job_ids.iter().enumerate() {
            batch.set_state(id, BatchState::Running);
            // later ids answer faster, earlier ids slower
            batch.set_latency(id, Duration::from_millis((20 - i) as u64 * 3));
        }

        let collector = Collector::new(Arc::clone(&batch) as Arc<dyn BatchSystem>);
        let entries = collector.collect_jobs(&job_ids).await;

        let collected: Vec<_> = entries.iter().map(|e| e.job_id.clone()).collect();
        assert_eq!(collected, job_ids);
        assert!(entries.iter().all(|e| e.state == JobState::Running));
    }

    #[tokio::test]
    async fn test_one_timeout_degrades_one_entry() {
        // 50 ids, one of which times out
        let batch = Arc::new(MockBatch::new());
        let job_ids = ids(50);
        for id in &job_ids {
            batch.set_state(id, BatchState::Queued);
        }
        batch.fail_queries_for("17.mock");

        let collector = Collector::new(Arc::clone(&batch) as Arc<dyn BatchSystem>);
        let entries = collector.collect_jobs(&job_ids).await;

        assert_eq!(entries.len(), 50);
        let unknown: Vec<_> = entries
            .iter()
            .filter(|e| e.state == JobState::Unknown)
            .collect();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].job_id, "17.mock");
        // order is still the input order
        let collected: Vec<_> = entries.iter().map(|e| e.job_id.clone()).collect();
        assert_eq!(collected, job_ids);
    }

    #[tokio::test]
    async fn test_purged_job_is_unknown_not_error() {
        let batch = Arc::new(MockBatch::new());
        batch.set_state("1.mock", BatchState::Running);
        // 2.mock is unknown to the scheduler

        let collector = Collector::new(Arc::clone(&batch) as Arc<dyn BatchSystem>);
        let entries = collector
            .collect_jobs(&["1.mock".to_string(), "2.mock".to_string()])
            .await;

        assert_eq!(entries[0].state, JobState::Running);
        assert_eq!(entries[1].state, JobState::Unknown);
        assert!(entries[1].status.is_none());
    }

    #[tokio::test]
    async fn test_worker_bound_is_respected() {
        let batch = Arc::new(MockBatch::new());
        let job_ids = ids(32);
        for id in &job_ids {
            batch.set_state(id, BatchState::Queued);
            batch.set_latency(id, Duration::from_millis(10));
        }

        let collector = Collector::new(Arc::clone(&batch) as Arc<dyn BatchSystem>).with_workers(4);
        collector.collect_jobs(&job_ids).await;

        assert!(batch.max_concurrent_queries() <= 4);
    }

    #[tokio::test]
    async fn test_collect_queues_and_nodes() {
        let batch = Arc::new(MockBatch::new());
        let collector = Collector::new(Arc::clone(&batch) as Arc<dyn BatchSystem>);

        let queues = collector
            .collect_queues(&["batch".to_string(), "gpu".to_string()])
            .await;
        assert_eq!(queues.len(), 2);
        assert!(queues[0].info.is_some());

        let nodes = collector.collect_nodes(&["node1".to_string()]).await;
        assert_eq!(nodes[0].name, "node1");
        assert!(nodes[0].info.is_some());
    }

    #[tokio::test]
    async fn test_collect_records_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = InfoStore::new();
        let record = sample_record(dir.path(), "md.sh", "1.mock");
        let path = store.save(&record).await.unwrap();

        let batch = Arc::new(MockBatch::new());
        let collector = Collector::new(batch as Arc<dyn BatchSystem>);
        let records = collector
            .collect_records(&store, &[path, dir.path().join("gone.info.json")])
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].job_id, "1.mock");
    }
}
