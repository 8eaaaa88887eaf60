//! The working-directory lifecycle state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use grani_types::{JobRecord, JobState};

use crate::error::{CoreError, CoreResult};
use crate::retry::Retry;
use crate::store::InfoStore;
use crate::sync::DirSync;

/// Terminal outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The script exited with code 0.
    Finished,
    /// The script exited with the given non-zero code.
    Failed(i32),
    /// The job was cancelled.
    Killed,
}

/// Drives a job's working directory through its lifecycle:
/// `Held -> Queued -> Running -> {Finished | Failed | Killed}`.
///
/// Terminal processing passes through the transient `Finishing` state,
/// during which the runtime files (`.out`/`.err`) are copied back to the
/// input directory before anything else. That ordering guarantees failure
/// diagnostics are recoverable even if the subsequent full sync is
/// interrupted.
pub struct LifecycleController {
    store: Arc<InfoStore>,
    sync: Arc<dyn DirSync>,
    retry: Retry,
}

impl LifecycleController {
    /// Create a controller over the given store and synchronizer.
    pub fn new(store: Arc<InfoStore>, sync: Arc<dyn DirSync>) -> Self {
        Self {
            store,
            sync,
            retry: Retry::default(),
        }
    }

    /// Override the retry policy used for synchronization.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Record that the job started executing on `main_node` in `work_dir`.
    ///
    /// The working directory is created by the execution environment; here
    /// it is recorded, exactly once. Fails when the record says the job was
    /// killed in the meantime.
    pub async fn on_start(
        &self,
        info_file: &Path,
        main_node: &str,
        nodes: Vec<String>,
        work_dir: &Path,
    ) -> CoreResult<JobRecord> {
        let record = self.store.reload(info_file).await?;
        if record.state == JobState::Killed {
            return Err(CoreError::NotSuitable(
                "job has been killed before it started running".to_string(),
            ));
        }

        self.store
            .update(info_file, |record| {
                record.set_running(Utc::now(), main_node, nodes, work_dir);
            })
            .await
    }

    /// Process a terminal signal for the job.
    ///
    /// Copies the runtime files to the input directory first, then
    /// synchronizes the remaining working directory (killed jobs get the
    /// partial copy only), then marks the record with the outcome. The
    /// outcome is recorded even when the full sync fails; the failure is
    /// surfaced afterwards.
    pub async fn on_terminal(&self, info_file: &Path, outcome: Outcome) -> CoreResult<JobRecord> {
        let record = self
            .store
            .update(info_file, JobRecord::set_finishing)
            .await?;

        let sync_result = self.sync_back(&record, outcome).await;
        if let Err(e) = &sync_result {
            warn!(job_id = %record.job_id, "working directory sync failed: {e}");
        }

        let record = self
            .store
            .update(info_file, |record| match outcome {
                Outcome::Finished => record.set_finished(Utc::now()),
                Outcome::Failed(code) => record.set_failed(Utc::now(), code),
                Outcome::Killed => record.set_killed(Utc::now()),
            })
            .await?;
        info!(job_id = %record.job_id, state = %record.state, "job reached terminal state");

        sync_result?;
        Ok(record)
    }

    /// Synchronize the working directory to the input directory on demand,
    /// optionally restricted to a subset of paths. Safe to call while the
    /// job is running.
    pub async fn sync_now(&self, info_file: &Path, filter: Option<&[PathBuf]>) -> CoreResult<()> {
        let record = self.store.load(info_file).await?;
        let (host, work_dir) = record.destination().ok_or(CoreError::NoDestination)?;

        if record.work_dir_is_input_dir() {
            // the job writes into the input directory directly
            return Ok(());
        }

        match filter {
            Some(paths) => {
                info!(job_id = %record.job_id, ?paths, "fetching selected files from the working directory");
                self.sync
                    .copy_selected(work_dir, &record.input_dir, Some(host), paths)
                    .await?;
            }
            None => {
                info!(job_id = %record.job_id, "fetching all files from the working directory");
                self.sync
                    .copy_all(work_dir, &record.input_dir, Some(host), &self.sync_exclusions(&record))
                    .await?;
            }
        }
        Ok(())
    }

    /// Delete a terminal job's working directory.
    ///
    /// Permitted only when the record is terminal and no sync is in flight
    /// (a `Finishing` record means one is); this prevents destroying a
    /// directory the scheduler side might still be writing to. Idempotent:
    /// wiping an already-removed directory succeeds. The input directory is
    /// never deleted.
    pub async fn wipe(&self, info_file: &Path) -> CoreResult<String> {
        let record = self.store.reload(info_file).await?;

        if !record.state.is_terminal() {
            return Err(CoreError::NotTerminal(record.job_id.clone()));
        }

        let (host, work_dir) = record.destination().ok_or_else(|| {
            CoreError::NotSuitable("job does not have a working directory".to_string())
        })?;

        if record.work_dir_is_input_dir() {
            return Err(CoreError::NotSuitable(
                "working directory of the job is the input directory; refusing to delete it"
                    .to_string(),
            ));
        }

        info!(job_id = %record.job_id, work_dir = %work_dir.display(), "deleting working directory");
        self.sync.remove_dir(Some(host), work_dir).await?;
        Ok(record.job_id)
    }

    /// Copy runtime files, then the rest of the working directory.
    async fn sync_back(&self, record: &JobRecord, outcome: Outcome) -> CoreResult<()> {
        let Some((host, work_dir)) = record.destination() else {
            // the job never started; nothing to copy
            return Ok(());
        };
        if record.work_dir_is_input_dir() {
            return Ok(());
        }

        // diagnostics first: .out/.err must land before anything else
        let runtime = record.runtime_files();
        self.retry
            .run(|| {
                self.sync
                    .copy_selected(work_dir, &record.input_dir, Some(host), &runtime)
            })
            .await?;

        // killed jobs keep the rest of the working directory in place for
        // inspection; a later explicit sync or wipe decides its fate
        if outcome == Outcome::Killed {
            return Ok(());
        }

        let exclusions = self.sync_exclusions(record);
        self.retry
            .run(|| {
                self.sync.copy_all(
                    work_dir,
                    &record.input_dir,
                    Some(host),
                    &exclusions,
                )
            })
            .await?;

        // scratch is only reclaimed after a fully successful sync
        if outcome == Outcome::Finished {
            self.retry
                .run(|| self.sync.remove_dir(Some(host), work_dir))
                .await?;
        }
        Ok(())
    }

    /// Paths that never travel back to the input directory.
    fn sync_exclusions(&self, record: &JobRecord) -> Vec<PathBuf> {
        let mut exclude = record.exclude_paths.clone();
        exclude.push(PathBuf::from(format!(
            "{}{}",
            record.job_name,
            grani_types::INFO_SUFFIX
        )));
        exclude
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InterruptedSync, LocalSync, sample_record};

    struct Setup {
        _input: tempfile::TempDir,
        _scratch: tempfile::TempDir,
        input_dir: PathBuf,
        work_dir: PathBuf,
        store: Arc<InfoStore>,
        info_file: PathBuf,
    }

    async fn setup() -> Setup {
        let input = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let input_dir = input.path().to_path_buf();
        let work_dir = scratch.path().join("work");
        std::fs::create_dir(&work_dir).unwrap();

        let store = Arc::new(InfoStore::new());
        let record = sample_record(&input_dir, "md.sh", "1.mock");
        let info_file = store.save(&record).await.unwrap();

        Setup {
            _input: input,
            _scratch: scratch,
            input_dir,
            work_dir,
            store,
            info_file,
        }
    }

    fn controller(store: Arc<InfoStore>, sync: Arc<dyn DirSync>) -> LifecycleController {
        LifecycleController::new(store, sync).with_retry(Retry::once())
    }

    fn populate_work_dir(work_dir: &Path) {
        std::fs::write(work_dir.join("md.sh.out"), "stdout").unwrap();
        std::fs::write(work_dir.join("md.sh.err"), "stderr").unwrap();
        std::fs::write(work_dir.join("trajectory.xtc"), "data").unwrap();
    }

    #[tokio::test]
    async fn test_start_then_finish_syncs_everything() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        let record = lifecycle
            .on_start(&s.info_file, "node1", vec!["node1".to_string()], &s.work_dir)
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Running);

        populate_work_dir(&s.work_dir);
        let record = lifecycle
            .on_terminal(&s.info_file, Outcome::Finished)
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Finished);
        assert_eq!(record.exit_code, Some(0));

        assert!(s.input_dir.join("md.sh.out").exists());
        assert!(s.input_dir.join("trajectory.xtc").exists());
        // scratch reclaimed after a successful sync
        assert!(!s.work_dir.exists());
    }

    #[tokio::test]
    async fn test_runtime_files_survive_interrupted_sync() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(InterruptedSync::new()));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();
        populate_work_dir(&s.work_dir);

        let result = lifecycle.on_terminal(&s.info_file, Outcome::Failed(17)).await;
        assert!(result.is_err());

        // diagnostics were copied before the full sync was attempted
        assert!(s.input_dir.join("md.sh.out").exists());
        assert!(s.input_dir.join("md.sh.err").exists());
        assert!(!s.input_dir.join("trajectory.xtc").exists());

        // and the outcome still landed in the record
        let record = s.store.reload(&s.info_file).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.exit_code, Some(17));
    }

    #[tokio::test]
    async fn test_killed_job_gets_partial_sync_only() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();
        populate_work_dir(&s.work_dir);

        let record = lifecycle
            .on_terminal(&s.info_file, Outcome::Killed)
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Killed);

        assert!(s.input_dir.join("md.sh.out").exists());
        // the rest stays in the working directory for inspection
        assert!(!s.input_dir.join("trajectory.xtc").exists());
        assert!(s.work_dir.exists());
    }

    #[tokio::test]
    async fn test_wipe_requires_terminal_state() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();

        let err = lifecycle.wipe(&s.info_file).await.unwrap_err();
        assert!(matches!(err, CoreError::NotTerminal(_)));
        assert!(s.work_dir.exists());
    }

    #[tokio::test]
    async fn test_wipe_is_idempotent() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();
        populate_work_dir(&s.work_dir);
        lifecycle
            .on_terminal(&s.info_file, Outcome::Killed)
            .await
            .unwrap();

        assert_eq!(lifecycle.wipe(&s.info_file).await.unwrap(), "1.mock");
        assert!(!s.work_dir.exists());
        // a second wipe of the already-removed directory succeeds
        assert_eq!(lifecycle.wipe(&s.info_file).await.unwrap(), "1.mock");
    }

    #[tokio::test]
    async fn test_wipe_refuses_while_finishing() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();
        s.store
            .update(&s.info_file, JobRecord::set_finishing)
            .await
            .unwrap();

        let err = lifecycle.wipe(&s.info_file).await.unwrap_err();
        assert!(matches!(err, CoreError::NotTerminal(_)));
    }

    #[tokio::test]
    async fn test_wipe_never_deletes_input_dir() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        // a job that ran directly in the input directory
        s.store
            .update(&s.info_file, |record| {
                record.resources.work_dir = grani_types::WorkDirPolicy::InputDir;
                record.set_running(Utc::now(), "login1", vec![], record.input_dir.clone());
                record.set_killed(Utc::now());
            })
            .await
            .unwrap();

        let err = lifecycle.wipe(&s.info_file).await.unwrap_err();
        assert!(matches!(err, CoreError::NotSuitable(_)));
        assert!(s.input_dir.exists());
    }

    #[tokio::test]
    async fn test_sync_now_with_filter() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap();
        populate_work_dir(&s.work_dir);

        lifecycle
            .sync_now(&s.info_file, Some(&[PathBuf::from("trajectory.xtc")]))
            .await
            .unwrap();
        assert!(s.input_dir.join("trajectory.xtc").exists());
        assert!(!s.input_dir.join("md.sh.out").exists());
    }

    #[tokio::test]
    async fn test_sync_now_requires_destination() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        let err = lifecycle.sync_now(&s.info_file, None).await.unwrap_err();
        assert!(matches!(err, CoreError::NoDestination));
    }

    #[tokio::test]
    async fn test_start_after_kill_is_rejected() {
        let s = setup().await;
        let lifecycle = controller(Arc::clone(&s.store), Arc::new(LocalSync));

        s.store
            .update(&s.info_file, |record| record.set_killed(Utc::now()))
            .await
            .unwrap();

        let err = lifecycle
            .on_start(&s.info_file, "node1", vec![], &s.work_dir)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotSuitable(_)));
    }
}
