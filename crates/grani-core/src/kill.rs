//! Job termination.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use grani_batch::{BatchError, BatchSystem};
use grani_types::{BatchState, JobState};

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{LifecycleController, Outcome};
use crate::store::InfoStore;

/// Terminates jobs: issues cancellation to the batch system and triggers
/// the partial lifecycle cleanup (runtime files are copied back before any
/// further synchronization).
pub struct Killer {
    batch: Arc<dyn BatchSystem>,
    store: Arc<InfoStore>,
    lifecycle: Arc<LifecycleController>,
}

impl Killer {
    /// Create a killer over the given batch system and lifecycle
    /// controller.
    pub fn new(
        batch: Arc<dyn BatchSystem>,
        store: Arc<InfoStore>,
        lifecycle: Arc<LifecycleController>,
    ) -> Self {
        Self {
            batch,
            store,
            lifecycle,
        }
    }

    /// Kill a job.
    ///
    /// With `force`, the job is terminated without cleanup time and the
    /// record is updated unconditionally. Jobs that already reached a
    /// terminal state (or are mid-terminal-processing) are rejected. A
    /// scheduler-side `AlreadyTerminal` on the cancel itself is reported
    /// but not escalated; the record still gets its killed mark.
    pub async fn kill(&self, info_file: &Path, force: bool) -> CoreResult<String> {
        let record = self.store.reload(info_file).await?;
        let batch_state = match self.batch.query_job(&record.job_id).await {
            Ok(Some(status)) => status.state,
            Ok(None) => BatchState::Unknown,
            Err(e) => {
                warn!(job_id = %record.job_id, "could not query the scheduler before kill: {e}");
                BatchState::Unknown
            }
        };
        let state = JobState::reconcile(record.state, batch_state);

        self.ensure_suitable(state)?;

        let cancel = if force {
            self.batch.cancel_force(&record.job_id).await
        } else {
            self.batch.cancel(&record.job_id).await
        };
        match cancel {
            Ok(()) => info!(job_id = %record.job_id, force, "job cancelled"),
            // the scheduler beat us to it; the record update below still
            // applies
            Err(BatchError::AlreadyTerminal(_)) => {
                warn!(job_id = %record.job_id, "job already left the scheduler's active state");
            }
            Err(e) => return Err(e.into()),
        }

        // partial cleanup: runtime files first, rest of the working
        // directory stays put for inspection
        self.lifecycle.on_terminal(info_file, Outcome::Killed).await?;

        // write-protect the record so a booting runner cannot overwrite
        // the killed state
        self.store.lock(info_file).await?;

        Ok(record.job_id)
    }

    fn ensure_suitable(&self, state: JobState) -> CoreResult<()> {
        match state {
            JobState::Finished | JobState::Failed => Err(CoreError::NotSuitable(
                "job cannot be terminated: it is already completed".to_string(),
            )),
            JobState::Killed => Err(CoreError::NotSuitable(
                "job cannot be terminated: it has already been killed".to_string(),
            )),
            JobState::Finishing => Err(CoreError::NotSuitable(
                "job cannot be terminated: it is in an exiting state".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
