//! Job lifecycle engine for the grani job-management layer.
//!
//! Everything above the batch seam lives here: the per-job info store, the
//! submitter, the working-directory lifecycle controller, the killer, the
//! loop-job resubmission engine, and the concurrent status collector.
//!
//! Per-job mutating operations (submit, kill, wipe, sync) on the same job
//! are serialized by the caller; only the [`Collector`] runs concurrently,
//! and only across distinct ids.

mod collect;
mod env;
mod error;
mod kill;
mod lifecycle;
mod looper;
mod retry;
mod store;
mod submit;
mod sync;
pub mod testing;

pub use collect::{Collector, JobEntry, NodeEntry, QueueEntry};
pub use env::job_environment;
pub use error::{CoreError, CoreResult};
pub use kill::Killer;
pub use lifecycle::{LifecycleController, Outcome};
pub use looper::{CycleMatcher, LoopEngine, detect_cycle, prefix_matcher, substring_matcher};
pub use retry::Retry;
pub use store::InfoStore;
pub use submit::{JobSubmission, Submitter, server_defaults};
pub use sync::{DirSync, RsyncSync};

pub mod env_vars {
    //! Names of the environment variables exported into running jobs.
    pub use crate::env::*;
}
