//! Core data model for the grani job-management layer.
//!
//! This crate holds the types shared by the batch adapters and the job
//! lifecycle engine: resource specifications and their resolution, memory
//! and storage sizes, job states, loop-job bookkeeping, and the persisted
//! job record. It performs no I/O beyond serialization.

mod kind;
mod loop_spec;
mod record;
mod resources;
mod size;
mod state;

pub use kind::BatchKind;
pub use loop_spec::{LoopSpec, LoopSpecError, cycle_tag};
pub use record::{
    BATCH_OUT_SUFFIX, INFO_SUFFIX, JobRecord, STDERR_SUFFIX, STDOUT_SUFFIX,
};
pub use resources::{
    ResolvedSpec, ResourceSpec, WorkDirPolicy, parse_props, parse_walltime, walltime_hours,
};
pub use size::{Size, SizeParseError};
pub use state::{BatchState, JobState};
