//! Batch scheduler adapters for the grani job-management layer.
//!
//! This crate is the seam between the lifecycle engine and a concrete batch
//! scheduler. The [`BatchSystem`] trait exposes a uniform capability set
//! (submit, query, cancel); [`pbs::PbsSystem`] and [`slurm::SlurmSystem`]
//! translate it into scheduler-native commands and parse scheduler-native
//! output back into canonical records. Adding a third scheduler means
//! implementing the trait, not touching callers.

mod error;
pub mod pbs;
pub mod remote;
pub mod slurm;
mod system;

pub use error::{BatchError, BatchResult};
pub use system::{
    BatchConfig, BatchJobStatus, BatchSystem, NodeInfo, QueueInfo, SubmitRequest, detect_kind,
    system_for,
};
