//! Batch scheduler variants.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The batch scheduler owning a job.
///
/// Adding a third scheduler means implementing the `BatchSystem` trait for
/// it and extending this enum; callers are untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchKind {
    /// PBS Pro / OpenPBS / Torque.
    #[default]
    Pbs,
    /// Slurm.
    Slurm,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKind::Pbs => write!(f, "PBS"),
            BatchKind::Slurm => write!(f, "Slurm"),
        }
    }
}

impl FromStr for BatchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pbs" => Ok(BatchKind::Pbs),
            "slurm" => Ok(BatchKind::Slurm),
            other => Err(format!("unknown batch system: '{other}'")),
        }
    }
}
