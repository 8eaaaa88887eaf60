//! Loop-job bookkeeping.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loop specification validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopSpecError {
    /// The ending cycle is missing.
    #[error("attribute 'loop-end' is undefined")]
    MissingEnd,

    /// The starting cycle is higher than the ending cycle.
    #[error("'loop-start' ({start}) cannot be higher than 'loop-end' ({end})")]
    StartAfterEnd { start: u32, end: u32 },

    /// The current cycle is higher than the ending cycle.
    #[error("current cycle ({current}) cannot be higher than 'loop-end' ({end})")]
    CurrentAfterEnd { current: u32, end: u32 },

    /// The archive directory coincides with the input directory.
    #[error("input directory cannot be used as the loop job's archive")]
    ArchiveIsInputDir,
}

/// Format the cycle tag appended to job names and archived artifacts,
/// e.g. cycle 3 becomes `+0003`.
pub fn cycle_tag(cycle: u32) -> String {
    format!("+{cycle:04}")
}

/// Bookkeeping for a cyclic (loop) job.
///
/// The cycle index increases monotonically per job family; each completed
/// cycle decides via the loop engine whether the next one is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopSpec {
    /// First cycle of the loop.
    pub start: u32,

    /// Last cycle of the loop (inclusive).
    pub end: u32,

    /// The cycle this job runs.
    pub current: u32,

    /// Directory where completed cycles archive their artifacts.
    pub archive_dir: PathBuf,

    /// File naming pattern for archived artifacts.
    pub pattern: String,
}

impl LoopSpec {
    /// Create a validated loop specification.
    ///
    /// `current` defaults to `start`. `input_dir`, when given, is checked
    /// against the archive directory: archiving into the input directory
    /// itself would make every cycle look already produced.
    pub fn new(
        start: u32,
        end: Option<u32>,
        current: Option<u32>,
        archive_dir: impl Into<PathBuf>,
        pattern: impl Into<String>,
        input_dir: Option<&Path>,
    ) -> Result<Self, LoopSpecError> {
        let end = end.ok_or(LoopSpecError::MissingEnd)?;
        let archive_dir = archive_dir.into();

        if let Some(input_dir) = input_dir {
            if archive_dir == input_dir {
                return Err(LoopSpecError::ArchiveIsInputDir);
            }
        }

        if start > end {
            return Err(LoopSpecError::StartAfterEnd { start, end });
        }

        let current = current.unwrap_or(start);
        if current > end {
            return Err(LoopSpecError::CurrentAfterEnd { current, end });
        }

        Ok(Self {
            start,
            end,
            current,
            archive_dir,
            pattern: pattern.into(),
        })
    }

    /// Whether this cycle is the final one of the loop.
    pub fn is_last_cycle(&self) -> bool {
        self.current >= self.end
    }

    /// The specification for the next cycle.
    pub fn next_cycle(&self) -> Self {
        Self {
            current: self.current + 1,
            ..self.clone()
        }
    }

    /// Tag of the current cycle, e.g. `+0002`.
    pub fn current_tag(&self) -> String {
        cycle_tag(self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_tag_format() {
        assert_eq!(cycle_tag(1), "+0001");
        assert_eq!(cycle_tag(123), "+0123");
        assert_eq!(cycle_tag(99999), "+99999");
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            LoopSpec::new(1, None, None, "/arch", "run*", None),
            Err(LoopSpecError::MissingEnd)
        );
        assert_eq!(
            LoopSpec::new(5, Some(3), None, "/arch", "run*", None),
            Err(LoopSpecError::StartAfterEnd { start: 5, end: 3 })
        );
        assert_eq!(
            LoopSpec::new(1, Some(3), Some(4), "/arch", "run*", None),
            Err(LoopSpecError::CurrentAfterEnd { current: 4, end: 3 })
        );
        assert_eq!(
            LoopSpec::new(1, Some(3), None, "/data/job", "run*", Some(Path::new("/data/job"))),
            Err(LoopSpecError::ArchiveIsInputDir)
        );
    }

    #[test]
    fn test_current_defaults_to_start() {
        let spec = LoopSpec::new(2, Some(10), None, "/arch", "run*", None).unwrap();
        assert_eq!(spec.current, 2);
        assert!(!spec.is_last_cycle());
    }

    #[test]
    fn test_next_cycle_increments_by_one() {
        let spec = LoopSpec::new(1, Some(3), Some(2), "/arch", "run*", None).unwrap();
        let next = spec.next_cycle();
        assert_eq!(next.current, 3);
        assert!(next.is_last_cycle());
    }
}
