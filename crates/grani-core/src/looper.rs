//! Loop-job resubmission.

use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, info, warn};

use grani_types::{JobRecord, cycle_tag};

use crate::env;
use crate::error::CoreResult;
use crate::submit::{JobSubmission, Submitter};

/// Predicate deciding whether an artifact file stem belongs to a cycle tag.
///
/// Cycle detection via filename matching is inherently heuristic; it is
/// isolated behind this single predicate so the matching rule can be
/// tightened without touching the engine.
pub type CycleMatcher = fn(stem: &str, tag: &str) -> bool;

/// The default matcher: the tag appears anywhere in the stem. Tolerates
/// naming drift between cycles.
pub fn substring_matcher(stem: &str, tag: &str) -> bool {
    stem.contains(tag)
}

/// A stricter matcher: the stem ends with the tag.
pub fn prefix_matcher(stem: &str, tag: &str) -> bool {
    stem.ends_with(tag)
}

/// Infer the highest existing cycle number from the files in an archive
/// directory, falling back to `start` when the directory does not exist or
/// holds no tagged files.
pub async fn detect_cycle(archive_dir: &Path, start: u32) -> u32 {
    let mut max = start;
    let Ok(mut entries) = fs::read_dir(archive_dir).await else {
        debug!(
            "archive '{}' does not exist, starting at cycle {start}",
            archive_dir.display()
        );
        return start;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if let Some(cycle) = extract_cycle(&name.to_string_lossy()) {
            max = max.max(cycle);
        }
    }
    max
}

/// The cycle number embedded in a file name (`md.sh+0004.out` -> 4).
fn extract_cycle(name: &str) -> Option<u32> {
    let at = name.find('+')?;
    let digits: String = name[at + 1..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Decides, at loop-job completion, whether the next cycle is submitted.
pub struct LoopEngine {
    submitter: Arc<Submitter>,
    matcher: CycleMatcher,
    optout_var: String,
}

impl LoopEngine {
    /// Create a loop engine resubmitting through the given submitter.
    pub fn new(submitter: Arc<Submitter>) -> Self {
        Self {
            submitter,
            matcher: substring_matcher,
            optout_var: env::NO_RESUBMIT.to_string(),
        }
    }

    /// Replace the artifact-matching predicate.
    pub fn with_matcher(mut self, matcher: CycleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Read the opt-out from a different environment variable (testing).
    pub fn with_optout_var(mut self, var: impl Into<String>) -> Self {
        self.optout_var = var.into();
        self
    }

    /// Handle the completion of one cycle.
    ///
    /// Returns the job id of the next cycle's submission, or `None` when
    /// the loop ends here: the explicit opt-out is set, the final cycle
    /// completed, or the next cycle's artifact already exists (e.g. from
    /// manual intervention). A resubmission failure is reported but never
    /// changes the completed job's terminal state.
    pub async fn on_cycle_complete(&self, record: &JobRecord) -> CoreResult<Option<String>> {
        let Some(loop_spec) = &record.loop_spec else {
            return Ok(None);
        };

        if self.opted_out() {
            info!(job_id = %record.job_id, "resubmission opt-out is set, ending the loop");
            return Ok(None);
        }

        if loop_spec.is_last_cycle() {
            info!(job_id = %record.job_id, "this was the final cycle, not resubmitting");
            return Ok(None);
        }

        let next = loop_spec.next_cycle();
        let tag = next.current_tag();
        if self.cycle_exists(record, &tag).await {
            warn!(
                job_id = %record.job_id,
                "an artifact for cycle {} already exists, not resubmitting",
                next.current
            );
            return Ok(None);
        }

        let submission = JobSubmission {
            script: record.input_dir.join(&record.script_name),
            queue: record.queue.clone(),
            account: None,
            resources: record.resources.to_spec(),
            include_paths: record.include_paths.clone(),
            exclude_paths: record.exclude_paths.clone(),
            loop_spec: Some(next),
            // the next cycle only starts after this one finished cleanly
            depend_ok: vec![record.job_id.clone()],
            command_line: record.command_line.clone(),
        };

        match self.submitter.submit(submission).await {
            Ok(next_record) => {
                info!(
                    job_id = %record.job_id,
                    next_job_id = %next_record.job_id,
                    "loop job resubmitted"
                );
                Ok(Some(next_record.job_id))
            }
            Err(e) => {
                warn!(job_id = %record.job_id, "could not resubmit the loop job: {e}");
                Err(e)
            }
        }
    }

    /// Move the previous cycle's runtime files from the input directory
    /// into the archive. Returns how many files were moved.
    pub async fn archive_runtime_files(&self, record: &JobRecord, cycle: u32) -> CoreResult<usize> {
        let Some(loop_spec) = &record.loop_spec else {
            return Ok(0);
        };
        fs::create_dir_all(&loop_spec.archive_dir).await?;

        let prefix = format!("{}{}", record.script_name, cycle_tag(cycle));
        let mut moved = 0;
        let mut entries = fs::read_dir(&record.input_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                fs::rename(entry.path(), loop_spec.archive_dir.join(&name)).await?;
                moved += 1;
            }
        }
        debug!(moved, cycle, "archived runtime files");
        Ok(moved)
    }

    fn opted_out(&self) -> bool {
        std::env::var(&self.optout_var)
            .map(|v| !v.is_empty() && v != "0" && v.to_ascii_lowercase() != "false")
            .unwrap_or(false)
    }

    /// Whether an artifact for the given cycle tag already exists in the
    /// archive or the input directory.
    async fn cycle_exists(&self, record: &JobRecord, tag: &str) -> bool {
        let Some(loop_spec) = &record.loop_spec else {
            return false;
        };
        for dir in [&loop_spec.archive_dir, &record.input_dir] {
            if self.dir_has_match(dir, tag).await {
                return true;
            }
        }
        false
    }

    async fn dir_has_match(&self, dir: &Path, tag: &str) -> bool {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = name.split('.').next().unwrap_or(&name);
            if (self.matcher)(stem, tag) || (self.matcher)(&name, tag) {
                return true;
            }
        }
        false
    }
}
