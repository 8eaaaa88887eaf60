//! Environment exported into running jobs.

use std::path::Path;

use rustc_hash::FxHashMap;

use grani_types::{BatchKind, LoopSpec, ResolvedSpec, walltime_hours};

/// Indicates that the process runs inside a grani job environment.
pub const GUARD: &str = "GRANI_ENV";

/// Enables printing of debug logs; propagated from the submitting shell.
pub const DEBUG: &str = "GRANI_DEBUG";

/// Absolute path of the job's info file.
pub const INFO_FILE: &str = "GRANI_INFO_FILE";

/// Host from which the job was submitted.
pub const INPUT_HOST: &str = "GRANI_INPUT_HOST";

/// Absolute path of the directory the job was submitted from.
pub const INPUT_DIR: &str = "GRANI_INPUT_DIR";

/// Name of the batch system driving the job.
pub const BATCH_SYSTEM: &str = "GRANI_BATCH_SYSTEM";

/// Set when the job was submitted from shared storage.
pub const SHARED_SUBMIT: &str = "GRANI_SHARED_SUBMIT";

/// Total CPU cores allocated to the job.
pub const NCPUS: &str = "GRANI_NCPUS";

/// Total GPUs allocated to the job.
pub const NGPUS: &str = "GRANI_NGPUS";

/// Number of nodes allocated to the job.
pub const NNODES: &str = "GRANI_NNODES";

/// Allocated walltime in whole hours, rounded up.
pub const WALLTIME_HOURS: &str = "GRANI_WALLTIME_HOURS";

/// Current cycle number of a loop job.
pub const LOOP_CURRENT: &str = "GRANI_LOOP_CURRENT";

/// First cycle number of a loop job.
pub const LOOP_START: &str = "GRANI_LOOP_START";

/// Last cycle number of a loop job.
pub const LOOP_END: &str = "GRANI_LOOP_END";

/// Naming pattern of archived loop artifacts.
pub const ARCHIVE_PATTERN: &str = "GRANI_ARCHIVE_PATTERN";

/// When set (to anything but `0`/`false`), the loop engine skips
/// resubmission regardless of any other signal.
pub const NO_RESUBMIT: &str = "GRANI_NO_RESUBMIT";

/// Build the environment exported into a running job.
pub fn job_environment(
    info_file: &Path,
    input_host: &str,
    input_dir: &Path,
    kind: BatchKind,
    spec: &ResolvedSpec,
    loop_spec: Option<&LoopSpec>,
    shared_submit: bool,
) -> FxHashMap<String, String> {
    let mut env = FxHashMap::default();

    env.insert(GUARD.to_string(), "true".to_string());
    env.insert(INFO_FILE.to_string(), info_file.display().to_string());
    env.insert(INPUT_HOST.to_string(), input_host.to_string());
    env.insert(INPUT_DIR.to_string(), input_dir.display().to_string());
    env.insert(BATCH_SYSTEM.to_string(), kind.to_string());

    env.insert(NCPUS.to_string(), spec.cpus.to_string());
    env.insert(NGPUS.to_string(), spec.gpus.to_string());
    env.insert(NNODES.to_string(), spec.nodes.to_string());
    if let Some(walltime) = &spec.walltime {
        env.insert(
            WALLTIME_HOURS.to_string(),
            walltime_hours(walltime).to_string(),
        );
    }

    if shared_submit {
        env.insert(SHARED_SUBMIT.to_string(), "true".to_string());
    }

    if let Some(loop_spec) = loop_spec {
        env.insert(LOOP_CURRENT.to_string(), loop_spec.current.to_string());
        env.insert(LOOP_START.to_string(), loop_spec.start.to_string());
        env.insert(LOOP_END.to_string(), loop_spec.end.to_string());
        env.insert(ARCHIVE_PATTERN.to_string(), loop_spec.pattern.clone());
    }

    // propagate debug logging into the job
    if std::env::var(DEBUG).is_ok() {
        env.insert(DEBUG.to_string(), "true".to_string());
    }

    env
}
