//! Parsers for PBS command output.

use rustc_hash::FxHashMap;

use grani_types::{BatchState, ResourceSpec, Size};

use crate::error::{BatchError, BatchResult};
use crate::system::{BatchJobStatus, NodeInfo, QueueInfo};

/// Parse qsub output to extract the job id.
///
/// qsub output format varies by PBS implementation:
/// - PBS Pro: "12345.pbs-server"
/// - Torque: "12345.server.domain.com"
/// - OpenPBS: "12345.hostname"
pub fn parse_submit_output(output: &str) -> BatchResult<String> {
    let trimmed = output.trim();

    if trimmed.contains('.') && !trimmed.is_empty() {
        // job ids start with a numeric sequence followed by the server name
        let head = trimmed.split('.').next().unwrap_or_default();
        if !head.is_empty() && head.chars().all(|c| c.is_ascii_digit()) {
            return Ok(trimmed.to_string());
        }
    }

    // some PBS systems return just the numeric id
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Ok(trimmed.to_string());
    }

    Err(BatchError::Parse(format!(
        "unexpected qsub output: '{trimmed}'"
    )))
}

/// Parse a multi-record PBS dump (`qstat -fxw`, `qstat -Qfw`, `pbsnodes`)
/// into per-record key/value maps.
///
/// Records are separated by blank lines. With a `header` (e.g. `"Job Id"`
/// or `"Queue"`), the record name is taken from the `Header: name` first
/// line; without one (pbsnodes), the first line is the bare record name.
/// Attribute lines are `key = value`; over-long values wrap onto
/// continuation lines that are folded back into the previous value.
pub fn parse_records(
    text: &str,
    header: Option<&str>,
) -> BatchResult<Vec<(String, FxHashMap<String, String>)>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();

    for chunk in trimmed.split("\n\n") {
        let chunk = chunk.trim_matches('\n');
        if chunk.is_empty() {
            continue;
        }
        let mut lines = chunk.lines();
        let first = lines.next().unwrap_or_default();

        let name = match header {
            Some(header) => first
                .strip_prefix(header)
                .and_then(|rest| rest.trim_start().strip_prefix(':'))
                .map(str::trim)
                .ok_or_else(|| {
                    BatchError::Parse(format!(
                        "could not extract '{header}' from record starting with '{first}'"
                    ))
                })?
                .to_string(),
            None => first.trim().to_string(),
        };

        let mut map: FxHashMap<String, String> = FxHashMap::default();
        let mut last_key: Option<String> = None;
        for line in lines {
            if let Some((key, value)) = line.split_once(" = ") {
                let key = key.trim().to_string();
                map.insert(key.clone(), value.trim().to_string());
                last_key = Some(key);
            } else if let Some(key) = &last_key {
                // continuation of a wrapped value
                if let Some(value) = map.get_mut(key) {
                    value.push_str(line.trim());
                }
            }
        }

        records.push((name, map));
    }

    Ok(records)
}

/// Build a canonical job status from a parsed qstat record.
pub fn job_from_dump(job_id: &str, map: &FxHashMap<String, String>) -> BatchJobStatus {
    let exit_code = map.get("Exit_status").and_then(|v| v.parse().ok());

    let state = match map.get("job_state").map(String::as_str) {
        None => BatchState::Unknown,
        // a finished job without a zero exit code never ran to success
        Some("F") if exit_code != Some(0) => BatchState::Failed,
        Some(code) => BatchState::from_code(code),
    };

    let nodes: Vec<String> = map
        .get("exec_host2")
        .or_else(|| map.get("exec_host"))
        .map(|raw| raw.split('+').map(clean_node_name).collect())
        .unwrap_or_default();

    BatchJobStatus {
        job_id: job_id.to_string(),
        name: map.get("Job_Name").cloned().unwrap_or_default(),
        state,
        queue: map.get("queue").cloned(),
        exit_code,
        main_node: nodes.first().cloned(),
        nodes,
        cpus: int_field(map, "Resource_List.ncpus"),
        gpus: int_field(map, "Resource_List.ngpus"),
        mem: size_field(map, "Resource_List.mem"),
        walltime: map.get("Resource_List.walltime").cloned(),
        walltime_used: map.get("resources_used.walltime").cloned(),
        comment: map.get("comment").cloned(),
    }
}

/// Build canonical queue information from a parsed `qstat -Qfw` record.
pub fn queue_from_dump(name: &str, map: &FxHashMap<String, String>) -> QueueInfo {
    let counts = map
        .get("state_count")
        .map(|raw| parse_state_count(raw))
        .unwrap_or_default();

    let other: u32 = ["Transit", "Held", "Waiting", "Exiting", "Begun"]
        .iter()
        .filter_map(|k| counts.get(*k))
        .sum();

    QueueInfo {
        name: name.to_string(),
        enabled: map.get("enabled").map(String::as_str) == Some("True"),
        started: map.get("started").map(String::as_str) == Some("True"),
        priority: map.get("Priority").and_then(|v| v.parse().ok()),
        total_jobs: int_field(map, "total_jobs"),
        running_jobs: counts.get("Running").copied().unwrap_or(0),
        queued_jobs: counts.get("Queued").copied().unwrap_or(0),
        other_jobs: other,
        max_walltime: map.get("resources_max.walltime").cloned(),
        max_mem: size_field(map, "resources_max.mem"),
        defaults: ResourceSpec {
            cpus: map
                .get("resources_default.ncpus")
                .and_then(|v| v.parse().ok()),
            mem: map.get("resources_default.mem").and_then(|v| v.parse().ok()),
            walltime: map.get("resources_default.walltime").cloned(),
            ..Default::default()
        },
        comment: map
            .get("comment")
            .map(|c| c.split('|').next().unwrap_or_default().trim().to_string()),
    }
}

/// Build canonical node information from a parsed pbsnodes record.
pub fn node_from_dump(name: &str, map: &FxHashMap<String, String>) -> NodeInfo {
    NodeInfo {
        name: name.to_string(),
        state: map.get("state").cloned().unwrap_or_default(),
        cpus_total: int_field(map, "resources_available.ncpus"),
        cpus_assigned: int_field(map, "resources_assigned.ncpus"),
        gpus_total: int_field(map, "resources_available.ngpus"),
        mem_total: size_field(map, "resources_available.mem"),
        mem_assigned: size_field(map, "resources_assigned.mem"),
        scratch_local: size_field(map, "resources_available.scratch_local"),
        properties: map
            .get("properties")
            .map(|raw| raw.split(',').map(|p| p.trim().to_string()).collect())
            .unwrap_or_default(),
    }
}

/// Interpret qdel output.
pub fn parse_cancel_output(job_id: &str, stderr: &str) -> BatchResult<()> {
    // qdel produces no output on success
    if stderr.contains("Unknown Job Id")
        || stderr.contains("has already finished")
        || stderr.contains("Job has finished")
    {
        return Err(BatchError::AlreadyTerminal(job_id.to_string()));
    }

    if !stderr.is_empty() && !stderr.contains("being deleted") {
        return Err(BatchError::CommandFailed {
            command: "qdel".to_string(),
            message: stderr.trim().to_string(),
        });
    }

    Ok(())
}

/// Normalize a raw execution-host entry (`node1/0*8` or `(node1:ncpus=8)`)
/// to the bare hostname.
fn clean_node_name(raw: &str) -> String {
    raw.trim()
        .split(':')
        .next()
        .unwrap_or_default()
        .split('/')
        .next()
        .unwrap_or_default()
        .replace(['(', ')'], "")
}

fn parse_state_count(raw: &str) -> FxHashMap<String, u32> {
    raw.split_whitespace()
        .filter_map(|pair| {
            let (state, count) = pair.split_once(':')?;
            Some((state.to_string(), count.parse().ok()?))
        })
        .collect()
}

fn int_field(map: &FxHashMap<String, String>, key: &str) -> u32 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// A size field; absent or malformed values are zero, never null.
fn size_field(map: &FxHashMap<String, String>, key: &str) -> Size {
    map.get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(Size::zero)
}
