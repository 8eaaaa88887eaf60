//! Parsers for Slurm command output.

use rustc_hash::FxHashMap;

use grani_types::{BatchState, ResourceSpec, Size};

use crate::error::{BatchError, BatchResult};
use crate::system::{BatchJobStatus, NodeInfo, QueueInfo};

/// Field list requested from squeue, pipe-delimited.
pub const SQUEUE_FORMAT: &str = "%i|%j|%T|%P|%N|%M|%l";

/// Field list requested from sacct with `--parsable2`.
pub const SACCT_FORMAT: &str = "JobID,JobName,State,Partition,ExitCode,NodeList,Elapsed,Timelimit,AllocCPUS,ReqMem";

/// Parse sbatch output to extract the job id.
///
/// Standard output is "Submitted batch job 12345"; with `--parsable` it is
/// just the id. Either way the id is the last whitespace-separated token.
pub fn parse_submit_output(output: &str) -> BatchResult<String> {
    let last = output.split_whitespace().last().unwrap_or_default();
    if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit() || c == '_' || c == '.') {
        return Ok(last.to_string());
    }
    Err(BatchError::Parse(format!(
        "unexpected sbatch output: '{}'",
        output.trim()
    )))
}

/// Map a Slurm state name to the canonical batch state.
///
/// sacct suffixes cancelled states with the cancelling user
/// ("CANCELLED by 1000"); only the leading word matters.
pub fn parse_state(raw: &str) -> BatchState {
    match raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "PENDING" | "REQUEUED" | "RESIZING" => BatchState::Queued,
        "RUNNING" => BatchState::Running,
        "SUSPENDED" => BatchState::Suspended,
        "COMPLETING" => BatchState::Exiting,
        "COMPLETED" => BatchState::Finished,
        "CANCELLED" | "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "DEADLINE" | "BOOT_FAIL" => BatchState::Failed,
        _ => BatchState::Unknown,
    }
}

/// Parse one pipe-delimited squeue line into a job status.
pub fn job_from_squeue_line(line: &str) -> BatchResult<BatchJobStatus> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 7 {
        return Err(BatchError::Parse(format!(
            "squeue line has {} fields, expected 7: '{line}'",
            fields.len()
        )));
    }

    let nodes = parse_nodelist(fields[4]);
    Ok(BatchJobStatus {
        job_id: fields[0].to_string(),
        name: fields[1].to_string(),
        state: parse_state(fields[2]),
        queue: non_empty(fields[3]),
        main_node: nodes.first().cloned(),
        nodes,
        walltime_used: non_empty(fields[5]),
        walltime: non_empty(fields[6]).filter(|l| l != "UNLIMITED"),
        ..Default::default()
    })
}

/// Parse one `--parsable2` sacct line into a job status.
pub fn job_from_sacct_line(line: &str) -> BatchResult<BatchJobStatus> {
    let fields: Vec<&str> = line.trim().split('|').collect();
    if fields.len() < 10 {
        return Err(BatchError::Parse(format!(
            "sacct line has {} fields, expected 10: '{line}'",
            fields.len()
        )));
    }

    // ExitCode is "code:signal"
    let exit_code = fields[4]
        .split(':')
        .next()
        .and_then(|c| c.parse::<i32>().ok());

    let nodes = parse_nodelist(fields[5]);
    Ok(BatchJobStatus {
        job_id: fields[0].to_string(),
        name: fields[1].to_string(),
        state: parse_state(fields[2]),
        queue: non_empty(fields[3]),
        exit_code,
        main_node: nodes.first().cloned(),
        nodes,
        walltime_used: non_empty(fields[6]),
        walltime: non_empty(fields[7]),
        cpus: fields[8].parse().unwrap_or(0),
        mem: parse_req_mem(fields[9]),
        ..Default::default()
    })
}

/// Parse one `scontrol show ... -o` line into a key/value map.
///
/// The one-line format is whitespace-separated `Key=Value` tokens; values
/// never contain spaces in the fields we read.
pub fn parse_scontrol_line(line: &str) -> FxHashMap<String, String> {
    line.split_whitespace()
        .filter_map(|token| {
            let (key, value) = token.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Build canonical queue information from a parsed partition line.
pub fn partition_from_map(map: &FxHashMap<String, String>) -> QueueInfo {
    let state_up = map.get("State").map(String::as_str) == Some("UP");
    QueueInfo {
        name: map.get("PartitionName").cloned().unwrap_or_default(),
        enabled: state_up,
        started: state_up,
        priority: map
            .get("PriorityTier")
            .and_then(|v| v.parse().ok()),
        total_jobs: 0,
        running_jobs: 0,
        queued_jobs: 0,
        other_jobs: 0,
        max_walltime: map
            .get("MaxTime")
            .filter(|v| *v != "UNLIMITED")
            .cloned(),
        max_mem: map
            .get("MaxMemPerNode")
            .filter(|v| *v != "UNLIMITED")
            .and_then(|v| v.parse::<u64>().ok())
            // Slurm reports megabytes
            .map(Size::from_mb)
            .unwrap_or_default(),
        defaults: ResourceSpec {
            mem: map
                .get("DefMemPerNode")
                .filter(|v| *v != "UNLIMITED")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Size::from_mb),
            ..Default::default()
        },
        comment: None,
    }
}

/// Build canonical node information from a parsed `scontrol show node` line.
pub fn node_from_map(map: &FxHashMap<String, String>) -> NodeInfo {
    NodeInfo {
        name: map.get("NodeName").cloned().unwrap_or_default(),
        state: map.get("State").cloned().unwrap_or_default(),
        cpus_total: int_field(map, "CPUTot"),
        cpus_assigned: int_field(map, "CPUAlloc"),
        gpus_total: map
            .get("Gres")
            .and_then(|gres| parse_gres_gpus(gres))
            .unwrap_or(0),
        mem_total: mb_field(map, "RealMemory"),
        mem_assigned: mb_field(map, "AllocMem"),
        scratch_local: mb_field(map, "TmpDisk"),
        properties: map
            .get("AvailableFeatures")
            .map(|raw| raw.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

/// Interpret scancel output.
pub fn parse_cancel_output(job_id: &str, stderr: &str) -> BatchResult<()> {
    if stderr.contains("Invalid job id") || stderr.contains("already completing or completed") {
        return Err(BatchError::AlreadyTerminal(job_id.to_string()));
    }
    if !stderr.trim().is_empty() {
        return Err(BatchError::CommandFailed {
            command: "scancel".to_string(),
            message: stderr.trim().to_string(),
        });
    }
    Ok(())
}

/// A compressed node list ("node[01-03],gpu1"); kept unexpanded, split only
/// on top-level commas.
fn parse_nodelist(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "None assigned" {
        return Vec::new();
    }

    let mut nodes = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in trimmed.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                nodes.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        nodes.push(current);
    }
    nodes
}

/// ReqMem values carry a unit and a per-node/per-cpu suffix ("4000Mn",
/// "2Gc", "16G"); absent or malformed values are zero.
fn parse_req_mem(raw: &str) -> Size {
    let trimmed = raw.trim().trim_end_matches(['n', 'c']);
    trimmed.parse().unwrap_or_else(|_| Size::zero())
}

fn parse_gres_gpus(gres: &str) -> Option<u32> {
    // Gres=gpu:a100:4 or gpu:4
    for part in gres.split(',') {
        if let Some(rest) = part.strip_prefix("gpu:") {
            return rest.rsplit(':').next().and_then(|n| {
                n.split('(').next().unwrap_or_default().parse().ok()
            });
        }
    }
    None
}

fn int_field(map: &FxHashMap<String, String>, key: &str) -> u32 {
    map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// A megabyte-valued field; absent values are zero, never null.
fn mb_field(map: &FxHashMap<String, String>, key: &str) -> Size {
    map.get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Size::from_mb)
        .unwrap_or_default()
}

fn non_empty(field: &str) -> Option<String> {
    let trimmed = field.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
