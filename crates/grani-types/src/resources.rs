//! Resource specifications and their resolution into a concrete allocation.

use std::fmt;
use std::str::FromStr;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::size::Size;

/// Working-directory policy for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkDirPolicy {
    /// Node-local scratch storage.
    #[default]
    ScratchLocal,
    /// Node-local SSD scratch storage.
    ScratchSsd,
    /// Shared scratch storage.
    ScratchShared,
    /// In-RAM scratch; its capacity comes out of the memory request, so no
    /// separate storage request is meaningful.
    ScratchShm,
    /// Run directly in the input directory; no storage request is
    /// meaningful.
    InputDir,
}

impl WorkDirPolicy {
    /// Whether the job runs in a scratch directory separate from the input
    /// directory.
    pub fn uses_scratch(&self) -> bool {
        !matches!(self, WorkDirPolicy::InputDir)
    }

    /// Whether a storage size request makes sense for this policy.
    pub fn accepts_work_size(&self) -> bool {
        matches!(
            self,
            WorkDirPolicy::ScratchLocal | WorkDirPolicy::ScratchSsd | WorkDirPolicy::ScratchShared
        )
    }
}

impl fmt::Display for WorkDirPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkDirPolicy::ScratchLocal => "scratch_local",
            WorkDirPolicy::ScratchSsd => "scratch_ssd",
            WorkDirPolicy::ScratchShared => "scratch_shared",
            WorkDirPolicy::ScratchShm => "scratch_shm",
            WorkDirPolicy::InputDir => "input_dir",
        };
        write!(f, "{name}")
    }
}

impl FromStr for WorkDirPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "scratch_local" => Ok(WorkDirPolicy::ScratchLocal),
            "scratch_ssd" => Ok(WorkDirPolicy::ScratchSsd),
            "scratch_shared" => Ok(WorkDirPolicy::ScratchShared),
            "scratch_shm" => Ok(WorkDirPolicy::ScratchShm),
            // job_dir is a historical alias for input_dir
            "input_dir" | "job_dir" => Ok(WorkDirPolicy::InputDir),
            other => Err(format!("unknown working directory type: '{other}'")),
        }
    }
}

/// Resource intent as provided by the user, before resolution.
///
/// Each dimension may be given as a total, per node, or per cpu. The
/// precedence is total > per-node > per-cpu; [`ResourceSpec::resolve`]
/// discards conflicting lower-precedence values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Number of computing nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,

    /// Total number of CPU cores (overrides `cpus_per_node`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// CPU cores per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_per_node: Option<u32>,

    /// Total number of GPUs (overrides `gpus_per_node`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,

    /// GPUs per node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus_per_node: Option<u32>,

    /// Absolute amount of memory (overrides `mem_per_cpu`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<Size>,

    /// Memory per CPU core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_per_cpu: Option<Size>,

    /// Absolute working-directory size (overrides `work_size_per_cpu`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_size: Option<Size>,

    /// Working-directory size per CPU core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_size_per_cpu: Option<Size>,

    /// Maximum allowed runtime, normalized to `HH:MM:SS`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,

    /// Working-directory policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<WorkDirPolicy>,

    /// Node properties the job requires (or excludes, value `"false"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<FxHashMap<String, String>>,
}

/// The dominant/recessive field couplings: when either member of a coupling
/// is set in an earlier merge layer, both members are taken from that layer.
/// A user-provided per-cpu value is therefore not overridden by a queue's
/// absolute default.
const COUPLINGS: &[(Dim, Dim)] = &[
    (Dim::Cpus, Dim::CpusPerNode),
    (Dim::Gpus, Dim::GpusPerNode),
    (Dim::Mem, Dim::MemPerCpu),
    (Dim::WorkSize, Dim::WorkSizePerCpu),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dim {
    Cpus,
    CpusPerNode,
    Gpus,
    GpusPerNode,
    Mem,
    MemPerCpu,
    WorkSize,
    WorkSizePerCpu,
}

impl ResourceSpec {
    /// Merge multiple specs; earlier layers take precedence over later ones
    /// (user spec, then queue defaults, then server defaults).
    ///
    /// Coupled fields travel together: the first layer that sets either
    /// member of a coupling supplies both members. Property maps are merged
    /// with first occurrence of each key winning.
    pub fn merge(layers: &[ResourceSpec]) -> ResourceSpec {
        let mut merged = ResourceSpec {
            nodes: layers.iter().find_map(|l| l.nodes),
            walltime: layers.iter().find_map(|l| l.walltime.clone()),
            work_dir: layers.iter().find_map(|l| l.work_dir),
            ..Default::default()
        };

        for &(dominant, recessive) in COUPLINGS {
            if let Some(layer) = layers
                .iter()
                .find(|l| l.dim_is_set(dominant) || l.dim_is_set(recessive))
            {
                merged.copy_dim(layer, dominant);
                merged.copy_dim(layer, recessive);
            }
        }

        let mut props: FxHashMap<String, String> = FxHashMap::default();
        for layer in layers {
            if let Some(layer_props) = &layer.props {
                for (k, v) in layer_props {
                    props.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        if !props.is_empty() {
            merged.props = Some(props);
        }

        debug!(?merged, "merged resource layers");
        merged
    }

    /// Resolve this spec into a single concrete allocation.
    ///
    /// Precedence per dimension is total > per-node > per-cpu; missing sizes
    /// resolve to zero, never to an absent value. For `scratch_shm` and
    /// `input_dir` policies the storage request is dropped entirely.
    pub fn resolve(&self) -> ResolvedSpec {
        let nodes = self.nodes.unwrap_or(1).max(1);
        let work_dir = self.work_dir.unwrap_or_default();

        let cpus = self
            .cpus
            .or(self.cpus_per_node.map(|c| c * nodes))
            .unwrap_or(0);
        let gpus = self
            .gpus
            .or(self.gpus_per_node.map(|g| g * nodes))
            .unwrap_or(0);

        let mem = self
            .mem
            .or(self.mem_per_cpu.map(|m| m.times(u64::from(cpus))))
            .unwrap_or_default();

        let work_size = if work_dir.accepts_work_size() {
            self.work_size
                .or(self.work_size_per_cpu.map(|w| w.times(u64::from(cpus))))
                .unwrap_or_default()
        } else {
            Size::zero()
        };

        ResolvedSpec {
            nodes,
            cpus,
            gpus,
            mem,
            work_size,
            walltime: self.walltime.clone(),
            work_dir,
            props: self.props.clone().unwrap_or_default(),
        }
    }

    fn dim_is_set(&self, dim: Dim) -> bool {
        match dim {
            Dim::Cpus => self.cpus.is_some(),
            Dim::CpusPerNode => self.cpus_per_node.is_some(),
            Dim::Gpus => self.gpus.is_some(),
            Dim::GpusPerNode => self.gpus_per_node.is_some(),
            Dim::Mem => self.mem.is_some(),
            Dim::MemPerCpu => self.mem_per_cpu.is_some(),
            Dim::WorkSize => self.work_size.is_some(),
            Dim::WorkSizePerCpu => self.work_size_per_cpu.is_some(),
        }
    }

    fn copy_dim(&mut self, from: &ResourceSpec, dim: Dim) {
        match dim {
            Dim::Cpus => self.cpus = from.cpus,
            Dim::CpusPerNode => self.cpus_per_node = from.cpus_per_node,
            Dim::Gpus => self.gpus = from.gpus,
            Dim::GpusPerNode => self.gpus_per_node = from.gpus_per_node,
            Dim::Mem => self.mem = from.mem,
            Dim::MemPerCpu => self.mem_per_cpu = from.mem_per_cpu,
            Dim::WorkSize => self.work_size = from.work_size,
            Dim::WorkSizePerCpu => self.work_size_per_cpu = from.work_size_per_cpu,
        }
    }
}

/// A fully resolved allocation: exactly one effective value per dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpec {
    /// Number of computing nodes (at least 1).
    pub nodes: u32,

    /// Total CPU cores across all nodes.
    pub cpus: u32,

    /// Total GPUs across all nodes.
    #[serde(default)]
    pub gpus: u32,

    /// Total memory.
    #[serde(default)]
    pub mem: Size,

    /// Total working-directory size; zero when the policy takes none.
    #[serde(default)]
    pub work_size: Size,

    /// Maximum allowed runtime (`HH:MM:SS`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<String>,

    /// Working-directory policy.
    #[serde(default)]
    pub work_dir: WorkDirPolicy,

    /// Node properties.
    #[serde(default)]
    pub props: FxHashMap<String, String>,
}

impl ResolvedSpec {
    /// Convert back into a spec with totals set, for resubmitting a loop
    /// job under the same policy.
    pub fn to_spec(&self) -> ResourceSpec {
        ResourceSpec {
            nodes: Some(self.nodes),
            cpus: Some(self.cpus),
            gpus: (self.gpus > 0).then_some(self.gpus),
            mem: (!self.mem.is_zero()).then_some(self.mem),
            work_size: (!self.work_size.is_zero()).then_some(self.work_size),
            walltime: self.walltime.clone(),
            work_dir: Some(self.work_dir),
            props: (!self.props.is_empty()).then(|| self.props.clone()),
            ..Default::default()
        }
    }
}

/// Parse a properties string into key/value pairs.
///
/// Properties are separated by commas, whitespace, or colons. Each may be
/// `key=value`, a bare `key` (stored as `"true"`), or `^key` (stored as
/// `"false"`). A key defined twice is an error.
pub fn parse_props(input: &str) -> Result<FxHashMap<String, String>, String> {
    let mut result = FxHashMap::default();

    for part in input
        .split([',', ':', ' ', '\t'])
        .filter(|p| !p.is_empty())
    {
        let (key, value) = if let Some((key, value)) = part.split_once('=') {
            (key.to_string(), value.to_string())
        } else if let Some(stripped) = part.strip_prefix('^') {
            (stripped.to_string(), "false".to_string())
        } else {
            (part.to_string(), "true".to_string())
        };

        if result.contains_key(&key) {
            return Err(format!("property '{key}' is defined multiple times"));
        }
        result.insert(key, value);
    }

    Ok(result)
}

/// Normalize a walltime string to `HH:MM:SS`.
///
/// Accepts `HH:MM:SS` directly, or a sequence of suffixed values such as
/// `1d`, `12h`, `90m`, `1d12h`.
pub fn parse_walltime(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.contains(':') {
        let parts: Vec<&str> = trimmed.split(':').collect();
        if parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
            return Err(format!("invalid walltime: '{input}'"));
        }
        let mut values = [0u64; 3];
        for (slot, part) in values[3 - parts.len()..].iter_mut().zip(&parts) {
            *slot = part.parse().unwrap_or(0);
        }
        let total = values[0] * 3600 + values[1] * 60 + values[2];
        return Ok(format_hhmmss(total));
    }

    let mut seconds = 0u64;
    let mut number = String::new();
    for c in trimmed.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            let value: u64 = number.parse().map_err(|_| format!("invalid walltime: '{input}'"))?;
            number.clear();
            seconds += match c.to_ascii_lowercase() {
                'w' => value * 7 * 86400,
                'd' => value * 86400,
                'h' => value * 3600,
                'm' => value * 60,
                's' => value,
                _ => return Err(format!("invalid walltime: '{input}'")),
            };
        }
    }
    if !number.is_empty() {
        return Err(format!("invalid walltime: '{input}'"));
    }
    Ok(format_hhmmss(seconds))
}

/// Whole hours in a `HH:MM:SS` walltime, rounded up; exported to running
/// jobs so scripts can plan against their limit.
pub fn walltime_hours(walltime: &str) -> u64 {
    let mut parts = walltime.split(':');
    let hours: u64 = parts.next().and_then(|h| h.parse().ok()).unwrap_or(0);
    let minutes: u64 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
    let seconds: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    hours + u64::from(minutes > 0 || seconds > 0)
}

fn format_hhmmss(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dir_policy_parse() {
        assert_eq!(
            "scratch_local".parse::<WorkDirPolicy>().unwrap(),
            WorkDirPolicy::ScratchLocal
        );
        assert_eq!(
            "scratch-shm".parse::<WorkDirPolicy>().unwrap(),
            WorkDirPolicy::ScratchShm
        );
        assert_eq!(
            "job_dir".parse::<WorkDirPolicy>().unwrap(),
            WorkDirPolicy::InputDir
        );
        assert!("ramdisk".parse::<WorkDirPolicy>().is_err());
    }

    #[test]
    fn test_resolve_total_overrides_per_node() {
        let spec = ResourceSpec {
            nodes: Some(2),
            cpus: Some(16),
            cpus_per_node: Some(4),
            ..Default::default()
        };
        assert_eq!(spec.resolve().cpus, 16);
    }

    #[test]
    fn test_resolve_per_node_times_nodes() {
        // submit with cpus_per_node=4, nodes=2, no total override
        let spec = ResourceSpec {
            nodes: Some(2),
            cpus_per_node: Some(4),
            ..Default::default()
        };
        assert_eq!(spec.resolve().cpus, 8);
    }

    #[test]
    fn test_resolve_mem_per_cpu() {
        let spec = ResourceSpec {
            cpus: Some(4),
            mem_per_cpu: Some(Size::from_gb(1)),
            ..Default::default()
        };
        assert_eq!(spec.resolve().mem, Size::from_gb(4));

        let spec = ResourceSpec {
            cpus: Some(4),
            mem: Some(Size::from_gb(2)),
            mem_per_cpu: Some(Size::from_gb(1)),
            ..Default::default()
        };
        assert_eq!(spec.resolve().mem, Size::from_gb(2));
    }

    #[test]
    fn test_resolve_missing_sizes_are_zero() {
        let resolved = ResourceSpec::default().resolve();
        assert_eq!(resolved.mem, Size::zero());
        assert_eq!(resolved.work_size, Size::zero());
        assert_eq!(resolved.nodes, 1);
    }

    #[test]
    fn test_resolve_drops_work_size_for_shm_and_input_dir() {
        for policy in [WorkDirPolicy::ScratchShm, WorkDirPolicy::InputDir] {
            let spec = ResourceSpec {
                cpus: Some(4),
                work_size: Some(Size::from_gb(10)),
                work_size_per_cpu: Some(Size::from_gb(1)),
                work_dir: Some(policy),
                ..Default::default()
            };
            assert_eq!(spec.resolve().work_size, Size::zero());
        }

        let spec = ResourceSpec {
            work_size: Some(Size::from_gb(10)),
            work_dir: Some(WorkDirPolicy::ScratchLocal),
            ..Default::default()
        };
        assert_eq!(spec.resolve().work_size, Size::from_gb(10));
    }

    #[test]
    fn test_merge_earlier_layer_wins() {
        let user = ResourceSpec {
            cpus: Some(8),
            ..Default::default()
        };
        let queue = ResourceSpec {
            cpus: Some(1),
            walltime: Some("01:00:00".to_string()),
            ..Default::default()
        };
        let merged = ResourceSpec::merge(&[user, queue]);
        assert_eq!(merged.cpus, Some(8));
        assert_eq!(merged.walltime.as_deref(), Some("01:00:00"));
    }

    #[test]
    fn test_merge_coupling_shadows_lower_layers() {
        // a user mem_per_cpu must not be overridden by a queue's absolute mem
        let user = ResourceSpec {
            mem_per_cpu: Some(Size::from_gb(2)),
            ..Default::default()
        };
        let queue = ResourceSpec {
            mem: Some(Size::from_gb(64)),
            ..Default::default()
        };
        let merged = ResourceSpec::merge(&[user, queue]);
        assert_eq!(merged.mem, None);
        assert_eq!(merged.mem_per_cpu, Some(Size::from_gb(2)));
    }

    #[test]
    fn test_merge_props_first_key_wins() {
        let mut first = FxHashMap::default();
        first.insert("gpu".to_string(), "true".to_string());
        let mut second = FxHashMap::default();
        second.insert("gpu".to_string(), "false".to_string());
        second.insert("infiniband".to_string(), "true".to_string());

        let merged = ResourceSpec::merge(&[
            ResourceSpec {
                props: Some(first),
                ..Default::default()
            },
            ResourceSpec {
                props: Some(second),
                ..Default::default()
            },
        ]);
        let props = merged.props.unwrap();
        assert_eq!(props.get("gpu").map(String::as_str), Some("true"));
        assert_eq!(props.get("infiniband").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_parse_props() {
        let props = parse_props("gpu,^slow cluster=brno").unwrap();
        assert_eq!(props.get("gpu").map(String::as_str), Some("true"));
        assert_eq!(props.get("slow").map(String::as_str), Some("false"));
        assert_eq!(props.get("cluster").map(String::as_str), Some("brno"));

        assert!(parse_props("gpu,gpu").is_err());
    }

    #[test]
    fn test_parse_walltime() {
        assert_eq!(parse_walltime("12:30:00").unwrap(), "12:30:00");
        assert_eq!(parse_walltime("90:00").unwrap(), "01:30:00");
        assert_eq!(parse_walltime("1d").unwrap(), "24:00:00");
        assert_eq!(parse_walltime("1d12h").unwrap(), "36:00:00");
        assert_eq!(parse_walltime("90m").unwrap(), "01:30:00");
        assert!(parse_walltime("soon").is_err());
    }

    #[test]
    fn test_walltime_hours() {
        assert_eq!(walltime_hours("24:00:00"), 24);
        assert_eq!(walltime_hours("12:30:00"), 13);
        assert_eq!(walltime_hours("00:00:30"), 1);
    }

    #[test]
    fn test_resolved_to_spec_roundtrip() {
        let spec = ResourceSpec {
            nodes: Some(2),
            cpus_per_node: Some(4),
            mem_per_cpu: Some(Size::from_gb(1)),
            walltime: Some("02:00:00".to_string()),
            ..Default::default()
        };
        let resolved = spec.resolve();
        let again = resolved.to_spec().resolve();
        assert_eq!(again, resolved);
    }
}
