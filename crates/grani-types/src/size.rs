//! Memory and storage sizes with binary units.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Error produced when a size string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid size string: '{0}'")]
pub struct SizeParseError(pub String);

const KB: u64 = 1;
const MB: u64 = 1024;
const GB: u64 = 1024 * 1024;
const TB: u64 = 1024 * 1024 * 1024;

/// A memory or disk size, stored exactly in kilobytes.
///
/// Units are binary multiples (powers of 1024). Display normalizes to the
/// largest unit where the value stays >= 1, rounding up: a resource request
/// must never shrink below what the user asked for. Use
/// [`Size::display_floor`] when reporting capacities available on a node,
/// where rounding up would overstate reality.
///
/// A missing size anywhere in the system is `Size::zero()`, never an absent
/// value; queues and nodes that advertise no limit report zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size {
    kb: u64,
}

impl Size {
    /// A zero size.
    pub const fn zero() -> Self {
        Self { kb: 0 }
    }

    /// Create a size from a value in kilobytes.
    pub const fn from_kb(kb: u64) -> Self {
        Self { kb }
    }

    /// Create a size from a value in megabytes.
    pub const fn from_mb(mb: u64) -> Self {
        Self { kb: mb * MB }
    }

    /// Create a size from a value in gigabytes.
    pub const fn from_gb(gb: u64) -> Self {
        Self { kb: gb * GB }
    }

    /// The size in kilobytes.
    pub const fn as_kb(&self) -> u64 {
        self.kb
    }

    /// Whether this size is zero.
    pub const fn is_zero(&self) -> bool {
        self.kb == 0
    }

    /// Multiply by a count (e.g. per-cpu size times cpu count).
    pub const fn times(&self, n: u64) -> Self {
        Self { kb: self.kb * n }
    }

    /// Divide by a node count, rounding up so the total allocation is never
    /// smaller than requested.
    pub const fn per_node(&self, nodes: u64) -> Self {
        if nodes == 0 {
            return Self { kb: self.kb };
        }
        Self {
            kb: self.kb.div_ceil(nodes),
        }
    }

    /// Exact representation for PBS resource arguments, using the largest
    /// unit that divides evenly (e.g. `4gb`, `1536mb`, `100kb`).
    pub fn to_pbs_exact(&self) -> String {
        if self.kb % GB == 0 && self.kb != 0 {
            format!("{}gb", self.kb / GB)
        } else if self.kb % MB == 0 && self.kb != 0 {
            format!("{}mb", self.kb / MB)
        } else {
            format!("{}kb", self.kb)
        }
    }

    /// Exact representation for Slurm memory arguments (`4G`, `1536M`,
    /// `100K`).
    pub fn to_slurm_exact(&self) -> String {
        if self.kb % GB == 0 && self.kb != 0 {
            format!("{}G", self.kb / GB)
        } else if self.kb % MB == 0 && self.kb != 0 {
            format!("{}M", self.kb / MB)
        } else {
            format!("{}K", self.kb)
        }
    }

    /// Human-readable form rounding down, for reporting available or
    /// allocated capacity on a node.
    pub fn display_floor(&self) -> String {
        let (value, unit) = match self.kb {
            kb if kb >= TB => (kb / TB, "tb"),
            kb if kb >= GB => (kb / GB, "gb"),
            kb if kb >= MB => (kb / MB, "mb"),
            kb => (kb, "kb"),
        };
        format!("{value}{unit}")
    }
}

impl fmt::Display for Size {
    /// Normalized form rounding up, suitable for resource requests.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, unit) = match self.kb {
            kb if kb >= TB => (kb.div_ceil(TB), "tb"),
            kb if kb >= GB => (kb.div_ceil(GB), "gb"),
            kb if kb >= MB => (kb.div_ceil(MB), "mb"),
            kb => (kb, "kb"),
        };
        write!(f, "{value}{unit}")
    }
}

impl FromStr for Size {
    type Err = SizeParseError;

    /// Parse strings like `10gb`, `10 GB`, `512mb`. A bare number is
    /// interpreted as kilobytes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits_end = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (value, unit) = trimmed.split_at(digits_end);
        if value.is_empty() {
            return Err(SizeParseError(s.to_string()));
        }
        let value: u64 = value.parse().map_err(|_| SizeParseError(s.to_string()))?;

        let factor = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "kb" | "k" => KB,
            "mb" | "m" => MB,
            "gb" | "g" => GB,
            "tb" | "t" => TB,
            _ => return Err(SizeParseError(s.to_string())),
        };

        Ok(Self { kb: value * factor })
    }
}

impl Serialize for Size {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Size {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("10gb".parse::<Size>().unwrap(), Size::from_gb(10));
        assert_eq!("10 GB".parse::<Size>().unwrap(), Size::from_gb(10));
        assert_eq!("512mb".parse::<Size>().unwrap(), Size::from_mb(512));
        assert_eq!("100".parse::<Size>().unwrap(), Size::from_kb(100));
        assert_eq!("4096M".parse::<Size>().unwrap(), Size::from_gb(4));

        assert!("".parse::<Size>().is_err());
        assert!("10xb".parse::<Size>().is_err());
        assert!("gb".parse::<Size>().is_err());
    }

    #[test]
    fn test_display_rounds_up() {
        assert_eq!(Size::from_gb(4).to_string(), "4gb");
        // 1536 mb is 1.5 gb; requests round up to 2 gb
        assert_eq!(Size::from_mb(1536).to_string(), "2gb");
        assert_eq!(Size::from_kb(0).to_string(), "0kb");
    }

    #[test]
    fn test_display_floor_rounds_down() {
        assert_eq!(Size::from_mb(1536).display_floor(), "1gb");
        assert_eq!(Size::from_mb(1023).display_floor(), "1023mb");
    }

    #[test]
    fn test_exact_forms() {
        assert_eq!(Size::from_gb(4).to_pbs_exact(), "4gb");
        assert_eq!(Size::from_mb(1536).to_pbs_exact(), "1536mb");
        assert_eq!(Size::from_kb(100).to_pbs_exact(), "100kb");
        assert_eq!(Size::from_gb(4).to_slurm_exact(), "4G");
        assert_eq!(Size::from_mb(1536).to_slurm_exact(), "1536M");
        assert_eq!(Size::zero().to_slurm_exact(), "0K");
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(Size::from_gb(1).times(4), Size::from_gb(4));
        assert_eq!(Size::from_gb(4).per_node(2), Size::from_gb(2));
        // 5 gb over 2 nodes rounds up per node
        assert_eq!(
            Size::from_gb(5).per_node(2),
            Size::from_kb(Size::from_gb(5).as_kb().div_ceil(2))
        );
    }

    #[test]
    fn test_zero_default() {
        assert_eq!(Size::default(), Size::zero());
        assert!(Size::zero().is_zero());
    }

    #[test]
    fn test_serde_roundtrip() {
        let size = Size::from_gb(16);
        let json = serde_json::to_string(&size).unwrap();
        assert_eq!(json, "\"16gb\"");
        let back: Size = serde_json::from_str(&json).unwrap();
        assert_eq!(back, size);
    }
}
