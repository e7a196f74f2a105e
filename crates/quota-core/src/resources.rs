//! Resource vectors: cpu (milli-units), memory (bytes), and named extended
//! resources, with the arithmetic the runtime calculator and the accounting
//! methods need.
//!
//! Generalizes the single-quantity newtypes the wider operator stack uses
//! (cpu in milli-cores, memory in bytes) into a vector over named
//! dimensions, because every comparison the engine makes (admission checks,
//! invariant checks, the runtime calculator) operates on whole resource
//! requests rather than one quantity at a time.

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use snafu::Snafu;

/// One axis of a [`ResourceAmount`]: the two well-known axes plus any named
/// extended resource (e.g. `nvidia.com/gpu`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Cpu,
    Memory,
    Extended(String),
}

impl Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Cpu => write!(f, "cpu"),
            Dimension::Memory => write!(f, "memory"),
            Dimension::Extended(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum QuantityParseError {
    #[snafu(display("quantity {value:?} has an unrecognized suffix"))]
    UnrecognizedSuffix { value: String },

    #[snafu(display("quantity {value:?} has a non-numeric magnitude"))]
    NonNumericMagnitude { value: String },
}

/// A resource vector: cpu in milli-units, memory in bytes, extended
/// resources as arbitrary integer counts keyed by name.
///
/// `Add`/`Sub` are plain per-dimension arithmetic and can go negative (a
/// removal applied before its matching add, or a caller bug) — accounting
/// deltas are symmetric by construction so a correct caller always nets back
/// to zero. [`ResourceAmount::saturating_sub`] is the clamped variant, used
/// where a negative result would be meaningless (available capacity, demand
/// above a guarantee).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceAmount {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
    pub extended: BTreeMap<String, i64>,
}

impl ResourceAmount {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn cpu_mem(cpu_millis: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            extended: BTreeMap::new(),
        }
    }

    pub fn get(&self, dim: &Dimension) -> i64 {
        match dim {
            Dimension::Cpu => self.cpu_millis,
            Dimension::Memory => self.memory_bytes,
            Dimension::Extended(name) => self.extended.get(name).copied().unwrap_or(0),
        }
    }

    pub fn set(&mut self, dim: &Dimension, value: i64) {
        match dim {
            Dimension::Cpu => self.cpu_millis = value,
            Dimension::Memory => self.memory_bytes = value,
            Dimension::Extended(name) => {
                if value == 0 {
                    self.extended.remove(name);
                } else {
                    self.extended.insert(name.clone(), value);
                }
            }
        }
    }

    /// All dimensions that either side of a comparison has a nonzero value
    /// on, in stable order (cpu, memory, then extended resources
    /// lexicographically) so diagnostics are deterministic.
    pub fn dimensions_union<'a>(a: &'a Self, b: &'a Self) -> Vec<Dimension> {
        let mut dims = vec![Dimension::Cpu, Dimension::Memory];
        for name in a.extended.keys().chain(b.extended.keys()) {
            let dim = Dimension::Extended(name.clone());
            if !dims.contains(&dim) {
                dims.push(dim);
            }
        }
        dims
    }

    /// `self[d] >= other[d]` for every dimension present on either side.
    pub fn ge_all(&self, other: &Self) -> bool {
        Self::dimensions_union(self, other)
            .iter()
            .all(|d| self.get(d) >= other.get(d))
    }

    /// Per-dimension `min(self, other)`.
    pub fn min_per_dim(&self, other: &Self) -> Self {
        let mut out = Self::zero();
        for dim in Self::dimensions_union(self, other) {
            out.set(&dim, self.get(&dim).min(other.get(&dim)));
        }
        out
    }

    /// Per-dimension `max(self, other)`.
    pub fn max_per_dim(&self, other: &Self) -> Self {
        let mut out = Self::zero();
        for dim in Self::dimensions_union(self, other) {
            out.set(&dim, self.get(&dim).max(other.get(&dim)));
        }
        out
    }

    /// Per-dimension `max(0, self - other)`.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        let mut out = Self::zero();
        for dim in Self::dimensions_union(self, other) {
            out.set(&dim, (self.get(&dim) - other.get(&dim)).max(0));
        }
        out
    }

    /// Clamp every dimension to be no less than zero.
    pub fn clamped_nonneg(&self) -> Self {
        self.saturating_sub(&Self::zero())
    }

    /// The dimensions on which `self` exceeds `other`, in stable order.
    /// Used to build the `exceedDimensions` list in PreFilter denial
    /// messages.
    pub fn exceeding_dimensions(&self, other: &Self) -> Vec<Dimension> {
        Self::dimensions_union(self, other)
            .into_iter()
            .filter(|d| self.get(d) > other.get(d))
            .collect()
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0 && self.memory_bytes == 0 && self.extended.values().all(|v| *v == 0)
    }
}

impl Add for ResourceAmount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        &self + &rhs
    }
}

impl Add for &ResourceAmount {
    type Output = ResourceAmount;

    fn add(self, rhs: Self) -> ResourceAmount {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl AddAssign<&ResourceAmount> for ResourceAmount {
    fn add_assign(&mut self, rhs: &ResourceAmount) {
        self.cpu_millis += rhs.cpu_millis;
        self.memory_bytes += rhs.memory_bytes;
        for (name, value) in &rhs.extended {
            *self.extended.entry(name.clone()).or_insert(0) += value;
        }
    }
}

impl Sub for &ResourceAmount {
    type Output = ResourceAmount;

    fn sub(self, rhs: Self) -> ResourceAmount {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl SubAssign<&ResourceAmount> for ResourceAmount {
    fn sub_assign(&mut self, rhs: &ResourceAmount) {
        self.cpu_millis -= rhs.cpu_millis;
        self.memory_bytes -= rhs.memory_bytes;
        for (name, value) in &rhs.extended {
            *self.extended.entry(name.clone()).or_insert(0) -= value;
        }
    }
}

/// Parses a cpu [`Quantity`] (e.g. `"500m"`, `"2"`, `"2.5"`) into milli-cpu
/// units, rounding for fractional cores so requests below one unit are not
/// lost the way a naive integer cast would lose them.
pub fn parse_cpu_millis(q: &Quantity) -> Result<i64, QuantityParseError> {
    let raw = q.0.trim();
    if let Some(stripped) = raw.strip_suffix('m') {
        return stripped
            .parse::<i64>()
            .map_err(|_| NonNumericMagnitudeSnafu { value: raw.to_string() }.build());
    }
    raw.parse::<f64>()
        .map(|cores| (cores * 1000.0).round() as i64)
        .map_err(|_| NonNumericMagnitudeSnafu { value: raw.to_string() }.build())
}

const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: &[(&str, i64)] = &[
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parses a memory [`Quantity`] (e.g. `"128Mi"`, `"2Gi"`, `"500000000"`) into
/// bytes.
pub fn parse_memory_bytes(q: &Quantity) -> Result<i64, QuantityParseError> {
    let raw = q.0.trim();

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped
                .parse::<f64>()
                .map(|n| (n * *factor as f64).round() as i64)
                .map_err(|_| NonNumericMagnitudeSnafu { value: raw.to_string() }.build());
        }
    }

    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped
                .parse::<f64>()
                .map(|n| (n * *factor as f64).round() as i64)
                .map_err(|_| NonNumericMagnitudeSnafu { value: raw.to_string() }.build());
        }
    }

    raw.parse::<f64>()
        .map(|n| n.round() as i64)
        .map_err(|_| NonNumericMagnitudeSnafu { value: raw.to_string() }.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_milli_and_whole_units() {
        assert_eq!(parse_cpu_millis(&Quantity("500m".to_string())).unwrap(), 500);
        assert_eq!(parse_cpu_millis(&Quantity("2".to_string())).unwrap(), 2000);
        assert_eq!(parse_cpu_millis(&Quantity("0.5".to_string())).unwrap(), 500);
    }

    #[test]
    fn parses_memory_binary_and_decimal_suffixes() {
        assert_eq!(
            parse_memory_bytes(&Quantity("1Ki".to_string())).unwrap(),
            1024
        );
        assert_eq!(
            parse_memory_bytes(&Quantity("1Mi".to_string())).unwrap(),
            1024 * 1024
        );
        assert_eq!(
            parse_memory_bytes(&Quantity("1k".to_string())).unwrap(),
            1000
        );
        assert_eq!(
            parse_memory_bytes(&Quantity("12345".to_string())).unwrap(),
            12345
        );
    }

    #[test]
    fn saturating_sub_clamps_to_zero_per_dimension() {
        let a = ResourceAmount::cpu_mem(10, 10);
        let b = ResourceAmount::cpu_mem(20, 5);
        let diff = a.saturating_sub(&b);
        assert_eq!(diff.cpu_millis, 0);
        assert_eq!(diff.memory_bytes, 5);
    }

    #[test]
    fn exceeding_dimensions_reports_only_violating_axes() {
        let used = ResourceAmount::cpu_mem(0, 20);
        let runtime = ResourceAmount::cpu_mem(0, 20);
        let request = ResourceAmount::cpu_mem(1, 2);
        let shortfall = (&used + &request).saturating_sub(&runtime);
        let exceeded = shortfall.exceeding_dimensions(&ResourceAmount::zero());
        assert_eq!(exceeded, vec![Dimension::Cpu]);
    }
}
