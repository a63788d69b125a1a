//! Compliance check between an instance's actual resources and a policy's desired spec

use super::quantity::{Quantity, ResourceKind};
use super::spec::{ResourceField, ResourceSpec};
use std::fmt;

/// Optional tolerance windows. Both default to zero, i.e. exact comparison
/// on normalized units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparatorConfig {
    /// Allowed CPU difference in millicores
    pub cpu_tolerance_millis: u64,
    /// Allowed memory difference in bytes
    pub memory_tolerance_bytes: u64,
}

impl ComparatorConfig {
    fn tolerance(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu_tolerance_millis,
            ResourceKind::Memory => self.memory_tolerance_bytes,
        }
    }
}

/// One field where the actual value differs from the desired value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    pub field: ResourceField,
    pub desired: Quantity,
    /// `None` when the instance does not set the field at all
    pub actual: Option<Quantity>,
}

impl fmt::Display for FieldDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.actual {
            Some(actual) => write!(f, "{}: want {}, have {}", self.field, self.desired, actual),
            None => write!(f, "{}: want {}, have unset", self.field, self.desired),
        }
    }
}

/// Result of comparing actual resources against a desired spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    Match,
    /// Every differing field, in field order
    Mismatch(Vec<FieldDiff>),
}

impl Comparison {
    pub fn is_match(&self) -> bool {
        matches!(self, Comparison::Match)
    }

    pub fn diffs(&self) -> &[FieldDiff] {
        match self {
            Comparison::Match => &[],
            Comparison::Mismatch(diffs) => diffs,
        }
    }
}

/// Compares resource specs field by field
#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    config: ComparatorConfig,
}

impl Comparator {
    pub fn new(config: ComparatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComparatorConfig {
        &self.config
    }

    /// Only fields present in `desired` are checked; anything `desired`
    /// leaves unset is ignored regardless of the actual value.
    pub fn compare(&self, actual: &ResourceSpec, desired: &ResourceSpec) -> Comparison {
        let diffs: Vec<FieldDiff> = desired
            .fields()
            .filter_map(|(field, want)| {
                let have = actual.get(field);
                let within = have
                    .map(|have| have.abs_diff(&want) <= self.config.tolerance(field.kind()))
                    .unwrap_or(false);

                (!within).then_some(FieldDiff {
                    field,
                    desired: want,
                    actual: have,
                })
            })
            .collect();

        if diffs.is_empty() {
            Comparison::Match
        } else {
            Comparison::Mismatch(diffs)
        }
    }
}

/// Exact comparison with no tolerance
pub fn compare(actual: &ResourceSpec, desired: &ResourceSpec) -> Comparison {
    Comparator::default().compare(actual, desired)
}
