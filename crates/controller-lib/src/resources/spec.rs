//! Resource specifications (requests + limits)

use super::quantity::{Quantity, QuantityError, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A resource spec field that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {source}")]
pub struct ParseError {
    pub field: ResourceField,
    #[source]
    pub source: QuantityError,
}

/// Resource requirements as written on the wire (`{"requests": {"cpu": "100m"}}`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl ResourceRequirements {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Individually comparable fields of a [`ResourceSpec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceField {
    RequestsCpu,
    RequestsMemory,
    LimitsCpu,
    LimitsMemory,
}

impl ResourceField {
    pub const ALL: [ResourceField; 4] = [
        ResourceField::RequestsCpu,
        ResourceField::RequestsMemory,
        ResourceField::LimitsCpu,
        ResourceField::LimitsMemory,
    ];

    pub fn kind(self) -> ResourceKind {
        match self {
            ResourceField::RequestsCpu | ResourceField::LimitsCpu => ResourceKind::Cpu,
            ResourceField::RequestsMemory | ResourceField::LimitsMemory => ResourceKind::Memory,
        }
    }
}

impl fmt::Display for ResourceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceField::RequestsCpu => "requests.cpu",
            ResourceField::RequestsMemory => "requests.memory",
            ResourceField::LimitsCpu => "limits.cpu",
            ResourceField::LimitsMemory => "limits.memory",
        };
        f.write_str(name)
    }
}

/// CPU and memory amounts for one section (requests or limits)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceList {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
}

impl ResourceList {
    pub fn get(&self, kind: ResourceKind) -> Option<Quantity> {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }

    /// Fields set in `other` replace the ones in `self`
    pub fn overlay(&self, other: &ResourceList) -> ResourceList {
        ResourceList {
            cpu: other.cpu.or(self.cpu),
            memory: other.memory.or(self.memory),
        }
    }

    fn parse(
        raw: &BTreeMap<String, String>,
        cpu_field: ResourceField,
        memory_field: ResourceField,
    ) -> Result<Self, ParseError> {
        let read = |key: &str, field: ResourceField| -> Result<Option<Quantity>, ParseError> {
            raw.get(key)
                .map(|value| Quantity::parse(field.kind(), value))
                .transpose()
                .map_err(|source| ParseError { field, source })
        };

        Ok(Self {
            cpu: read("cpu", cpu_field)?,
            memory: read("memory", memory_field)?,
        })
    }

    fn to_raw(self) -> BTreeMap<String, String> {
        let mut raw = BTreeMap::new();
        if let Some(cpu) = self.cpu {
            raw.insert("cpu".to_string(), cpu.to_string());
        }
        if let Some(memory) = self.memory {
            raw.insert("memory".to_string(), memory.to_string());
        }
        raw
    }
}

/// Normalized resource requests and limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSpec {
    #[serde(skip_serializing_if = "ResourceList::is_empty")]
    pub requests: ResourceList,
    #[serde(skip_serializing_if = "ResourceList::is_empty")]
    pub limits: ResourceList,
}

impl ResourceSpec {
    /// Parse the wire form. Only `cpu` and `memory` keys are interpreted;
    /// other resource names (ephemeral-storage, extended resources) are ignored.
    pub fn parse(raw: &ResourceRequirements) -> Result<Self, ParseError> {
        Ok(Self {
            requests: ResourceList::parse(
                &raw.requests,
                ResourceField::RequestsCpu,
                ResourceField::RequestsMemory,
            )?,
            limits: ResourceList::parse(
                &raw.limits,
                ResourceField::LimitsCpu,
                ResourceField::LimitsMemory,
            )?,
        })
    }

    pub fn to_requirements(&self) -> ResourceRequirements {
        ResourceRequirements {
            requests: self.requests.to_raw(),
            limits: self.limits.to_raw(),
        }
    }

    pub fn get(&self, field: ResourceField) -> Option<Quantity> {
        match field {
            ResourceField::RequestsCpu => self.requests.cpu,
            ResourceField::RequestsMemory => self.requests.memory,
            ResourceField::LimitsCpu => self.limits.cpu,
            ResourceField::LimitsMemory => self.limits.memory,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }

    /// Every field `desired` sets replaces the corresponding field here
    pub fn overlay(&self, desired: &ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            requests: self.requests.overlay(&desired.requests),
            limits: self.limits.overlay(&desired.limits),
        }
    }

    /// Fields that carry a value
    pub fn fields(&self) -> impl Iterator<Item = (ResourceField, Quantity)> + '_ {
        ResourceField::ALL
            .into_iter()
            .filter_map(|field| self.get(field).map(|q| (field, q)))
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, quantity) in self.fields() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", field, quantity)?;
            first = false;
        }
        if first {
            f.write_str("<none>")?;
        }
        Ok(())
    }
}
