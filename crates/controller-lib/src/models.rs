//! Core data models for the pod resource controller

use crate::policy::PolicyStatus;
use crate::resources::{ResourceRequirements, ResourceSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Identity of a policy object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of a pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceRef {
    pub namespace: String,
    pub name: String,
}

impl InstanceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod lifecycle phase as reported by the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl InstancePhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => InstancePhase::Pending,
            Some("Running") => InstancePhase::Running,
            Some("Succeeded") => InstancePhase::Succeeded,
            Some("Failed") => InstancePhase::Failed,
            _ => InstancePhase::Unknown,
        }
    }
}

/// Read-only snapshot of a pod delivered by an instance event
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Resources of the first container
    pub resources: ResourceSpec,
    pub phase: InstancePhase,
    /// Deletion has been requested; the pod is terminating
    pub deleting: bool,
    /// Opaque workload body (the pod spec), carried through to recreation
    pub template: serde_json::Value,
}

impl Instance {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            resources: ResourceSpec::default(),
            phase: InstancePhase::Unknown,
            deleting: false,
            template: serde_json::Value::Null,
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_phase(mut self, phase: InstancePhase) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_deleting(mut self, deleting: bool) -> Self {
        self.deleting = deleting;
        self
    }

    pub fn with_template(mut self, template: serde_json::Value) -> Self {
        self.template = template;
        self
    }

    pub fn reference(&self) -> InstanceRef {
        InstanceRef::new(&self.namespace, &self.name)
    }

    /// `"<namespace>/<name>"`, the form stored in policy status
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Which pods a policy targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    #[serde(default)]
    pub names: BTreeSet<String>,
    #[serde(default)]
    pub label_selector: BTreeMap<String, String>,
    /// Defaults to the policy's own namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl TargetSelector {
    /// A selector with neither names nor labels selects nothing
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.label_selector.is_empty()
    }

    /// Name or label match, ignoring namespace
    pub fn selects(&self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        if self.names.contains(name) {
            return true;
        }

        !self.label_selector.is_empty()
            && self
                .label_selector
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value))
    }
}

/// Transport form of a policy, as delivered by the policy event stream
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDocument {
    pub key: PolicyKey,
    pub selector: TargetSelector,
    pub resources: ResourceRequirements,
    pub enabled: bool,
    /// Status as currently persisted in the object store
    pub status: Option<PolicyStatus>,
}

impl PolicyDocument {
    pub fn new(key: PolicyKey, selector: TargetSelector, resources: ResourceRequirements) -> Self {
        Self {
            key,
            selector,
            resources,
            enabled: true,
            status: None,
        }
    }
}

/// Normalized policy watch event
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Added(PolicyDocument),
    Modified(PolicyDocument),
    Deleted(PolicyDocument),
}

impl PolicyEvent {
    pub fn document(&self) -> &PolicyDocument {
        match self {
            PolicyEvent::Added(doc) | PolicyEvent::Modified(doc) | PolicyEvent::Deleted(doc) => doc,
        }
    }
}

/// Normalized pod watch event
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Added(Instance),
    Modified(Instance),
    Deleted(Instance),
}

impl InstanceEvent {
    pub fn instance(&self) -> &Instance {
        match self {
            InstanceEvent::Added(i) | InstanceEvent::Modified(i) | InstanceEvent::Deleted(i) => i,
        }
    }
}

/// An event that could not be turned into a normalized event.
/// The event is dropped; it never stops a worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("object is missing {0}")]
    MissingField(&'static str),

    #[error("undecodable {kind} {object}: {reason}")]
    Undecodable {
        kind: &'static str,
        object: String,
        reason: String,
    },

    #[error("watch stream error: {0}")]
    Stream(String),
}
