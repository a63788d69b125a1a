//! Policy status sub-document and its transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Policy phase as persisted in `status.phase`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Reconciled,
    Error,
}

impl Phase {
    pub fn parse(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(Phase::Pending),
            "Reconciled" => Some(Phase::Reconciled),
            "Error" => Some(Phase::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Reconciled => "Reconciled",
            Phase::Error => "Error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const INVALID_SPEC_PREFIX: &str = "invalid resource spec: ";

/// Status of a policy.
///
/// Serializes to the persisted layout `{phase, managedInstances,
/// lastReconciled, message}`. The set of instances whose last correction
/// failed is controller-local and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    pub phase: Phase,
    /// `"<namespace>/<name>"` in the order instances were first reconciled
    #[serde(default)]
    pub managed_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(skip)]
    outstanding: BTreeSet<String>,
}

impl PolicyStatus {
    pub fn is_managed(&self, instance: &str) -> bool {
        self.managed_instances.iter().any(|m| m == instance)
    }

    /// Instances whose most recent correction attempt failed
    pub fn outstanding(&self) -> impl Iterator<Item = &str> {
        self.outstanding.iter().map(String::as_str)
    }

    pub fn is_outstanding(&self, instance: &str) -> bool {
        self.outstanding.contains(instance)
    }

    pub fn has_outstanding(&self) -> bool {
        !self.outstanding.is_empty()
    }

    fn manage(&mut self, instance: &str) {
        if !self.is_managed(instance) {
            self.managed_instances.push(instance.to_string());
        }
    }

    fn settle(&mut self, instance: &str, at: DateTime<Utc>, message: String) {
        self.manage(instance);
        self.outstanding.remove(instance);
        self.last_reconciled = Some(at);
        self.message = message;
        // Other instances still failing keep the policy in Error
        if self.outstanding.is_empty() {
            self.phase = Phase::Reconciled;
        }
    }

    /// The instance already matches the desired spec
    pub fn record_compliant(&mut self, instance: &str, at: DateTime<Utc>) {
        self.settle(instance, at, format!("{} matches desired resources", instance));
    }

    /// The instance was replaced with the desired spec
    pub fn record_replaced(&mut self, instance: &str, at: DateTime<Utc>, summary: &str) {
        self.settle(instance, at, format!("replaced {} ({})", instance, summary));
    }

    /// Correction failed; membership in `managed_instances` is left as is
    pub fn record_failure(&mut self, instance: &str, at: DateTime<Utc>, reason: &str) {
        self.outstanding.insert(instance.to_string());
        self.phase = Phase::Error;
        self.last_reconciled = Some(at);
        self.message = format!("failed to reconcile {}: {}", instance, reason);
    }

    /// Nothing was changed in the cluster; membership and phase stay as they are
    pub fn record_dry_run(&mut self, instance: &str, at: DateTime<Utc>, summary: &str) {
        self.last_reconciled = Some(at);
        self.message = format!("dry run: would replace {} ({})", instance, summary);
    }

    pub fn record_invalid_spec(&mut self, reason: &str) {
        self.phase = Phase::Error;
        self.message = format!("{}{}", INVALID_SPEC_PREFIX, reason);
    }

    /// Error recorded by [`record_invalid_spec`](Self::record_invalid_spec),
    /// possibly read back from the persisted status
    pub fn is_invalid_spec(&self) -> bool {
        self.phase == Phase::Error && self.message.starts_with(INVALID_SPEC_PREFIX)
    }

    /// Clear a previous spec error after a corrected policy arrives
    pub fn record_spec_accepted(&mut self) {
        self.phase = Phase::Pending;
        self.message = "resource spec accepted".to_string();
    }

    /// Drop an instance that is gone or no longer targeted. Returns whether
    /// anything changed.
    pub fn release(&mut self, instance: &str) -> bool {
        let before = self.managed_instances.len();
        self.managed_instances.retain(|m| m != instance);
        let was_outstanding = self.outstanding.remove(instance);
        before != self.managed_instances.len() || was_outstanding
    }

    /// Equal in every persisted field
    pub fn same_persisted(&self, other: &PolicyStatus) -> bool {
        self.phase == other.phase
            && self.managed_instances == other.managed_instances
            && self.last_reconciled == other.last_reconciled
            && self.message == other.message
    }
}
