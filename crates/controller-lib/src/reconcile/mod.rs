//! Reconciliation of pods against their governing policy
//!
//! This module provides:
//! - The per-event reconcile pass (match, compare, correct, report)
//! - The delete-then-recreate corrective action
//! - A sharded worker pool that drives both event streams
//! - An optional periodic resync source

mod executor;
mod reconciler;
mod resync;
mod workers;


pub use executor::{
    build_replacement, ActionError, ActionOutcome, ActionStep, CorrectiveAction, ExecutorConfig,
    ReplacementSpec, LAST_RECONCILED_ANNOTATION, MANAGED_BY_ANNOTATION,
    ORIGINAL_RESOURCES_ANNOTATION,
};
pub use reconciler::{Evaluation, PolicyChange, Reconciler, ReconcilerConfig};
pub use resync::{ResyncConfig, ResyncScheduler};
pub use workers::{EventChannels, WorkerConfig, WorkerPool};

use crate::models::{Instance, InstanceRef, PolicyKey};
use crate::policy::PolicyStatus;
use anyhow::Result;

pub use async_trait::async_trait;

/// Pod operations the reconciler needs from the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Delete a pod. A pod that is already gone counts as deleted.
    async fn delete_instance(&self, target: &InstanceRef) -> Result<()>;

    async fn instance_exists(&self, target: &InstanceRef) -> Result<bool>;

    async fn create_instance(&self, spec: &ReplacementSpec) -> Result<()>;

    /// List pods in a namespace
    async fn list_instances(&self, namespace: &str) -> Result<Vec<Instance>>;
}

/// Persists policy status after every reconciliation attempt
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn write_status(&self, key: &PolicyKey, status: &PolicyStatus) -> Result<()>;
}
