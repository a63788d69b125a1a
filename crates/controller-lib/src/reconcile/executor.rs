//! Delete-then-recreate corrective action
//!
//! A pod's resources are immutable, so a non-compliant pod is corrected by
//! deleting it, waiting until it is gone and creating a replacement with the
//! same identity and the desired resources.

use super::ClusterClient;
use crate::models::{Instance, InstanceRef, PolicyKey};
use crate::resources::ResourceSpec;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Policy that produced the replacement, as `<namespace>/<name>`
pub const MANAGED_BY_ANNOTATION: &str = "managed-by-policy";
/// RFC 3339 time of the correction
pub const LAST_RECONCILED_ANNOTATION: &str = "last-reconciled-at";
/// JSON of the resources the pod had before correction
pub const ORIGINAL_RESOURCES_ANNOTATION: &str = "original-resources";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on waiting for the old pod to disappear (default: 30 seconds)
    pub delete_timeout: Duration,
    /// Delay between existence checks (default: 500 milliseconds)
    pub poll_interval: Duration,
    /// Build the replacement but never touch the cluster
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            delete_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            dry_run: false,
        }
    }
}

impl ExecutorConfig {
    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// The step of a corrective action that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStep {
    Delete,
    AwaitDeletion,
    Create,
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::Delete => f.write_str("delete"),
            ActionStep::AwaitDeletion => f.write_str("await deletion"),
            ActionStep::Create => f.write_str("create"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{step} failed: {reason}")]
pub struct ActionError {
    pub step: ActionStep,
    pub reason: String,
}

impl ActionError {
    fn new(step: ActionStep, reason: impl Into<String>) -> Self {
        Self {
            step,
            reason: reason.into(),
        }
    }
}

/// Everything needed to create the replacement pod
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplacementSpec {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Applied to every container of the template
    pub resources: ResourceSpec,
    pub template: serde_json::Value,
}

impl ReplacementSpec {
    pub fn reference(&self) -> InstanceRef {
        InstanceRef::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Replaced(InstanceRef),
    /// Dry run: the replacement that would have been created
    DryRun(ReplacementSpec),
}

/// Executes corrective actions against the cluster
#[derive(Clone)]
pub struct CorrectiveAction {
    cluster: Arc<dyn ClusterClient>,
    config: ExecutorConfig,
}

impl CorrectiveAction {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: ExecutorConfig) -> Self {
        Self { cluster, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Replace `instance` with a copy carrying `desired`.
    ///
    /// Each step runs at most once. A failure after deletion leaves the pod
    /// deleted; there is no rollback.
    pub async fn apply(
        &self,
        instance: &Instance,
        desired: &ResourceSpec,
        policy: &PolicyKey,
    ) -> Result<ActionOutcome, ActionError> {
        let replacement = build_replacement(instance, desired, policy, Utc::now());
        if self.config.dry_run {
            info!(
                instance = %instance.reference(),
                policy = %policy,
                resources = %replacement.resources,
                "Dry run, skipping pod replacement"
            );
            return Ok(ActionOutcome::DryRun(replacement));
        }

        let target = instance.reference();

        self.cluster
            .delete_instance(&target)
            .await
            .map_err(|e| ActionError::new(ActionStep::Delete, format!("{:#}", e)))?;
        debug!(instance = %target, "Delete requested");

        self.await_deletion(&target).await?;

        self.cluster
            .create_instance(&replacement)
            .await
            .map_err(|e| ActionError::new(ActionStep::Create, format!("{:#}", e)))?;

        Ok(ActionOutcome::Replaced(target))
    }

    /// Poll until the pod is gone, bounded by the delete timeout
    async fn await_deletion(&self, target: &InstanceRef) -> Result<(), ActionError> {
        let poll = async {
            loop {
                match self.cluster.instance_exists(target).await {
                    Ok(false) => return,
                    Ok(true) => {}
                    Err(e) => {
                        debug!(instance = %target, error = %e, "Existence check failed, retrying");
                    }
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };

        tokio::time::timeout(self.config.delete_timeout, poll)
            .await
            .map_err(|_| {
                ActionError::new(
                    ActionStep::AwaitDeletion,
                    format!(
                        "{} still present after {}ms",
                        target,
                        self.config.delete_timeout.as_millis()
                    ),
                )
            })
    }
}

/// Build the replacement for `instance`: same identity and template, the
/// actual resources overlaid with every field `desired` sets, plus
/// provenance annotations.
pub fn build_replacement(
    instance: &Instance,
    desired: &ResourceSpec,
    policy: &PolicyKey,
    at: DateTime<Utc>,
) -> ReplacementSpec {
    let mut annotations = instance.annotations.clone();
    annotations.insert(MANAGED_BY_ANNOTATION.to_string(), policy.to_string());
    annotations.insert(
        LAST_RECONCILED_ANNOTATION.to_string(),
        at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    // The first correction records what the pod originally asked for
    if !annotations.contains_key(ORIGINAL_RESOURCES_ANNOTATION) {
        let original = serde_json::to_string(&instance.resources.to_requirements())
            .unwrap_or_default();
        annotations.insert(ORIGINAL_RESOURCES_ANNOTATION.to_string(), original);
    }

    ReplacementSpec {
        namespace: instance.namespace.clone(),
        name: instance.name.clone(),
        labels: instance.labels.clone(),
        annotations,
        resources: instance.resources.overlay(desired),
        template: instance.template.clone(),
    }
}
