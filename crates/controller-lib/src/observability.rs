//! Structured logging for controller events
//!
//! Every helper emits a `tracing` event with a stable `event` field so log
//! pipelines can filter on it when the JSON formatter is installed.

use crate::models::{InstanceRef, PolicyKey};
use crate::reconcile::ActionError;
use tracing::{error, info, warn};

/// Structured logger for controller events
///
/// Carries the controller identity (pod name or hostname) so entries from
/// several replicas can be told apart.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Log controller startup
    pub fn log_startup(&self, version: &str, namespace: Option<&str>, dry_run: bool) {
        info!(
            event = "controller_started",
            controller = %self.controller,
            version = %version,
            namespace = %namespace.unwrap_or("*"),
            dry_run = dry_run,
            "Pod resource controller started"
        );
    }

    /// Log controller shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "controller_shutdown",
            controller = %self.controller,
            reason = %reason,
            "Pod resource controller shutting down"
        );
    }

    /// Log a completed pod replacement
    pub fn log_replacement(&self, instance: &InstanceRef, policy: &PolicyKey, changes: &str) {
        info!(
            event = "pod_replaced",
            controller = %self.controller,
            namespace = %instance.namespace,
            pod_name = %instance.name,
            policy = %policy,
            changes = %changes,
            "Replaced pod with desired resources"
        );
    }

    pub fn log_action_failed(&self, instance: &str, policy: &PolicyKey, err: &ActionError) {
        warn!(
            event = "pod_replacement_failed",
            controller = %self.controller,
            instance = %instance,
            policy = %policy,
            step = %err.step,
            reason = %err.reason,
            "Corrective action failed"
        );
    }

    /// A policy whose desired resources could not be parsed
    pub fn log_policy_rejected(&self, policy: &PolicyKey, reason: &str) {
        warn!(
            event = "policy_rejected",
            controller = %self.controller,
            policy = %policy,
            reason = %reason,
            "Policy has an invalid resource spec"
        );
    }

    pub fn log_status_flush_failed(&self, policy: &PolicyKey, err: &anyhow::Error) {
        let reason = format!("{:#}", err);
        error!(
            event = "status_flush_failed",
            controller = %self.controller,
            policy = %policy,
            error = %reason,
            "Failed to write policy status"
        );
    }

    /// An event that could not be normalized and was dropped
    pub fn log_dropped_event(&self, stream: &str, reason: &str) {
        warn!(
            event = "event_dropped",
            controller = %self.controller,
            stream = %stream,
            reason = %reason,
            "Dropped undecodable watch event"
        );
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new("pod-resource-controller")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::ActionStep;

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("controller-0");
        assert_eq!(logger.controller(), "controller-0");
        assert_eq!(StructuredLogger::default().controller(), "pod-resource-controller");
    }

    #[test]
    fn test_logging_without_subscriber_does_not_panic() {
        let logger = StructuredLogger::new("controller-0");
        let policy = PolicyKey::new("default", "fix");
        logger.log_startup("0.1.0", None, false);
        logger.log_replacement(&InstanceRef::new("default", "web-0"), &policy, "requests.cpu");
        logger.log_action_failed(
            "default/web-0",
            &policy,
            &ActionError {
                step: ActionStep::Create,
                reason: "quota exceeded".to_string(),
            },
        );
        logger.log_status_flush_failed(&policy, &anyhow::anyhow!("conflict"));
        logger.log_shutdown("test");
    }
}
