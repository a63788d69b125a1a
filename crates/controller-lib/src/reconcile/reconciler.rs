//! Per-event reconcile pass
//!
//! Each policy or instance event is handled to completion against a fresh
//! index snapshot. The only state kept between events is the policy index
//! itself and the uids of pods this controller has just replaced.

use super::executor::{ActionError, ActionOutcome, CorrectiveAction, ExecutorConfig};
use super::{ClusterClient, StatusSink};
use crate::models::{Instance, InstanceEvent, InstanceRef, PolicyDocument, PolicyEvent, PolicyKey};
use crate::observability::StructuredLogger;
use crate::policy::{Policy, PolicyIndex, PolicySnapshot, PolicyStatus};
use crate::resources::{Comparator, ComparatorConfig, Comparison, FieldDiff, ResourceSpec};
use chrono::{SubsecRound, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Tolerance windows for the compliance check (default: exact)
    pub comparator: ComparatorConfig,
    /// Re-evaluate pods in the target namespace when a policy is created or changed
    pub sweep_on_policy_change: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            comparator: ComparatorConfig::default(),
            sweep_on_policy_change: false,
        }
    }
}

impl ReconcilerConfig {
    pub fn comparator(mut self, comparator: ComparatorConfig) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn sweep_on_policy_change(mut self, enabled: bool) -> Self {
        self.sweep_on_policy_change = enabled;
        self
    }
}

/// What a policy event did to the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    /// Re-delivery of content already indexed
    Unchanged,
    /// New or changed policy. Every pod in a `sweep` namespace (empty when
    /// sweeping is disabled) and every pod in `tracked` should be re-evaluated.
    Changed {
        sweep: BTreeSet<String>,
        /// `"<namespace>/<name>"` of pods the policy managed or failed to correct
        tracked: BTreeSet<String>,
    },
    Removed,
}

/// Result of handling one instance event
#[derive(Debug, Clone)]
pub enum Evaluation {
    /// No policy governs the instance
    Unmatched,
    /// Terminating pod, or a late event for a pod already replaced
    Skipped,
    /// The governing policy has an unparseable resource spec
    InvalidSpec(PolicyKey),
    Compliant(PolicyKey),
    Replaced(PolicyKey),
    DryRun(PolicyKey),
    Failed(PolicyKey, ActionError),
    /// Deleted pod, released from this many policies
    Released(usize),
}

pub struct Reconciler {
    index: Arc<PolicyIndex>,
    cluster: Arc<dyn ClusterClient>,
    status_sink: Arc<dyn StatusSink>,
    executor: CorrectiveAction,
    comparator: Comparator,
    config: ReconcilerConfig,
    /// Pods deleted by a corrective action, by uid, until their deletion is observed
    replaced: DashMap<InstanceRef, String>,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        index: Arc<PolicyIndex>,
        cluster: Arc<dyn ClusterClient>,
        status_sink: Arc<dyn StatusSink>,
        executor_config: ExecutorConfig,
        config: ReconcilerConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            index,
            executor: CorrectiveAction::new(cluster.clone(), executor_config),
            cluster,
            status_sink,
            comparator: Comparator::new(config.comparator),
            config,
            replaced: DashMap::new(),
            logger,
        }
    }

    pub fn index(&self) -> &Arc<PolicyIndex> {
        &self.index
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub async fn handle_policy_event(&self, event: PolicyEvent) -> PolicyChange {
        match event {
            PolicyEvent::Added(doc) | PolicyEvent::Modified(doc) => self.apply_policy(doc).await,
            PolicyEvent::Deleted(doc) => {
                if self.index.remove(&doc.key).is_some() {
                    info!(policy = %doc.key, "Policy removed");
                }
                PolicyChange::Removed
            }
        }
    }

    async fn apply_policy(&self, doc: PolicyDocument) -> PolicyChange {
        let persisted = doc.status.clone();
        let policy = Policy::from_document(doc);
        let key = policy.key.clone();

        // The index owns status once a policy is known; the document's copy
        // is only trusted on first sight.
        let previous = self.index.upsert_with(policy, |previous, next| {
            let Some(previous) = previous else {
                return;
            };
            let mut status = previous.status.clone();
            match &next.desired {
                Err(err) => status.record_invalid_spec(&err.to_string()),
                Ok(_) if status.is_invalid_spec() => status.record_spec_accepted(),
                Ok(_) => {}
            }
            next.status = status;
        });

        let Some(current) = self.index.get(&key) else {
            return PolicyChange::Unchanged;
        };

        let stale = persisted
            .as_ref()
            .map_or(true, |status| !status.same_persisted(&current.status));
        if stale {
            self.flush(&key, &current.status).await;
        }

        if previous.as_ref().is_some_and(|p| p.same_spec(&current)) {
            debug!(policy = %key, "Policy unchanged");
            return PolicyChange::Unchanged;
        }

        match &current.desired {
            Ok(desired) => info!(
                policy = %key,
                enabled = current.enabled,
                created = previous.is_none(),
                resources = %desired,
                "Policy indexed"
            ),
            Err(err) => self.logger.log_policy_rejected(&key, &err.to_string()),
        }

        let mut sweep = BTreeSet::new();
        if self.config.sweep_on_policy_change {
            sweep.insert(current.target_namespace().to_string());
            if let Some(previous) = &previous {
                sweep.insert(previous.target_namespace().to_string());
            }
        }
        let mut tracked = tracked_instances(&current.status);
        if let Some(previous) = &previous {
            tracked.extend(tracked_instances(&previous.status));
        }
        PolicyChange::Changed { sweep, tracked }
    }

    /// Pods to re-evaluate after a policy change
    pub async fn sweep_candidates(&self, change: &PolicyChange) -> Vec<Instance> {
        let PolicyChange::Changed { sweep, tracked } = change else {
            return Vec::new();
        };

        let mut namespaces: BTreeSet<&str> = sweep.iter().map(String::as_str).collect();
        namespaces.extend(
            tracked
                .iter()
                .filter_map(|key| key.split_once('/').map(|(ns, _)| ns)),
        );

        let mut instances = Vec::new();
        for namespace in namespaces {
            match self.cluster.list_instances(namespace).await {
                Ok(found) => instances.extend(found.into_iter().filter(|instance| {
                    sweep.contains(&instance.namespace) || tracked.contains(&instance.key())
                })),
                Err(e) => warn!(
                    namespace = %namespace,
                    error = %e,
                    "Failed to list pods for policy sweep"
                ),
            }
        }
        instances
    }

    pub async fn handle_instance_event(&self, event: InstanceEvent) -> Evaluation {
        match event {
            InstanceEvent::Added(instance) | InstanceEvent::Modified(instance) => {
                self.evaluate(&instance).await
            }
            InstanceEvent::Deleted(instance) => self.forget(&instance).await,
        }
    }

    fn is_superseded(&self, instance: &Instance) -> bool {
        match (&instance.uid, self.replaced.get(&instance.reference())) {
            (Some(uid), Some(replaced)) => *replaced == *uid,
            _ => false,
        }
    }

    /// Match, compare and correct one instance
    pub async fn evaluate(&self, instance: &Instance) -> Evaluation {
        if instance.deleting || self.is_superseded(instance) {
            debug!(instance = %instance.reference(), "Skipping pod on its way out");
            return Evaluation::Skipped;
        }

        let snapshot = self.index.snapshot_all();
        let matched = snapshot.find_match(instance);
        let key = instance.key();
        self.prune(&snapshot, &key, matched.map(|p| &p.key)).await;

        let Some(policy) = matched else {
            return Evaluation::Unmatched;
        };
        let Some(desired) = policy.desired_spec() else {
            debug!(instance = %key, policy = %policy.key, "Policy spec invalid, no action");
            return Evaluation::InvalidSpec(policy.key.clone());
        };

        match self.comparator.compare(&instance.resources, desired) {
            Comparison::Match => {
                let now = Utc::now().trunc_subsecs(0);
                let updated = self
                    .index
                    .update_status(&policy.key, |status| status.record_compliant(&key, now));
                if let Some(status) = updated {
                    debug!(instance = %key, policy = %policy.key, "Pod compliant");
                    self.flush(&policy.key, &status).await;
                }
                Evaluation::Compliant(policy.key.clone())
            }
            Comparison::Mismatch(diffs) => self.correct(instance, policy, desired, &diffs).await,
        }
    }

    async fn correct(
        &self,
        instance: &Instance,
        policy: &Policy,
        desired: &ResourceSpec,
        diffs: &[FieldDiff],
    ) -> Evaluation {
        let key = instance.key();
        let reference = instance.reference();
        let summary = diffs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        info!(
            instance = %key,
            policy = %policy.key,
            diff = %summary,
            "Pod resources diverge from policy"
        );

        // Recorded before deletion so the resulting watch events are recognized
        if let Some(uid) = &instance.uid {
            self.replaced.insert(reference.clone(), uid.clone());
        }

        let now = Utc::now().trunc_subsecs(0);
        let outcome = self.executor.apply(instance, desired, &policy.key).await;
        let (evaluation, updated) = match outcome {
            Ok(ActionOutcome::Replaced(target)) => {
                let fields = diffs
                    .iter()
                    .map(|d| d.field.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                self.logger.log_replacement(&target, &policy.key, &fields);
                let updated = self
                    .index
                    .update_status(&policy.key, |s| s.record_replaced(&key, now, &fields));
                (Evaluation::Replaced(policy.key.clone()), updated)
            }
            Ok(ActionOutcome::DryRun(_)) => {
                self.replaced.remove(&reference);
                let updated = self
                    .index
                    .update_status(&policy.key, |s| s.record_dry_run(&key, now, &summary));
                (Evaluation::DryRun(policy.key.clone()), updated)
            }
            Err(err) => {
                self.replaced.remove(&reference);
                self.logger.log_action_failed(&key, &policy.key, &err);
                let reason = err.to_string();
                let updated = self
                    .index
                    .update_status(&policy.key, |s| s.record_failure(&key, now, &reason));
                (Evaluation::Failed(policy.key.clone(), err), updated)
            }
        };

        if let Some(status) = updated {
            self.flush(&policy.key, &status).await;
        }
        evaluation
    }

    /// Deleted pod: release it everywhere, unless it is the pod a corrective
    /// action just replaced.
    async fn forget(&self, instance: &Instance) -> Evaluation {
        let reference = instance.reference();
        if let Some(uid) = &instance.uid {
            if self
                .replaced
                .remove_if(&reference, |_, replaced| replaced == uid)
                .is_some()
            {
                debug!(instance = %reference, "Observed deletion of replaced pod");
                return Evaluation::Skipped;
            }
        }

        let snapshot = self.index.snapshot_all();
        let released = self.prune(&snapshot, &instance.key(), None).await;
        Evaluation::Released(released)
    }

    /// Remove `instance` from every policy except `keep`. Returns how many
    /// policies changed.
    async fn prune(
        &self,
        snapshot: &PolicySnapshot,
        instance: &str,
        keep: Option<&PolicyKey>,
    ) -> usize {
        let mut released = 0;
        for policy in snapshot.iter() {
            if Some(&policy.key) == keep {
                continue;
            }
            if !policy.status.is_managed(instance) && !policy.status.is_outstanding(instance) {
                continue;
            }
            if let Some(status) = self.index.modify_status(&policy.key, |s| s.release(instance)) {
                debug!(instance = %instance, policy = %policy.key, "Released pod from policy");
                released += 1;
                self.flush(&policy.key, &status).await;
            }
        }
        released
    }

    /// Status write failures are logged and never retried
    async fn flush(&self, key: &PolicyKey, status: &PolicyStatus) {
        if let Err(e) = self.status_sink.write_status(key, status).await {
            self.logger.log_status_flush_failed(key, &e);
        }
    }
}

fn tracked_instances(status: &PolicyStatus) -> BTreeSet<String> {
    status
        .managed_instances
        .iter()
        .cloned()
        .chain(status.outstanding().map(str::to_string))
        .collect()
}
