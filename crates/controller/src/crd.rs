//! `PodResourcePolicy` custom resource

use chrono::{DateTime, SecondsFormat, Utc};
use controller_lib::models::{PolicyDocument, PolicyKey, TargetSelector, TransportError};
use controller_lib::resources::ResourceRequirements;
use controller_lib::{Phase, PolicyStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "resources.example.com",
    version = "v1",
    kind = "PodResourcePolicy",
    plural = "podresourcepolicies",
    shortname = "prp",
    namespaced,
    status = "PodResourcePolicyStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reconciled", "type":"date", "jsonPath":".status.lastReconciled"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicySpec {
    #[serde(default)]
    pub target_pods: TargetPods,
    #[serde(default)]
    pub resources: PolicyResources,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Pods governed by the policy. A pod is selected by name or when it
/// carries every label in `labelSelector`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetPods {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selector: BTreeMap<String, String>,
    /// Namespace of the pods; the policy's own namespace when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Desired container resources, in Kubernetes quantity notation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PolicyResources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicyStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub managed_instances: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl From<&PolicyStatus> for PodResourcePolicyStatus {
    fn from(status: &PolicyStatus) -> Self {
        Self {
            phase: status.phase.to_string(),
            managed_instances: status.managed_instances.clone(),
            last_reconciled: status
                .last_reconciled
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            message: status.message.clone(),
        }
    }
}

impl PodResourcePolicyStatus {
    /// Unknown phases read as `Pending`, unparseable timestamps as unset
    pub fn to_status(&self) -> PolicyStatus {
        let mut status = PolicyStatus::default();
        status.phase = Phase::parse(&self.phase).unwrap_or_default();
        status.managed_instances = self.managed_instances.clone();
        status.last_reconciled = self
            .last_reconciled
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        status.message = self.message.clone();
        status
    }
}

/// Convert a policy object into the form the reconciler consumes
pub fn policy_document(policy: &PodResourcePolicy) -> Result<PolicyDocument, TransportError> {
    let name = policy
        .metadata
        .name
        .clone()
        .ok_or(TransportError::MissingField("metadata.name"))?;
    let namespace = policy
        .metadata
        .namespace
        .clone()
        .ok_or(TransportError::MissingField("metadata.namespace"))?;

    let target = &policy.spec.target_pods;
    let selector = TargetSelector {
        names: target.names.iter().cloned().collect(),
        label_selector: target.label_selector.clone(),
        namespace: target.namespace.clone().filter(|ns| !ns.is_empty()),
    };
    let resources = ResourceRequirements {
        requests: policy.spec.resources.requests.clone(),
        limits: policy.spec.resources.limits.clone(),
    };

    let mut doc = PolicyDocument::new(PolicyKey::new(namespace, name), selector, resources);
    doc.enabled = policy.spec.enabled;
    doc.status = policy.status.as_ref().map(PodResourcePolicyStatus::to_status);
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kube::CustomResourceExt;
    use serde_json::json;

    fn policy(value: serde_json::Value) -> PodResourcePolicy {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> PodResourcePolicy {
        policy(json!({
            "apiVersion": "resources.example.com/v1",
            "kind": "PodResourcePolicy",
            "metadata": {"name": "fix-pending", "namespace": "default"},
            "spec": {
                "targetPods": {"names": ["pending-demo"], "labelSelector": {"app": "web"}},
                "resources": {
                    "requests": {"cpu": "100m", "memory": "128Mi"},
                    "limits": {"cpu": "200m"}
                }
            }
        }))
    }

    #[test]
    fn test_crd_metadata() {
        let crd = PodResourcePolicy::crd();
        assert_eq!(crd.spec.group, "resources.example.com");
        assert_eq!(crd.spec.names.plural, "podresourcepolicies");
        assert_eq!(crd.spec.names.kind, "PodResourcePolicy");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_document_from_policy() {
        let doc = policy_document(&sample()).unwrap();

        assert_eq!(doc.key, PolicyKey::new("default", "fix-pending"));
        assert!(doc.selector.names.contains("pending-demo"));
        assert_eq!(doc.selector.label_selector.get("app").map(String::as_str), Some("web"));
        assert_eq!(doc.selector.namespace, None);
        assert_eq!(doc.resources.requests.get("memory").map(String::as_str), Some("128Mi"));
        assert_eq!(doc.resources.limits.get("cpu").map(String::as_str), Some("200m"));
        assert!(doc.enabled);
        assert!(doc.status.is_none());
    }

    #[test]
    fn test_empty_target_namespace_means_own_namespace() {
        let mut p = sample();
        p.spec.target_pods.namespace = Some(String::new());
        assert_eq!(policy_document(&p).unwrap().selector.namespace, None);

        p.spec.target_pods.namespace = Some("apps".to_string());
        assert_eq!(
            policy_document(&p).unwrap().selector.namespace.as_deref(),
            Some("apps")
        );
    }

    #[test]
    fn test_disabled_policy() {
        let p = policy(json!({
            "apiVersion": "resources.example.com/v1",
            "kind": "PodResourcePolicy",
            "metadata": {"name": "off", "namespace": "default"},
            "spec": {"enabled": false, "targetPods": {"names": ["a"]}}
        }));
        assert!(!policy_document(&p).unwrap().enabled);
    }

    #[test]
    fn test_missing_namespace_is_rejected() {
        let mut p = sample();
        p.metadata.namespace = None;
        assert!(matches!(
            policy_document(&p),
            Err(TransportError::MissingField("metadata.namespace"))
        ));
    }

    #[test]
    fn test_status_round_trip() {
        let mut status = PolicyStatus::default();
        status.record_compliant(
            "default/pending-demo",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        );

        let persisted = PodResourcePolicyStatus::from(&status);
        assert_eq!(persisted.phase, "Reconciled");
        assert_eq!(persisted.last_reconciled.as_deref(), Some("2024-05-01T12:00:00Z"));

        let wire = serde_json::to_value(&persisted).unwrap();
        assert_eq!(wire["managedInstances"], json!(["default/pending-demo"]));

        let back: PodResourcePolicyStatus = serde_json::from_value(wire).unwrap();
        assert!(back.to_status().same_persisted(&status));
    }

    #[test]
    fn test_unknown_phase_reads_as_pending() {
        let persisted = PodResourcePolicyStatus {
            phase: "Bogus".to_string(),
            last_reconciled: Some("not a time".to_string()),
            ..Default::default()
        };
        let status = persisted.to_status();
        assert_eq!(status.phase, Phase::Pending);
        assert!(status.last_reconciled.is_none());
    }

    #[test]
    fn test_document_carries_persisted_status() {
        let mut p = sample();
        p.status = Some(PodResourcePolicyStatus {
            phase: "Error".to_string(),
            message: "requests.cpu: invalid".to_string(),
            ..Default::default()
        });
        let doc = policy_document(&p).unwrap();
        assert_eq!(doc.status.map(|s| s.phase), Some(Phase::Error));
    }
}
