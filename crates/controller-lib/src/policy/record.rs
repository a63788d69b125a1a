//! Materialized policy record held by the index

use super::status::PolicyStatus;
use crate::models::{PolicyDocument, PolicyKey, TargetSelector};
use crate::resources::{ParseError, ResourceSpec};

/// A complete policy as stored in the [`PolicyIndex`](super::PolicyIndex)
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub key: PolicyKey,
    pub selector: TargetSelector,
    /// Parsed desired resources, or the parse failure that keeps the policy in Error
    pub desired: Result<ResourceSpec, ParseError>,
    pub enabled: bool,
    pub status: PolicyStatus,
}

impl Policy {
    /// Materialize a transport document. A malformed quantity does not drop
    /// the policy: it is kept with `phase = Error` so a corrected update can
    /// recover it.
    pub fn from_document(doc: PolicyDocument) -> Self {
        let desired = ResourceSpec::parse(&doc.resources);
        let mut status = doc.status.unwrap_or_default();
        match &desired {
            Err(err) => status.record_invalid_spec(&err.to_string()),
            // The spec was fixed while nobody was watching
            Ok(_) if status.is_invalid_spec() => status.record_spec_accepted(),
            Ok(_) => {}
        }

        Self {
            key: doc.key,
            selector: doc.selector,
            desired,
            enabled: doc.enabled,
            status,
        }
    }

    /// Namespace whose pods this policy governs
    pub fn target_namespace(&self) -> &str {
        self.selector
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.key.namespace)
    }

    pub fn desired_spec(&self) -> Option<&ResourceSpec> {
        self.desired.as_ref().ok()
    }

    /// True when everything except status is identical
    pub fn same_spec(&self, other: &Policy) -> bool {
        self.selector == other.selector
            && self.desired == other.desired
            && self.enabled == other.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Phase;
    use crate::resources::{Quantity, ResourceRequirements};

    fn document(cpu: &str) -> PolicyDocument {
        PolicyDocument::new(
            PolicyKey::new("default", "fix-pending-pods"),
            TargetSelector {
                names: ["pending-demo".to_string()].into_iter().collect(),
                ..Default::default()
            },
            ResourceRequirements {
                requests: [("cpu".to_string(), cpu.to_string())].into_iter().collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_from_document_parses_desired() {
        let policy = Policy::from_document(document("100m"));
        assert_eq!(
            policy.desired_spec().unwrap().requests.cpu,
            Some(Quantity::millicores(100))
        );
        assert_eq!(policy.status.phase, Phase::Pending);
    }

    #[test]
    fn test_invalid_quantity_keeps_policy_in_error() {
        let policy = Policy::from_document(document("a-lot"));
        assert!(policy.desired.is_err());
        assert_eq!(policy.status.phase, Phase::Error);
        assert!(policy.status.message.contains("requests.cpu"));
    }

    #[test]
    fn test_persisted_spec_error_clears_once_spec_parses() {
        let mut stale = PolicyStatus::default();
        stale.record_invalid_spec("requests.cpu: invalid quantity");
        let mut doc = document("100m");
        doc.status = Some(stale);

        let policy = Policy::from_document(doc);

        assert_eq!(policy.status.phase, Phase::Pending);
        assert!(!policy.status.is_invalid_spec());
    }

    #[test]
    fn test_persisted_action_error_is_kept() {
        let mut persisted = PolicyStatus::default();
        persisted.record_failure("default/pending-demo", chrono::Utc::now(), "create failed");
        let mut doc = document("100m");
        doc.status = Some(persisted);

        let policy = Policy::from_document(doc);

        assert_eq!(policy.status.phase, Phase::Error);
        assert!(policy.status.message.contains("create failed"));
    }

    #[test]
    fn test_target_namespace_defaults_to_policy_namespace() {
        let mut policy = Policy::from_document(document("100m"));
        assert_eq!(policy.target_namespace(), "default");

        policy.selector.namespace = Some("apps".to_string());
        assert_eq!(policy.target_namespace(), "apps");

        policy.selector.namespace = Some(String::new());
        assert_eq!(policy.target_namespace(), "default");
    }

    #[test]
    fn test_same_spec_ignores_status() {
        let a = Policy::from_document(document("100m"));
        let mut b = a.clone();
        b.status.message = "different".to_string();
        assert!(a.same_spec(&b));

        let c = Policy::from_document(document("200m"));
        assert!(!a.same_spec(&c));
    }
}
