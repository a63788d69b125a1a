//! Instance-to-policy matching

use super::record::Policy;
use crate::models::Instance;

/// Whether `policy` targets `instance`, ignoring precedence
pub fn policy_matches(policy: &Policy, instance: &Instance) -> bool {
    policy.enabled
        && policy.target_namespace() == instance.namespace
        && policy.selector.selects(&instance.name, &instance.labels)
}

/// Pick the policy governing `instance`.
///
/// Policies are evaluated in the order given; the first match wins. Callers
/// pass the index's key order so the choice is reproducible across restarts.
pub fn match_instance<'a, I>(instance: &Instance, policies: I) -> Option<&'a Policy>
where
    I: IntoIterator<Item = &'a Policy>,
{
    policies
        .into_iter()
        .find(|policy| policy_matches(policy, instance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyDocument, PolicyKey, TargetSelector};
    use crate::resources::ResourceRequirements;

    fn policy(namespace: &str, name: &str, selector: TargetSelector) -> Policy {
        Policy::from_document(PolicyDocument::new(
            PolicyKey::new(namespace, name),
            selector,
            ResourceRequirements::default(),
        ))
    }

    fn by_name(target: &str) -> TargetSelector {
        TargetSelector {
            names: [target.to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    fn by_label(key: &str, value: &str) -> TargetSelector {
        TargetSelector {
            label_selector: [(key.to_string(), value.to_string())].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_first_matching_policy_wins() {
        let p1 = policy("default", "a-policy", by_name("web-0"));
        let p2 = policy("default", "b-policy", by_label("app", "web"));
        let instance = Instance::new("default", "web-0").with_label("app", "web");

        let policies = vec![p1, p2];
        for _ in 0..10 {
            let winner = match_instance(&instance, &policies).unwrap();
            assert_eq!(winner.key.name, "a-policy");
        }

        let reversed: Vec<Policy> = policies.into_iter().rev().collect();
        assert_eq!(
            match_instance(&instance, &reversed).unwrap().key.name,
            "b-policy"
        );
    }

    #[test]
    fn test_namespace_must_match() {
        let p = policy("default", "p", by_name("web-0"));
        let elsewhere = Instance::new("other", "web-0");
        assert!(match_instance(&elsewhere, [&p]).is_none());
    }

    #[test]
    fn test_explicit_target_namespace() {
        let mut selector = by_name("web-0");
        selector.namespace = Some("apps".to_string());
        let p = policy("ops", "p", selector);

        assert!(policy_matches(&p, &Instance::new("apps", "web-0")));
        assert!(!policy_matches(&p, &Instance::new("ops", "web-0")));
    }

    #[test]
    fn test_empty_selector_matches_nothing() {
        let p = policy("default", "p", TargetSelector::default());
        let instance = Instance::new("default", "web-0").with_label("app", "web");
        assert!(match_instance(&instance, [&p]).is_none());
    }

    #[test]
    fn test_disabled_policy_matches_nothing() {
        let mut p = policy("default", "p", by_name("web-0"));
        p.enabled = false;
        assert!(!policy_matches(&p, &Instance::new("default", "web-0")));
    }

    #[test]
    fn test_label_match() {
        let p = policy("default", "p", by_label("app", "web"));
        assert!(policy_matches(
            &p,
            &Instance::new("default", "anything").with_label("app", "web")
        ));
        assert!(!policy_matches(
            &p,
            &Instance::new("default", "anything").with_label("app", "db")
        ));
    }
}
