//! In-memory policy index
//!
//! Writers are serialized behind one lock and copy the map on write; readers
//! take an `Arc` to the current map, so a snapshot is never a partial write
//! and can be iterated without holding the lock.

use super::matcher::match_instance;
use super::record::Policy;
use super::status::PolicyStatus;
use crate::models::{Instance, PolicyKey};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

type PolicyMap = BTreeMap<PolicyKey, Policy>;

/// Point-in-time copy of the index, iterated in key order
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    policies: Arc<PolicyMap>,
}

impl PolicySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn get(&self, key: &PolicyKey) -> Option<&Policy> {
        self.policies.get(key)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// The policy governing `instance`, by key-order precedence
    pub fn find_match(&self, instance: &Instance) -> Option<&Policy> {
        match_instance(instance, self.policies.values())
    }
}

#[derive(Debug, Default)]
pub struct PolicyIndex {
    policies: RwLock<Arc<PolicyMap>>,
}

impl PolicyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Arc<PolicyMap> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write<R>(&self, f: impl FnOnce(&mut PolicyMap) -> R) -> R {
        let mut guard = self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut *guard))
    }

    /// Insert or fully replace a policy. Returns the previous record.
    pub fn upsert(&self, policy: Policy) -> Option<Policy> {
        self.write(|map| map.insert(policy.key.clone(), policy))
    }

    /// Replace a policy after letting `merge` reconcile it with the record it
    /// replaces, all under one write lock. Returns the previous record.
    pub fn upsert_with(
        &self,
        mut policy: Policy,
        merge: impl FnOnce(Option<&Policy>, &mut Policy),
    ) -> Option<Policy> {
        self.write(|map| {
            merge(map.get(&policy.key), &mut policy);
            map.insert(policy.key.clone(), policy)
        })
    }

    /// Remove a policy. Unknown keys are a no-op.
    pub fn remove(&self, key: &PolicyKey) -> Option<Policy> {
        self.write(|map| map.remove(key))
    }

    pub fn get(&self, key: &PolicyKey) -> Option<Policy> {
        self.read().get(key).cloned()
    }

    pub fn snapshot_all(&self) -> PolicySnapshot {
        PolicySnapshot {
            policies: self.read(),
        }
    }

    /// Apply a compound status mutation atomically and return the resulting
    /// status, or `None` if the policy is no longer indexed.
    pub fn update_status(
        &self,
        key: &PolicyKey,
        f: impl FnOnce(&mut PolicyStatus),
    ) -> Option<PolicyStatus> {
        self.modify_status(key, |status| {
            f(status);
            true
        })
    }

    /// Like [`update_status`](Self::update_status), but `f` reports whether it
    /// changed anything. The new status is returned only on change, and an
    /// unchanged status does not copy the map.
    pub fn modify_status(
        &self,
        key: &PolicyKey,
        f: impl FnOnce(&mut PolicyStatus) -> bool,
    ) -> Option<PolicyStatus> {
        let mut guard = self
            .policies
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut status = guard.get(key)?.status.clone();
        if !f(&mut status) {
            return None;
        }

        let policy = Arc::make_mut(&mut *guard).get_mut(key)?;
        policy.status = status.clone();
        Some(status)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Distinct namespaces targeted by indexed policies
    pub fn target_namespaces(&self) -> BTreeSet<String> {
        self.read()
            .values()
            .map(|p| p.target_namespace().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PolicyDocument, TargetSelector};
    use crate::policy::Phase;
    use crate::resources::ResourceRequirements;
    use chrono::Utc;

    fn policy(name: &str, target: &str) -> Policy {
        Policy::from_document(PolicyDocument::new(
            PolicyKey::new("default", name),
            TargetSelector {
                names: [target.to_string()].into_iter().collect(),
                ..Default::default()
            },
            ResourceRequirements {
                requests: [("cpu".to_string(), "100m".to_string())].into_iter().collect(),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let index = PolicyIndex::new();
        index.upsert(policy("p", "web-0"));
        let first = index.snapshot_all();
        index.upsert(policy("p", "web-0"));
        let second = index.snapshot_all();

        assert_eq!(index.len(), 1);
        assert_eq!(
            first.iter().collect::<Vec<_>>(),
            second.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_upsert_replaces_not_merges() {
        let index = PolicyIndex::new();
        index.upsert(policy("p", "web-0"));
        let previous = index.upsert(policy("p", "web-1"));

        assert!(previous.is_some());
        let stored = index.get(&PolicyKey::new("default", "p")).unwrap();
        assert_eq!(stored.selector.names.len(), 1);
        assert!(stored.selector.names.contains("web-1"));
    }

    #[test]
    fn test_upsert_with_sees_previous_record() {
        let index = PolicyIndex::new();
        let key = PolicyKey::new("default", "p");
        index.upsert(policy("p", "web-0"));
        index.update_status(&key, |s| s.record_compliant("default/web-0", Utc::now()));

        index.upsert_with(policy("p", "web-1"), |previous, next| {
            next.status = previous.unwrap().status.clone();
        });

        let stored = index.get(&key).unwrap();
        assert!(stored.selector.names.contains("web-1"));
        assert!(stored.status.is_managed("default/web-0"));
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let index = PolicyIndex::new();
        assert!(index.remove(&PolicyKey::new("default", "missing")).is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let index = PolicyIndex::new();
        index.upsert(policy("a", "web-0"));
        let snapshot = index.snapshot_all();

        index.upsert(policy("b", "web-1"));
        index.remove(&PolicyKey::new("default", "a"));

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get(&PolicyKey::new("default", "a")).is_some());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_snapshot_iterates_in_key_order() {
        let index = PolicyIndex::new();
        index.upsert(policy("zeta", "web-0"));
        index.upsert(policy("alpha", "web-0"));

        let snapshot = index.snapshot_all();
        let names: Vec<_> = snapshot.iter().map(|p| p.key.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let winner = snapshot.find_match(&Instance::new("default", "web-0")).unwrap();
        assert_eq!(winner.key.name, "alpha");
    }

    #[test]
    fn test_update_status_is_visible_to_new_snapshots() {
        let index = PolicyIndex::new();
        let key = PolicyKey::new("default", "p");
        index.upsert(policy("p", "web-0"));

        let status = index
            .update_status(&key, |s| s.record_compliant("default/web-0", Utc::now()))
            .unwrap();
        assert_eq!(status.phase, Phase::Reconciled);
        assert_eq!(index.get(&key).unwrap().status, status);
    }

    #[test]
    fn test_modify_status_reports_no_change() {
        let index = PolicyIndex::new();
        let key = PolicyKey::new("default", "p");
        index.upsert(policy("p", "web-0"));

        assert!(index.modify_status(&key, |s| s.release("default/web-0")).is_none());
        assert!(index
            .update_status(&PolicyKey::new("default", "missing"), |_| {})
            .is_none());
    }

    #[test]
    fn test_target_namespaces() {
        let index = PolicyIndex::new();
        index.upsert(policy("a", "web-0"));
        let mut other = policy("b", "web-1");
        other.selector.namespace = Some("apps".to_string());
        index.upsert(other);

        let namespaces: Vec<_> = index.target_namespaces().into_iter().collect();
        assert_eq!(namespaces, vec!["apps", "default"]);
    }
}
